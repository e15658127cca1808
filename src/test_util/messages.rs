use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messaging::message_type::{Message, MessageTypeId};
use crate::util::buf::{put_bytes, put_string, try_get_bytes, try_get_string};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestMessage {
    pub value: u64,
    pub text: String,
}

impl TestMessage {
    pub fn new(value: u64, text: impl Into<String>) -> TestMessage {
        TestMessage { value, text: text.into() }
    }
}

impl Message for TestMessage {
    const TYPE_ID: MessageTypeId = MessageTypeId::new(b"TestMsg\0");

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.value);
        put_string(buf, &self.text);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(TestMessage {
            value: buf.try_get_u64()?,
            text: try_get_string(buf)?,
        })
    }
}

/// A message with an arbitrary payload, for exercising multi-part sends
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobMessage {
    pub data: Bytes,
}

impl BlobMessage {
    /// deterministic, non-repeating content so that misplaced chunks are detected
    pub fn with_len(len: usize) -> BlobMessage {
        let data = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        BlobMessage { data: data.into() }
    }
}

impl Message for BlobMessage {
    const TYPE_ID: MessageTypeId = MessageTypeId::new(b"TestBlob");

    fn ser(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.data);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(BlobMessage { data: try_get_bytes(buf)? })
    }
}
