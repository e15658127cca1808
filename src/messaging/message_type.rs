use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};

/// A [MessageTypeId] is sent as part of a message body to identify its type for deserialization
///  and dispatch on the receiving side.
///
/// An id is technically a u64, but it is intended to be used as a sequence of up to eight ASCII
///  characters to give it a human-readable name, both for uniqueness and for debugging at the
///  wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageTypeId(pub u64);

impl MessageTypeId {
    pub const fn new(value: &[u8; 8]) -> MessageTypeId {
        Self(u64::from_be_bytes(*value))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageTypeId> {
        Ok(MessageTypeId(buf.try_get_u64()?))
    }
}

impl Debug for MessageTypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}

/// Application messages implement this to be sent through Courier. Each message type has its
///  own (hopefully) unique [MessageTypeId], and it takes care of its own serialization.
pub trait Message: Debug + Send + Sync + Sized + 'static {
    const TYPE_ID: MessageTypeId;

    fn ser(&self, buf: &mut BytesMut);

    /// The buffer contains exactly the serialized message, i.e. what [Message::ser] wrote.
    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::abc(MessageTypeId::new(b"abc\0\0\0\0\0"), "0x6162630000000000(\"abc\")")]
    #[case::full(MessageTypeId::new(b"MultPart"), "0x4D756C7450617274(\"MultPart\")")]
    #[case::empty(MessageTypeId::new(b"\0\0\0\0\0\0\0\0"), "0x0000000000000000(\"\")")]
    fn test_id_debug(#[case] id: MessageTypeId, #[case] expected: &str) {
        let formatted = format!("{:?}", id);
        assert_eq!(&formatted, expected);
    }
}
