//! Wire representation of everything Courier sends.
//!
//! A UDP datagram is a sequence of back-to-back [Payload]s, each starting with a one-byte kind tag.
//!  A TCP frame holds exactly one [Payload]. Ids are written as 16 raw bytes, integers big-endian,
//!  and strings and byte arrays are varint length prefixed.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::identity::{Identity, PeerId};
use crate::messaging::message_type::{Message, MessageTypeId};
use crate::messaging::packet_id::PacketId;
use crate::util::buf::{put_bytes, try_get_bytes};

/// A type tagged, serialized application message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageBody {
    pub type_id: MessageTypeId,
    pub payload: Bytes,
}

impl MessageBody {
    pub fn of<T: Message>(message: &T) -> MessageBody {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        MessageBody {
            type_id: T::TYPE_ID,
            payload: buf.freeze(),
        }
    }

    pub fn is<T: Message>(&self) -> bool {
        self.type_id == T::TYPE_ID
    }

    pub fn decode<T: Message>(&self) -> anyhow::Result<T> {
        if !self.is::<T>() {
            bail!("expected message type {:?}, was {:?}", T::TYPE_ID, self.type_id);
        }
        let mut buf: &[u8] = &self.payload;
        T::try_deser(&mut buf)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.type_id.ser(buf);
        put_bytes(buf, &self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageBody> {
        let type_id = MessageTypeId::try_deser(buf)?;
        let payload = try_get_bytes(buf)?;
        Ok(MessageBody { type_id, payload })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageDto {
    pub body: MessageBody,
    pub sender_id: PeerId,
    /// [PeerId::BROADCAST] for messages addressed to all nodes
    pub receiver_id: PeerId,
}

impl MessageDto {
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_broadcast()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.sender_id.ser(buf);
        self.receiver_id.ser(buf);
        self.body.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageDto> {
        let sender_id = PeerId::try_deser(buf)?;
        let receiver_id = PeerId::try_deser(buf)?;
        let body = MessageBody::try_deser(buf)?;
        Ok(MessageDto { body, sender_id, receiver_id })
    }
}

/// UDP envelope around a message. Its id correlates acknowledgements and detects duplicates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketDto {
    pub id: PacketId,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub message: MessageDto,
    pub is_reliable: bool,
}

impl PacketDto {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.id.ser(buf);
        self.sender_id.ser(buf);
        self.receiver_id.ser(buf);
        buf.put_u8(self.is_reliable as u8);
        self.message.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PacketDto> {
        let id = PacketId::try_deser(buf)?;
        let sender_id = PeerId::try_deser(buf)?;
        let receiver_id = PeerId::try_deser(buf)?;
        let is_reliable = match buf.try_get_u8()? {
            0 => false,
            1 => true,
            other => bail!("invalid reliability flag {}", other),
        };
        let message = MessageDto::try_deser(buf)?;
        Ok(PacketDto { id, sender_id, receiver_id, message, is_reliable })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AcknowledgementDto {
    pub packet_id: PacketId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnnouncementDto {
    pub identity: Identity,
}

/// First frame on every TCP connection, sent by both ends
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeDto {
    pub identity: Identity,
}

/// One shard of a serialized [MessageBody] that is too big for a single datagram. Chunks travel
///  as regular messages, and the shards of one body share a `multi_part_message_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiPartChunkDto {
    pub multi_part_message_id: Uuid,
    pub chunk_index: u32,
    pub chunk_count: u32,
    /// length of the complete serialized body
    pub body_length: u32,
    pub chunk: Bytes,
}

impl Message for MultiPartChunkDto {
    const TYPE_ID: MessageTypeId = MessageTypeId::new(b"MultPart");

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u128(self.multi_part_message_id.as_u128());
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.chunk_count);
        buf.put_u32(self.body_length);
        put_bytes(buf, &self.chunk);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(MultiPartChunkDto {
            multi_part_message_id: Uuid::from_u128(buf.try_get_u128()?),
            chunk_index: buf.try_get_u32()?,
            chunk_count: buf.try_get_u32()?,
            body_length: buf.try_get_u32()?,
            chunk: try_get_bytes(buf)?,
        })
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PayloadKind {
    Packet = 1,
    Acknowledgement = 2,
    Announcement = 3,
    Handshake = 4,
    Message = 5,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Packet(PacketDto),
    Acknowledgement(AcknowledgementDto),
    Announcement(AnnouncementDto),
    Handshake(HandshakeDto),
    Message(MessageDto),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Packet(_) => PayloadKind::Packet,
            Payload::Acknowledgement(_) => PayloadKind::Acknowledgement,
            Payload::Announcement(_) => PayloadKind::Announcement,
            Payload::Handshake(_) => PayloadKind::Handshake,
            Payload::Message(_) => PayloadKind::Message,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            Payload::Packet(p) => p.ser(buf),
            Payload::Acknowledgement(a) => a.packet_id.ser(buf),
            Payload::Announcement(a) => a.identity.ser(buf),
            Payload::Handshake(h) => h.identity.ser(buf),
            Payload::Message(m) => m.ser(buf),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let kind = PayloadKind::try_from_primitive(buf.try_get_u8()?)?;
        Ok(match kind {
            PayloadKind::Packet => Payload::Packet(PacketDto::try_deser(buf)?),
            PayloadKind::Acknowledgement => Payload::Acknowledgement(AcknowledgementDto { packet_id: PacketId::try_deser(buf)? }),
            PayloadKind::Announcement => Payload::Announcement(AnnouncementDto { identity: Identity::try_deser(buf)? }),
            PayloadKind::Handshake => Payload::Handshake(HandshakeDto { identity: Identity::try_deser(buf)? }),
            PayloadKind::Message => Payload::Message(MessageDto::try_deser(buf)?),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

/// Decodes all payloads in a datagram. Any malformed payload fails the datagram as a whole.
pub fn decode_datagram(mut datagram: &[u8]) -> anyhow::Result<Vec<Payload>> {
    let mut result = Vec::new();
    while datagram.has_remaining() {
        result.push(Payload::try_deser(&mut datagram)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::identity::PropertyValue;
    use crate::test_util::messages::TestMessage;

    fn message_dto() -> MessageDto {
        MessageDto {
            body: MessageBody::of(&TestMessage::new(17, "hello")),
            sender_id: PeerId::from_u128(1),
            receiver_id: PeerId::BROADCAST,
        }
    }

    #[rstest]
    #[case::packet(Payload::Packet(PacketDto {
        id: PacketId::from_u128(99),
        sender_id: PeerId::from_u128(1),
        receiver_id: PeerId::from_u128(2),
        message: message_dto(),
        is_reliable: true,
    }))]
    #[case::ack(Payload::Acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(5) }))]
    #[case::announcement(Payload::Announcement(AnnouncementDto {
        identity: Identity::with_id(PeerId::from_u128(3), "a").with_declared_property("p", PropertyValue::Int(1)),
    }))]
    #[case::handshake(Payload::Handshake(HandshakeDto { identity: Identity::with_id(PeerId::from_u128(3), "a") }))]
    #[case::message(Payload::Message(message_dto()))]
    fn test_payload_ser_deser(#[case] payload: Payload) {
        let bytes = payload.to_bytes();
        assert_eq!(bytes[0], u8::from(payload.kind()));

        let mut buf: &[u8] = &bytes;
        assert_eq!(Payload::try_deser(&mut buf).unwrap(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back() {
        let ack = Payload::Acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(5) });
        let message = Payload::Message(message_dto());

        let mut buf = BytesMut::new();
        ack.ser(&mut buf);
        message.ser(&mut buf);
        ack.ser(&mut buf);

        assert_eq!(decode_datagram(&buf).unwrap(), vec![ack.clone(), message, ack]);
    }

    #[rstest]
    #[case::unknown_kind(vec![17])]
    #[case::truncated_ack(vec![2, 0, 0, 0])]
    #[case::invalid_reliability({
        let mut buf = BytesMut::new();
        Payload::Packet(PacketDto {
            id: PacketId::from_u128(99),
            sender_id: PeerId::from_u128(1),
            receiver_id: PeerId::from_u128(2),
            message: message_dto(),
            is_reliable: false,
        }).ser(&mut buf);
        buf[49] = 7;
        buf.to_vec()
    })]
    fn test_decode_malformed(#[case] datagram: Vec<u8>) {
        assert!(decode_datagram(&datagram).is_err());
    }

    #[test]
    fn test_decode_trailing_garbage_fails_whole_datagram() {
        let mut buf = BytesMut::new();
        Payload::Message(message_dto()).ser(&mut buf);
        buf.put_u8(3);
        assert!(decode_datagram(&buf).is_err());
    }

    #[test]
    fn test_body_decode() {
        let body = MessageBody::of(&TestMessage::new(3, "x"));
        assert!(body.is::<TestMessage>());
        assert_eq!(body.decode::<TestMessage>().unwrap(), TestMessage::new(3, "x"));
        assert!(body.decode::<MultiPartChunkDto>().is_err());
    }
}
