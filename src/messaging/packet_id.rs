use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Correlates a UDP packet with its acknowledgement and identifies duplicates. Resends of a
///  packet reuse its id.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PacketId(Uuid);

impl PacketId {
    pub fn new_random() -> PacketId {
        PacketId(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> PacketId {
        PacketId(Uuid::from_u128(value))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0.as_u128());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PacketId> {
        Ok(PacketId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P[{}]", self.0)
    }
}
