use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;
use uuid::Uuid;

use crate::error::CourierError;
use crate::util::buf::{put_bytes, put_string, put_varint_len, try_get_bytes, try_get_string, try_get_varint_len};

/// Declared property carrying the port of a node's UDP unicast socket. Peers combine it with the
///  source address of an announcement to reach the node directly.
pub const UDP_UNICAST_PORT_PROPERTY: &str = "udp.unicast_port";

/// A node's 128-bit identifier. The nil id is reserved for 'broadcast', both as a receiver and
///  as the sender of messages that do not originate from an identifiable node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub const BROADCAST: PeerId = PeerId(Uuid::nil());

    pub fn new_random() -> PeerId {
        PeerId(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> PeerId {
        PeerId(Uuid::from_u128(value))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_nil()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0.as_u128());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerId> {
        Ok(PeerId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "[broadcast]")
        }
        else {
            write!(f, "[{}]", self.0)
        }
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(Uuid::parse_str(s)?))
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum PropertyKind {
    Int = 1,
    Text = 2,
    Bytes = 3,
}

/// Value of a declared property. Nodes declare transport specific details (e.g. ports) and
///  application metadata through these.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    fn ser(&self, buf: &mut BytesMut) {
        match self {
            PropertyValue::Int(v) => {
                buf.put_u8(PropertyKind::Int.into());
                buf.put_i64(*v);
            }
            PropertyValue::Text(s) => {
                buf.put_u8(PropertyKind::Text.into());
                put_string(buf, s);
            }
            PropertyValue::Bytes(b) => {
                buf.put_u8(PropertyKind::Bytes.into());
                put_bytes(buf, b);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PropertyValue> {
        let kind = PropertyKind::try_from_primitive(buf.try_get_u8()?)?;
        Ok(match kind {
            PropertyKind::Int => PropertyValue::Int(buf.try_get_i64()?),
            PropertyKind::Text => PropertyValue::Text(try_get_string(buf)?),
            PropertyKind::Bytes => PropertyValue::Bytes(try_get_bytes(buf)?.to_vec()),
        })
    }
}

/// A node's identity as it is announced to peers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    id: PeerId,
    vanity_name: String,
    declared_properties: BTreeMap<String, PropertyValue>,
}

impl Identity {
    /// Creates a new identity with a random id. This is meant to be called once per process.
    pub fn create(vanity_name: impl Into<String>) -> Identity {
        Self::with_id(PeerId::new_random(), vanity_name)
    }

    pub fn with_id(id: PeerId, vanity_name: impl Into<String>) -> Identity {
        Identity {
            id,
            vanity_name: vanity_name.into(),
            declared_properties: BTreeMap::default(),
        }
    }

    pub fn with_declared_property(mut self, key: impl Into<String>, value: PropertyValue) -> Identity {
        self.declared_properties.insert(key.into(), value);
        self
    }

    pub fn with_vanity_name(mut self, vanity_name: impl Into<String>) -> Identity {
        self.vanity_name = vanity_name.into();
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn vanity_name(&self) -> &str {
        &self.vanity_name
    }

    pub fn declared_properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.declared_properties
    }

    pub fn declared_property(&self, key: &str) -> Option<&PropertyValue> {
        self.declared_properties.get(key)
    }

    /// Convenience for port-like properties: `None` if the property is missing, not an integer
    ///  or out of range
    pub fn declared_u16(&self, key: &str) -> Option<u16> {
        match self.declared_properties.get(key) {
            Some(PropertyValue::Int(v)) => u16::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.id.ser(buf);
        put_string(buf, &self.vanity_name);
        put_varint_len(buf, self.declared_properties.len());
        for (key, value) in &self.declared_properties {
            put_string(buf, key);
            value.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Identity> {
        let id = PeerId::try_deser(buf)?;
        let vanity_name = try_get_string(buf)?;
        let num_properties = try_get_varint_len(buf)?;
        let mut declared_properties = BTreeMap::default();
        for _ in 0..num_properties {
            let key = try_get_string(buf)?;
            let value = PropertyValue::try_deser(buf)?;
            if declared_properties.insert(key.clone(), value).is_some() {
                return Err(anyhow!("duplicate declared property {:?}", key));
            }
        }
        Ok(Identity {
            id,
            vanity_name,
            declared_properties,
        })
    }
}

/// The local node's identity. Its id is fixed for the lifetime of the process, while the rest of
///  the identity can be replaced as a whole (e.g. when a transport learns its bound port).
#[derive(Debug)]
pub struct LocalIdentity {
    id: PeerId,
    current: RwLock<Arc<Identity>>,
}

impl LocalIdentity {
    pub fn new(identity: Identity) -> LocalIdentity {
        LocalIdentity {
            id: identity.id(),
            current: RwLock::new(Arc::new(identity)),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn snapshot(&self) -> Arc<Identity> {
        self.current.read().unwrap().clone()
    }

    pub fn update(&self, identity: Identity) -> anyhow::Result<()> {
        if identity.id() != self.id {
            return Err(CourierError::IdentityChanged { expected: self.id, actual: identity.id() }.into());
        }
        debug!("updating local identity: {:?}", identity);
        *self.current.write().unwrap() = Arc::new(identity);
        Ok(())
    }

    pub fn update_with(&self, f: impl FnOnce(&Identity) -> Identity) -> anyhow::Result<()> {
        let mut current = self.current.write().unwrap();
        let updated = f(current.as_ref());
        if updated.id() != self.id {
            return Err(CourierError::IdentityChanged { expected: self.id, actual: updated.id() }.into());
        }
        debug!("updating local identity: {:?}", updated);
        *current = Arc::new(updated);
        Ok(())
    }

    /// true if a message for `receiver` is meant for this node, i.e. either addressed to it or
    ///  broadcast
    pub fn matches_receiver(&self, receiver: PeerId) -> bool {
        receiver == self.id || receiver.is_broadcast()
    }
}
