use thiserror::Error;

use crate::identity::PeerId;
use crate::messaging::packet_id::PacketId;

/// Failures that callers may want to react to specifically. They travel inside `anyhow::Error`
///  and can be recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("no route to peer {0:?}")]
    NoRoute(PeerId),
    #[error("transport is shut down")]
    ShutDown,
    #[error("packet {packet_id:?} was not acknowledged after {attempts} resend attempts")]
    AcknowledgementTimeout { packet_id: PacketId, attempts: u32 },
    #[error("an identity update must preserve the id: was {expected:?}, update has {actual:?}")]
    IdentityChanged { expected: PeerId, actual: PeerId },
    #[error("frame of {len} bytes exceeds the maximum frame length of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}
