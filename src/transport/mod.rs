pub mod tcp;
pub mod udp;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::dto::MessageDto;

/// Routing context weight of UDP unicast
pub const UDP_ROUTING_WEIGHT: u32 = 100;
/// Routing context weight of TCP connections, preferred over UDP where both reach a peer
pub const TCP_ROUTING_WEIGHT: u32 = 200;

/// A transport moves messages between nodes. Sending to specific peers goes through the
///  routing contexts that a transport registers, so the transport itself only exposes
///  broadcasting and its lifecycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn broadcast(&self, message: MessageDto) -> anyhow::Result<()>;

    /// Stops all background work, unregisters the transport's routing contexts and fails
    ///  pending sends
    async fn shutdown(&self) -> anyhow::Result<()>;
}
