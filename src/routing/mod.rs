pub mod routing_table;

use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::identity::PeerId;
use crate::messaging::dto::{AcknowledgementDto, MessageDto};

/// A live, transport specific channel through which a single peer is reachable. Each context is
///  owned by one transport and registered in the [routing_table::RoutingTable] while it is usable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoutingContext: Debug + Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    /// Contexts with a higher weight are preferred when several transports reach a peer
    fn weight(&self) -> u32;

    /// Completes when the transport's delivery guarantee is met, e.g. when the peer acknowledged
    ///  the message
    async fn send_reliable(&self, message: MessageDto) -> anyhow::Result<()>;

    async fn send_unreliable(&self, message: MessageDto) -> anyhow::Result<()>;

    /// No-op for transports that do not acknowledge on the application level
    async fn send_acknowledgement(&self, acknowledgement: AcknowledgementDto) -> anyhow::Result<()>;
}
