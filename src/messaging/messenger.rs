use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, instrument, trace, warn};

use crate::error::CourierError;
use crate::identity::{LocalIdentity, PeerId};
use crate::messaging::dto::{MessageBody, MessageDto};
use crate::messaging::message_type::Message;
use crate::routing::routing_table::RoutingTable;
use crate::transport::Transport;

/// The application's API for sending messages. Peers are addressed by id, and the messenger
///  picks whatever routing context currently reaches them.
pub struct Messenger {
    identity: Arc<LocalIdentity>,
    routing_table: Arc<RoutingTable>,
    transports: Vec<Arc<dyn Transport>>,
}

impl Messenger {
    pub fn new(identity: Arc<LocalIdentity>, routing_table: Arc<RoutingTable>, transports: Vec<Arc<dyn Transport>>) -> Messenger {
        Messenger {
            identity,
            routing_table,
            transports,
        }
    }

    fn envelope<T: Message>(&self, message: &T, receiver_id: PeerId) -> MessageDto {
        MessageDto {
            body: MessageBody::of(message),
            sender_id: self.identity.id(),
            receiver_id,
        }
    }

    /// Sends a message through every transport's broadcast. Failure of some transports does
    ///  not keep the others from sending, but it is reported.
    #[instrument(skip_all, fields(type_id = ?T::TYPE_ID))]
    pub async fn broadcast<T: Message>(&self, message: &T) -> anyhow::Result<()> {
        let dto = self.envelope(message, PeerId::BROADCAST);

        let mut failed = Vec::new();
        for transport in &self.transports {
            if let Err(e) = transport.broadcast(dto.clone()).await {
                warn!("broadcast via {} failed: {}", transport.name(), e);
                failed.push(transport.name());
            }
        }

        if failed.is_empty() {
            Ok(())
        }
        else {
            Err(anyhow!("broadcast failed for transport(s) {:?}", failed))
        }
    }

    /// Best effort send. Without a route to the peer, this does nothing.
    #[instrument(skip_all, fields(type_id = ?T::TYPE_ID, ?destination))]
    pub async fn send_unreliable<T: Message>(&self, message: &T, destination: PeerId) -> anyhow::Result<()> {
        let Some(context) = self.routing_table.try_get_routing_context(destination) else {
            debug!("no route to {:?} - skipping unreliable send", destination);
            return Ok(());
        };
        trace!("sending unreliable via {:?}", context);
        context.send_unreliable(self.envelope(message, destination)).await
    }

    /// Completes when the message was delivered according to the routing context's guarantees,
    ///  and fails with [CourierError::NoRoute] if the peer is not reachable.
    #[instrument(skip_all, fields(type_id = ?T::TYPE_ID, ?destination))]
    pub async fn send_reliable<T: Message>(&self, message: &T, destination: PeerId) -> anyhow::Result<()> {
        let Some(context) = self.routing_table.try_get_routing_context(destination) else {
            return Err(CourierError::NoRoute(destination).into());
        };
        trace!("sending reliable via {:?}", context);
        context.send_reliable(self.envelope(message, destination)).await
    }
}
