use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::config::InboundConfig;
use crate::identity::{LocalIdentity, PeerId};
use crate::messaging::dto::MessageDto;
use crate::messaging::message_type::{Message, MessageTypeId};
use crate::peering::peer_table::{PeerContext, PeerTable};
use crate::util::atomic_map::AtomicMap;

/// A received message, decoded to its type, as passed to handlers
#[derive(Debug)]
pub struct InboundMessageEvent<T> {
    pub message: T,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    /// `None` for messages without an identifiable sender
    pub sender: Option<Arc<PeerContext>>,
}

#[async_trait]
trait ErasedHandler: Send + Sync + 'static {
    async fn handle(&self, message: &MessageDto, sender: Option<Arc<PeerContext>>);
}

struct TypedHandler<T, F> {
    handler: F,
    _message_type: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> ErasedHandler for TypedHandler<T, F>
where
    T: Message,
    F: Fn(InboundMessageEvent<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: &MessageDto, sender: Option<Arc<PeerContext>>) {
        match message.body.decode::<T>() {
            Ok(decoded) => {
                (self.handler)(InboundMessageEvent {
                    message: decoded,
                    sender_id: message.sender_id,
                    receiver_id: message.receiver_id,
                    sender,
                }).await
            }
            Err(e) => warn!("failed to decode message of type {:?} from {:?}: {}", T::TYPE_ID, message.sender_id, e),
        }
    }
}

/// Demultiplexes inbound messages to the handlers registered for their type.
#[derive(Default)]
pub struct InboundMessageRouter {
    handlers: AtomicMap<MessageTypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl InboundMessageRouter {
    pub fn new() -> InboundMessageRouter {
        Self::default()
    }

    /// Registers a handler for messages of type `T`. Several handlers can be registered for the
    ///  same type, and each of them gets every message.
    pub fn register_handler<T, F, Fut>(&self, handler: F)
    where
        T: Message,
        F: Fn(InboundMessageEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("registering handler for message type {:?}", T::TYPE_ID);
        let handler: Arc<dyn ErasedHandler> = Arc::new(TypedHandler {
            handler,
            _message_type: PhantomData,
        });
        self.handlers.update(|handlers| {
            handlers.entry(T::TYPE_ID)
                .or_default()
                .push(handler);
        });
    }

    /// returns the number of handlers that were removed
    pub fn deregister_handlers<T: Message>(&self) -> usize {
        self.handlers.update(|handlers| handlers.remove(&T::TYPE_ID))
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// returns false if there is no handler for the message's type
    pub async fn route(&self, message: &MessageDto, sender: Option<Arc<PeerContext>>) -> bool {
        let Some(handlers) = self.handlers.get(&message.body.type_id) else {
            debug!("no handler for message type {:?} from {:?} - dropping message", message.body.type_id, message.sender_id);
            return false;
        };

        for handler in handlers {
            handler.handle(message, sender.clone()).await;
        }
        true
    }
}

/// Entry point for application messages that a transport received. This filters out messages
///  that are not meant for this node and holds messages back until their sender is discovered.
pub struct InboundMessageDispatcher {
    identity: Arc<LocalIdentity>,
    peer_table: Arc<PeerTable>,
    router: Arc<InboundMessageRouter>,
    config: InboundConfig,
}

impl InboundMessageDispatcher {
    pub fn new(identity: Arc<LocalIdentity>, peer_table: Arc<PeerTable>, router: Arc<InboundMessageRouter>, config: InboundConfig) -> InboundMessageDispatcher {
        InboundMessageDispatcher {
            identity,
            peer_table,
            router,
            config,
        }
    }

    /// returns true if the message was passed to at least one handler
    pub async fn dispatch(&self, message: MessageDto) -> bool {
        if message.sender_id == self.identity.id() {
            trace!("dropping message sent by myself");
            return false;
        }
        if !self.identity.matches_receiver(message.receiver_id) {
            trace!("dropping message for {:?}", message.receiver_id);
            return false;
        }

        let sender = if message.sender_id.is_broadcast() {
            None
        }
        else {
            let peer = self.peer_table.get_or_add(message.sender_id);
            if !peer.is_discovered() {
                trace!("waiting for discovery of {:?}", message.sender_id);
                if !peer.wait_for_discovery_timeout(self.config.discovery_timeout).await {
                    warn!("peer {:?} was not discovered within {:?} - dropping message of type {:?}", message.sender_id, self.config.discovery_timeout, message.body.type_id);
                    return false;
                }
            }
            Some(peer)
        };

        self.router.route(&message, sender).await
    }
}
