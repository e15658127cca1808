use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::identity::{Identity, PeerId};
use crate::util::latch::AsyncLatch;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerEvent {
    /// a peer's identity became known for the first time
    Discovered(PeerId),
    /// a known peer announced a changed identity
    IdentityUpdated(PeerId),
}

/// What is known about a peer. A context exists as soon as any traffic from the peer's id was
///  seen, and it is 'discovered' once the peer's identity was received.
#[derive(Debug)]
pub struct PeerContext {
    peer_id: PeerId,
    identity: RwLock<Option<Arc<Identity>>>,
    discovered: AsyncLatch,
}

impl PeerContext {
    fn new(peer_id: PeerId) -> PeerContext {
        PeerContext {
            peer_id,
            identity: RwLock::new(None),
            discovered: AsyncLatch::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity.read().unwrap().clone()
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered.is_set()
    }

    pub async fn wait_for_discovery(&self) {
        self.discovered.wait().await
    }

    /// returns false if the peer was not discovered within the timeout
    pub async fn wait_for_discovery_timeout(&self, timeout: Duration) -> bool {
        self.discovered.wait_timeout(timeout).await
    }

    /// returns the event that the update caused, if any
    fn update_identity(&self, identity: Identity) -> Option<PeerEvent> {
        {
            let mut current = self.identity.write().unwrap();
            if current.as_deref() == Some(&identity) {
                return None;
            }
            *current = Some(Arc::new(identity));
        }

        if self.discovered.set() {
            Some(PeerEvent::Discovered(self.peer_id))
        }
        else {
            Some(PeerEvent::IdentityUpdated(self.peer_id))
        }
    }
}

pub struct PeerTable {
    peers: DashMap<PeerId, Arc<PeerContext>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> PeerTable {
        let (events, _) = broadcast::channel(128);
        PeerTable {
            peers: DashMap::new(),
            events,
        }
    }

    pub fn get_or_add(&self, peer_id: PeerId) -> Arc<PeerContext> {
        self.peers.entry(peer_id)
            .or_insert_with(|| {
                trace!("adding undiscovered peer {:?}", peer_id);
                Arc::new(PeerContext::new(peer_id))
            })
            .clone()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<PeerContext>> {
        self.peers.get(&peer_id)
            .map(|p| p.clone())
    }

    /// Records a peer's identity as received through an announcement or a handshake. This marks
    ///  the peer as discovered, releasing messages from that peer that wait for discovery.
    pub fn handle_inbound_peer_identity_update(&self, identity: Identity) {
        let peer = self.get_or_add(identity.id());
        let vanity_name = identity.vanity_name().to_string();

        match peer.update_identity(identity) {
            Some(event) => {
                match &event {
                    PeerEvent::Discovered(id) => info!("discovered peer {:?} ({})", id, vanity_name),
                    PeerEvent::IdentityUpdated(id) => debug!("peer {:?} ({}) updated its identity", id, vanity_name),
                }
                // no receivers is fine
                let _ = self.events.send(event);
            }
            None => trace!("identity of peer {:?} is unchanged", peer.peer_id()),
        }
    }

    pub fn discovered_peers(&self) -> Vec<Arc<PeerContext>> {
        self.peers.iter()
            .filter(|p| p.is_discovered())
            .map(|p| p.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
