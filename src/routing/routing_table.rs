use std::sync::Arc;

use anyhow::bail;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::routing::RoutingContext;

fn is_same_context(a: &Arc<dyn RoutingContext>, b: &Arc<dyn RoutingContext>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Maps peers to the routing contexts through which they are currently reachable. A peer that is
///  present in the table has at least one context.
#[derive(Default)]
pub struct RoutingTable {
    routes: DashMap<PeerId, Vec<Arc<dyn RoutingContext>>>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        Self::default()
    }

    pub fn register(&self, peer_id: PeerId, context: Arc<dyn RoutingContext>) -> anyhow::Result<()> {
        let mut contexts = self.routes.entry(peer_id).or_default();
        if contexts.iter().any(|c| is_same_context(c, &context)) {
            bail!("routing context {:?} is already registered for peer {:?}", context, peer_id);
        }
        debug!("registering routing context {:?} for peer {:?}", context, peer_id);
        contexts.push(context);
        Ok(())
    }

    /// returns false if the context was not registered for the peer
    pub fn unregister(&self, peer_id: PeerId, context: &Arc<dyn RoutingContext>) -> bool {
        let removed = match self.routes.get_mut(&peer_id) {
            Some(mut contexts) => {
                let len_before = contexts.len();
                contexts.retain(|c| !is_same_context(c, context));
                len_before != contexts.len()
            }
            None => false,
        };

        if removed {
            debug!("unregistered routing context {:?} for peer {:?}", context, peer_id);
            self.routes.remove_if(&peer_id, |_, contexts| contexts.is_empty());
        }
        else {
            trace!("unregistering routing context {:?} for peer {:?}: was not registered", context, peer_id);
        }
        removed
    }

    /// The preferred context for a peer: highest weight, and for equal weights the one that was
    ///  registered first
    pub fn try_get_routing_context(&self, peer_id: PeerId) -> Option<Arc<dyn RoutingContext>> {
        let contexts = self.routes.get(&peer_id)?;
        let mut result: Option<&Arc<dyn RoutingContext>> = None;
        for candidate in contexts.iter() {
            match result {
                Some(best) if best.weight() >= candidate.weight() => {}
                _ => result = Some(candidate),
            }
        }
        result.cloned()
    }

    pub fn routing_contexts(&self, peer_id: PeerId) -> Vec<Arc<dyn RoutingContext>> {
        self.routes.get(&peer_id)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.routes.iter()
            .map(|e| *e.key())
            .collect()
    }
}
