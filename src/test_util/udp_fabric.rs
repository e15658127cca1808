use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::transport::udp::dispatcher::UdpDispatcher;
use crate::transport::udp::network::UdpNetwork;

/// Connects the UDP dispatchers of several in-process nodes without sockets. Broadcasts reach
///  all attached nodes including the sender, like multicast with loopback does. Delivery is
///  asynchronous, one task per datagram and receiver.
#[derive(Default)]
pub struct InMemoryUdpFabric {
    nodes: Mutex<FxHashMap<SocketAddr, Arc<UdpDispatcher>>>,
    dropping_unicasts: AtomicBool,
    num_dropped: AtomicU64,
}

impl InMemoryUdpFabric {
    pub fn new() -> Arc<InMemoryUdpFabric> {
        Arc::new(Self::default())
    }

    pub fn network(self: &Arc<Self>, addr: SocketAddr) -> Arc<FabricUdpNetwork> {
        Arc::new(FabricUdpNetwork {
            fabric: self.clone(),
            addr,
        })
    }

    pub fn attach(&self, addr: SocketAddr, dispatcher: Arc<UdpDispatcher>) {
        self.nodes.lock().unwrap().insert(addr, dispatcher);
    }

    pub fn detach(&self, addr: SocketAddr) {
        self.nodes.lock().unwrap().remove(&addr);
    }

    /// While set, unicast datagrams are lost
    pub fn set_dropping_unicasts(&self, dropping: bool) {
        self.dropping_unicasts.store(dropping, Ordering::Release);
    }

    pub fn num_dropped(&self) -> u64 {
        self.num_dropped.load(Ordering::Acquire)
    }

    fn deliver(&self, from: SocketAddr, to: Option<SocketAddr>, datagram: &[u8]) {
        let receivers = {
            let nodes = self.nodes.lock().unwrap();
            match to {
                Some(to) => nodes.get(&to).cloned().into_iter().collect::<Vec<_>>(),
                None => nodes.values().cloned().collect(),
            }
        };

        let datagram = Bytes::copy_from_slice(datagram);
        for receiver in receivers {
            let datagram = datagram.clone();
            tokio::spawn(async move {
                receiver.handle_inbound_datagram(&datagram, from).await;
            });
        }
    }
}

pub struct FabricUdpNetwork {
    fabric: Arc<InMemoryUdpFabric>,
    addr: SocketAddr,
}

impl FabricUdpNetwork {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl UdpNetwork for FabricUdpNetwork {
    fn local_unicast_port(&self) -> u16 {
        self.addr.port()
    }

    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("fabric broadcast from {:?}", self.addr);
        self.fabric.deliver(self.addr, None, datagram);
        Ok(())
    }

    async fn unicast(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        if self.fabric.dropping_unicasts.load(Ordering::Acquire) {
            trace!("fabric dropping unicast from {:?} to {:?}", self.addr, to);
            self.fabric.num_dropped.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        self.fabric.deliver(self.addr, Some(to), datagram);
        Ok(())
    }
}
