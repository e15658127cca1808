use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::config::UdpTransportConfig;
use crate::transport::udp::dispatcher::UdpDispatcher;
use crate::util::buffer_pool::BufferPool;

/// A peer's current unicast address. It is shared between the peer's routing context and its
///  pending reliable sends, so that resends follow an address change.
#[derive(Clone, Debug)]
pub struct PeerEndpoint(Arc<RwLock<SocketAddr>>);

impl PeerEndpoint {
    pub fn new(addr: SocketAddr) -> PeerEndpoint {
        PeerEndpoint(Arc::new(RwLock::new(addr)))
    }

    pub fn get(&self) -> SocketAddr {
        *self.0.read().unwrap()
    }

    /// returns the previous address if it changed
    pub fn set(&self, addr: SocketAddr) -> Option<SocketAddr> {
        let mut current = self.0.write().unwrap();
        if *current == addr {
            return None;
        }
        Some(std::mem::replace(&mut *current, addr))
    }
}

impl From<SocketAddr> for PeerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        PeerEndpoint::new(addr)
    }
}

/// The raw datagram operations the UDP transport needs, separated from the sockets so that
///  nodes can be wired together in memory for tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UdpNetwork: Send + Sync + 'static {
    /// The port peers use to reach this node directly
    fn local_unicast_port(&self) -> u16;

    /// Sends a datagram to all nodes in the multicast group, including this node
    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()>;

    async fn unicast(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;
}

/// The socket based [UdpNetwork]: one socket joined to the multicast group for discovery and
///  broadcasts, and one unicast socket on which the node is reachable directly. All sends go
///  out through the unicast socket.
pub struct UdpClient {
    multicast_socket: Arc<UdpSocket>,
    unicast_socket: Arc<UdpSocket>,
    multicast_destination: SocketAddr,
    buffer_pool: Arc<BufferPool>,
}

impl UdpClient {
    pub async fn bind(config: &UdpTransportConfig) -> anyhow::Result<UdpClient> {
        let multicast_socket = Self::bind_multicast_socket(config)?;
        info!("joined multicast group {:?}", config.multicast_group);

        let unicast_socket = UdpSocket::bind(config.unicast_bind_addr).await?;
        {
            let sock_ref = SockRef::from(&unicast_socket);
            sock_ref.set_multicast_loop_v4(true)?;
            sock_ref.set_multicast_ttl_v4(config.multicast_ttl)?;
            if !config.multicast_interface.is_unspecified() {
                sock_ref.set_multicast_if_v4(&config.multicast_interface)?;
            }
        }
        info!("bound unicast socket to {:?}", unicast_socket.local_addr()?);

        Ok(UdpClient {
            multicast_socket: Arc::new(multicast_socket),
            unicast_socket: Arc::new(unicast_socket),
            multicast_destination: SocketAddr::V4(config.multicast_group),
            buffer_pool: Arc::new(BufferPool::new(config.receive_buffer_size, config.buffer_pool_size)),
        })
    }

    /// Several nodes on the same host share the multicast port, so the socket needs address
    ///  (and port) reuse, which is why it is set up through socket2
    fn bind_multicast_socket(config: &UdpTransportConfig) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_group.port()));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(config.multicast_group.ip(), &config.multicast_interface)?;
        socket.set_multicast_loop_v4(true)?;

        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Spawns one receive loop per socket, feeding the dispatcher until `cancel` is triggered
    pub fn spawn_receive_loops(&self, dispatcher: Arc<UdpDispatcher>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        [("multicast", self.multicast_socket.clone()), ("unicast", self.unicast_socket.clone())]
            .into_iter()
            .map(|(name, socket)| {
                let buffer_pool = self.buffer_pool.clone();
                let dispatcher = dispatcher.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    Self::recv_loop(name, socket, buffer_pool, dispatcher, cancel).await
                })
            })
            .collect()
    }

    async fn recv_loop(name: &'static str, socket: Arc<UdpSocket>, buffer_pool: Arc<BufferPool>, dispatcher: Arc<UdpDispatcher>, cancel: CancellationToken) {
        info!("starting {} receive loop", name);

        loop {
            let mut buf = buffer_pool.get_from_pool();
            let received = select! {
                _ = cancel.cancelled() => None,
                r = socket.recv_buf_from(&mut buf) => Some(r),
            };

            match received {
                None => {
                    buffer_pool.return_to_pool(buf);
                    break;
                }
                Some(Err(e)) => {
                    error!("{} socket error: {}", name, e);
                }
                Some(Ok((num_read, from))) => {
                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                    trace!(parent: &span, "received {} bytes from {:?}", num_read, from);
                    dispatcher.handle_inbound_datagram(&buf[..num_read], from)
                        .instrument(span)
                        .await;
                }
            }
            buffer_pool.return_to_pool(buf);
        }

        debug!("{} receive loop terminated", name);
    }
}

#[async_trait]
impl UdpNetwork for UdpClient {
    fn local_unicast_port(&self) -> u16 {
        self.unicast_socket.local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to multicast group {:?}", datagram.len(), self.multicast_destination);
        self.unicast_socket.send_to(datagram, self.multicast_destination).await?;
        Ok(())
    }

    async fn unicast(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {:?}", datagram.len(), to);
        self.unicast_socket.send_to(datagram, to).await?;
        Ok(())
    }
}
