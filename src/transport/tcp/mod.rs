//! Connection oriented transport. A node either listens for connections (server role) or keeps
//!  a connection to a configured address (client role). Both ends of a connection start by
//!  exchanging their identities in a handshake, and each connection becomes a routing context
//!  for the peer at the other end.

pub mod frame;
pub mod routing_context;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use crate::config::{TcpRole, TcpTransportConfig};
use crate::error::CourierError;
use crate::identity::{LocalIdentity, PeerId};
use crate::messaging::dto::{HandshakeDto, MessageDto, Payload};
use crate::messaging::inbound::InboundMessageDispatcher;
use crate::peering::peer_table::PeerTable;
use crate::routing::routing_table::RoutingTable;
use crate::routing::RoutingContext;
use crate::transport::tcp::frame::{read_frame, write_frame, Frame};
use crate::transport::tcp::routing_context::TcpRoutingContext;
use crate::transport::Transport;

pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
    identity: Arc<LocalIdentity>,
    routing_table: Arc<RoutingTable>,
    peer_table: Arc<PeerTable>,
    inbound_dispatcher: Arc<InboundMessageDispatcher>,
    connections: DashMap<u64, Arc<TcpRoutingContext>>,
    next_connection_id: AtomicU64,
    listening_addr: watch::Sender<Option<SocketAddr>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TcpTransport {
    pub fn start(
        config: TcpTransportConfig,
        identity: Arc<LocalIdentity>,
        routing_table: Arc<RoutingTable>,
        peer_table: Arc<PeerTable>,
        inbound_dispatcher: Arc<InboundMessageDispatcher>,
    ) -> anyhow::Result<Arc<TcpTransport>> {
        config.validate()?;

        let (listening_addr, _) = watch::channel(None);
        let transport = Arc::new(TcpTransport {
            config: Arc::new(config),
            identity,
            routing_table,
            peer_table,
            inbound_dispatcher,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(0),
            listening_addr,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        match transport.config.role.clone() {
            TcpRole::Server { bind_addr } => {
                transport.tracker.spawn(transport.clone().server_loop(bind_addr));
            }
            TcpRole::Client { connect_addr } => {
                transport.tracker.spawn(transport.clone().client_loop(connect_addr));
            }
        }
        Ok(transport)
    }

    /// Waits until the server socket is bound and returns its address, or `None` for the client
    ///  role or after shutdown
    pub async fn listening_addr(&self) -> Option<SocketAddr> {
        if !matches!(self.config.role, TcpRole::Server { .. }) {
            return None;
        }
        let mut receiver = self.listening_addr.subscribe();
        select! {
            _ = self.cancel.cancelled() => None,
            addr = receiver.wait_for(|a| a.is_some()) => addr.ok().and_then(|a| *a),
        }
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Sends the current local identity to all connected peers
    pub async fn announce_now(&self) {
        let identity = self.identity.snapshot();
        let contexts = self.connections.iter()
            .map(|c| c.value().clone())
            .collect::<Vec<_>>();

        for context in contexts {
            if let Err(e) = context.send_identity(identity.as_ref().clone()).await {
                warn!("failed to send identity update to {:?}: {}", context, e);
            }
        }
    }

    /// returns false if the transport was shut down while waiting
    async fn backoff(&self) -> bool {
        select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.reconnect_backoff) => true,
        }
    }

    #[instrument(name = "tcp_server", skip_all, fields(%bind_addr))]
    async fn server_loop(self: Arc<Self>, bind_addr: SocketAddr) {
        while !self.cancel.is_cancelled() {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr().ok();
                    info!("listening on {:?}", local_addr);
                    self.listening_addr.send_replace(local_addr);

                    if let Err(e) = self.accept_loop(&listener).await {
                        warn!("accepting connections failed: {}", e);
                    }
                    self.listening_addr.send_replace(None);
                }
                Err(e) => warn!("failed to bind to {:?}: {}", bind_addr, e),
            }

            if !self.backoff().await {
                break;
            }
        }
        debug!("server loop terminated");
    }

    /// Returns `Ok` on shutdown
    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, remote_addr) = select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            debug!("accepted connection from {:?}", remote_addr);

            let this = self.clone();
            self.tracker.spawn(
                async move {
                    if let Err(e) = this.handle_connection(stream, remote_addr).await {
                        warn!("connection from {:?} broke with an error: {}", remote_addr, e);
                    }
                }
                .instrument(Span::current())
            );
        }
    }

    #[instrument(name = "tcp_client", skip_all, fields(%connect_addr))]
    async fn client_loop(self: Arc<Self>, connect_addr: SocketAddr) {
        loop {
            let connected = select! {
                _ = self.cancel.cancelled() => break,
                connected = TcpStream::connect(connect_addr) => connected,
            };

            match connected {
                Ok(stream) => {
                    debug!("connected");
                    match self.clone().handle_connection(stream, connect_addr).await {
                        Ok(_) => debug!("connection closed"),
                        Err(e) => warn!("connection broke with an error: {}", e),
                    }
                }
                Err(e) => warn!("failed to connect: {}", e),
            }

            if !self.backoff().await {
                break;
            }
        }
        debug!("client loop terminated");
    }

    #[instrument(name = "tcp_connection", skip_all, fields(%remote_addr))]
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let max_frame_length = self.config.max_frame_length;

        let handshake = Payload::Handshake(HandshakeDto { identity: self.identity.snapshot().as_ref().clone() });
        write_frame(&mut writer, &handshake, max_frame_length).await?;

        let remote_identity = select! {
            _ = self.cancel.cancelled() => return Ok(()),
            frame = timeout(self.config.handshake_timeout, read_frame(&mut reader, max_frame_length)) => {
                let Ok(frame) = frame else {
                    bail!("no handshake within {:?}", self.config.handshake_timeout);
                };
                match frame?.map(Frame::into_payload).transpose()? {
                    Some(Payload::Handshake(h)) => h.identity,
                    Some(other) => bail!("expected a handshake, received {:?}", other.kind()),
                    None => bail!("connection closed during handshake"),
                }
            },
        };
        let peer_id = remote_identity.id();
        if peer_id == self.identity.id() {
            bail!("connected to myself");
        }
        if peer_id.is_broadcast() {
            bail!("handshake without a peer id");
        }
        debug!("handshake complete with {:?} ({})", peer_id, remote_identity.vanity_name());

        let context = Arc::new(TcpRoutingContext::new(peer_id, remote_addr, Box::new(writer), max_frame_length));
        let routing_context: Arc<dyn RoutingContext> = context.clone();
        self.routing_table.register(peer_id, routing_context.clone())?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(connection_id, context.clone());
        self.peer_table.handle_inbound_peer_identity_update(remote_identity);

        let result = self.receive_loop(&mut reader, peer_id).await;

        self.routing_table.unregister(peer_id, &routing_context);
        self.connections.remove(&connection_id);
        context.shutdown().await;
        result
    }

    async fn receive_loop(&self, reader: &mut OwnedReadHalf, peer_id: PeerId) -> anyhow::Result<()> {
        loop {
            let frame = select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = read_frame(reader, self.config.max_frame_length) => frame?,
            };

            let payload = match frame {
                None => {
                    debug!("connection closed by {:?}", peer_id);
                    return Ok(());
                }
                Some(Frame::Malformed(e)) => {
                    warn!("malformed frame from {:?} - dropping: {}", peer_id, e);
                    continue;
                }
                Some(Frame::Payload(payload)) => payload,
            };

            match payload {
                Payload::Message(message) => {
                    if message.sender_id != peer_id {
                        warn!("message on connection with {:?} claims to be from {:?} - dropping", peer_id, message.sender_id);
                        continue;
                    }
                    trace!("received message of type {:?}", message.body.type_id);
                    let inbound_dispatcher = self.inbound_dispatcher.clone();
                    tokio::spawn(async move {
                        inbound_dispatcher.dispatch(message).await;
                    });
                }
                Payload::Handshake(h) => {
                    if h.identity.id() != peer_id {
                        bail!("peer {:?} sent a handshake for {:?}", peer_id, h.identity.id());
                    }
                    self.peer_table.handle_inbound_peer_identity_update(h.identity);
                }
                other => debug!("unexpected payload of kind {:?} - ignoring", other.kind()),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn broadcast(&self, message: MessageDto) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CourierError::ShutDown.into());
        }
        let contexts = self.connections.iter()
            .map(|c| c.value().clone())
            .collect::<Vec<_>>();

        for context in contexts {
            if let Err(e) = context.send_unreliable(message.clone()).await {
                warn!("broadcast to {:?} failed: {}", context, e);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down TCP transport");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("TCP transport is shut down");
        Ok(())
    }
}
