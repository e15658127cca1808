use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{InboundConfig, TcpTransportConfig, UdpTransportConfig};
use crate::identity::{Identity, LocalIdentity};
use crate::messaging::inbound::{InboundMessageDispatcher, InboundMessageRouter};
use crate::messaging::messenger::Messenger;
use crate::peering::peer_table::PeerTable;
use crate::routing::routing_table::RoutingTable;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::network::UdpNetwork;
use crate::transport::udp::UdpTransport;
use crate::transport::Transport;

enum UdpSetup {
    Sockets(UdpTransportConfig),
    Network(UdpTransportConfig, Arc<dyn UdpNetwork>),
}

/// Collects the configuration of a [Courier] node before starting its transports
pub struct CourierBuilder {
    identity: Identity,
    udp: Option<UdpSetup>,
    tcp: Vec<TcpTransportConfig>,
    inbound_config: InboundConfig,
}

impl CourierBuilder {
    pub fn new(identity: Identity) -> CourierBuilder {
        CourierBuilder {
            identity,
            udp: None,
            tcp: Vec::new(),
            inbound_config: InboundConfig::default(),
        }
    }

    pub fn with_udp(mut self, config: UdpTransportConfig) -> CourierBuilder {
        self.udp = Some(UdpSetup::Sockets(config));
        self
    }

    /// UDP transport on top of a network other than real sockets, e.g. an in-memory fabric
    pub fn with_udp_network(mut self, config: UdpTransportConfig, network: Arc<dyn UdpNetwork>) -> CourierBuilder {
        self.udp = Some(UdpSetup::Network(config, network));
        self
    }

    /// Adds a TCP transport. This can be called several times, e.g. to listen for connections
    ///  and connect to some other node.
    pub fn with_tcp(mut self, config: TcpTransportConfig) -> CourierBuilder {
        self.tcp.push(config);
        self
    }

    pub fn with_inbound_config(mut self, inbound_config: InboundConfig) -> CourierBuilder {
        self.inbound_config = inbound_config;
        self
    }

    /// Starts all configured transports. If one of them fails to start, the ones that were
    ///  already started are shut down again.
    pub async fn build(self) -> anyhow::Result<Courier> {
        let identity = Arc::new(LocalIdentity::new(self.identity));
        let routing_table = Arc::new(RoutingTable::new());
        let peer_table = Arc::new(PeerTable::new());
        let router = Arc::new(InboundMessageRouter::new());
        let inbound_dispatcher = Arc::new(InboundMessageDispatcher::new(identity.clone(), peer_table.clone(), router.clone(), self.inbound_config));

        info!("starting courier node {:?}", identity.id());

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();

        let udp = match self.udp {
            None => None,
            Some(setup) => {
                let started = match setup {
                    UdpSetup::Sockets(config) => UdpTransport::start(config, identity.clone(), routing_table.clone(), peer_table.clone(), inbound_dispatcher.clone()).await,
                    UdpSetup::Network(config, network) => UdpTransport::start_with_network(config, network, identity.clone(), routing_table.clone(), peer_table.clone(), inbound_dispatcher.clone()),
                };
                let udp = started?;
                transports.push(udp.clone());
                Some(udp)
            }
        };

        let mut tcp = Vec::new();
        for config in self.tcp {
            match TcpTransport::start(config, identity.clone(), routing_table.clone(), peer_table.clone(), inbound_dispatcher.clone()) {
                Ok(t) => {
                    transports.push(t.clone());
                    tcp.push(t);
                }
                Err(e) => {
                    shutdown_all(&transports).await;
                    return Err(e);
                }
            }
        }

        let messenger = Arc::new(Messenger::new(identity.clone(), routing_table.clone(), transports.clone()));

        Ok(Courier {
            identity,
            routing_table,
            peer_table,
            router,
            messenger,
            udp,
            tcp,
            transports,
        })
    }
}

async fn shutdown_all(transports: &[Arc<dyn Transport>]) {
    for transport in transports {
        if let Err(e) = transport.shutdown().await {
            warn!("error shutting down {} transport: {}", transport.name(), e);
        }
    }
}

/// A running node: the local identity, the routing and peer tables that the transports share,
///  and the application facing [Messenger] and [InboundMessageRouter].
pub struct Courier {
    identity: Arc<LocalIdentity>,
    routing_table: Arc<RoutingTable>,
    peer_table: Arc<PeerTable>,
    router: Arc<InboundMessageRouter>,
    messenger: Arc<Messenger>,
    udp: Option<Arc<UdpTransport>>,
    tcp: Vec<Arc<TcpTransport>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl Courier {
    pub fn builder(identity: Identity) -> CourierBuilder {
        CourierBuilder::new(identity)
    }

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn router(&self) -> &Arc<InboundMessageRouter> {
        &self.router
    }

    pub fn peer_table(&self) -> &Arc<PeerTable> {
        &self.peer_table
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn udp_transport(&self) -> Option<&Arc<UdpTransport>> {
        self.udp.as_ref()
    }

    pub fn tcp_transports(&self) -> &[Arc<TcpTransport>] {
        &self.tcp
    }

    /// Replaces the local identity and sends it to peers right away. Changing the id is an
    ///  error.
    pub async fn update_identity(&self, f: impl FnOnce(&Identity) -> Identity) -> anyhow::Result<()> {
        self.identity.update_with(f)?;
        if let Some(udp) = &self.udp {
            udp.announce_now().await;
        }
        for tcp in &self.tcp {
            tcp.announce_now().await;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("shutting down courier node {:?}", self.identity.id());
        shutdown_all(&self.transports).await;
    }
}
