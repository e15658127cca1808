//! Multicast UDP transport: nodes discover each other through periodic announcements on a
//!  multicast group and talk to each other directly through their unicast sockets. Reliable
//!  sends are acknowledged per packet and resent until acknowledged.

pub mod acknowledgement_coordinator;
pub mod dispatcher;
pub mod duplicate_filter;
pub mod multi_part;
pub mod network;
pub mod periodic;
pub mod routing_context;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::UdpTransportConfig;
use crate::identity::{LocalIdentity, PropertyValue, UDP_UNICAST_PORT_PROPERTY};
use crate::messaging::dto::MessageDto;
use crate::messaging::inbound::InboundMessageDispatcher;
use crate::peering::peer_table::PeerTable;
use crate::routing::routing_table::RoutingTable;
use crate::transport::udp::acknowledgement_coordinator::AcknowledgementCoordinator;
use crate::transport::udp::dispatcher::{UdpDispatcher, UdpDispatcherStatisticsSnapshot};
use crate::transport::udp::network::{UdpClient, UdpNetwork};
use crate::transport::udp::periodic::{announce_once, announcer_loop, resender_loop};
use crate::transport::udp::routing_context::to_packet_datagrams;
use crate::transport::Transport;

pub struct UdpTransport {
    config: Arc<UdpTransportConfig>,
    identity: Arc<LocalIdentity>,
    network: Arc<dyn UdpNetwork>,
    dispatcher: Arc<UdpDispatcher>,
    ack_coordinator: Arc<AcknowledgementCoordinator>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Binds the sockets, declares the unicast port in the local identity and starts receiving,
    ///  announcing and resending
    pub async fn start(
        config: UdpTransportConfig,
        identity: Arc<LocalIdentity>,
        routing_table: Arc<RoutingTable>,
        peer_table: Arc<PeerTable>,
        inbound_dispatcher: Arc<InboundMessageDispatcher>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        config.validate()?;

        let client = Arc::new(UdpClient::bind(&config).await?);
        let transport = Self::start_with_network(config, client.clone(), identity, routing_table, peer_table, inbound_dispatcher)?;

        let receive_loops = client.spawn_receive_loops(transport.dispatcher.clone(), transport.cancel.clone());
        transport.tasks.lock().unwrap().extend(receive_loops);
        Ok(transport)
    }

    /// Starts the transport on top of an arbitrary network. Feeding inbound datagrams to
    ///  [UdpTransport::dispatcher] is up to the caller.
    pub fn start_with_network(
        config: UdpTransportConfig,
        network: Arc<dyn UdpNetwork>,
        identity: Arc<LocalIdentity>,
        routing_table: Arc<RoutingTable>,
        peer_table: Arc<PeerTable>,
        inbound_dispatcher: Arc<InboundMessageDispatcher>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        config.validate()?;
        let config = Arc::new(config);

        let unicast_port = network.local_unicast_port();
        identity.update_with(|i| i.clone().with_declared_property(UDP_UNICAST_PORT_PROPERTY, PropertyValue::Int(unicast_port.into())))?;
        info!("starting UDP transport, reachable on unicast port {}", unicast_port);

        let ack_coordinator = Arc::new(AcknowledgementCoordinator::new(config.max_resend_attempts));
        let dispatcher = Arc::new(UdpDispatcher::new(
            identity.clone(),
            network.clone(),
            ack_coordinator.clone(),
            routing_table,
            peer_table,
            inbound_dispatcher,
            config.max_datagram_payload,
        ));

        let cancel = CancellationToken::new();
        let announcer = tokio::spawn(announcer_loop(identity.clone(), network.clone(), config.announce_interval, cancel.clone()));
        let resender = tokio::spawn(resender_loop(
            ack_coordinator.clone(),
            dispatcher.clone(),
            network.clone(),
            config.resend_interval,
            config.multi_part_timeout,
            cancel.clone(),
        ));

        Ok(Arc::new(UdpTransport {
            config,
            identity,
            network,
            dispatcher,
            ack_coordinator,
            cancel,
            tasks: Mutex::new(vec![announcer, resender]),
        }))
    }

    pub fn dispatcher(&self) -> &Arc<UdpDispatcher> {
        &self.dispatcher
    }

    pub fn statistics(&self) -> UdpDispatcherStatisticsSnapshot {
        self.dispatcher.statistics()
    }

    /// Sends an announcement right away instead of waiting for the next interval, e.g. after
    ///  the local identity changed
    pub async fn announce_now(&self) {
        announce_once(&self.identity, self.network.as_ref()).await
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn broadcast(&self, message: MessageDto) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(crate::error::CourierError::ShutDown.into());
        }
        for (packet_id, datagram) in to_packet_datagrams(self.identity.id(), message, false, self.config.max_datagram_payload) {
            trace!("broadcasting packet {:?}", packet_id);
            self.network.broadcast(&datagram).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down UDP transport");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("UDP transport task failed: {}", e);
            }
        }

        self.dispatcher.unregister_routing_contexts();
        self.ack_coordinator.fail_all();
        debug!("UDP transport is shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::InboundConfig;
    use crate::error::CourierError;
    use crate::identity::{Identity, PeerId};
    use crate::messaging::dto::{decode_datagram, MessageBody, Payload};
    use crate::messaging::inbound::InboundMessageRouter;
    use crate::routing::RoutingContext;
    use crate::test_util::messages::{BlobMessage, TestMessage};
    use crate::test_util::tracking_network::TrackingUdpNetwork;

    const MYSELF: PeerId = PeerId::from_u128(1);
    const PEER: PeerId = PeerId::from_u128(2);

    struct Fixture {
        transport: Arc<UdpTransport>,
        network: Arc<TrackingUdpNetwork>,
        identity: Arc<LocalIdentity>,
        routing_table: Arc<RoutingTable>,
    }

    fn start(config: UdpTransportConfig) -> Fixture {
        let identity = Arc::new(LocalIdentity::new(Identity::with_id(MYSELF, "myself")));
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let routing_table = Arc::new(RoutingTable::new());
        let peer_table = Arc::new(PeerTable::new());
        let inbound = Arc::new(InboundMessageDispatcher::new(identity.clone(), peer_table.clone(), Arc::new(InboundMessageRouter::new()), InboundConfig::default()));

        let transport = UdpTransport::start_with_network(config, network.clone(), identity.clone(), routing_table.clone(), peer_table, inbound).unwrap();
        Fixture { transport, network, identity, routing_table }
    }

    fn broadcast_message<T: crate::messaging::message_type::Message>(msg: &T) -> MessageDto {
        MessageDto {
            body: MessageBody::of(msg),
            sender_id: MYSELF,
            receiver_id: PeerId::BROADCAST,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_declares_port_and_announces() {
        let fixture = start(UdpTransportConfig::default());
        assert_eq!(fixture.identity.snapshot().declared_u16(UDP_UNICAST_PORT_PROPERTY), Some(5000));

        tokio::time::sleep(Duration::from_millis(1)).await;
        let announcements = fixture.network.take_broadcasts();
        assert_eq!(announcements.len(), 1);
        match decode_datagram(&announcements[0]).unwrap().as_slice() {
            [Payload::Announcement(a)] => assert_eq!(a.identity.declared_u16(UDP_UNICAST_PORT_PROPERTY), Some(5000)),
            other => panic!("expected an announcement, was {:?}", other),
        }

        fixture.transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_splits_large_messages() {
        let fixture = start(UdpTransportConfig::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        fixture.network.take_broadcasts();

        fixture.transport.broadcast(broadcast_message(&TestMessage::new(1, "a"))).await.unwrap();
        fixture.transport.broadcast(broadcast_message(&BlobMessage::with_len(5000))).await.unwrap();

        let sent = fixture.network.take_broadcasts();
        assert_eq!(sent.len(), 5);
        for datagram in sent {
            match decode_datagram(&datagram).unwrap().as_slice() {
                [Payload::Packet(p)] => {
                    assert!(!p.is_reliable);
                    assert_eq!(p.receiver_id, PeerId::BROADCAST);
                }
                other => panic!("expected a packet, was {:?}", other),
            }
        }

        fixture.transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown() {
        let fixture = start(UdpTransportConfig::default());

        let announcement = Payload::Announcement(crate::messaging::dto::AnnouncementDto {
            identity: Identity::with_id(PEER, "peer").with_declared_property(UDP_UNICAST_PORT_PROPERTY, PropertyValue::Int(4000)),
        });
        fixture.transport.dispatcher().handle_inbound_datagram(&announcement.to_bytes(), "10.0.0.2:21337".parse().unwrap()).await;
        let context = fixture.routing_table.try_get_routing_context(PEER).unwrap();

        let pending = {
            let context = context.clone();
            tokio::spawn(async move {
                context.send_reliable(MessageDto {
                    body: MessageBody::of(&TestMessage::new(1, "a")),
                    sender_id: MYSELF,
                    receiver_id: PEER,
                }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        fixture.transport.shutdown().await.unwrap();

        assert!(fixture.routing_table.peers().is_empty());
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<CourierError>(), Some(CourierError::ShutDown)));

        let err = fixture.transport.broadcast(broadcast_message(&TestMessage::new(1, "a"))).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CourierError>(), Some(CourierError::ShutDown)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let identity = Arc::new(LocalIdentity::new(Identity::with_id(MYSELF, "myself")));
        let peer_table = Arc::new(PeerTable::new());
        let inbound = Arc::new(InboundMessageDispatcher::new(identity.clone(), peer_table.clone(), Arc::new(InboundMessageRouter::new()), InboundConfig::default()));
        let config = UdpTransportConfig { max_datagram_payload: 10, ..Default::default() };

        assert!(UdpTransport::start_with_network(config, Arc::new(TrackingUdpNetwork::new(5000)), identity.clone(), Arc::new(RoutingTable::new()), peer_table, inbound).is_err());
        assert!(identity.snapshot().declared_u16(UDP_UNICAST_PORT_PROPERTY).is_none());
    }
}
