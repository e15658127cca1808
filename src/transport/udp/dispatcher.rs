use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::identity::{LocalIdentity, PeerId, UDP_UNICAST_PORT_PROPERTY};
use crate::messaging::dto::{decode_datagram, AcknowledgementDto, AnnouncementDto, MessageDto, MultiPartChunkDto, PacketDto, Payload};
use crate::messaging::inbound::InboundMessageDispatcher;
use crate::peering::peer_table::PeerTable;
use crate::routing::routing_table::RoutingTable;
use crate::routing::RoutingContext;
use crate::transport::udp::acknowledgement_coordinator::AcknowledgementCoordinator;
use crate::transport::udp::duplicate_filter::DuplicateFilter;
use crate::transport::udp::multi_part::MultiPartPacketReassembler;
use crate::transport::udp::network::UdpNetwork;
use crate::transport::udp::routing_context::UdpRoutingContext;

#[derive(Default)]
pub struct UdpDispatcherStatistics {
    datagrams: AtomicU64,
    malformed_datagrams: AtomicU64,
    tossed_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    dispatched_messages: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UdpDispatcherStatisticsSnapshot {
    pub datagrams: u64,
    pub malformed_datagrams: u64,
    pub tossed_packets: u64,
    pub duplicate_packets: u64,
    pub dispatched_messages: u64,
}

impl UdpDispatcherStatistics {
    fn inc(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UdpDispatcherStatisticsSnapshot {
        UdpDispatcherStatisticsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            tossed_packets: self.tossed_packets.load(Ordering::Relaxed),
            duplicate_packets: self.duplicate_packets.load(Ordering::Relaxed),
            dispatched_messages: self.dispatched_messages.load(Ordering::Relaxed),
        }
    }
}

/// Processes inbound datagrams: acknowledgements, peer announcements and packets. Packets are
///  acknowledged, deduplicated and reassembled before the messages they carry are handed to the
///  [InboundMessageDispatcher].
pub struct UdpDispatcher {
    identity: Arc<LocalIdentity>,
    network: Arc<dyn UdpNetwork>,
    ack_coordinator: Arc<AcknowledgementCoordinator>,
    duplicate_filter: DuplicateFilter,
    reassembler: MultiPartPacketReassembler,
    routing_table: Arc<RoutingTable>,
    peer_table: Arc<PeerTable>,
    inbound_dispatcher: Arc<InboundMessageDispatcher>,
    routing_contexts: DashMap<PeerId, Arc<UdpRoutingContext>>,
    statistics: UdpDispatcherStatistics,
    max_datagram_payload: usize,
}

impl UdpDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<LocalIdentity>,
        network: Arc<dyn UdpNetwork>,
        ack_coordinator: Arc<AcknowledgementCoordinator>,
        routing_table: Arc<RoutingTable>,
        peer_table: Arc<PeerTable>,
        inbound_dispatcher: Arc<InboundMessageDispatcher>,
        max_datagram_payload: usize,
    ) -> UdpDispatcher {
        UdpDispatcher {
            identity,
            network,
            ack_coordinator,
            duplicate_filter: DuplicateFilter::new(),
            reassembler: MultiPartPacketReassembler::new(),
            routing_table,
            peer_table,
            inbound_dispatcher,
            routing_contexts: DashMap::new(),
            statistics: UdpDispatcherStatistics::default(),
            max_datagram_payload,
        }
    }

    pub fn statistics(&self) -> UdpDispatcherStatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn routing_context(&self, peer_id: PeerId) -> Option<Arc<UdpRoutingContext>> {
        self.routing_contexts.get(&peer_id)
            .map(|c| c.clone())
    }

    pub async fn handle_inbound_datagram(&self, datagram: &[u8], from: SocketAddr) {
        UdpDispatcherStatistics::inc(&self.statistics.datagrams, 1);

        let payloads = match decode_datagram(datagram) {
            Ok(payloads) => payloads,
            Err(e) => {
                UdpDispatcherStatistics::inc(&self.statistics.malformed_datagrams, 1);
                warn!("received malformed datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };

        let mut acknowledgements = Vec::new();
        let mut announcements = Vec::new();
        let mut reliable = Vec::new();
        let mut unreliable = Vec::new();
        for payload in payloads {
            match payload {
                Payload::Acknowledgement(a) => acknowledgements.push(a),
                Payload::Announcement(a) => announcements.push(a),
                Payload::Packet(p) if !self.identity.matches_receiver(p.receiver_id) => {
                    trace!("tossing packet {:?} for {:?}", p.id, p.receiver_id);
                    UdpDispatcherStatistics::inc(&self.statistics.tossed_packets, 1);
                }
                Payload::Packet(p) if p.is_reliable => reliable.push(p),
                Payload::Packet(p) => unreliable.push(p),
                other => debug!("unexpected payload of kind {:?} from {:?} - ignoring", other.kind(), from),
            }
        }

        for acknowledgement in &acknowledgements {
            self.ack_coordinator.process_acknowledgement(acknowledgement);
        }

        for announcement in announcements {
            self.on_announcement(announcement, from);
        }

        // acknowledge before deduplication: the previous acknowledgement may have been lost
        for packet in &reliable {
            self.acknowledge(packet).await;
        }

        let mut is_new = self.duplicate_filter.test_packet_ids_are_new(reliable.iter().map(|p| p.id));
        let num_reliable = reliable.len();
        reliable.retain(|p| is_new.remove(&p.id).unwrap_or(false));
        if reliable.len() < num_reliable {
            trace!("dropping {} duplicate packets", num_reliable - reliable.len());
            UdpDispatcherStatistics::inc(&self.statistics.duplicate_packets, (num_reliable - reliable.len()) as u64);
        }

        for packet in reliable.into_iter().chain(unreliable) {
            self.on_packet(packet);
        }
    }

    fn on_announcement(&self, announcement: AnnouncementDto, from: SocketAddr) {
        let identity = announcement.identity;
        let peer_id = identity.id();
        if peer_id == self.identity.id() {
            trace!("ignoring my own announcement");
            return;
        }
        if peer_id.is_broadcast() {
            debug!("announcement from {:?} without a peer id - ignoring", from);
            return;
        }

        match identity.declared_u16(UDP_UNICAST_PORT_PROPERTY) {
            Some(port) => {
                let endpoint = SocketAddr::new(from.ip(), port);
                match self.routing_contexts.entry(peer_id) {
                    Entry::Occupied(e) => e.get().update_remote_addr(endpoint),
                    Entry::Vacant(e) => {
                        debug!("new UDP peer {:?} at {:?}", peer_id, endpoint);
                        let context = Arc::new(UdpRoutingContext::new(
                            peer_id,
                            self.identity.id(),
                            endpoint,
                            self.network.clone(),
                            self.ack_coordinator.clone(),
                            self.max_datagram_payload,
                        ));
                        if let Err(e) = self.routing_table.register(peer_id, context.clone()) {
                            warn!("failed to register UDP routing context for {:?}: {}", peer_id, e);
                        }
                        e.insert(context);
                    }
                }
            }
            None => debug!("peer {:?} does not declare a UDP unicast port - it is not reachable directly", peer_id),
        }

        // the routing context goes first so that handlers released by discovery can reply
        self.peer_table.handle_inbound_peer_identity_update(identity);
    }

    async fn acknowledge(&self, packet: &PacketDto) {
        let acknowledgement = AcknowledgementDto { packet_id: packet.id };
        let result = match self.routing_context(packet.sender_id) {
            Some(context) => context.send_acknowledgement(acknowledgement).await,
            None => {
                trace!("no UDP route to {:?} - broadcasting acknowledgement", packet.sender_id);
                self.network.broadcast(&Payload::Acknowledgement(acknowledgement).to_bytes()).await
            }
        };
        if let Err(e) = result {
            warn!("failed to acknowledge packet {:?}: {}", packet.id, e);
        }
    }

    fn on_packet(&self, packet: PacketDto) {
        let message = packet.message;
        if !message.body.is::<MultiPartChunkDto>() {
            self.dispatch(message);
            return;
        }

        let chunk = match message.body.decode::<MultiPartChunkDto>() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("malformed multi-part chunk in packet {:?} - dropping: {}", packet.id, e);
                return;
            }
        };
        match self.reassembler.on_chunk(&message, chunk) {
            Ok(Some(complete)) => self.dispatch(complete),
            Ok(None) => {}
            Err(e) => warn!("invalid multi-part chunk in packet {:?} - dropping: {}", packet.id, e),
        }
    }

    fn dispatch(&self, message: MessageDto) {
        UdpDispatcherStatistics::inc(&self.statistics.dispatched_messages, 1);
        let inbound_dispatcher = self.inbound_dispatcher.clone();
        tokio::spawn(async move {
            inbound_dispatcher.dispatch(message).await;
        });
    }

    pub fn prune_stale_multi_part_messages(&self, max_age: Duration) {
        self.reassembler.prune_stale(max_age);
    }

    /// Unregisters all UDP routing contexts, for shutdown
    pub fn unregister_routing_contexts(&self) {
        let peers = self.routing_contexts.iter()
            .map(|e| *e.key())
            .collect::<Vec<_>>();
        for peer_id in peers {
            if let Some((_, context)) = self.routing_contexts.remove(&peer_id) {
                let context: Arc<dyn RoutingContext> = context;
                self.routing_table.unregister(peer_id, &context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::InboundConfig;
    use crate::identity::{Identity, PropertyValue};
    use crate::messaging::dto::MessageBody;
    use crate::messaging::inbound::{InboundMessageEvent, InboundMessageRouter};
    use crate::messaging::packet_id::PacketId;
    use crate::test_util::messages::{BlobMessage, TestMessage};
    use crate::test_util::tracking_network::TrackingUdpNetwork;
    use crate::transport::udp::routing_context::to_packet_datagrams;

    const MYSELF: PeerId = PeerId::from_u128(1);
    const PEER: PeerId = PeerId::from_u128(2);

    fn peer_addr() -> SocketAddr {
        "10.0.0.2:21337".parse().unwrap()
    }

    struct Fixture {
        dispatcher: UdpDispatcher,
        network: Arc<TrackingUdpNetwork>,
        ack_coordinator: Arc<AcknowledgementCoordinator>,
        routing_table: Arc<RoutingTable>,
        peer_table: Arc<PeerTable>,
        received: mpsc::UnboundedReceiver<InboundMessageEvent<TestMessage>>,
        received_blobs: mpsc::UnboundedReceiver<BlobMessage>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let identity = Arc::new(LocalIdentity::new(Identity::with_id(MYSELF, "myself")));
            let network = Arc::new(TrackingUdpNetwork::new(5000));
            let ack_coordinator = Arc::new(AcknowledgementCoordinator::new(None));
            let routing_table = Arc::new(RoutingTable::new());
            let peer_table = Arc::new(PeerTable::new());

            let router = Arc::new(InboundMessageRouter::new());
            let (send, received) = mpsc::unbounded_channel();
            router.register_handler(move |event: InboundMessageEvent<TestMessage>| {
                let send = send.clone();
                async move { send.send(event).unwrap(); }
            });
            let (send_blob, received_blobs) = mpsc::unbounded_channel();
            router.register_handler(move |event: InboundMessageEvent<BlobMessage>| {
                let send_blob = send_blob.clone();
                async move { send_blob.send(event.message).unwrap(); }
            });

            let inbound = Arc::new(InboundMessageDispatcher::new(identity.clone(), peer_table.clone(), router, InboundConfig::default()));
            let dispatcher = UdpDispatcher::new(identity, network.clone(), ack_coordinator.clone(), routing_table.clone(), peer_table.clone(), inbound, 1472);

            Fixture { dispatcher, network, ack_coordinator, routing_table, peer_table, received, received_blobs }
        }

        async fn receive(&self, payloads: &[Payload]) {
            let mut buf = BytesMut::new();
            for p in payloads {
                p.ser(&mut buf);
            }
            self.dispatcher.handle_inbound_datagram(&buf, peer_addr()).await;
        }
    }

    fn announcement(port: Option<i64>) -> Payload {
        let mut identity = Identity::with_id(PEER, "peer");
        if let Some(port) = port {
            identity = identity.with_declared_property(UDP_UNICAST_PORT_PROPERTY, PropertyValue::Int(port));
        }
        Payload::Announcement(AnnouncementDto { identity })
    }

    fn packet(id: u128, receiver_id: PeerId, is_reliable: bool) -> Payload {
        Payload::Packet(PacketDto {
            id: PacketId::from_u128(id),
            sender_id: PEER,
            receiver_id,
            message: MessageDto {
                body: MessageBody::of(&TestMessage::new(id as u64, "x")),
                sender_id: PEER,
                receiver_id,
            },
            is_reliable,
        })
    }

    fn ack(id: u128) -> Payload {
        Payload::Acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(id) })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_announcement_registers_route() {
        let fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000))]).await;

        let ctx = fixture.dispatcher.routing_context(PEER).unwrap();
        assert_eq!(ctx.remote_addr(), "10.0.0.2:4000".parse().unwrap());
        assert!(fixture.routing_table.try_get_routing_context(PEER).is_some());
        assert!(fixture.peer_table.get(PEER).unwrap().is_discovered());

        // repeated announcements refresh the endpoint without registering a second context
        fixture.receive(&[announcement(Some(4001))]).await;
        assert_eq!(ctx.remote_addr(), "10.0.0.2:4001".parse().unwrap());
        assert_eq!(fixture.routing_table.routing_contexts(PEER).len(), 1);
    }

    #[tokio::test]
    async fn test_announcement_without_port() {
        let fixture = Fixture::new();
        fixture.receive(&[announcement(None)]).await;

        assert!(fixture.routing_table.try_get_routing_context(PEER).is_none());
        assert!(fixture.peer_table.get(PEER).unwrap().is_discovered());
    }

    #[tokio::test]
    async fn test_own_announcement_is_ignored() {
        let fixture = Fixture::new();
        let own = Payload::Announcement(AnnouncementDto {
            identity: Identity::with_id(MYSELF, "myself").with_declared_property(UDP_UNICAST_PORT_PROPERTY, PropertyValue::Int(5000)),
        });
        fixture.receive(&[own]).await;

        assert!(fixture.routing_table.peers().is_empty());
        assert!(fixture.peer_table.get(MYSELF).is_none());
    }

    #[tokio::test]
    async fn test_reliable_packet_is_acknowledged_and_dispatched_once() {
        let mut fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000)), packet(7, MYSELF, true)]).await;
        fixture.receive(&[packet(7, MYSELF, true)]).await;
        settle().await;

        // both copies are acknowledged via the peer's routing context
        let acks = fixture.network.take_unicasts();
        assert_eq!(acks.len(), 2);
        for (addr, datagram) in acks {
            assert_eq!(addr, "10.0.0.2:4000".parse().unwrap());
            assert_eq!(decode_datagram(&datagram).unwrap(), vec![ack(7)]);
        }

        assert_eq!(fixture.received.recv().await.unwrap().message, TestMessage::new(7, "x"));
        assert!(fixture.received.try_recv().is_err());

        let stats = fixture.dispatcher.statistics();
        assert_eq!(stats.datagrams, 2);
        assert_eq!(stats.duplicate_packets, 1);
        assert_eq!(stats.dispatched_messages, 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_datagram() {
        let mut fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000)), packet(7, MYSELF, true), packet(7, MYSELF, true)]).await;
        settle().await;

        assert!(fixture.received.recv().await.is_some());
        assert!(fixture.received.try_recv().is_err());
        assert_eq!(fixture.dispatcher.statistics().duplicate_packets, 1);
    }

    #[tokio::test]
    async fn test_acknowledgement_without_route_is_broadcast() {
        let fixture = Fixture::new();
        fixture.receive(&[packet(7, MYSELF, true)]).await;

        assert!(fixture.network.take_unicasts().is_empty());
        let broadcasts = fixture.network.take_broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(decode_datagram(&broadcasts[0]).unwrap(), vec![ack(7)]);
    }

    #[tokio::test]
    async fn test_unreliable_packets_are_not_deduplicated() {
        let mut fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000)), packet(7, PeerId::BROADCAST, false)]).await;
        fixture.receive(&[packet(7, PeerId::BROADCAST, false)]).await;
        settle().await;

        assert!(fixture.network.take_unicasts().is_empty());
        assert!(fixture.received.recv().await.is_some());
        assert!(fixture.received.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_toss_filter() {
        let mut fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000)), packet(7, PeerId::from_u128(3), true), packet(8, PeerId::from_u128(3), false)]).await;
        settle().await;

        assert!(fixture.received.try_recv().is_err());
        assert!(fixture.network.take_unicasts().is_empty());
        let stats = fixture.dispatcher.statistics();
        assert_eq!(stats.tossed_packets, 2);
        assert_eq!(stats.dispatched_messages, 0);
    }

    #[tokio::test]
    async fn test_acknowledgement_completes_pending_send() {
        let fixture = Fixture::new();
        let completion = fixture.ack_coordinator.expect(PacketId::from_u128(3), peer_addr().into(), bytes::Bytes::new());

        fixture.receive(&[ack(3)]).await;
        completion.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_datagram() {
        let mut fixture = Fixture::new();
        let mut buf = BytesMut::new();
        packet(7, MYSELF, true).ser(&mut buf);
        buf.extend_from_slice(&[99]);

        fixture.dispatcher.handle_inbound_datagram(&buf, peer_addr()).await;
        settle().await;

        // nothing in the datagram is processed, not even the valid packet
        assert!(fixture.network.take_broadcasts().is_empty());
        assert!(fixture.received.try_recv().is_err());
        assert_eq!(fixture.dispatcher.statistics().malformed_datagrams, 1);
    }

    #[tokio::test]
    async fn test_message_waits_for_announcement() {
        let mut fixture = Fixture::new();
        fixture.receive(&[packet(7, MYSELF, false)]).await;
        settle().await;
        assert!(fixture.received.try_recv().is_err());

        fixture.receive(&[announcement(Some(4000))]).await;
        assert_eq!(fixture.received.recv().await.unwrap().message.value, 7);
        settle().await;
        assert!(fixture.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multi_part_reassembly() {
        let mut fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000))]).await;

        let blob = BlobMessage::with_len(5000);
        let message = MessageDto {
            body: MessageBody::of(&blob),
            sender_id: PEER,
            receiver_id: MYSELF,
        };
        let mut datagrams = to_packet_datagrams(PEER, message, true, 1472);
        datagrams.reverse();
        let num_datagrams = datagrams.len();
        for (_, datagram) in &datagrams {
            fixture.dispatcher.handle_inbound_datagram(datagram, peer_addr()).await;
        }
        // a resent chunk
        fixture.dispatcher.handle_inbound_datagram(&datagrams[0].1, peer_addr()).await;

        assert_eq!(fixture.received_blobs.recv().await.unwrap(), blob);
        settle().await;
        assert!(fixture.received_blobs.try_recv().is_err());
        assert_eq!(fixture.network.take_unicasts().len(), num_datagrams + 1);
    }

    #[tokio::test]
    async fn test_unregister_routing_contexts() {
        let fixture = Fixture::new();
        fixture.receive(&[announcement(Some(4000))]).await;

        fixture.dispatcher.unregister_routing_contexts();
        assert!(fixture.routing_table.peers().is_empty());
        assert!(fixture.dispatcher.routing_context(PEER).is_none());
    }
}
