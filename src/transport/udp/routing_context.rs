use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::CourierError;
use crate::identity::PeerId;
use crate::messaging::dto::{AcknowledgementDto, MessageDto, PacketDto, Payload};
use crate::messaging::packet_id::PacketId;
use crate::routing::RoutingContext;
use crate::transport::udp::acknowledgement_coordinator::AcknowledgementCoordinator;
use crate::transport::udp::multi_part::split_message;
use crate::transport::udp::network::{PeerEndpoint, UdpNetwork};
use crate::transport::UDP_ROUTING_WEIGHT;

/// Wraps messages into packets, splitting oversized ones, and serializes them as single-payload
///  datagrams
pub fn to_packet_datagrams(sender_id: PeerId, message: MessageDto, is_reliable: bool, max_datagram_payload: usize) -> Vec<(PacketId, bytes::Bytes)> {
    split_message(message, max_datagram_payload)
        .into_iter()
        .map(|message| {
            let packet = PacketDto {
                id: PacketId::new_random(),
                sender_id,
                receiver_id: message.receiver_id,
                message,
                is_reliable,
            };
            (packet.id, Payload::Packet(packet).to_bytes())
        })
        .collect()
}

/// Reaches a single peer through UDP unicast. The peer's endpoint is the source address of its
///  announcements combined with the unicast port it declares.
pub struct UdpRoutingContext {
    peer_id: PeerId,
    local_id: PeerId,
    endpoint: PeerEndpoint,
    network: Arc<dyn UdpNetwork>,
    ack_coordinator: Arc<AcknowledgementCoordinator>,
    max_datagram_payload: usize,
}

impl Debug for UdpRoutingContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UDP({:?}@{:?})", self.peer_id, self.remote_addr())
    }
}

impl UdpRoutingContext {
    pub fn new(peer_id: PeerId, local_id: PeerId, remote_addr: SocketAddr, network: Arc<dyn UdpNetwork>, ack_coordinator: Arc<AcknowledgementCoordinator>, max_datagram_payload: usize) -> UdpRoutingContext {
        UdpRoutingContext {
            peer_id,
            local_id,
            endpoint: PeerEndpoint::new(remote_addr),
            network,
            ack_coordinator,
            max_datagram_payload,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoint.get()
    }

    /// Pending reliable sends to this peer are resent to the new address
    pub fn update_remote_addr(&self, remote_addr: SocketAddr) {
        if let Some(previous) = self.endpoint.set(remote_addr) {
            debug!("unicast endpoint of {:?} changed from {:?} to {:?}", self.peer_id, previous, remote_addr);
        }
    }
}

#[async_trait]
impl RoutingContext for UdpRoutingContext {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn weight(&self) -> u32 {
        UDP_ROUTING_WEIGHT
    }

    /// All packets are sent before waiting for the first acknowledgement. Resends are up to the
    ///  resender loop.
    async fn send_reliable(&self, message: MessageDto) -> anyhow::Result<()> {
        let destination = self.remote_addr();
        let datagrams = to_packet_datagrams(self.local_id, message, true, self.max_datagram_payload);

        let mut completions = Vec::with_capacity(datagrams.len());
        for (packet_id, datagram) in datagrams {
            trace!("sending reliable packet {:?} to {:?}", packet_id, destination);
            completions.push(self.ack_coordinator.expect(packet_id, self.endpoint.clone(), datagram.clone()));
            if let Err(e) = self.network.unicast(destination, &datagram).await {
                // this is retried by the resender
                debug!("initial send of packet {:?} failed: {}", packet_id, e);
            }
        }

        for completion in completions {
            match completion.await {
                Ok(result) => result?,
                Err(_) => return Err(CourierError::ShutDown.into()),
            }
        }
        Ok(())
    }

    async fn send_unreliable(&self, message: MessageDto) -> anyhow::Result<()> {
        let destination = self.remote_addr();
        for (packet_id, datagram) in to_packet_datagrams(self.local_id, message, false, self.max_datagram_payload) {
            trace!("sending unreliable packet {:?} to {:?}", packet_id, destination);
            self.network.unicast(destination, &datagram).await?;
        }
        Ok(())
    }

    async fn send_acknowledgement(&self, acknowledgement: AcknowledgementDto) -> anyhow::Result<()> {
        let datagram = Payload::Acknowledgement(acknowledgement).to_bytes();
        self.network.unicast(self.remote_addr(), &datagram).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messaging::dto::{decode_datagram, MessageBody, MultiPartChunkDto};
    use crate::test_util::messages::{BlobMessage, TestMessage};
    use crate::test_util::tracking_network::TrackingUdpNetwork;

    const LOCAL: PeerId = PeerId::from_u128(1);
    const REMOTE: PeerId = PeerId::from_u128(2);

    fn remote_addr() -> SocketAddr {
        "10.0.0.2:4000".parse().unwrap()
    }

    fn context(network: Arc<TrackingUdpNetwork>, ack_coordinator: Arc<AcknowledgementCoordinator>) -> UdpRoutingContext {
        UdpRoutingContext::new(REMOTE, LOCAL, remote_addr(), network, ack_coordinator, 1472)
    }

    fn message<T: crate::messaging::message_type::Message>(msg: &T) -> MessageDto {
        MessageDto {
            body: MessageBody::of(msg),
            sender_id: LOCAL,
            receiver_id: REMOTE,
        }
    }

    fn single_packet(datagram: &[u8]) -> PacketDto {
        match decode_datagram(datagram).unwrap().as_slice() {
            [Payload::Packet(p)] => p.clone(),
            other => panic!("expected a single packet, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_unreliable() {
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let ctx = context(network.clone(), Arc::new(AcknowledgementCoordinator::new(None)));

        ctx.send_unreliable(message(&TestMessage::new(1, "a"))).await.unwrap();

        let sent = network.take_unicasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, remote_addr());
        let packet = single_packet(&sent[0].1);
        assert!(!packet.is_reliable);
        assert_eq!(packet.sender_id, LOCAL);
        assert_eq!(packet.receiver_id, REMOTE);
        assert_eq!(packet.message, message(&TestMessage::new(1, "a")));
    }

    #[tokio::test]
    async fn test_send_reliable_waits_for_all_acknowledgements() {
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let ack_coordinator = Arc::new(AcknowledgementCoordinator::new(None));
        let ctx = Arc::new(context(network.clone(), ack_coordinator.clone()));

        let send = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.send_reliable(message(&BlobMessage::with_len(3000))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let packets = network.take_unicasts().iter()
            .map(|(_, d)| single_packet(d))
            .collect::<Vec<_>>();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.is_reliable && p.message.body.is::<MultiPartChunkDto>()));
        assert_eq!(ack_coordinator.num_pending(), 3);

        for p in &packets[..2] {
            ack_coordinator.process_acknowledgement(&AcknowledgementDto { packet_id: p.id });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!send.is_finished());

        ack_coordinator.process_acknowledgement(&AcknowledgementDto { packet_id: packets[2].id });
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_reliable_fails_on_shutdown() {
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let ack_coordinator = Arc::new(AcknowledgementCoordinator::new(None));
        let ctx = Arc::new(context(network.clone(), ack_coordinator.clone()));

        let send = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.send_reliable(message(&TestMessage::new(1, "a"))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ack_coordinator.fail_all();

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<CourierError>(), Some(CourierError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_goes_to_updated_endpoint() {
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let ack_coordinator = Arc::new(AcknowledgementCoordinator::new(None));
        let ctx = Arc::new(context(network.clone(), ack_coordinator.clone()));

        let send = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.send_reliable(message(&TestMessage::new(1, "a"))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let packet = single_packet(&network.take_unicasts()[0].1);

        let new_addr: SocketAddr = "10.0.0.3:4001".parse().unwrap();
        ctx.update_remote_addr(new_addr);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let resends = ack_coordinator.due_for_resend(Duration::from_secs(1));
        assert_eq!(resends.len(), 1);
        assert_eq!(resends[0].packet_id, packet.id);
        assert_eq!(resends[0].destination, new_addr);

        ack_coordinator.process_acknowledgement(&AcknowledgementDto { packet_id: packet.id });
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_acknowledgement_to_updated_endpoint() {
        let network = Arc::new(TrackingUdpNetwork::new(5000));
        let ctx = context(network.clone(), Arc::new(AcknowledgementCoordinator::new(None)));
        let new_addr: SocketAddr = "10.0.0.3:4001".parse().unwrap();
        ctx.update_remote_addr(new_addr);

        ctx.send_acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(9) }).await.unwrap();

        let sent = network.take_unicasts();
        assert_eq!(sent[0].0, new_addr);
        assert_eq!(decode_datagram(&sent[0].1).unwrap(), vec![Payload::Acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(9) })]);
    }
}
