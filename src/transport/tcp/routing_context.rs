use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::identity::{Identity, PeerId};
use crate::messaging::dto::{AcknowledgementDto, HandshakeDto, MessageDto, Payload};
use crate::routing::RoutingContext;
use crate::transport::tcp::frame::write_frame;
use crate::transport::TCP_ROUTING_WEIGHT;

pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Sends to a peer through the write half of a TCP connection. TCP takes care of delivery, so
///  reliable and unreliable sends are the same, and there are no acknowledgements.
pub struct TcpRoutingContext {
    peer_id: PeerId,
    remote_addr: SocketAddr,
    writer: Mutex<FrameWriter>,
    max_frame_length: usize,
}

impl Debug for TcpRoutingContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TCP({:?}@{:?})", self.peer_id, self.remote_addr)
    }
}

impl TcpRoutingContext {
    pub fn new(peer_id: PeerId, remote_addr: SocketAddr, writer: FrameWriter, max_frame_length: usize) -> TcpRoutingContext {
        TcpRoutingContext {
            peer_id,
            remote_addr,
            writer: Mutex::new(writer),
            max_frame_length,
        }
    }

    async fn send(&self, message: MessageDto) -> anyhow::Result<()> {
        trace!("sending message of type {:?} to {:?}", message.body.type_id, self.remote_addr);
        self.write(&Payload::Message(message)).await
    }

    /// Repeats the handshake with an updated identity. The peer's id must not change.
    pub async fn send_identity(&self, identity: Identity) -> anyhow::Result<()> {
        self.write(&Payload::Handshake(HandshakeDto { identity })).await
    }

    async fn write(&self, payload: &Payload) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut **writer, payload, self.max_frame_length).await
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("error closing connection to {:?}: {}", self.remote_addr, e);
        }
    }
}

#[async_trait]
impl RoutingContext for TcpRoutingContext {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn weight(&self) -> u32 {
        TCP_ROUTING_WEIGHT
    }

    async fn send_reliable(&self, message: MessageDto) -> anyhow::Result<()> {
        self.send(message).await
    }

    async fn send_unreliable(&self, message: MessageDto) -> anyhow::Result<()> {
        self.send(message).await
    }

    async fn send_acknowledgement(&self, _acknowledgement: AcknowledgementDto) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::messaging::dto::MessageBody;
    use crate::messaging::packet_id::PacketId;
    use crate::test_util::messages::TestMessage;
    use crate::transport::tcp::frame::read_frame;

    #[tokio::test]
    async fn test_send() {
        let (a, mut b) = duplex(4096);
        let ctx = TcpRoutingContext::new(PeerId::from_u128(2), "127.0.0.1:1".parse().unwrap(), Box::new(a), 1024);

        let message = MessageDto {
            body: MessageBody::of(&TestMessage::new(1, "a")),
            sender_id: PeerId::from_u128(1),
            receiver_id: PeerId::from_u128(2),
        };
        ctx.send_reliable(message.clone()).await.unwrap();
        ctx.send_unreliable(message.clone()).await.unwrap();
        ctx.send_acknowledgement(AcknowledgementDto { packet_id: PacketId::from_u128(1) }).await.unwrap();
        ctx.send_identity(Identity::with_id(PeerId::from_u128(1), "renamed")).await.unwrap();
        ctx.shutdown().await;

        assert_eq!(read_frame(&mut b, 1024).await.unwrap().map(|f| f.into_payload().unwrap()), Some(Payload::Message(message.clone())));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().map(|f| f.into_payload().unwrap()), Some(Payload::Message(message)));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().map(|f| f.into_payload().unwrap()), Some(Payload::Handshake(HandshakeDto { identity: Identity::with_id(PeerId::from_u128(1), "renamed") })));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().map(|f| f.into_payload().unwrap()), None);
        assert_eq!(ctx.weight(), TCP_ROUTING_WEIGHT);
    }
}
