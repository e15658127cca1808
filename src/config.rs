use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(235, 13, 37, 1), 21337);

/// Bytes reserved in each datagram for framing around a multi-part chunk: payload kind, packet
///  header, message envelope and chunk header
pub const MULTI_PART_OVERHEAD: usize = 192;

#[derive(Clone, Debug)]
pub struct UdpTransportConfig {
    /// Announcements and broadcasts go to this group. All nodes of a cluster must agree on it.
    pub multicast_group: SocketAddrV4,
    pub multicast_interface: Ipv4Addr,
    pub multicast_ttl: u32,

    /// Port 0 lets the OS pick a port; the actual port is declared in the node's identity
    pub unicast_bind_addr: SocketAddr,

    pub announce_interval: Duration,
    pub resend_interval: Duration,

    /// `None` retries unacknowledged reliable packets until the transport shuts down
    pub max_resend_attempts: Option<u32>,

    /// Upper bound for a datagram's payload. Messages that do not fit are split into chunks.
    ///
    /// This must be supported by all routes between nodes: with full Ethernet frames and no
    ///  optional IP headers, UDP payload is `1500 - 20 - 8 = 1472` for IPV4.
    pub max_datagram_payload: usize,

    /// Partially received multi-part messages are discarded after this time
    pub multi_part_timeout: Duration,

    pub receive_buffer_size: usize,
    pub buffer_pool_size: usize,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        UdpTransportConfig {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            unicast_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            announce_interval: Duration::from_secs(5),
            resend_interval: Duration::from_secs(1),
            max_resend_attempts: None,
            max_datagram_payload: 1472,
            multi_part_timeout: Duration::from_secs(60),
            receive_buffer_size: 65536,
            buffer_pool_size: 64,
        }
    }
}

impl UdpTransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multicast_group.ip().is_multicast() {
            bail!("{} is not a multicast address", self.multicast_group.ip());
        }
        if self.max_datagram_payload < 2 * MULTI_PART_OVERHEAD {
            bail!("max datagram payload must be at least {} bytes", 2 * MULTI_PART_OVERHEAD);
        }
        if self.receive_buffer_size < self.max_datagram_payload {
            bail!("receive buffer size must be at least the max datagram payload");
        }
        if self.announce_interval.is_zero() || self.resend_interval.is_zero() {
            bail!("announce and resend intervals must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TcpRole {
    Server { bind_addr: SocketAddr },
    Client { connect_addr: SocketAddr },
}

#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    pub role: TcpRole,
    /// pause before re-binding or re-connecting after a failure or a dropped connection
    pub reconnect_backoff: Duration,
    /// a peer sending a larger frame is considered compromised and disconnected
    pub max_frame_length: usize,
    /// a connection is closed if the peer does not send its handshake within this time
    pub handshake_timeout: Duration,
}

impl TcpTransportConfig {
    pub fn server(bind_addr: SocketAddr) -> TcpTransportConfig {
        Self::with_role(TcpRole::Server { bind_addr })
    }

    pub fn client(connect_addr: SocketAddr) -> TcpTransportConfig {
        Self::with_role(TcpRole::Client { connect_addr })
    }

    fn with_role(role: TcpRole) -> TcpTransportConfig {
        TcpTransportConfig {
            role,
            reconnect_backoff: Duration::from_secs(5),
            max_frame_length: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_length == 0 || self.max_frame_length > u32::MAX as usize {
            bail!("max frame length must be between 1 and {}", u32::MAX);
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct InboundConfig {
    /// How long an inbound message from a not-yet-discovered peer waits for the peer's identity
    ///  before it is dropped
    pub discovery_timeout: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        InboundConfig {
            discovery_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_udp_defaults_are_valid() {
        UdpTransportConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::not_multicast(UdpTransportConfig { multicast_group: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1), ..Default::default() })]
    #[case::tiny_datagram(UdpTransportConfig { max_datagram_payload: 100, ..Default::default() })]
    #[case::small_receive_buffer(UdpTransportConfig { receive_buffer_size: 1000, ..Default::default() })]
    #[case::zero_interval(UdpTransportConfig { resend_interval: Duration::ZERO, ..Default::default() })]
    fn test_udp_invalid(#[case] config: UdpTransportConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tcp_config() {
        let config = TcpTransportConfig::server("127.0.0.1:0".parse().unwrap());
        config.validate().unwrap();
        assert_eq!(config.max_frame_length, 16 * 1024 * 1024);

        assert!(TcpTransportConfig { max_frame_length: 0, ..config.clone() }.validate().is_err());
        assert!(TcpTransportConfig { handshake_timeout: Duration::ZERO, ..config }.validate().is_err());
    }
}
