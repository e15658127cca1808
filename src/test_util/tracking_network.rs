use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::udp::network::UdpNetwork;

/// A [UdpNetwork] that records what is sent instead of sending it
pub struct TrackingUdpNetwork {
    unicast_port: u16,
    broadcasts: Mutex<Vec<Bytes>>,
    unicasts: Mutex<Vec<(SocketAddr, Bytes)>>,
    failing: AtomicBool,
}

impl TrackingUdpNetwork {
    pub fn new(unicast_port: u16) -> TrackingUdpNetwork {
        TrackingUdpNetwork {
            unicast_port,
            broadcasts: Default::default(),
            unicasts: Default::default(),
            failing: AtomicBool::new(false),
        }
    }

    /// While failing, sends return an error and are not recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn take_broadcasts(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.broadcasts.lock().unwrap())
    }

    pub fn take_unicasts(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.unicasts.lock().unwrap())
    }
}

#[async_trait]
impl UdpNetwork for TrackingUdpNetwork {
    fn local_unicast_port(&self) -> u16 {
        self.unicast_port
    }

    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            bail!("simulated network failure");
        }
        self.broadcasts.lock().unwrap().push(Bytes::copy_from_slice(datagram));
        Ok(())
    }

    async fn unicast(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            bail!("simulated network failure");
        }
        self.unicasts.lock().unwrap().push((to, Bytes::copy_from_slice(datagram)));
        Ok(())
    }
}
