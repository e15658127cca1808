use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::CourierError;
use crate::messaging::dto::AcknowledgementDto;
use crate::messaging::packet_id::PacketId;
use crate::transport::udp::network::PeerEndpoint;

struct PendingSend {
    datagram: Bytes,
    destination: PeerEndpoint,
    last_sent: Instant,
    resend_attempts: u32,
    completion: oneshot::Sender<Result<(), CourierError>>,
}

/// A datagram that is due for re-transmission, with the same packet id as the original
#[derive(Debug, Clone)]
pub struct Resend {
    pub packet_id: PacketId,
    pub destination: SocketAddr,
    pub datagram: Bytes,
}

/// Keeps track of reliable packets until they are acknowledged. Each pending packet has a
///  waiting sender that is completed by the acknowledgement, by exceeding the resend limit or by
///  shutdown.
pub struct AcknowledgementCoordinator {
    pending: DashMap<PacketId, PendingSend>,
    max_resend_attempts: Option<u32>,
}

impl AcknowledgementCoordinator {
    pub fn new(max_resend_attempts: Option<u32>) -> AcknowledgementCoordinator {
        AcknowledgementCoordinator {
            pending: DashMap::new(),
            max_resend_attempts,
        }
    }

    /// Registers a packet before it is sent for the first time. The returned receiver completes
    ///  when the packet's fate is known. Resends go to wherever `destination` points at the time.
    pub fn expect(&self, packet_id: PacketId, destination: PeerEndpoint, datagram: Bytes) -> oneshot::Receiver<Result<(), CourierError>> {
        let (completion, result) = oneshot::channel();
        let previous = self.pending.insert(packet_id, PendingSend {
            datagram,
            destination,
            last_sent: Instant::now(),
            resend_attempts: 0,
            completion,
        });
        if previous.is_some() {
            warn!("packet id {:?} was registered twice - the first sender will see a shutdown", packet_id);
        }
        result
    }

    /// returns false if the packet was not pending, e.g. because it was acknowledged before
    pub fn process_acknowledgement(&self, acknowledgement: &AcknowledgementDto) -> bool {
        match self.pending.remove(&acknowledgement.packet_id) {
            Some((packet_id, pending)) => {
                trace!("packet {:?} was acknowledged after {} resends", packet_id, pending.resend_attempts);
                // the sender may have stopped waiting
                let _ = pending.completion.send(Ok(()));
                true
            }
            None => {
                trace!("acknowledgement for packet {:?} that is not pending", acknowledgement.packet_id);
                false
            }
        }
    }

    pub fn is_pending(&self, packet_id: PacketId) -> bool {
        self.pending.contains_key(&packet_id)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Collects packets that were last sent at least `resend_interval` ago, counting this as a
    ///  resend attempt. Packets exceeding the resend limit are failed and dropped instead.
    pub fn due_for_resend(&self, resend_interval: Duration) -> Vec<Resend> {
        let now = Instant::now();
        let mut result = Vec::new();
        let mut expired = Vec::new();

        for mut entry in self.pending.iter_mut() {
            if now.duration_since(entry.last_sent) < resend_interval {
                continue;
            }
            if let Some(max) = self.max_resend_attempts {
                if entry.resend_attempts >= max {
                    expired.push(*entry.key());
                    continue;
                }
            }
            entry.resend_attempts += 1;
            entry.last_sent = now;
            result.push(Resend {
                packet_id: *entry.key(),
                destination: entry.destination.get(),
                datagram: entry.datagram.clone(),
            });
        }

        for packet_id in expired {
            if let Some((_, pending)) = self.pending.remove(&packet_id) {
                debug!("packet {:?} to {:?} was not acknowledged after {} resends - giving up", packet_id, pending.destination.get(), pending.resend_attempts);
                let _ = pending.completion.send(Err(CourierError::AcknowledgementTimeout {
                    packet_id,
                    attempts: pending.resend_attempts,
                }));
            }
        }

        result
    }

    /// Fails all pending sends, for shutdown
    pub fn fail_all(&self) {
        let packet_ids = self.pending.iter()
            .map(|e| *e.key())
            .collect::<Vec<_>>();
        if !packet_ids.is_empty() {
            debug!("failing {} pending reliable sends", packet_ids.len());
        }

        for packet_id in packet_ids {
            if let Some((_, pending)) = self.pending.remove(&packet_id) {
                let _ = pending.completion.send(Err(CourierError::ShutDown));
            }
        }
    }
}
