use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::LocalIdentity;
use crate::messaging::dto::{AnnouncementDto, Payload};
use crate::transport::udp::acknowledgement_coordinator::AcknowledgementCoordinator;
use crate::transport::udp::dispatcher::UdpDispatcher;
use crate::transport::udp::network::UdpNetwork;

pub async fn announce_once(identity: &LocalIdentity, network: &dyn UdpNetwork) {
    let announcement = Payload::Announcement(AnnouncementDto {
        identity: identity.snapshot().as_ref().clone(),
    });
    trace!("announcing myself");
    if let Err(e) = network.broadcast(&announcement.to_bytes()).await {
        warn!("failed to send announcement: {}", e);
    }
}

/// Multicasts the local identity at a fixed interval, starting immediately, until cancelled
pub async fn announcer_loop(identity: Arc<LocalIdentity>, network: Arc<dyn UdpNetwork>, announce_interval: Duration, cancel: CancellationToken) {
    info!("starting announcer loop");
    let mut ticks = interval(announce_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => announce_once(&identity, network.as_ref()).await,
        }
    }
    debug!("announcer loop terminated");
}

/// Re-transmits unacknowledged reliable packets at a fixed interval until cancelled. This loop
///  also discards stale partial multi-part messages.
pub async fn resender_loop(
    ack_coordinator: Arc<AcknowledgementCoordinator>,
    dispatcher: Arc<UdpDispatcher>,
    network: Arc<dyn UdpNetwork>,
    resend_interval: Duration,
    multi_part_timeout: Duration,
    cancel: CancellationToken,
) {
    info!("starting resender loop");
    let mut ticks = interval(resend_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                for resend in ack_coordinator.due_for_resend(resend_interval) {
                    trace!("resending packet {:?} to {:?}", resend.packet_id, resend.destination);
                    if let Err(e) = network.unicast(resend.destination, &resend.datagram).await {
                        warn!("failed to resend packet {:?}: {}", resend.packet_id, e);
                    }
                }
                dispatcher.prune_stale_multi_part_messages(multi_part_timeout);
            }
        }
    }
    debug!("resender loop terminated");
}
