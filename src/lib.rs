//! Courier is a peer-to-peer messaging overlay. Nodes are addressed by their [identity::PeerId],
//!  and messages travel through whatever transport currently reaches a peer: multicast UDP with
//!  acknowledgements and resends, or TCP connections.
//!
//! A node is started through [courier::CourierBuilder]. Applications send through the node's
//!  [messaging::messenger::Messenger] and receive by registering handlers with the
//!  [messaging::inbound::InboundMessageRouter].

pub mod config;
pub mod courier;
pub mod error;
pub mod identity;
pub mod messaging;
pub mod peering;
pub mod routing;
pub mod test_util;
pub mod transport;
pub mod util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
