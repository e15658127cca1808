//! Utilities for testing code based on Courier: message types, a recording UDP network and an
//!  in-memory UDP fabric connecting several nodes in one process. They are used for testing
//!  Courier itself, but they are also exported for application testing.

pub mod messages;
pub mod tracking_network;
pub mod udp_fabric;
