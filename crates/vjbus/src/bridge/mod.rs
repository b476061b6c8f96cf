//! Loopback transports between workers, the supervisor and consoles.
//!
//! - `codec`: length-prefixed JSON framing shared by every socket
//! - `command`: request/reply endpoint and client
//! - `telemetry`: broadcast publisher and topic-filtered subscriber
//! - `osc`: optional UDP mirror of telemetry as OSC messages

pub mod codec;
pub mod command;
pub mod osc;
pub mod telemetry;
pub mod topic;
