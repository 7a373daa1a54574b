//! Signaling relay that pairs one viewer with one camera source.
//!
//! Clients connect over plain or TLS WebSockets, claim a role, and exchange
//! offer/answer/candidate messages through the relay until their direct
//! peer-to-peer link is up. The relay never sees media.

pub mod config;
pub mod model;
pub mod notifier;
pub mod router;
pub mod server;
pub mod status;
pub mod util;
