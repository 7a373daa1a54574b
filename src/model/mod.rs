//! Data models for the signaling relay
//!
//! Channels, the role bindings of the pairing session, and the message
//! envelopes exchanged with clients.

pub mod channel;
pub mod message;
pub mod session;
