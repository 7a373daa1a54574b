//! Channels: one open duplex connection to one client.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::model::message::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a process-unique id. Ids increase in connection order.
    pub fn next() -> ChannelId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        ChannelId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn from_raw(id: u64) -> ChannelId {
        ChannelId(id)
    }
}

impl Deref for ChannelId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The far end went away before the message could be queued.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel {0} is closed")]
pub struct ChannelClosed(pub ChannelId);

/// What the transport writer task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// Sending half of a channel, held by the router.
///
/// Sends never block: messages go into the connection's outbound queue and
/// the transport writes them out at its own pace.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: UnboundedSender<Outgoing>,
}

impl ChannelHandle {
    /// Create a handle plus the receiver the transport drains.
    pub fn new(id: ChannelId) -> (ChannelHandle, UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelHandle { id, tx }, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn send(&self, message: &ServerMessage) -> Result<(), ChannelClosed> {
        self.tx
            .send(Outgoing::Text(message.encode()))
            .map_err(|_| ChannelClosed(self.id))
    }

    /// Ask the transport to close the connection.
    pub fn close(&self) -> Result<(), ChannelClosed> {
        self.tx
            .send(Outgoing::Close)
            .map_err(|_| ChannelClosed(self.id))
    }
}
