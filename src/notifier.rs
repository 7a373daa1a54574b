//! Network change notifier
//!
//! Polls the host's reachable address on a fixed interval and tells every
//! connected client when it changes, so they can refresh any URL they show.
//! Role bindings are never touched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::message::ServerMessage;
use crate::router::RouterHandle;
use crate::status::StatusBoard;

/// Anything that can tell which address clients should use to reach the host.
pub trait AddressResolver: Send + Sync + 'static {
    fn current_address(&self) -> Result<String>;
}

/// What one poll of the resolver amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First address seen; becomes the baseline.
    Seeded(String),
    Unchanged,
    Changed(String),
    /// Resolver failed; the last known address stands.
    Failed,
}

/// Remembers the last observed address and spots changes.
#[derive(Debug, Default)]
pub struct AddressWatch {
    last: Option<String>,
}

impl AddressWatch {
    pub fn new() -> AddressWatch {
        AddressWatch::default()
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub fn observe(&mut self, resolved: Result<String>) -> Observation {
        let address = match resolved {
            Ok(address) => address,
            Err(e) => {
                warn!("Address lookup failed, keeping {:?}: {:#}", self.last, e);
                return Observation::Failed;
            }
        };

        match self.last.replace(address.clone()) {
            None => Observation::Seeded(address),
            Some(previous) if previous == address => Observation::Unchanged,
            Some(previous) => {
                info!("Host address changed from {} to {}", previous, address);
                Observation::Changed(address)
            }
        }
    }
}

/// Start polling `resolver` every `interval`.
pub fn spawn(
    resolver: Arc<dyn AddressResolver>,
    interval: Duration,
    router: RouterHandle,
    board: StatusBoard,
) -> JoinHandle<()> {
    tokio::spawn(run(resolver, interval, router, board))
}

async fn run(
    resolver: Arc<dyn AddressResolver>,
    interval: Duration,
    router: RouterHandle,
    board: StatusBoard,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watch = AddressWatch::new();

    loop {
        ticker.tick().await;

        // Lookups touch the OS and must not stall the runtime.
        let lookup = Arc::clone(&resolver);
        let resolved = task::spawn_blocking(move || lookup.current_address())
            .await
            .unwrap_or_else(|e| Err(anyhow!("address lookup task failed: {}", e)));

        match watch.observe(resolved) {
            Observation::Seeded(address) => {
                info!("Advertising host address {}", address);
                board.publish_address(&address, Utc::now());
            }
            Observation::Changed(address) => {
                board.publish_address(&address, Utc::now());
                router.broadcast(ServerMessage::IpChanged {
                    new_address: address,
                });
            }
            Observation::Unchanged => debug!("Host address unchanged"),
            Observation::Failed => {}
        }
    }
}
