//! Read-only HTTP status endpoint
//!
//! Serves `GET /`, `GET /network-info` and `GET /session` from snapshots the
//! router and notifier publish. Runs on its own thread and never touches the
//! session itself.

use std::net::SocketAddr;
use std::sync::{mpsc, Arc, PoisonError, RwLock};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rouille::{Request, Response, Server};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::router::SessionSnapshot;

/// Address currently advertised to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStatus {
    pub address: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Status {
    session: SessionSnapshot,
    address: Option<AddressStatus>,
}

/// Shared snapshots written by the relay tasks and read by the endpoint.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Status>>,
}

impl StatusBoard {
    pub fn publish_session(&self, snapshot: SessionSnapshot) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        status.session = snapshot;
    }

    /// Record the advertised address. The timestamp only moves when the
    /// address does.
    pub fn publish_address(&self, address: &str, now: DateTime<Utc>) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if status.address.as_ref().map(|a| a.address.as_str()) == Some(address) {
            return;
        }
        status.address = Some(AddressStatus {
            address: address.to_string(),
            changed_at: now,
        });
    }

    pub fn session(&self) -> SessionSnapshot {
        let status = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        status.session.clone()
    }

    pub fn address(&self) -> Option<AddressStatus> {
        let status = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        status.address.clone()
    }
}

/// Ports the web frontend is served on, used to build client URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontend {
    pub http_port: u16,
    pub https_port: u16,
}

/// URLs clients should use to reach the frontend at the current address.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub address: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
    pub local_viewer_url: String,
    pub viewer_url: Option<String>,
    pub source_url: Option<String>,
}

impl NetworkInfo {
    pub fn new(address: Option<AddressStatus>, frontend: Frontend) -> NetworkInfo {
        // Cameras on phones need a secure origin, hence https for the
        // address-based URLs.
        let base = address
            .as_ref()
            .map(|a| format!("https://{}:{}", a.address, frontend.https_port));

        NetworkInfo {
            local_viewer_url: format!("http://localhost:{}", frontend.http_port),
            viewer_url: base.clone(),
            source_url: base.map(|b| format!("{}/phone", b)),
            changed_at: address.as_ref().map(|a| a.changed_at),
            address: address.map(|a| a.address),
        }
    }
}

/// A running status endpoint.
#[derive(Debug)]
pub struct StatusServer {
    addr: SocketAddr,
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StatusServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for the server thread.
    pub fn shutdown(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            debug!("Status server thread panicked");
        }
    }
}

pub fn start(addr: SocketAddr, board: StatusBoard, frontend: Frontend) -> Result<StatusServer> {
    let server = Server::new(addr, move |request| web_request(request, &board, frontend))
        .map_err(|e| anyhow!("starting the status server on {}: {}", addr, e))?;

    let addr = server.server_addr();
    info!("Status endpoint on http://{}", addr);

    let (thread, stop) = server.stoppable();
    Ok(StatusServer { addr, stop, thread })
}

fn web_request(request: &Request, board: &StatusBoard, frontend: Frontend) -> Response {
    debug!("{} {}", request.method(), request.url());

    let response = match (request.method(), request.url().as_str()) {
        ("GET", "/") => Response::json(&json!({ "message": "Pairing relay" })),
        ("GET", "/network-info") => Response::json(&NetworkInfo::new(board.address(), frontend)),
        ("GET", "/session") => Response::json(&board.session()),
        _ => Response::empty_404(),
    };

    response.with_additional_header("Access-Control-Allow-Origin", "*")
}
