use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::channel::{ChannelHandle, ChannelId, Outgoing};
use crate::notifier;
use crate::router::{self, RouterHandle};
use crate::status::{self, StatusBoard};
use crate::util::HostAddressResolver;

/// Which listener a connection came in on. Only used for logging; the router
/// treats both alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Plain,
    Tls,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Plain => f.write_str("ws"),
            Endpoint::Tls => f.write_str("wss"),
        }
    }
}

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// Budget for the TLS and WebSocket handshakes together.
    pub handshake: Duration,
    /// How often the relay pings each client.
    pub ping_interval: Duration,
    /// A client that sent nothing, pongs included, for this long is dropped.
    pub idle: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        ConnectionTimeouts {
            handshake: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            idle: Duration::from_secs(45),
        }
    }
}

/// Run the relay until ctrl-c.
pub async fn main(config: Config) -> Result<()> {
    let board = StatusBoard::default();
    let (router, router_task) = router::spawn(config.grace(), board.clone());

    let timeouts = config.timeouts();
    let (addr, plain) = listen(config.listen, None, timeouts, router.clone()).await?;
    info!("Signaling endpoint on ws://{}", addr);
    let mut listeners = vec![plain];

    match config.tls() {
        Some((cert, key)) => {
            let acceptor = load_tls(cert, key)?;
            let (addr, tls) =
                listen(config.tls_listen, Some(acceptor), timeouts, router.clone()).await?;
            info!("Signaling endpoint on wss://{}", addr);
            listeners.push(tls);
        }
        None => warn!("No TLS certificate configured, wss:// endpoint disabled"),
    }

    let resolver = Arc::new(HostAddressResolver::new(config.host_ip.clone()));
    let notifier = notifier::spawn(
        resolver,
        config.ip_poll_interval(),
        router.clone(),
        board.clone(),
    );

    let status = status::start(config.status_listen, board, config.frontend())?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    for listener in listeners {
        listener.abort();
    }
    notifier.abort();
    router.shutdown();
    if let Err(e) = router_task.await {
        warn!("Router task failed: {}", e);
    }
    status.shutdown();

    Ok(())
}

/// Bind `addr` and serve WebSocket connections on it, terminating TLS first
/// when an acceptor is given.
pub async fn listen(
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    timeouts: ConnectionTimeouts,
    router: RouterHandle,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let local = listener.local_addr().context("reading listener address")?;

    let task = tokio::spawn(accept_loop(listener, tls, timeouts, router));
    Ok((local, task))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    timeouts: ConnectionTimeouts,
    router: RouterHandle,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    tls.clone(),
                    timeouts,
                    router.clone(),
                ));
            }
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    timeouts: ConnectionTimeouts,
    router: RouterHandle,
) {
    let deadline = Instant::now() + timeouts.handshake;
    match tls {
        Some(acceptor) => match time::timeout_at(deadline, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => serve(stream, peer, Endpoint::Tls, deadline, timeouts, router).await,
            Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", peer, e),
            Err(_) => warn!("TLS handshake with {} timed out", peer),
        },
        None => serve(stream, peer, Endpoint::Plain, deadline, timeouts, router).await,
    }
}

/// Pump one WebSocket connection: inbound frames go to the router, queued
/// outbound messages go to the socket. Idle clients are pinged and dropped
/// once they stop answering.
async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    endpoint: Endpoint,
    handshake_deadline: Instant,
    timeouts: ConnectionTimeouts,
    router: RouterHandle,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = match time::timeout_at(handshake_deadline, tokio_tungstenite::accept_async(stream))
        .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake with {} timed out", peer);
            return;
        }
    };

    let id = ChannelId::next();
    let (channel, mut outgoing) = ChannelHandle::new(id);
    let (mut ws_tx, mut ws_rx) = ws.split();

    info!("Channel {} connected from {} over {}", id, peer, endpoint);
    router.open(channel);

    let mut ping = time::interval_at(
        Instant::now() + timeouts.ping_interval,
        timeouts.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(frame)) => {
                    last_seen = Instant::now();
                    match frame {
                        Message::Text(text) => router.receive(id, text.into_bytes()),
                        Message::Binary(data) => router.receive(id, data),
                        Message::Close(_) => break,
                        // Pings are answered by tungstenite.
                        _ => {}
                    }
                }
                None => break,
                Some(Err(e)) => {
                    debug!("Channel {} read failed: {}", id, e);
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > timeouts.idle {
                    info!("Channel {} silent for {:?}, dropping it", id, timeouts.idle);
                    break;
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!("Channel {} ping failed: {}", id, e);
                    break;
                }
            },
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        debug!("Channel {} write failed: {}", id, e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    router.close(id);
    info!("Channel {} from {} disconnected", id, peer);
}

/// Build a TLS acceptor from PEM files.
pub fn load_tls(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_file =
        File::open(cert).with_context(|| format!("opening certificate {}", cert.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificate {}", cert.display()))?;
    if certs.is_empty() {
        bail!("no certificate found in {}", cert.display());
    }

    let key_file = File::open(key).with_context(|| format!("opening key {}", key.display()))?;
    let key_der = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("reading key {}", key.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", key.display()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("selecting TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key_der)
    .context("building TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
