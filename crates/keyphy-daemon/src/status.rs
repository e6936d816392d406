//! Loopback status endpoint and the report printed by `keyphyd status`.

use crate::daemon::DaemonState;
use keyphy_core::auth::AuthStatus;
use keyphy_core::config::BlockSet;
use keyphy_core::error::{KeyphyError, KeyphyResult};
use log::{debug, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

/// Bind the status listener. Only loopback addresses are accepted.
pub async fn bind_status(addr: &str) -> KeyphyResult<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|err| KeyphyError::InvalidConfig(format!("invalid daemon.status_addr `{addr}`: {err}")))?;
    if !addr.ip().is_loopback() {
        return Err(KeyphyError::InvalidConfig(format!(
            "daemon.status_addr {addr} is not a loopback address"
        )));
    }
    Ok(TcpListener::bind(addr).await?)
}

/// How long a client gets to send its request before we answer anyway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn respond(mut stream: TcpStream, peer: SocketAddr, state: DaemonState) {
    let mut request = [0u8; 1024];
    if timeout(REQUEST_TIMEOUT, stream.read(&mut request)).await.is_err() {
        debug!("status client {peer} sent nothing; answering anyway");
    }
    let body = state.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        warn!("failed to respond to {peer}: {err}");
    }
    let _ = stream.shutdown().await;
}

/// Answer every connection with the current state as plain text. Each client
/// is served on its own task so a stalled one cannot hold up the others or
/// shutdown.
pub async fn serve_status(
    listener: TcpListener,
    state: watch::Receiver<DaemonState>,
    mut shutdown: watch::Receiver<bool>,
) -> KeyphyResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("status endpoint listening on http://{addr}");
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let current = *state.borrow();
                    tokio::spawn(respond(stream, peer, current));
                }
                Err(err) => {
                    warn!("status accept failed: {err}");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockCounts {
    pub apps: usize,
    pub websites: usize,
    pub paths: usize,
    pub ips: usize,
}

impl From<&BlockSet> for BlockCounts {
    fn from(blocks: &BlockSet) -> Self {
        Self {
            apps: blocks.apps.len(),
            websites: blocks.websites.len(),
            paths: blocks.paths.len(),
            ips: blocks.ips.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub daemon_running: bool,
    pub auth_configured: bool,
    pub auth: AuthStatus,
    pub blocks: BlockCounts,
}
