use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::blocklist::Blocklist;
use crate::cache::ResponseCache;
use crate::request::{self, find_subsequence};
use crate::{forward, tunnel};

/// Listen backlog for the proxy socket.
const LISTEN_BACKLOG: i32 = 10;

/// How long a client gets to deliver its request headers.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(25);

/// Chunk size for reading client requests.
const READ_CHUNK: usize = 1024;

/// Sent verbatim when the target host is on the blocklist.
pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\nBlocked URL.";

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub blocked: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub tunneled: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&self) {
        info!(
            "📊 total={} active={} blocked={} cache_hit={} cache_miss={} tunneled={} failed={} in={}KB out={}KB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.tunneled.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000,
        );
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Clone)]
pub struct ProxyState {
    pub blocklist: Arc<Blocklist>,
    pub cache: Arc<ResponseCache>,
    pub stats: Arc<Stats>,
}

// ============================================================================
// LISTENER SETUP
// ============================================================================

/// Binds the proxy listener with an explicit backlog. Must be called from
/// within the runtime so the listener can be registered with the reactor.
pub fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    if let Err(e) = socket.bind(&addr.into()) {
        if e.kind() == ErrorKind::AddrInUse {
            eprintln!("\n❌ PORT {} ALREADY IN USE\n", addr.port());
            eprintln!("   Find the culprit: lsof -i:{} -P -n | grep LISTEN", addr.port());
            eprintln!("   Or run with a different port: --port {}\n", addr.port().wrapping_add(1));
        }
        return Err(e).with_context(|| format!("failed to bind {addr}"));
    }

    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).context("failed to register listener with runtime")
}

// ============================================================================
// ACCEPT LOOP
// ============================================================================

/// Accepts connections forever, one task per client. A single connection's
/// failure is logged and counted, never allowed to take the loop down.
pub async fn serve(listener: TcpListener, state: ProxyState) -> anyhow::Result<()> {
    loop {
        let (client, client_addr) = listener.accept().await?;
        let state = state.clone();

        state.stats.total.fetch_add(1, Ordering::Relaxed);
        state.stats.active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            debug!("accepted connection from {client_addr}");

            if let Err(e) = handle_connection(client, client_addr, &state).await {
                debug!("connection from {client_addr} failed: {e:#}");
                state.stats.failed.fetch_add(1, Ordering::Relaxed);
            }

            state.stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

// ============================================================================
// CONNECTION HANDLER
// ============================================================================

async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    state: &ProxyState,
) -> anyhow::Result<()> {
    let _ = client.set_nodelay(true);

    let raw = match read_request(&mut client).await {
        Some(raw) => raw,
        None => {
            debug!("no request data from {client_addr}, dropping");
            return Ok(());
        }
    };

    let req = match request::parse(raw) {
        Ok(req) => req,
        Err(e) => {
            debug!("rejecting request from {client_addr}: {e}");
            return Ok(());
        }
    };
    debug!("{client_addr} -> {} {}", req.method, req.target());

    if state.blocklist.is_blocked(&req.host) {
        state.stats.blocked.fetch_add(1, Ordering::Relaxed);
        warn!("🚫 blocked: {}", req.host);
        client.write_all(RESPONSE_403).await?;
        let _ = client.shutdown().await;
        return Ok(());
    }

    if req.is_connect() {
        state.stats.tunneled.fetch_add(1, Ordering::Relaxed);
        tunnel::run(client, &req, &state.stats).await
    } else {
        forward::run(client, &req, &state.cache, &state.stats).await
    }
}

/// Reads until the header terminator, the peer closes, or the per-connection
/// deadline fires. Whatever arrived by then is handed to the parser; nothing
/// at all means the connection is silently abandoned.
async fn read_request(client: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buffered = Vec::new();

    let read_headers = async {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match client.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buffered.extend_from_slice(&chunk[..n]);
                    if find_subsequence(&buffered, b"\r\n\r\n").is_some() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("error reading request: {e}");
                    break;
                }
            }
        }
    };

    if timeout(CLIENT_READ_TIMEOUT, read_headers).await.is_err() {
        debug!("timed out waiting for request headers");
    }

    if buffered.is_empty() {
        None
    } else {
        Some(buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_on_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn rejects_second_bind_on_same_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(bind(addr).is_err());
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.blocked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn blocked_response_is_the_fixed_literal() {
        assert_eq!(RESPONSE_403, b"HTTP/1.1 403 Forbidden\r\n\r\nBlocked URL.");
    }
}
