use std::sync::atomic::Ordering;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::request::{find_subsequence, ParsedRequest};
use crate::server::Stats;

/// Chunk size for relaying upstream responses, matching the request read size.
const RESPONSE_CHUNK: usize = 1024;

/// Relays a plain HTTP exchange, serving from the cache when possible.
///
/// The upstream response is streamed to the client chunk by chunk while
/// being accumulated in full; only a cleanly terminated response (upstream
/// EOF) is cached. Both sockets are closed on every path out.
pub async fn run(
    mut client: TcpStream,
    req: &ParsedRequest,
    cache: &ResponseCache,
    stats: &Stats,
) -> anyhow::Result<()> {
    let key = ResponseCache::key(&req.host, req.port);

    if let Some(body) = cache.lookup(&key) {
        stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!("serving {key} from cache ({} bytes)", body.len());
        client.write_all(&body).await?;
        let _ = client.shutdown().await;
        return Ok(());
    }
    stats.cache_misses.fetch_add(1, Ordering::Relaxed);

    let mut upstream = match TcpStream::connect((req.host.as_str(), req.port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("upstream connect to {key} failed: {e}");
            let _ = client.shutdown().await;
            return Err(e.into());
        }
    };
    let _ = upstream.set_nodelay(true);

    // The upstream must not hold the connection open past one exchange;
    // end-of-response is signalled by EOF.
    let request = rewrite_keep_alive(&req.raw);
    upstream.write_all(&request).await?;
    stats.bytes_out.fetch_add(request.len() as u64, Ordering::Relaxed);
    debug!("request forwarded to {key}");

    let mut response = Vec::new();
    let mut chunk = [0u8; RESPONSE_CHUNK];
    loop {
        match upstream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&chunk[..n]);
                if let Err(e) = client.write_all(&chunk[..n]).await {
                    debug!("client went away mid-response for {key}: {e}");
                    let _ = upstream.shutdown().await;
                    return Err(e.into());
                }
            }
            Err(e) => {
                warn!("error reading response from {key}: {e}");
                let _ = client.shutdown().await;
                return Err(e.into());
            }
        }
    }

    stats.bytes_in.fetch_add(response.len() as u64, Ordering::Relaxed);
    if !response.is_empty() {
        debug!("cached {} bytes for {key}", response.len());
        cache.store(key, response);
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}

/// Rewrites every `Connection: keep-alive` to `Connection: close` at the
/// byte level, leaving the rest of the request untouched.
fn rewrite_keep_alive(raw: &[u8]) -> Vec<u8> {
    const FROM: &[u8] = b"Connection: keep-alive";
    const TO: &[u8] = b"Connection: close";

    let mut rewritten = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(i) = find_subsequence(rest, FROM) {
        rewritten.extend_from_slice(&rest[..i]);
        rewritten.extend_from_slice(TO);
        rest = &rest[i + FROM.len()..];
    }
    rewritten.extend_from_slice(rest);
    rewritten
}
