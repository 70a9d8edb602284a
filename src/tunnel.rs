use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::request::ParsedRequest;
use crate::server::Stats;

/// Sent to the client once the upstream leg of the tunnel is up.
pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Chunk size for relaying tunneled bytes.
const RELAY_CHUNK: usize = 4096;

/// A relay direction with no traffic for this long shuts itself down.
const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Both relay directions must be done within this window, otherwise the
/// sockets are force-closed under them.
const JOIN_DEADLINE: Duration = Duration::from_secs(25);

/// Runs an opaque CONNECT tunnel: confirms it to the client, then relays
/// raw bytes in both directions until either side closes or goes idle.
/// Nothing is ever decrypted or cached on this path.
pub async fn run(mut client: TcpStream, req: &ParsedRequest, stats: &Stats) -> anyhow::Result<()> {
    let target = req.target();
    debug!("setting up tunnel for {target}");

    let upstream = match TcpStream::connect((req.host.as_str(), req.port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // The client gets no 200, just a closed connection.
            warn!("tunnel connect to {target} failed: {e}");
            return Err(e.into());
        }
    };
    let _ = upstream.set_nodelay(true);

    client
        .write_all(RESPONSE_200_CONNECT)
        .await
        .context("confirming tunnel to client")?;
    client.flush().await?;

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut up = tokio::spawn(relay(client_read, upstream_write, "client->upstream"));
    let mut down = tokio::spawn(relay(upstream_read, client_write, "upstream->client"));

    let joined = timeout(JOIN_DEADLINE, async {
        let sent = (&mut up).await.unwrap_or(0);
        let received = (&mut down).await.unwrap_or(0);
        (sent, received)
    })
    .await;

    match joined {
        Ok((sent, received)) => {
            debug!("tunnel to {target} closed ({sent} bytes up, {received} bytes down)");
            stats.bytes_out.fetch_add(sent, Ordering::Relaxed);
            stats.bytes_in.fetch_add(received, Ordering::Relaxed);
        }
        Err(_) => {
            // Aborting the tasks drops the socket halves, which unblocks
            // and closes whatever the relays were stuck on.
            warn!("forcing closure of long-lived tunnel to {target}");
            up.abort();
            down.abort();
        }
    }

    Ok(())
}

/// Pumps bytes from `src` to `dst` until EOF, an idle timeout, or an I/O
/// error. Idle timeouts and EOF are normal exits; errors are logged. On the
/// way out the destination's write side is shut down so the opposite
/// direction sees EOF promptly. Returns the number of bytes relayed.
async fn relay(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf, direction: &'static str) -> u64 {
    let mut buf = [0u8; RELAY_CHUNK];
    let mut total = 0u64;

    loop {
        let n = match timeout(RELAY_IDLE_TIMEOUT, src.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("[{direction}] read failed: {e}");
                break;
            }
            Err(_) => {
                debug!("[{direction}] idle, closing");
                break;
            }
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!("[{direction}] write failed: {e}");
            break;
        }
        total += n as u64;
    }

    let _ = dst.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relay_forwards_until_source_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_client_read, mut client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        // Loop the server side back onto itself and count what comes through.
        let handle = tokio::spawn(relay(server_read, server_write, "loopback"));

        client_write.write_all(b"hello tunnel").await.unwrap();
        client_write.shutdown().await.unwrap();

        // Relay reads nothing more after our shutdown, so it exits on EOF.
        let relayed = handle.await.unwrap();
        assert_eq!(relayed, b"hello tunnel".len() as u64);
    }

    #[test]
    fn connect_response_is_the_fixed_literal() {
        assert_eq!(
            RESPONSE_200_CONNECT,
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );
    }
}
