//! Opaque byte relay between the client and the accepted backend

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, instrument};

const BUF_SIZE: usize = 16 * 1024;

/// Relays an established tunnel
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data in both directions until either side closes.
    ///
    /// The first direction to end stops the other one, and both connections
    /// are closed before returning. Returns the bytes moved client to backend
    /// and backend to client, counting partial transfers before an error.
    #[instrument(skip(client, backend))]
    pub async fn relay<C, B>(client: C, backend: B) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        B: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend);
        let (ended, _) = watch::channel(false);

        let (bytes_sent, bytes_received) = tokio::join!(
            pump("client->backend", &mut client_read, &mut backend_write, &ended),
            pump("backend->client", &mut backend_read, &mut client_write, &ended),
        );

        let _ = client_write.shutdown().await;
        let _ = backend_write.shutdown().await;
        drop((client_read, client_write));
        drop((backend_read, backend_write));

        debug!(bytes_sent, bytes_received, "Relay finished");
        (bytes_sent, bytes_received)
    }
}

/// Copy `reader` into `writer` until EOF, an error, or the other direction
/// ending. Signals `ended` on the way out.
async fn pump<R, W>(
    direction: &'static str,
    reader: &mut R,
    writer: &mut W,
    ended: &watch::Sender<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stop = ended.subscribe();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = stop.wait_for(|ended| *ended) => {
                debug!(direction, "Peer direction ended");
                break;
            }
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction, "Read ended: {}", e);
                break;
            }
        };

        let written = tokio::select! {
            written = writer.write_all(&buf[..n]) => written,
            _ = stop.wait_for(|ended| *ended) => {
                debug!(direction, "Peer direction ended mid-write");
                break;
            }
        };
        if let Err(e) = written {
            debug!(direction, "Write ended: {}", e);
            break;
        }
        total += n as u64;
    }

    ended.send_replace(true);
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut backend_peer, backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move { TunnelHandler::relay(client, backend).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        let mut buf = [0u8; 17];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        backend_peer.write_all(b"hello from backend!").await.unwrap();
        let mut buf = [0u8; 19];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from backend!");

        client_peer.shutdown().await.unwrap();

        let counts = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(counts, (17, 19));

        let mut rest = Vec::new();
        backend_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_ends_relay_with_idle_backend() {
        let (client, client_peer) = tokio::io::duplex(1024);
        let (mut backend_peer, backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move { TunnelHandler::relay(client, backend).await });

        drop(client_peer);

        let counts = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay still running after the client closed")
            .unwrap();
        assert_eq!(counts, (0, 0));

        // The backend side was closed, not just half-closed
        let mut buf = Vec::new();
        backend_peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(backend_peer.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_backend_close_keeps_partial_counts() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut backend_peer, backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move { TunnelHandler::relay(client, backend).await });

        client_peer.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        backend_peer.read_exact(&mut buf).await.unwrap();
        backend_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        drop(backend_peer);

        // The client stays open and idle
        let counts = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay still running after the backend closed")
            .unwrap();
        assert_eq!(counts, (3, 5));

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
