//! Local TCP socket bound to one logical connection of a route.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A TCP socket with non-consuming lookahead and an explicit close signal.
///
/// Reads, writes and the half-close probe may run from different tasks;
/// [`close`](BufferedConn::close) unblocks any pending read.
#[derive(Debug)]
pub struct BufferedConn {
    id: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl BufferedConn {
    /// Wrap an accepted or dialed socket.
    pub fn new(id: impl Into<String>, stream: TcpStream) -> Self {
        let id = id.into();
        if let Err(error) = stream.set_nodelay(true) {
            debug!(connection_id = %id, %error, "unable to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        Self {
            id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    /// Connection id used on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether [`close`](BufferedConn::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote end closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            res = reader.read(buf) => res,
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            res = writer.write_all(data) => res,
        }
    }

    /// Check whether the remote end has fully closed, without consuming data.
    ///
    /// Peeks one byte with a short deadline. Only a clean EOF counts as
    /// closed; a timeout, pending data or a read error all leave the
    /// connection open. The deadline is scoped to this call, so nothing has
    /// to be reset afterwards.
    pub async fn remote_closed(&self, deadline: Duration) -> bool {
        let mut reader = self.reader.lock().await;
        let mut one = [0u8; 1];
        matches!(
            tokio::time::timeout(deadline, reader.peek(&mut one)).await,
            Ok(Ok(0))
        )
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // a writer blocked on a slow peer keeps the lock; dropping the last
        // handle closes the socket in that case
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (BufferedConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            BufferedConn::new("conn", accepted.unwrap().0),
            client.unwrap(),
        )
    }

    #[tokio::test]
    async fn disables_nagle() {
        let (conn, _client) = pair().await;
        let reader = conn.reader.lock().await;
        let stream: &TcpStream = (*reader).as_ref();
        assert!(stream.nodelay().unwrap());
        assert_eq!(conn.id(), "conn");
    }

    #[tokio::test]
    async fn probe_detects_remote_close() {
        let (conn, client) = pair().await;
        drop(client);
        // allow the FIN to arrive
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.remote_closed(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn probe_times_out_on_idle_connection() {
        let (conn, _client) = pair().await;
        assert!(!conn.remote_closed(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn probe_does_not_consume_data() {
        let (conn, mut client) = pair().await;
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!conn.remote_closed(Duration::from_millis(10)).await);

        let mut buf = [0u8; 8];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[tokio::test]
    async fn close_unblocks_reader() {
        let (conn, _client) = pair().await;
        let conn = std::sync::Arc::new(conn);

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await;
        conn.close().await;

        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should be unblocked")
            .unwrap();
        assert!(res.is_err());
        assert!(conn.is_closed());
        assert!(conn.write_all(b"late").await.is_err());
    }
}
