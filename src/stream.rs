//! Multiplexed connection over a single `OpenStream` call.
//!
//! Connectors are symmetric: whichever side dialed, both ends see the same
//! [`MuxConnection`] with serialized sends, a blocking receive and an
//! idempotent close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tonic::transport::Channel;
use tonic::{Status, Streaming};
use tracing::trace;

use crate::proto::OpenData;
use crate::service::locked;
use crate::{Error, Result};

/// Messages buffered per direction before `send` waits.
pub(crate) const STREAM_BUFFER: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The side of the gRPC call this connector plays.
#[async_trait]
trait StreamRole: Send + Sync {
    async fn send(&self, msg: OpenData) -> Result<()>;
    async fn recv(&self) -> Result<OpenData>;
    /// Stop sending. For the dialing side this half-closes the request stream.
    fn close_send(&self);
}

/// This connector dialed the peer: requests out, responses in.
struct Outbound {
    _channel: Channel,
    tx: Mutex<Option<mpsc::Sender<OpenData>>>,
    rx: tokio::sync::Mutex<Streaming<OpenData>>,
}

/// The peer dialed this connector: requests in, responses out.
struct Inbound {
    tx: Mutex<Option<mpsc::Sender<std::result::Result<OpenData, Status>>>>,
    rx: tokio::sync::Mutex<Streaming<OpenData>>,
}

async fn next_message(rx: &tokio::sync::Mutex<Streaming<OpenData>>) -> Result<OpenData> {
    match rx.lock().await.message().await? {
        Some(msg) => Ok(msg),
        None => Err(Error::connection("stream ended by peer")),
    }
}

#[async_trait]
impl StreamRole for Outbound {
    async fn send(&self, msg: OpenData) -> Result<()> {
        let tx = locked(&self.tx).clone();
        let tx = tx.ok_or_else(|| Error::connection("stream closed"))?;
        tx.send(msg)
            .await
            .map_err(|_| Error::connection("request stream dropped"))
    }

    async fn recv(&self) -> Result<OpenData> {
        next_message(&self.rx).await
    }

    fn close_send(&self) {
        locked(&self.tx).take();
    }
}

#[async_trait]
impl StreamRole for Inbound {
    async fn send(&self, msg: OpenData) -> Result<()> {
        let tx = locked(&self.tx).clone();
        let tx = tx.ok_or_else(|| Error::connection("stream closed"))?;
        tx.send(Ok(msg))
            .await
            .map_err(|_| Error::connection("response stream dropped"))
    }

    async fn recv(&self) -> Result<OpenData> {
        next_message(&self.rx).await
    }

    fn close_send(&self) {
        locked(&self.tx).take();
    }
}

/// One live multiplexed stream to a peer.
pub(crate) struct MuxConnection {
    id: u64,
    role: Box<dyn StreamRole>,
    closed: AtomicBool,
    send_lock: tokio::sync::Mutex<()>,
    done: CancellationToken,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxConnection {
    fn with_role(role: Box<dyn StreamRole>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            role,
            closed: AtomicBool::new(false),
            send_lock: tokio::sync::Mutex::new(()),
            done: CancellationToken::new(),
        }
    }

    /// Wrap a call this connector opened. `tx` feeds the request stream.
    pub(crate) fn outbound(
        channel: Channel,
        tx: mpsc::Sender<OpenData>,
        responses: Streaming<OpenData>,
    ) -> Self {
        Self::with_role(Box::new(Outbound {
            _channel: channel,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(responses),
        }))
    }

    /// Wrap a call a peer opened. The returned stream is the response body.
    pub(crate) fn inbound(
        requests: Streaming<OpenData>,
    ) -> (Self, ReceiverStream<std::result::Result<OpenData, Status>>) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let conn = Self::with_role(Box::new(Inbound {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(requests),
        }));
        (conn, ReceiverStream::new(rx))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a message. A closed connection drops it silently.
    pub(crate) async fn send(&self, msg: OpenData) -> Result<()> {
        if self.is_closed() {
            trace!(conn = self.id, kind = msg.kind(), "dropping message on closed stream");
            return Ok(());
        }
        let _guard = self.send_lock.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        self.role.send(msg).await
    }

    /// Wait for the next message from the peer.
    pub(crate) async fn recv(&self) -> Result<OpenData> {
        tokio::select! {
            _ = self.done() => Err(Error::connection("stream closed")),
            msg = self.role.recv() => msg,
        }
    }

    /// Close the connection. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(conn = self.id, "closing stream");
        self.done.cancel();
        self.role.close_send();
    }

    /// Resolves once [`close`](MuxConnection::close) has been called.
    pub(crate) fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }
}
