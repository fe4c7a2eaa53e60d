//! Client library for connecting to an `ssidkv-server` partition.
//!
//! Requests are multiplexed over one connection: each carries a fresh id,
//! and the reader task routes every response line to the handler registered
//! for that id. Handlers run on the reader task.
//!
//! Every handler runs exactly once. When the connection is gone, or a
//! request cannot be encoded, it receives a `Disconnected` or
//! `SerializationError` error response instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use ssidkv_core::types::{ColumnId, PartitionId, RowKey, Value};

use crate::error::ClientError;
use crate::protocol::{Request, RequestFrame, Response, ResponseFrame};

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

type ReplyHandler = Box<dyn FnOnce(Response) + Send>;
/// Handlers by request id; `None` once the connection closed.
type PendingMap = Arc<Mutex<Option<HashMap<u64, ReplyHandler>>>>;

/// Client for one partition server.
pub struct PartitionClient {
    partition: PartitionId,
    next_id: AtomicU64,
    pending: PendingMap,
    tx: mpsc::UnboundedSender<RequestFrame>,
}

impl PartitionClient {
    /// Connect to the partition server at the given Unix socket path.
    pub async fn connect(partition: PartitionId, path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));

        tokio::spawn(write_requests(
            partition,
            BufWriter::new(write_half),
            rx,
            pending.clone(),
        ));
        tokio::spawn(read_responses(
            partition,
            BufReader::new(read_half),
            pending.clone(),
        ));
        debug!(partition, path = %path.as_ref().display(), "connected");

        Ok(Self {
            partition,
            next_id: AtomicU64::new(1),
            pending,
            tx,
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Send `request`; `on_reply` runs on the reader task once the matching
    /// response arrives. Never invokes `on_reply` from inside this call: on
    /// a closed connection it gets the `Disconnected` error response from a
    /// spawned task, and the call returns [`ClientError::Disconnected`].
    pub fn send(
        &self,
        request: Request,
        on_reply: impl FnOnce(Response) + Send + 'static,
    ) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let on_reply: ReplyHandler = Box::new(on_reply);
        let closed = match self.pending.lock().as_mut() {
            Some(handlers) => {
                handlers.insert(id, on_reply);
                None
            }
            None => Some(on_reply),
        };
        if let Some(on_reply) = closed {
            answer_later(on_reply, disconnected());
            return Err(ClientError::Disconnected);
        }
        if self.tx.send(RequestFrame { id, body: request }).is_err() {
            if let Some(handler) = take_handler(&self.pending, id) {
                answer_later(handler, disconnected());
            }
            return Err(ClientError::Disconnected);
        }
        Ok(())
    }

    /// Send `request` and ignore the response.
    pub fn notify(&self, request: Request) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(RequestFrame { id, body: request })
            .map_err(|_| ClientError::Disconnected)
    }

    /// Send `request` and wait for its response. Server errors become
    /// [`ClientError::Server`].
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.send(request, move |resp| {
            let _ = tx.send(resp);
        })?;
        match rx.await.map_err(|_| ClientError::Disconnected)? {
            Response::Error(e) => Err(ClientError::Server(e)),
            resp => Ok(resp),
        }
    }

    /// Install a row on the partition.
    pub async fn load_row(&self, key: RowKey, values: Vec<Value>) -> Result<()> {
        match self.call(Request::LoadRow { key, values }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Latest finalized value of a column, or `None` for an unknown cell.
    pub async fn committed_value(&self, key: RowKey, col: ColumnId) -> Result<Option<Value>> {
        match self.call(Request::CommittedValue { key, col }).await? {
            Response::Value { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(resp: &Response) -> ClientError {
    ClientError::Protocol(format!("unexpected response: {resp:?}"))
}

fn disconnected() -> Response {
    Response::error("Disconnected", "partition server connection closed")
}

fn take_handler(pending: &PendingMap, id: u64) -> Option<ReplyHandler> {
    pending.lock().as_mut().and_then(|handlers| handlers.remove(&id))
}

/// Run `handler` on its own task, so it never runs inside the caller.
fn answer_later(handler: ReplyHandler, response: Response) {
    tokio::spawn(async move { handler(response) });
}

async fn write_requests(
    partition: PartitionId,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<RequestFrame>,
    pending: PendingMap,
) {
    while let Some(frame) = rx.recv().await {
        let data = match frame.to_line().map_err(ClientError::Serialization) {
            Ok(data) => data,
            Err(e) => {
                warn!(partition, id = frame.id, error = %e, "dropping request");
                if let Some(handler) = take_handler(&pending, frame.id) {
                    handler(Response::error("SerializationError", e.to_string()));
                }
                continue;
            }
        };
        if let Err(e) = writer.write_all(&data).await {
            warn!(partition, error = %e, "write failed");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(partition, error = %e, "flush failed");
            return;
        }
    }
}

async fn read_responses(
    partition: PartitionId,
    mut reader: BufReader<OwnedReadHalf>,
    pending: PendingMap,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(partition, error = %e, "read failed");
                break;
            }
        }

        let frame: ResponseFrame = match serde_json::from_str(line.trim()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(partition, error = %e, "unparseable response");
                continue;
            }
        };
        // Take the handler out before running it.
        match take_handler(&pending, frame.id) {
            Some(handler) => handler(frame.body),
            None => trace!(partition, id = frame.id, "response without a waiter"),
        }
    }

    let handlers = pending.lock().take().unwrap_or_default();
    if !handlers.is_empty() {
        warn!(
            partition,
            in_flight = handlers.len(),
            "server disconnected with requests in flight"
        );
    }
    for (_, handler) in handlers {
        handler(disconnected());
    }
}
