//! Unix domain socket server hosting one partition scheduler.
//!
//! Each connected client sends JSON-line requests and receives JSON-line
//! responses. Requests are handled in arrival order, but responses go out
//! through a per-connection writer task so a parked StatusQuery can be
//! answered later, from whichever connection finalizes its dependency.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ssidkv_core::commo::DispatchRequest;
use ssidkv_core::scheduler::PartitionScheduler;
use ssidkv_core::txn::ReplySlot;
use ssidkv_core::types::Decision;

use crate::protocol::{Request, RequestFrame, Response, ResponseFrame};

/// A partition listening on a Unix socket.
pub struct PartitionServer {
    scheduler: Arc<PartitionScheduler>,
    socket_path: PathBuf,
}

impl PartitionServer {
    pub fn new(scheduler: Arc<PartitionScheduler>, socket_path: PathBuf) -> Self {
        Self {
            scheduler,
            socket_path,
        }
    }

    pub fn scheduler(&self) -> &Arc<PartitionScheduler> {
        &self.scheduler
    }

    /// Run the server, accepting connections until a shutdown signal is received.
    pub async fn run(&self) -> std::io::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `shutdown` completes.
    ///
    /// On startup, removes any stale socket file and binds a new one.
    /// On shutdown, removes the socket file before returning.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            partition = self.scheduler.partition(),
            path = %self.socket_path.display(),
            "partition listening"
        );

        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let scheduler = self.scheduler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(scheduler, stream).await {
                                warn!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = shutdown => {
                info!("shutdown signal received");
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove socket file on shutdown");
            } else {
                info!(path = %self.socket_path.display(), "socket file removed");
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    scheduler: Arc<PartitionScheduler>,
    stream: tokio::net::UnixStream,
) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            // Client disconnected.
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RequestFrame>(trimmed) {
            Ok(frame) => handle_request(&scheduler, frame, &tx),
            Err(e) => {
                warn!(error = %e, "unparseable request");
                let _ = tx.send(ResponseFrame {
                    id: 0,
                    body: Response::error("ParseError", e.to_string()),
                });
            }
        }
    }

    // Parked StatusQuery replies still hold senders; the writer ends once
    // they are answered or dropped.
    drop(tx);
    drop(writer_task);
    Ok(())
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ResponseFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let bytes = match frame.to_line() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(id = frame.id, error = %e, "failed to encode response");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "client went away");
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "client went away");
            return;
        }
    }
}

fn handle_request(
    scheduler: &PartitionScheduler,
    frame: RequestFrame,
    tx: &mpsc::UnboundedSender<ResponseFrame>,
) {
    let id = frame.id;
    let response = match frame.body {
        Request::Dispatch {
            txn_id,
            ssid_spec,
            pieces,
        } => Response::DispatchAck(scheduler.on_dispatch(DispatchRequest {
            txn_id,
            ssid_spec,
            pieces,
        })),

        Request::Validate { txn_id, ssid_new } => Response::ValidateAck {
            result: scheduler.on_validate(txn_id, ssid_new),
        },

        Request::Finalize {
            txn_id,
            decision,
            ssid_commit,
        } => match Decision::try_from(decision) {
            Ok(decision) => {
                scheduler.on_finalize(txn_id, decision, ssid_commit);
                Response::Ok
            }
            Err(e) => Response::error("CodecError", e.to_string()),
        },

        Request::FinalizeAbort { txn_id } => {
            scheduler.on_finalize(txn_id, Decision::Aborted, 0);
            Response::FinalizeAck
        }

        Request::StatusQuery { txn_id } => {
            let tx = tx.clone();
            let slot = ReplySlot::new(move |reply| {
                let _ = tx.send(ResponseFrame {
                    id,
                    body: Response::StatusQueryAck(reply),
                });
            });
            // Answered now or parked on the owners of undecided versions.
            scheduler.on_status_query(txn_id, slot);
            return;
        }

        Request::LoadRow { key, values } => {
            scheduler.load_row(key, values);
            Response::Ok
        }

        Request::CommittedValue { key, col } => Response::Value {
            value: scheduler.committed_value(key, col),
        },
    };

    if tx.send(ResponseFrame { id, body: response }).is_err() {
        debug!(id, "response dropped: writer closed");
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
