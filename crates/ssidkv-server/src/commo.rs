//! [`Commo`] over partition servers.
//!
//! Replies are delivered on each client's reader task, never from inside a
//! broadcast call. A lost connection, a server error or a reply of the
//! wrong kind is logged and answered with the reply that aborts the
//! transaction, so the coordinator never waits on it forever.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{error, warn};

use ssidkv_core::commo::{
    Commo, DispatchCallback, DispatchReply, DispatchRequest, FinalizeAckCallback, StatusCallback,
    ValidateCallback,
};
use ssidkv_core::types::{Decision, PartitionId, SnapshotId, StatusReply, TxnId, ValidateResult};

use crate::client::{PartitionClient, Result};
use crate::protocol::{Request, Response};

/// One client per partition.
pub struct SocketCommo {
    clients: HashMap<PartitionId, PartitionClient>,
}

impl SocketCommo {
    /// Connect to every `(partition, socket path)` endpoint.
    pub async fn connect(endpoints: impl IntoIterator<Item = (PartitionId, PathBuf)>) -> Result<Self> {
        let mut clients = HashMap::new();
        for (partition, path) in endpoints {
            clients.insert(partition, PartitionClient::connect(partition, path).await?);
        }
        Ok(Self { clients })
    }

    pub fn client(&self, partition: PartitionId) -> &PartitionClient {
        match self.clients.get(&partition) {
            Some(c) => c,
            None => panic!("no partition {partition}"),
        }
    }

    /// Send `request`. `on_reply` always runs, with an error response when
    /// the request never got through.
    fn send(
        &self,
        partition: PartitionId,
        what: &'static str,
        request: Request,
        on_reply: impl FnOnce(Response) + Send + 'static,
    ) {
        if let Err(e) = self.client(partition).send(request, on_reply) {
            error!(partition, what, error = %e, "send failed");
        }
    }
}

fn log_failed_reply(partition: PartitionId, txn_id: TxnId, what: &'static str, reply: &Response) {
    warn!(partition, txn_id, what, ?reply, "no usable reply, aborting");
}

impl Commo for SocketCommo {
    fn broadcast_dispatch(
        &self,
        partition: PartitionId,
        request: DispatchRequest,
        callback: DispatchCallback,
    ) {
        let failed = DispatchReply::unreachable(&request);
        let DispatchRequest {
            txn_id,
            ssid_spec,
            pieces,
        } = request;
        self.send(
            partition,
            "dispatch",
            Request::Dispatch {
                txn_id,
                ssid_spec,
                pieces,
            },
            move |resp| match resp {
                Response::DispatchAck(reply) => callback(reply),
                other => {
                    log_failed_reply(partition, txn_id, "dispatch", &other);
                    callback(failed);
                }
            },
        );
    }

    fn broadcast_validate(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        ssid_new: SnapshotId,
        callback: ValidateCallback,
    ) {
        self.send(
            partition,
            "validate",
            Request::Validate { txn_id, ssid_new },
            move |resp| match resp {
                Response::ValidateAck { result } => callback(result),
                other => {
                    log_failed_reply(partition, txn_id, "validate", &other);
                    callback(ValidateResult::Inconsistent);
                }
            },
        );
    }

    fn broadcast_finalize(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        decision: Decision,
        ssid_commit: SnapshotId,
    ) {
        let request = Request::Finalize {
            txn_id,
            decision: decision as i8,
            ssid_commit,
        };
        if let Err(e) = self.client(partition).notify(request) {
            error!(partition, txn_id, error = %e, "finalize not sent");
        }
    }

    fn broadcast_finalize_abort(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: FinalizeAckCallback,
    ) {
        self.send(
            partition,
            "finalize_abort",
            Request::FinalizeAbort { txn_id },
            move |resp| {
                if resp != Response::FinalizeAck {
                    log_failed_reply(partition, txn_id, "finalize_abort", &resp);
                }
                callback();
            },
        );
    }

    fn broadcast_status_query(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: StatusCallback,
    ) {
        self.send(
            partition,
            "status_query",
            Request::StatusQuery { txn_id },
            move |resp| match resp {
                Response::StatusQueryAck(reply) => callback(reply),
                other => {
                    log_failed_reply(partition, txn_id, "status_query", &other);
                    callback(StatusReply::aborted());
                }
            },
        );
    }
}
