//! Transport boundary between coordinators and partitions.
//!
//! A [`Commo`] delivers one message to one partition and hands the reply to
//! a callback. Callbacks run exactly once. Finalize(commit) carries no reply.

pub mod local;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    ColumnId, Decision, DispatchResult, InnId, PartitionId, RowKey, SSID_INFINITY, SnapshotId,
    StatusReply, TxnId, ValidateResult, Value,
};

pub use local::{Envelope, LocalCommo, MessageKind};

/// Values a piece produced, keyed by the position of the read op.
pub type PieceOutput = BTreeMap<u32, Value>;

/// One operation of a dispatched piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PieceOp {
    Read { row: RowKey, col: ColumnId },
    Write { row: RowKey, col: ColumnId, value: Value },
}

/// A piece with every write value resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceData {
    pub inn_id: InnId,
    pub ops: Vec<PieceOp>,
}

/// The pieces of one transaction bound for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub txn_id: TxnId,
    pub ssid_spec: SnapshotId,
    pub pieces: Vec<PieceData>,
}

/// A partition's answer to Dispatch: the classification plus the
/// transaction's aggregated bounds at this partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    pub result: DispatchResult,
    pub ssid_low: SnapshotId,
    pub ssid_high: SnapshotId,
    pub ssid_new: SnapshotId,
    /// The transaction cannot commit: a write was refused behind another
    /// transaction's pending write, a column changed between two of its
    /// accesses, or the partition was unreachable.
    #[serde(default)]
    pub refused: bool,
    /// One entry per dispatched piece, even when it produced nothing.
    pub outputs: BTreeMap<InnId, PieceOutput>,
}

impl DispatchReply {
    /// Stand-in reply for a dispatch that never reached its partition.
    pub fn unreachable(request: &DispatchRequest) -> Self {
        Self {
            result: DispatchResult::BothNegative,
            ssid_low: 0,
            ssid_high: SSID_INFINITY,
            ssid_new: request.ssid_spec,
            refused: true,
            outputs: request
                .pieces
                .iter()
                .map(|piece| (piece.inn_id, PieceOutput::new()))
                .collect(),
        }
    }
}

pub type DispatchCallback = Box<dyn FnOnce(DispatchReply) + Send>;
pub type ValidateCallback = Box<dyn FnOnce(ValidateResult) + Send>;
pub type FinalizeAckCallback = Box<dyn FnOnce() + Send>;
pub type StatusCallback = Box<dyn FnOnce(StatusReply) + Send>;

/// Broadcast-with-callback primitives used by the coordinator.
///
/// Implementations must not invoke a callback from inside the broadcast
/// call: the coordinator sends while holding its own lock. When a message
/// cannot be delivered the callback still runs, later, with an answer that
/// makes the transaction abort: [`DispatchReply::unreachable`] for
/// Dispatch, INCONSISTENT for Validate, [`StatusReply::aborted`] for
/// StatusQuery, and a plain ack for FinalizeAbort.
pub trait Commo: Send + Sync {
    fn broadcast_dispatch(
        &self,
        partition: PartitionId,
        request: DispatchRequest,
        callback: DispatchCallback,
    );

    fn broadcast_validate(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        ssid_new: SnapshotId,
        callback: ValidateCallback,
    );

    /// Fire-and-forget commit. `ssid_commit` is the position the
    /// transaction committed at. A commit that cannot be delivered is only
    /// logged; the partition keeps the writes pending.
    fn broadcast_finalize(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        decision: Decision,
        ssid_commit: SnapshotId,
    );

    /// Abort that reports back once the partition applied it.
    fn broadcast_finalize_abort(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: FinalizeAckCallback,
    );

    fn broadcast_status_query(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: StatusCallback,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_reply_aborts_every_piece() {
        let request = DispatchRequest {
            txn_id: 4,
            ssid_spec: 3,
            pieces: vec![
                PieceData { inn_id: 1, ops: vec![PieceOp::Read { row: 1, col: 0 }] },
                PieceData { inn_id: 2, ops: vec![] },
            ],
        };
        let reply = DispatchReply::unreachable(&request);
        assert!(reply.refused);
        assert!(!reply.result.decided());
        assert_eq!(reply.outputs.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_refused_flag_defaults_off_on_the_wire() {
        let json = r#"{"result":"success","ssid_low":1,"ssid_high":4,"ssid_new":1,"outputs":{}}"#;
        let reply: DispatchReply = serde_json::from_str(json).unwrap();
        assert!(!reply.refused);
    }
}
