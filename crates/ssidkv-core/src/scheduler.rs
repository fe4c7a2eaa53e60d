//! Partition-side entry points: Dispatch, Validate, Finalize, StatusQuery.
//!
//! All state of one partition sits behind a single mutex. Replies and query
//! callbacks are invoked while it is held, so they must only hand the answer
//! off (enqueue, send on a channel) and never call back into the same
//! scheduler.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::commo::{DispatchReply, DispatchRequest, PieceOp, PieceOutput};
use crate::config::ProtocolConfig;
use crate::mvcc::{Row, VersionQueue};
use crate::txn::{AccTxn, PendingQuery, QueryCallback, ReplySlot};
use crate::types::{
    ColumnId, Decision, PartitionId, RowKey, SnapshotId, StatusReply, TxnId, ValidateResult, Value,
    VersionIndex, VersionStatus,
};

struct PartitionState {
    rows: HashMap<RowKey, Row>,
    txns: HashMap<TxnId, AccTxn>,
}

/// The scheduler of one partition.
pub struct PartitionScheduler {
    partition: PartitionId,
    offset_tolerance: u64,
    state: Mutex<PartitionState>,
}

impl PartitionScheduler {
    pub fn new(partition: PartitionId, config: &ProtocolConfig) -> Self {
        Self {
            partition,
            offset_tolerance: config.offset_tolerance,
            state: Mutex::new(PartitionState {
                rows: HashMap::new(),
                txns: HashMap::new(),
            }),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Install a row whose columns start at `values`. An existing row with
    /// the same key is replaced.
    pub fn load_row(&self, key: RowKey, values: Vec<Value>) {
        let mut st = self.state.lock();
        if let Some(old) = st.rows.get(&key) {
            assert_eq!(
                old.pin_count(),
                0,
                "partition {}: replacing pinned row {key}",
                self.partition
            );
        }
        st.rows.insert(key, Row::create(key, values));
    }

    /// Execute the pieces against the rows and report the transaction's
    /// aggregated bounds. A piece addressing a missing row skips that op.
    pub fn on_dispatch(&self, request: DispatchRequest) -> DispatchReply {
        let mut st = self.state.lock();
        let PartitionState { rows, txns } = &mut *st;
        let txn_id = request.txn_id;
        let txn = txns
            .entry(txn_id)
            .or_insert_with(|| AccTxn::new(txn_id, self.offset_tolerance));
        txn.load_speculative_ssid(request.ssid_spec);

        let mut outputs = BTreeMap::new();
        for piece in request.pieces {
            let mut output = PieceOutput::new();
            for (slot, op) in piece.ops.into_iter().enumerate() {
                match op {
                    PieceOp::Read { row, col } => {
                        let Some(r) = rows.get_mut(&row) else {
                            warn!(partition = self.partition, txn_id, row, "read of missing row");
                            continue;
                        };
                        if let Some(value) = txn.read_column(r, col) {
                            output.insert(slot as u32, value);
                        }
                    }
                    PieceOp::Write { row, col, value } => {
                        let Some(r) = rows.get_mut(&row) else {
                            warn!(partition = self.partition, txn_id, row, "write to missing row");
                            continue;
                        };
                        txn.write_column(r, col, value);
                    }
                }
            }
            outputs.insert(piece.inn_id, output);
        }

        let reply = DispatchReply {
            result: txn.dispatch_result(),
            ssid_low: txn.sg.highest_ssid_low,
            ssid_high: txn.sg.lowest_ssid_high,
            ssid_new: txn.sg.highest_write_ssid,
            refused: txn.sg.refused,
            outputs,
        };
        debug!(
            partition = self.partition,
            txn_id,
            result = ?reply.result,
            ssid_low = reply.ssid_low,
            ssid_high = reply.ssid_high,
            refused = reply.refused,
            "dispatched"
        );
        reply
    }

    /// Validate every access of `txn_id` at `ssid_new`.
    ///
    /// Runs at most once per transaction; repeats answer CONSISTENT. After
    /// the first rejection the remaining accesses are still visited, with
    /// the consistency flag cleared, so their writes get aborted too.
    pub fn on_validate(&self, txn_id: TxnId, ssid_new: SnapshotId) -> ValidateResult {
        let mut st = self.state.lock();
        let PartitionState { rows, txns } = &mut *st;
        let Some(txn) = txns.get_mut(&txn_id) else {
            debug!(partition = self.partition, txn_id, "validate for unknown txn");
            return ValidateResult::Consistent;
        };
        if txn.sg.validate_done {
            return ValidateResult::Consistent;
        }
        txn.sg.validate_done = true;

        let mut consistent = true;
        let mut undecided_reads = 0usize;
        for (&(key, col), &index) in &txn.sg.indices {
            let row = row_mut(rows, self.partition, key);
            let outcome = row.validate(txn_id, col, index, ssid_new, consistent);
            if !outcome.accepted {
                debug!(
                    partition = self.partition,
                    txn_id, row = key, col, index, "validation rejected"
                );
                consistent = false;
            } else if !outcome.decided {
                undecided_reads += 1;
            }
        }
        trace!(partition = self.partition, txn_id, undecided_reads, consistent, "validated");

        if consistent {
            ValidateResult::Consistent
        } else {
            ValidateResult::Inconsistent
        }
    }

    /// Apply `decision` to every access of `txn_id`, release its rows and
    /// fire the StatusQuery callbacks parked on it. Committed writes move
    /// to `ssid_commit`. A repeat is a no-op.
    pub fn on_finalize(&self, txn_id: TxnId, decision: Decision, ssid_commit: SnapshotId) {
        let mut st = self.state.lock();
        let PartitionState { rows, txns } = &mut *st;
        let Some(mut txn) = txns.remove(&txn_id) else {
            trace!(partition = self.partition, txn_id, "finalize for unknown txn");
            return;
        };

        for (&(key, col), &index) in &txn.sg.indices {
            row_mut(rows, self.partition, key).finalize(txn_id, col, index, decision, ssid_commit);
        }
        txn.release_rows(rows);

        let outcome = match decision {
            Decision::Finalized => StatusReply::finalized(ssid_commit),
            Decision::Aborted => StatusReply::aborted(),
        };
        let callbacks = txn.sg.mark_finalized(outcome);
        debug!(
            partition = self.partition,
            txn_id,
            ?decision,
            ssid_commit,
            callbacks = callbacks.len(),
            "finalized"
        );
        for callback in callbacks {
            callback.fire(outcome);
        }
        txn.sg.reset_safeguard();
    }

    /// Answer whether the undecided versions `txn_id` read have been
    /// decided, and the latest position their writers committed at.
    /// Undecided ones park the reply on their owners.
    pub fn on_status_query(&self, txn_id: TxnId, reply: ReplySlot) {
        let mut st = self.state.lock();
        let PartitionState { rows, txns } = &mut *st;
        let Some(txn) = txns.get_mut(&txn_id) else {
            trace!(partition = self.partition, txn_id, "status query for unknown txn");
            reply.send(StatusReply::finalized(0));
            return;
        };
        if txn.sg.status_query_done || txn.sg.decided {
            txn.sg.status_query_done = true;
            reply.send(StatusReply::finalized(0));
            return;
        }

        let mut will_abort = false;
        let mut ssid_floor: SnapshotId = 0;
        let mut waiting: Vec<(RowKey, ColumnId, VersionIndex)> = Vec::new();
        for (&(key, col), &index) in &txn.sg.reads_for_query {
            let row = row_ref(rows, self.partition, key);
            match row.check_status(txn_id, col, index) {
                VersionStatus::Unchecked | VersionStatus::Validating => {
                    waiting.push((key, col, index))
                }
                VersionStatus::Finalized => {
                    ssid_floor = ssid_floor.max(row.commit_ssid(col, index));
                }
                VersionStatus::Aborted => will_abort = true,
            }
        }
        txn.sg.reads_for_query.clear();

        if will_abort || waiting.is_empty() {
            txn.sg.status_query_done = true;
            let answer = if will_abort {
                StatusReply::aborted()
            } else {
                StatusReply::finalized(ssid_floor)
            };
            reply.send(answer);
            return;
        }

        debug!(
            partition = self.partition,
            txn_id,
            waiting = waiting.len(),
            "status query parked"
        );
        let pending = PendingQuery::new(reply, waiting.len(), ssid_floor);
        for (key, col, index) in waiting {
            let owner = row_ref(rows, self.partition, key).version_txn(col, index);
            match txns.get_mut(&owner) {
                Some(owner_txn) => owner_txn
                    .sg
                    .insert_callback(QueryCallback::new(txn_id, pending.clone())),
                None => panic!(
                    "partition {}: txn {txn_id} depends on unknown txn {owner}",
                    self.partition
                ),
            }
        }
    }

    /// Value of the latest FINALIZED version of a column.
    pub fn committed_value(&self, key: RowKey, col: ColumnId) -> Option<Value> {
        self.with_column(key, col, |q| {
            q.record(q.finalized_version()).map(|rec| rec.value.clone())
        })
        .flatten()
    }

    /// Run `f` against a column's version queue.
    pub fn with_column<R>(
        &self,
        key: RowKey,
        col: ColumnId,
        f: impl FnOnce(&VersionQueue) -> R,
    ) -> Option<R> {
        let st = self.state.lock();
        st.rows.get(&key).and_then(|row| row.column(col)).map(f)
    }

    pub fn row_pins(&self, key: RowKey) -> Option<usize> {
        self.state.lock().rows.get(&key).map(Row::pin_count)
    }

    /// Transactions that dispatched here and are not finalized yet.
    pub fn active_txns(&self) -> usize {
        self.state.lock().txns.len()
    }

    /// StatusQuery callbacks parked on `txn_id`.
    pub fn pending_callbacks(&self, txn_id: TxnId) -> usize {
        self.state
            .lock()
            .txns
            .get(&txn_id)
            .map_or(0, |txn| txn.sg.pending_callbacks())
    }
}

fn row_mut(rows: &mut HashMap<RowKey, Row>, partition: PartitionId, key: RowKey) -> &mut Row {
    match rows.get_mut(&key) {
        Some(row) => row,
        None => panic!("partition {partition}: access to unknown row {key}"),
    }
}

fn row_ref(rows: &HashMap<RowKey, Row>, partition: PartitionId, key: RowKey) -> &Row {
    match rows.get(&key) {
        Some(row) => row,
        None => panic!("partition {partition}: access to unknown row {key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commo::PieceData;
    use crate::types::DispatchResult;
    use std::sync::Arc;

    fn scheduler() -> PartitionScheduler {
        let s = PartitionScheduler::new(0, &ProtocolConfig::default());
        s.load_row(1, vec![Value::Int(0); 6]);
        s.load_row(2, vec![Value::Int(100)]);
        s
    }

    fn dispatch(s: &PartitionScheduler, txn_id: TxnId, spec: u64, ops: Vec<PieceOp>) -> DispatchReply {
        s.on_dispatch(DispatchRequest {
            txn_id,
            ssid_spec: spec,
            pieces: vec![PieceData { inn_id: 1, ops }],
        })
    }

    fn read(row: RowKey, col: ColumnId) -> PieceOp {
        PieceOp::Read { row, col }
    }

    fn write(row: RowKey, col: ColumnId, value: impl Into<Value>) -> PieceOp {
        PieceOp::Write {
            row,
            col,
            value: value.into(),
        }
    }

    fn recording_slot() -> (ReplySlot, Arc<Mutex<Vec<StatusReply>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (ReplySlot::new(move |d| sink.lock().push(d)), seen)
    }

    #[test]
    fn test_dispatch_outputs_by_slot() {
        let s = scheduler();
        let reply = dispatch(&s, 1, 0, vec![write(1, 0, 5), read(2, 0), read(9, 0), read(1, 9)]);
        assert_eq!(reply.result, DispatchResult::Success);
        let out = &reply.outputs[&1];
        assert_eq!(out.len(), 1);
        assert_eq!(out[&1], Value::Int(100));
        assert_eq!(s.active_txns(), 1);
        assert_eq!(s.row_pins(1), Some(1));
    }

    #[test]
    fn test_empty_piece_still_acked() {
        let s = scheduler();
        let reply = dispatch(&s, 1, 0, vec![read(42, 0)]);
        assert!(reply.outputs[&1].is_empty());
        assert_eq!(reply.ssid_high, u64::MAX);
    }

    #[test]
    fn test_validate_and_finalize_commit() {
        let s = scheduler();
        dispatch(&s, 1, 3, vec![read(2, 0), write(1, 5, "a")]);
        assert_eq!(s.on_validate(1, 3), ValidateResult::Consistent);
        assert_eq!(
            s.with_column(1, 5, |q| q.check_status(1)),
            Some(VersionStatus::Validating)
        );
        // Repeat validation is absorbed.
        assert_eq!(s.on_validate(1, 3), ValidateResult::Consistent);

        s.on_finalize(1, Decision::Finalized, 3);
        assert_eq!(s.committed_value(1, 5), Some(Value::from("a")));
        assert_eq!(s.row_pins(1), Some(0));
        assert_eq!(s.row_pins(2), Some(0));
        assert_eq!(s.active_txns(), 0);

        // Idempotent.
        s.on_finalize(1, Decision::Finalized, 3);
        assert_eq!(s.committed_value(1, 5), Some(Value::from("a")));
    }

    #[test]
    fn test_validate_rejects_write_already_read() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 0, 7), write(1, 1, 8)]);
        dispatch(&s, 2, 0, vec![read(1, 0)]);

        assert_eq!(s.on_validate(1, 1), ValidateResult::Inconsistent);
        // Both writes are aborted even though only one was read.
        assert_eq!(s.with_column(1, 0, |q| q.check_status(1)), Some(VersionStatus::Aborted));
        assert_eq!(s.with_column(1, 1, |q| q.check_status(1)), Some(VersionStatus::Aborted));
    }

    #[test]
    fn test_validate_unknown_txn_is_consistent() {
        let s = scheduler();
        assert_eq!(s.on_validate(77, 4), ValidateResult::Consistent);
        assert_eq!(s.active_txns(), 0);
    }

    #[test]
    fn test_status_query_fast_path() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![read(1, 0)]);
        let (slot, seen) = recording_slot();
        s.on_status_query(1, slot);
        assert_eq!(*seen.lock(), vec![StatusReply::finalized(0)]);
    }

    #[test]
    fn test_dispatch_reports_refused_write() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 5, "a")]);
        let reply = dispatch(&s, 2, 0, vec![write(1, 5, "b")]);
        assert!(reply.refused);
        assert_eq!(s.with_column(1, 5, |q| q.check_status(2)), Some(VersionStatus::Aborted));

        // Aborting the refused transaction leaves the pending write alone.
        s.on_finalize(2, Decision::Aborted, 0);
        s.on_finalize(1, Decision::Finalized, 1);
        assert_eq!(s.committed_value(1, 5), Some(Value::from("a")));
    }

    #[test]
    fn test_committed_write_moves_to_commit_position() {
        let s = scheduler();
        dispatch(&s, 1, 2, vec![write(1, 5, "a")]);
        s.on_finalize(1, Decision::Finalized, 9);
        assert_eq!(s.with_column(1, 5, |q| q.commit_ssid(1)), Some(9));

        let reply = dispatch(&s, 2, 0, vec![write(1, 5, "b")]);
        assert_eq!(reply.ssid_low, 10);
    }

    #[test]
    fn test_status_query_reports_finalized_owner_position() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 5, "a")]);
        dispatch(&s, 2, 0, vec![read(1, 5)]);
        s.on_finalize(1, Decision::Finalized, 6);

        let (slot, seen) = recording_slot();
        s.on_status_query(2, slot);
        assert_eq!(*seen.lock(), vec![StatusReply::finalized(6)]);
    }

    #[test]
    fn test_status_query_parks_until_owner_finalizes() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 5, "a")]);
        let reply = dispatch(&s, 2, 0, vec![read(1, 5)]);
        assert_eq!(reply.result, DispatchResult::NotDecided);
        assert_eq!(reply.outputs[&1][&0], Value::from("a"));

        let (slot, seen) = recording_slot();
        s.on_status_query(2, slot);
        assert!(seen.lock().is_empty());
        assert_eq!(s.pending_callbacks(1), 1);

        s.on_finalize(1, Decision::Finalized, 4);
        assert_eq!(*seen.lock(), vec![StatusReply::finalized(4)]);
        s.on_finalize(1, Decision::Finalized, 4);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_status_query_sees_abort_directly() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 5, "a")]);
        dispatch(&s, 2, 0, vec![read(1, 5)]);
        s.on_finalize(1, Decision::Aborted, 0);

        let (slot, seen) = recording_slot();
        s.on_status_query(2, slot);
        assert_eq!(*seen.lock(), vec![StatusReply::aborted()]);
        assert_eq!(s.committed_value(1, 5), Some(Value::Int(0)));
    }

    #[test]
    fn test_status_query_waits_on_every_owner() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 0, 1)]);
        dispatch(&s, 2, 0, vec![write(1, 1, 2)]);
        dispatch(&s, 3, 0, vec![read(1, 0), read(1, 1)]);

        let (slot, seen) = recording_slot();
        s.on_status_query(3, slot);
        s.on_finalize(1, Decision::Finalized, 2);
        assert!(seen.lock().is_empty());
        s.on_finalize(2, Decision::Finalized, 5);
        assert_eq!(*seen.lock(), vec![StatusReply::finalized(5)]);
    }

    #[test]
    fn test_status_query_first_abort_wins() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![write(1, 0, 1)]);
        dispatch(&s, 2, 0, vec![write(1, 1, 2)]);
        dispatch(&s, 3, 0, vec![read(1, 0), read(1, 1)]);

        let (slot, seen) = recording_slot();
        s.on_status_query(3, slot);
        s.on_finalize(2, Decision::Aborted, 0);
        s.on_finalize(1, Decision::Finalized, 1);
        assert_eq!(*seen.lock(), vec![StatusReply::aborted()]);
    }

    #[test]
    #[should_panic(expected = "replacing pinned row")]
    fn test_reload_of_pinned_row_is_fatal() {
        let s = scheduler();
        dispatch(&s, 1, 0, vec![read(1, 0)]);
        s.load_row(1, vec![Value::Null]);
    }
}
