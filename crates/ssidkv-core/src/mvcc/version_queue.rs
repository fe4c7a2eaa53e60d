//! Per-column version queue.
//!
//! Records are kept in write order and are never removed, so a queue grows
//! with every write to its column. An aborted record stays in place so that
//! version indices held by transactions stay valid.
//! Two cursors summarize the queue:
//!
//! - `finalized_version`: index of the most recent FINALIZED record.
//! - `decided_head`: every record at or before it is FINALIZED or ABORTED.
//!
//! The *logical head* is the first non-aborted record after
//! `finalized_version`, or `finalized_version` itself when there is none.
//! A write is only appended behind a decided head. A write that arrives
//! while another transaction's write is still pending is refused: it is
//! recorded as ABORTED and its transaction has to restart. So at most one
//! undecided record exists past the frontier, and it is the logical head.
//!
//! A record's stored range is `(write position, highest read position)`.
//! A new write lands strictly above every read position of the version it
//! replaces, and committing a write raises it to its transaction's commit
//! position.

use tracing::trace;

use crate::types::{
    ColumnId, Decision, LOADER_TXN_ID, SnapshotId, SsidRange, TxnId, Value, VersionIndex,
    VersionStatus,
};

/// One version of a column.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub txn_id: TxnId,
    pub ssid: SsidRange,
    pub status: VersionStatus,
    pub value: Value,
    /// Other transactions that read this record.
    readers: Vec<TxnId>,
}

impl VersionRecord {
    fn new(txn_id: TxnId, value: Value, ssid: SsidRange, status: VersionStatus) -> Self {
        Self {
            txn_id,
            ssid,
            status,
            value,
            readers: Vec::new(),
        }
    }

    pub fn has_reads(&self) -> bool {
        !self.readers.is_empty()
    }

    /// True when no transaction other than `txn_id` has read this record.
    pub fn read_only_by(&self, txn_id: TxnId) -> bool {
        self.readers.iter().all(|&r| r == txn_id)
    }

    fn add_reader(&mut self, txn_id: TxnId) {
        if !self.readers.contains(&txn_id) {
            self.readers.push(txn_id);
        }
    }
}

/// Result of reading the logical head.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub value: Value,
    pub ssid: SsidRange,
    pub offset_safe: bool,
    pub index: VersionIndex,
    pub decided: bool,
}

/// Result of appending a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub ssid: SsidRange,
    pub index: VersionIndex,
    pub offset_safe: bool,
    /// The write arrived behind another transaction's pending write and was
    /// recorded as ABORTED.
    pub refused: bool,
    /// The record this write replaces. `None` when an own pending write was
    /// overwritten in place.
    pub follows: Option<VersionIndex>,
}

/// Result of validating a read marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub accepted: bool,
    /// Whether the version that was read is already FINALIZED.
    pub decided: bool,
}

/// The version queue of a single column.
#[derive(Debug, Clone)]
pub struct VersionQueue {
    column: ColumnId,
    records: Vec<VersionRecord>,
    finalized_version: VersionIndex,
    decided_head: VersionIndex,
}

impl VersionQueue {
    /// Create a queue holding `initial` as a FINALIZED version owned by the
    /// loader transaction.
    pub fn new(column: ColumnId, initial: Value) -> Self {
        Self {
            column,
            records: vec![VersionRecord::new(
                LOADER_TXN_ID,
                initial,
                SsidRange::EMPTY,
                VersionStatus::Finalized,
            )],
            finalized_version: 0,
            decided_head: 0,
        }
    }

    pub fn column(&self) -> ColumnId {
        self.column
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, index: VersionIndex) -> Option<&VersionRecord> {
        self.records.get(index)
    }

    pub fn finalized_version(&self) -> VersionIndex {
        self.finalized_version
    }

    pub fn decided_head(&self) -> VersionIndex {
        self.decided_head
    }

    /// Index of the record visible to new operations.
    pub fn logical_head_index(&self) -> VersionIndex {
        self.records
            .iter()
            .enumerate()
            .skip(self.finalized_version + 1)
            .find(|(_, rec)| rec.status != VersionStatus::Aborted)
            .map_or(self.finalized_version, |(i, _)| i)
    }

    pub fn is_logical_head(&self, index: VersionIndex) -> bool {
        self.logical_head_index() == index
    }

    /// Whether `txn_id` touched `index` as a reader (it did not write it).
    pub fn is_read(&self, txn_id: TxnId, index: VersionIndex) -> bool {
        self.record_at(index).txn_id != txn_id
    }

    /// The transaction that wrote the record at `index`.
    pub fn version_txn(&self, index: VersionIndex) -> TxnId {
        self.record_at(index).txn_id
    }

    /// Write position of the record at `index`. For a FINALIZED record this
    /// is the position its transaction committed at.
    pub fn commit_ssid(&self, index: VersionIndex) -> SnapshotId {
        self.record_at(index).ssid.low
    }

    /// Number of undecided records.
    pub fn pending_count(&self) -> usize {
        self.records[self.decided_head + 1..]
            .iter()
            .filter(|rec| !rec.status.is_decided())
            .count()
    }

    /// Read the logical head on behalf of `txn_id`. Never blocks.
    pub fn read(&mut self, txn_id: TxnId, ssid_spec: SnapshotId) -> ReadOutcome {
        let index = self.logical_head_index();
        let rec = &mut self.records[index];
        assert!(
            rec.status != VersionStatus::Aborted,
            "column {}: logical head {index} is aborted",
            self.column
        );

        if rec.txn_id == txn_id {
            // Reading our own pending write.
            return ReadOutcome {
                value: rec.value.clone(),
                ssid: SsidRange::unbounded(rec.ssid.low),
                offset_safe: true,
                index,
                decided: true,
            };
        }

        rec.add_reader(txn_id);
        rec.ssid.extend_to(ssid_spec);
        ReadOutcome {
            value: rec.value.clone(),
            ssid: rec.ssid,
            offset_safe: ssid_spec >= rec.ssid.low,
            index,
            decided: rec.status == VersionStatus::Finalized,
        }
    }

    /// Append a write by `txn_id` after the current logical head.
    ///
    /// A second write by the same transaction to this column replaces the
    /// value of its pending record instead of queueing behind itself. A
    /// write behind another transaction's undecided record is refused.
    pub fn write(&mut self, value: Value, ssid_spec: SnapshotId, txn_id: TxnId) -> WriteOutcome {
        if let Some(index) = self.own_pending(txn_id) {
            self.records[index].value = value;
            return WriteOutcome {
                ssid: SsidRange::unbounded(self.records[index].ssid.low),
                index,
                offset_safe: true,
                refused: false,
                follows: None,
            };
        }

        let head_index = self.logical_head_index();
        let head = &self.records[head_index];
        let refused = !head.status.is_decided();
        let low = head.ssid.high.saturating_add(1).max(ssid_spec);
        let offset_safe = !refused && head.read_only_by(txn_id);
        let status = if refused {
            VersionStatus::Aborted
        } else {
            VersionStatus::Unchecked
        };

        let index = self.records.len();
        self.records
            .push(VersionRecord::new(txn_id, value, SsidRange::new(low, low), status));
        if refused {
            trace!(
                column = self.column,
                txn_id,
                index,
                pending = head_index,
                "refused write behind pending write"
            );
        } else {
            trace!(column = self.column, txn_id, index, low, "appended write");
        }

        WriteOutcome {
            ssid: SsidRange::unbounded(low),
            index,
            offset_safe,
            refused,
            follows: Some(head_index),
        }
    }

    /// Validate a read marker at `index`.
    ///
    /// Accepted iff `consistent` and the version read is still the logical
    /// head; on acceptance the version's range is extended to `ssid_new`.
    pub fn validate_read(
        &mut self,
        index: VersionIndex,
        ssid_new: SnapshotId,
        consistent: bool,
    ) -> ValidateOutcome {
        if !consistent || !self.is_logical_head(index) {
            return ValidateOutcome {
                accepted: false,
                decided: false,
            };
        }
        let rec = self.record_at_mut(index);
        rec.ssid.extend_to(ssid_new);
        ValidateOutcome {
            accepted: true,
            decided: rec.status == VersionStatus::Finalized,
        }
    }

    /// Validate a write at `index`.
    ///
    /// Accepted iff `consistent`, the write is the logical head and nobody
    /// has read it yet. Accepted writes move to VALIDATING with both bounds
    /// on `ssid_new`; rejected writes are marked ABORTED.
    pub fn validate_write(
        &mut self,
        index: VersionIndex,
        ssid_new: SnapshotId,
        consistent: bool,
    ) -> bool {
        let accepted =
            consistent && self.is_logical_head(index) && !self.record_at(index).has_reads();
        let column = self.column;
        let rec = self.record_at_mut(index);
        if accepted {
            set_status(column, index, rec, VersionStatus::Validating);
            rec.ssid.snap_to(ssid_new);
        } else {
            set_status(column, index, rec, VersionStatus::Aborted);
            self.update_decided_head();
        }
        accepted
    }

    /// Apply the commit decision to the write at `index`. A committed write
    /// is raised to `ssid_commit`, the position its transaction committed
    /// at; aborts ignore it. Repeating the same decision is a no-op.
    ///
    /// Panics when committing a write while an earlier write is undecided.
    pub fn finalize(&mut self, index: VersionIndex, decision: Decision, ssid_commit: SnapshotId) {
        let column = self.column;
        if decision == Decision::Finalized {
            let earlier_pending = self
                .records
                .iter()
                .enumerate()
                .take(index)
                .skip(self.decided_head + 1)
                .find(|(_, rec)| !rec.status.is_decided());
            if let Some((pending, _)) = earlier_pending {
                panic!(
                    "column {column}: finalizing {index} ahead of an undecided write at {pending}"
                );
            }
        }

        let rec = self.record_at_mut(index);
        set_status(column, index, rec, decision.into());
        if decision == Decision::Finalized {
            rec.ssid.raise_to(ssid_commit);
            if index > self.finalized_version {
                self.finalized_version = index;
            }
        }
        self.update_decided_head();
    }

    pub fn check_status(&self, index: VersionIndex) -> VersionStatus {
        self.record_at(index).status
    }

    fn own_pending(&self, txn_id: TxnId) -> Option<VersionIndex> {
        (self.decided_head + 1..self.records.len()).find(|&i| {
            let rec = &self.records[i];
            rec.txn_id == txn_id && !rec.status.is_decided()
        })
    }

    fn update_decided_head(&mut self) {
        while self.decided_head + 1 < self.records.len()
            && self.records[self.decided_head + 1].status.is_decided()
        {
            self.decided_head += 1;
        }
    }

    fn record_at(&self, index: VersionIndex) -> &VersionRecord {
        match self.records.get(index) {
            Some(rec) => rec,
            None => panic!(
                "column {}: version index {index} out of bounds ({} records)",
                self.column,
                self.records.len()
            ),
        }
    }

    fn record_at_mut(&mut self, index: VersionIndex) -> &mut VersionRecord {
        let len = self.records.len();
        match self.records.get_mut(index) {
            Some(rec) => rec,
            None => panic!(
                "column {}: version index {index} out of bounds ({len} records)",
                self.column
            ),
        }
    }
}

fn set_status(column: ColumnId, index: VersionIndex, rec: &mut VersionRecord, next: VersionStatus) {
    assert!(
        rec.status.can_transition_to(next),
        "column {column}: illegal status transition {:?} -> {next:?} at index {index}",
        rec.status
    );
    rec.status = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue() -> VersionQueue {
        VersionQueue::new(5, Value::Int(0))
    }

    #[test]
    fn test_initial_state() {
        let q = queue();
        assert_eq!(q.len(), 1);
        assert_eq!(q.logical_head_index(), 0);
        assert_eq!(q.check_status(0), VersionStatus::Finalized);
        assert_eq!(q.version_txn(0), LOADER_TXN_ID);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn test_read_finalized_head() {
        let mut q = queue();
        let r = q.read(7, 4);
        assert_eq!(r.value, Value::Int(0));
        assert_eq!(r.index, 0);
        assert_eq!(r.ssid, SsidRange::new(0, 4));
        assert!(r.decided);
        assert!(r.offset_safe);
        // The read position sticks to the version.
        assert_eq!(q.record(0).unwrap().ssid.high, 4);
    }

    #[test]
    fn test_write_lands_above_reads() {
        let mut q = queue();
        q.read(7, 10);
        let w = q.write(Value::from("a"), 3, 8);
        assert_eq!(w.index, 1);
        assert_eq!(w.ssid, SsidRange::unbounded(11));
        assert_eq!(w.follows, Some(0));
        assert!(!w.refused);
        // Someone else read the version this write replaces.
        assert!(!w.offset_safe);
        assert_eq!(q.check_status(1), VersionStatus::Unchecked);
    }

    #[test]
    fn test_read_modify_write_stays_offset_safe() {
        let mut q = queue();
        let r = q.read(1, 4);
        let w = q.write(Value::Int(1), 4, 1);
        assert_eq!(r.ssid, SsidRange::new(0, 4));
        assert_eq!(w.ssid.low, 5);
        assert!(w.offset_safe);
    }

    #[test]
    fn test_speculative_read_sees_pending_write() {
        let mut q = queue();
        q.write(Value::from("a"), 2, 1);
        let r = q.read(2, 2);
        assert_eq!(r.value, Value::from("a"));
        assert_eq!(r.index, 1);
        assert_eq!(r.ssid, SsidRange::new(2, 2));
        assert!(!r.decided);
        assert!(q.is_read(2, 1));
        assert!(!q.is_read(1, 1));
    }

    #[test]
    fn test_own_write_read_is_decided() {
        let mut q = queue();
        q.write(Value::Int(9), 2, 1);
        let r = q.read(1, 2);
        assert_eq!(r.value, Value::Int(9));
        assert!(r.decided);
        assert_eq!(r.ssid.high, u64::MAX);
        assert!(!q.record(1).unwrap().has_reads());
    }

    #[test]
    fn test_write_behind_pending_write_is_refused() {
        let mut q = queue();
        let w1 = q.write(Value::Int(1), 0, 1);
        let w2 = q.write(Value::Int(2), 0, 2);
        assert!(w1.offset_safe);
        assert!(w2.refused);
        assert!(!w2.offset_safe);
        assert_eq!(q.check_status(w2.index), VersionStatus::Aborted);
        assert_eq!(q.logical_head_index(), w1.index);
        assert_eq!(q.pending_count(), 1);
        assert_eq!(q.read(3, 0).value, Value::Int(1));

        // Once the pending write is decided the retry goes through.
        q.finalize(w1.index, Decision::Aborted, 0);
        assert_eq!(q.logical_head_index(), 0);
        assert_eq!(q.decided_head(), 2);
        let w3 = q.write(Value::Int(3), 0, 2);
        assert!(!w3.refused);
        assert_eq!(q.logical_head_index(), w3.index);
    }

    #[test]
    fn test_repeat_write_replaces_own_record() {
        let mut q = queue();
        let w1 = q.write(Value::Int(1), 0, 1);
        let w2 = q.write(Value::Int(2), 0, 1);
        assert_eq!(w1.index, w2.index);
        assert_eq!(w2.follows, None);
        assert_eq!(q.len(), 2);
        assert_eq!(q.record(1).unwrap().value, Value::Int(2));
    }

    #[test]
    fn test_validate_write_snaps_range() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 3, 1);
        assert!(q.validate_write(w.index, 7, true));
        let rec = q.record(w.index).unwrap();
        assert_eq!(rec.status, VersionStatus::Validating);
        assert_eq!(rec.ssid, SsidRange::new(7, 7));
    }

    #[test]
    fn test_validate_write_rejects_read_version() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 3, 1);
        q.read(2, 3);
        assert!(!q.validate_write(w.index, 7, true));
        assert_eq!(q.check_status(w.index), VersionStatus::Aborted);
        assert_eq!(q.decided_head(), 1);
    }

    #[test]
    fn test_validate_write_rejects_refused_write() {
        let mut q = queue();
        q.write(Value::Int(1), 0, 1);
        let w2 = q.write(Value::Int(2), 0, 2);
        assert!(!q.validate_write(w2.index, 4, true));
        assert_eq!(q.check_status(w2.index), VersionStatus::Aborted);
    }

    #[test]
    fn test_validate_write_rejects_inconsistent_flag() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 0, 1);
        assert!(!q.validate_write(w.index, 4, false));
        assert_eq!(q.check_status(w.index), VersionStatus::Aborted);
    }

    #[test]
    fn test_validate_read() {
        let mut q = queue();
        let r = q.read(1, 2);
        let v = q.validate_read(r.index, 9, true);
        assert!(v.accepted);
        assert!(v.decided);
        assert_eq!(q.record(0).unwrap().ssid.high, 9);

        // A newer write makes the read stale.
        let w = q.write(Value::Int(5), 9, 2);
        assert_eq!(w.ssid.low, 10);
        let v = q.validate_read(r.index, 10, true);
        assert!(!v.accepted);
    }

    #[test]
    fn test_validate_read_of_pending_reports_undecided() {
        let mut q = queue();
        let w = q.write(Value::Int(5), 1, 1);
        let r = q.read(2, 1);
        assert_eq!(r.index, w.index);
        let v = q.validate_read(r.index, 3, true);
        assert!(v.accepted);
        assert!(!v.decided);
    }

    #[test]
    fn test_commit_raises_write_to_commit_position() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 3, 1);
        q.finalize(w.index, Decision::Finalized, 8);
        assert_eq!(q.record(w.index).unwrap().ssid, SsidRange::new(8, 8));
        assert_eq!(q.commit_ssid(w.index), 8);

        let next = q.write(Value::Int(2), 0, 2);
        assert_eq!(next.ssid.low, 9);
    }

    #[test]
    fn test_finalize_moves_frontier() {
        let mut q = queue();
        let w1 = q.write(Value::Int(1), 0, 1);
        q.finalize(w1.index, Decision::Finalized, 1);
        assert_eq!(q.finalized_version(), w1.index);
        assert_eq!(q.decided_head(), 1);

        let w2 = q.write(Value::Int(2), 0, 2);
        assert_eq!(q.pending_count(), 1);
        q.finalize(w2.index, Decision::Finalized, 2);
        assert_eq!(q.finalized_version(), w2.index);
        assert_eq!(q.logical_head_index(), w2.index);
        assert_eq!(q.decided_head(), 2);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 0, 1);
        q.finalize(w.index, Decision::Finalized, 1);
        q.finalize(w.index, Decision::Finalized, 1);
        assert_eq!(q.check_status(w.index), VersionStatus::Finalized);
        assert_eq!(q.decided_head(), 1);
    }

    #[test]
    #[should_panic(expected = "ahead of an undecided write")]
    fn test_commit_past_undecided_write_is_fatal() {
        let mut q = queue();
        q.write(Value::Int(1), 0, 1);
        let w2 = q.write(Value::Int(2), 0, 2);
        q.finalize(w2.index, Decision::Finalized, 3);
    }

    #[test]
    #[should_panic(expected = "illegal status transition")]
    fn test_finalized_cannot_abort() {
        let mut q = queue();
        let w = q.write(Value::Int(1), 0, 1);
        q.finalize(w.index, Decision::Finalized, 1);
        q.finalize(w.index, Decision::Aborted, 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_bad_index_is_fatal() {
        let q = queue();
        q.check_status(3);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Read(TxnId, SnapshotId),
        Write(TxnId, SnapshotId),
        Validate(usize, SnapshotId, bool),
        Finalize(usize, SnapshotId, bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1u64..6, 0u64..20).prop_map(|(t, s)| Step::Read(t, s)),
            (1u64..6, 0u64..20).prop_map(|(t, s)| Step::Write(t, s)),
            (0usize..12, 0u64..5, any::<bool>()).prop_map(|(i, d, c)| Step::Validate(i, d, c)),
            (0usize..12, 0u64..5, any::<bool>()).prop_map(|(i, d, c)| Step::Finalize(i, d, c)),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_undecided_record_and_it_is_the_head(steps in prop::collection::vec(step(), 1..60)) {
            let mut q = queue();
            let mut last_decided_head = 0;
            for s in steps {
                let before: Vec<VersionStatus> =
                    (0..q.len()).map(|i| q.check_status(i)).collect();
                match s {
                    Step::Read(t, spec) => {
                        let head = q.logical_head_index();
                        let r = q.read(t, spec);
                        prop_assert_eq!(r.index, head);
                    }
                    Step::Write(t, spec) => {
                        let head = q.logical_head_index();
                        let pending = !q.check_status(head).is_decided();
                        let w = q.write(Value::Int(t as i64), spec, t);
                        if pending && q.version_txn(head) != t {
                            prop_assert!(w.refused);
                        }
                    }
                    Step::Validate(i, delta, c) => {
                        if i > 0 && i < q.len() && !q.check_status(i).is_decided() {
                            let ssid_new = q.commit_ssid(i) + delta;
                            q.validate_write(i, ssid_new, c);
                        }
                    }
                    Step::Finalize(i, delta, commit) => {
                        if i > 0 && i < q.len() && !q.check_status(i).is_decided() {
                            let d = if commit { Decision::Finalized } else { Decision::Aborted };
                            let point = q.commit_ssid(i) + delta;
                            q.finalize(i, d, point);
                        }
                    }
                }
                for (i, old) in before.iter().enumerate() {
                    prop_assert!(old.can_transition_to(q.check_status(i)));
                }
                prop_assert!(q.decided_head() >= last_decided_head);
                last_decided_head = q.decided_head();

                let head = q.logical_head_index();
                prop_assert!(head >= q.finalized_version());
                let undecided: Vec<usize> = (q.finalized_version() + 1..q.len())
                    .filter(|&i| !q.check_status(i).is_decided())
                    .collect();
                prop_assert!(undecided.len() <= 1);
                if let Some(&only) = undecided.first() {
                    prop_assert_eq!(only, head);
                }
                for i in q.finalized_version() + 1..q.len() {
                    prop_assert!(q.check_status(i) != VersionStatus::Finalized);
                }
                for i in 0..=q.decided_head() {
                    prop_assert!(q.check_status(i).is_decided());
                }
                // Surviving versions sit at strictly increasing positions.
                let lows: Vec<SnapshotId> = (0..q.len())
                    .filter(|&i| q.check_status(i) != VersionStatus::Aborted)
                    .map(|i| q.commit_ssid(i))
                    .collect();
                for pair in lows.windows(2) {
                    prop_assert!(pair[0] < pair[1]);
                }
            }
        }
    }
}
