//! A row: one version queue per column.
//!
//! Out-of-range column ids are a benign sentinel: reads and writes on them
//! return the zero SSID range and touch nothing.

use crate::types::{
    ColumnId, Decision, RowKey, SnapshotId, SsidRange, TxnId, Value, VersionIndex, VersionStatus,
};

use super::version_queue::{ValidateOutcome, VersionQueue};

/// Result of [`Row::read_column`]. `value` is `None` for the sentinel column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRead {
    pub value: Option<Value>,
    pub ssid: SsidRange,
    pub offset_safe: bool,
    pub index: VersionIndex,
    pub decided: bool,
}

impl ColumnRead {
    fn sentinel() -> Self {
        Self {
            value: None,
            ssid: SsidRange::EMPTY,
            offset_safe: true,
            index: 0,
            decided: true,
        }
    }
}

/// Result of [`Row::write_column`]. `applied` is false for the sentinel column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnWrite {
    pub applied: bool,
    pub ssid: SsidRange,
    pub index: VersionIndex,
    pub offset_safe: bool,
    pub refused: bool,
    pub follows: Option<VersionIndex>,
}

#[derive(Debug, Clone)]
pub struct Row {
    key: RowKey,
    columns: Vec<VersionQueue>,
    /// In-flight transactions holding this row between dispatch and finalize.
    pins: usize,
}

impl Row {
    /// Build a row whose column `i` starts with `values[i]`.
    pub fn create(key: RowKey, values: Vec<Value>) -> Self {
        let columns = values
            .into_iter()
            .enumerate()
            .map(|(col, v)| VersionQueue::new(col, v))
            .collect();
        Self {
            key,
            columns,
            pins: 0,
        }
    }

    pub fn key(&self) -> RowKey {
        self.key
    }

    pub fn column(&self, col: ColumnId) -> Option<&VersionQueue> {
        self.columns.get(col)
    }

    /// Keep the row alive for an in-flight transaction.
    pub fn ref_copy(&mut self) {
        self.pins += 1;
    }

    pub fn release(&mut self) {
        assert!(self.pins > 0, "row {}: release without a pin", self.key);
        self.pins -= 1;
    }

    pub fn pin_count(&self) -> usize {
        self.pins
    }

    pub fn read_column(&mut self, col: ColumnId, txn_id: TxnId, ssid_spec: SnapshotId) -> ColumnRead {
        let Some(queue) = self.columns.get_mut(col) else {
            return ColumnRead::sentinel();
        };
        let read = queue.read(txn_id, ssid_spec);
        ColumnRead {
            value: Some(read.value),
            ssid: read.ssid,
            offset_safe: read.offset_safe,
            index: read.index,
            decided: read.decided,
        }
    }

    pub fn write_column(
        &mut self,
        col: ColumnId,
        value: Value,
        ssid_spec: SnapshotId,
        txn_id: TxnId,
    ) -> ColumnWrite {
        let Some(queue) = self.columns.get_mut(col) else {
            return ColumnWrite {
                applied: false,
                ssid: SsidRange::EMPTY,
                index: 0,
                offset_safe: true,
                refused: false,
                follows: None,
            };
        };
        let write = queue.write(value, ssid_spec, txn_id);
        ColumnWrite {
            applied: true,
            ssid: write.ssid,
            index: write.index,
            offset_safe: write.offset_safe,
            refused: write.refused,
            follows: write.follows,
        }
    }

    /// Validate the access `txn_id` made at `(col, index)`, dispatching on
    /// whether it was a read or a write.
    pub fn validate(
        &mut self,
        txn_id: TxnId,
        col: ColumnId,
        index: VersionIndex,
        ssid_new: SnapshotId,
        consistent: bool,
    ) -> ValidateOutcome {
        let queue = self.queue_mut(col);
        if queue.is_read(txn_id, index) {
            queue.validate_read(index, ssid_new, consistent)
        } else {
            let accepted = queue.validate_write(index, ssid_new, consistent);
            ValidateOutcome {
                accepted,
                decided: true,
            }
        }
    }

    /// Apply `decision` to a write, committing it at `ssid_commit`. Reads
    /// carry nothing to finalize.
    pub fn finalize(
        &mut self,
        txn_id: TxnId,
        col: ColumnId,
        index: VersionIndex,
        decision: Decision,
        ssid_commit: SnapshotId,
    ) {
        let queue = self.queue_mut(col);
        if queue.is_read(txn_id, index) {
            return;
        }
        queue.finalize(index, decision, ssid_commit);
    }

    /// Status of the version behind an access. A transaction's own write is
    /// never a dependency, so it reports FINALIZED.
    pub fn check_status(&self, txn_id: TxnId, col: ColumnId, index: VersionIndex) -> VersionStatus {
        let queue = self.queue(col);
        if !queue.is_read(txn_id, index) {
            return VersionStatus::Finalized;
        }
        queue.check_status(index)
    }

    /// The transaction that wrote the version at `(col, index)`.
    pub fn version_txn(&self, col: ColumnId, index: VersionIndex) -> TxnId {
        self.queue(col).version_txn(index)
    }

    /// Position the version at `(col, index)` committed at.
    pub fn commit_ssid(&self, col: ColumnId, index: VersionIndex) -> SnapshotId {
        self.queue(col).commit_ssid(index)
    }

    fn queue(&self, col: ColumnId) -> &VersionQueue {
        match self.columns.get(col) {
            Some(q) => q,
            None => panic!("row {}: no column {col}", self.key),
        }
    }

    fn queue_mut(&mut self, col: ColumnId) -> &mut VersionQueue {
        let key = self.key;
        match self.columns.get_mut(col) {
            Some(q) => q,
            None => panic!("row {key}: no column {col}"),
        }
    }
}
