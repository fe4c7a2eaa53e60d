//! Partition-side transaction state.
//!
//! An [`AccTxn`] lives in a partition from the first Dispatch that names it
//! until its Finalize. It bridges piece operations to [`Row`] accesses and
//! folds every access into its [`Safeguard`].

pub mod safeguard;

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::mvcc::Row;
use crate::types::{ColumnId, DispatchResult, RowKey, SnapshotId, TxnId, Value};

pub use safeguard::{AccessKey, PendingQuery, QueryCallback, ReplySlot, Safeguard};

#[derive(Debug)]
pub struct AccTxn {
    txn_id: TxnId,
    pub sg: Safeguard,
    /// Rows pinned by this transaction, released at Finalize.
    pinned: BTreeSet<RowKey>,
}

impl AccTxn {
    pub fn new(txn_id: TxnId, offset_tolerance: u64) -> Self {
        Self {
            txn_id,
            sg: Safeguard::new(offset_tolerance),
            pinned: BTreeSet::new(),
        }
    }

    pub fn load_speculative_ssid(&mut self, ssid_spec: SnapshotId) {
        self.sg.load_speculative_ssid(ssid_spec);
    }

    /// Read `col` of `row`. Returns `None` for an out-of-range column, which
    /// leaves the safeguard untouched.
    ///
    /// Reading a different version than an earlier access of the same
    /// column saw marks the transaction as unable to commit.
    pub fn read_column(&mut self, row: &mut Row, col: ColumnId) -> Option<Value> {
        let key = (row.key(), col);
        let earlier = self.sg.indices.get(&key).copied();
        let read = row.read_column(col, self.txn_id, self.sg.ssid_spec);
        let value = read.value?;
        self.pin(row);

        if earlier.is_some_and(|index| index != read.index) {
            debug!(
                txn_id = self.txn_id,
                row = key.0,
                col,
                "column changed between reads"
            );
            self.sg.refused = true;
        }
        self.sg.record_access(key, read.index);
        self.sg.update_metadata(read.ssid, read.offset_safe);
        if !read.decided {
            self.sg.record_dependency(key, read.index);
        }
        Some(value)
    }

    /// Write `value` into `col` of `row`. Returns false for an out-of-range
    /// column.
    ///
    /// A refused write, or one that lands on a newer version than this
    /// transaction read in the same column, marks the transaction as unable
    /// to commit and leaves the bounds alone.
    pub fn write_column(&mut self, row: &mut Row, col: ColumnId, value: Value) -> bool {
        let key = (row.key(), col);
        let read_before = self
            .sg
            .indices
            .get(&key)
            .copied()
            .filter(|&index| row.version_txn(col, index) != self.txn_id);
        let write = row.write_column(col, value, self.sg.ssid_spec, self.txn_id);
        if !write.applied {
            return false;
        }
        self.pin(row);
        self.sg.record_access(key, write.index);

        let stale_read = read_before.is_some() && write.follows != read_before;
        if write.refused || stale_read {
            debug!(
                txn_id = self.txn_id,
                row = key.0,
                col,
                refused = write.refused,
                stale_read,
                "write cannot commit"
            );
            self.sg.refused = true;
            return true;
        }
        self.sg.update_metadata(write.ssid, write.offset_safe);
        true
    }

    /// This partition's answer to Dispatch.
    pub fn dispatch_result(&self) -> DispatchResult {
        DispatchResult::classify(self.sg.decided, self.sg.offset_safe)
    }

    /// Drop every pin this transaction holds.
    pub fn release_rows(&mut self, rows: &mut HashMap<RowKey, Row>) {
        for key in std::mem::take(&mut self.pinned) {
            match rows.get_mut(&key) {
                Some(row) => row.release(),
                None => panic!("txn {}: pinned row {key} vanished", self.txn_id),
            }
        }
    }

    pub fn pinned_rows(&self) -> usize {
        self.pinned.len()
    }

    fn pin(&mut self, row: &mut Row) {
        if self.pinned.insert(row.key()) {
            row.ref_copy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SSID_INFINITY;

    fn rows() -> HashMap<RowKey, Row> {
        let mut rows = HashMap::new();
        rows.insert(1, Row::create(1, vec![Value::Int(1), Value::Int(2)]));
        rows.insert(2, Row::create(2, vec![Value::Int(3)]));
        rows
    }

    #[test]
    fn test_read_and_write_record_accesses() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.load_speculative_ssid(3);

        let v = txn.read_column(rows.get_mut(&1).unwrap(), 0);
        assert_eq!(v, Some(Value::Int(1)));
        assert!(txn.write_column(rows.get_mut(&1).unwrap(), 1, Value::Int(9)));

        assert_eq!(txn.sg.indices.get(&(1, 0)), Some(&0));
        assert_eq!(txn.sg.indices.get(&(1, 1)), Some(&1));
        assert_eq!(txn.sg.highest_ssid_low, 3);
        assert_eq!(txn.sg.lowest_ssid_high, 3);
        assert!(txn.sg.is_consistent());
        assert_eq!(txn.dispatch_result(), DispatchResult::Success);
    }

    #[test]
    fn test_row_pinned_once() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.read_column(rows.get_mut(&1).unwrap(), 0);
        txn.read_column(rows.get_mut(&1).unwrap(), 1);
        txn.read_column(rows.get_mut(&2).unwrap(), 0);
        assert_eq!(rows[&1].pin_count(), 1);
        assert_eq!(txn.pinned_rows(), 2);

        txn.release_rows(&mut rows);
        assert_eq!(rows[&1].pin_count(), 0);
        assert_eq!(rows[&2].pin_count(), 0);
        assert_eq!(txn.pinned_rows(), 0);
    }

    #[test]
    fn test_sentinel_column_leaves_safeguard_alone() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        assert_eq!(txn.read_column(rows.get_mut(&2).unwrap(), 7), None);
        assert!(!txn.write_column(rows.get_mut(&2).unwrap(), 7, Value::Int(0)));
        assert!(txn.sg.indices.is_empty());
        assert_eq!(txn.sg.lowest_ssid_high, SSID_INFINITY);
        assert_eq!(rows[&2].pin_count(), 0);
    }

    #[test]
    fn test_undecided_read_becomes_dependency() {
        let mut rows = rows();
        let mut writer = AccTxn::new(5, 1);
        writer.write_column(rows.get_mut(&1).unwrap(), 0, Value::from("a"));

        let mut reader = AccTxn::new(6, 1);
        let v = reader.read_column(rows.get_mut(&1).unwrap(), 0);
        assert_eq!(v, Some(Value::from("a")));
        assert!(!reader.sg.decided);
        assert_eq!(reader.sg.reads_for_query.get(&(1, 0)), Some(&1));
        assert_eq!(reader.dispatch_result(), DispatchResult::NotDecided);
    }

    #[test]
    fn test_offset_flags_reach_dispatch_result() {
        let mut rows = rows();
        let mut early = AccTxn::new(4, 1);
        early.load_speculative_ssid(10);
        early.read_column(rows.get_mut(&2).unwrap(), 0);

        // Writes row 2 above the position the earlier read pushed it to,
        // while row 1 pins the high bound at 0.
        let mut late = AccTxn::new(5, 1);
        late.read_column(rows.get_mut(&1).unwrap(), 0);
        late.write_column(rows.get_mut(&2).unwrap(), 0, Value::Int(8));
        assert_eq!(late.sg.highest_ssid_low, 11);
        assert_eq!(late.sg.lowest_ssid_high, 0);
        assert!(!late.sg.is_consistent());
        assert_eq!(late.dispatch_result(), DispatchResult::OffsetInvalid);
    }

    #[test]
    fn test_read_modify_write_is_one_apart() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.load_speculative_ssid(2);
        txn.read_column(rows.get_mut(&1).unwrap(), 0);
        txn.write_column(rows.get_mut(&1).unwrap(), 0, Value::Int(2));
        assert_eq!(txn.sg.lowest_ssid_high, 2);
        assert_eq!(txn.sg.highest_ssid_low, 3);
        assert!(!txn.sg.refused);
        assert_eq!(txn.dispatch_result(), DispatchResult::Success);
    }

    #[test]
    fn test_write_behind_pending_write_cannot_commit() {
        let mut rows = rows();
        let mut first = AccTxn::new(5, 1);
        first.write_column(rows.get_mut(&1).unwrap(), 0, Value::Int(7));

        let mut second = AccTxn::new(6, 1);
        assert!(second.write_column(rows.get_mut(&1).unwrap(), 0, Value::Int(8)));
        assert!(second.sg.refused);
        assert_eq!(second.sg.indices.get(&(1, 0)), Some(&2));
        // The refused write contributes no bounds.
        assert_eq!(second.sg.highest_ssid_low, 0);
    }

    #[test]
    fn test_write_over_newer_version_than_read_cannot_commit() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.read_column(rows.get_mut(&1).unwrap(), 0);

        // Someone else commits a new version between the read and the write.
        let row = rows.get_mut(&1).unwrap();
        let other = row.write_column(0, Value::Int(50), 0, 6);
        row.finalize(6, 0, other.index, crate::types::Decision::Finalized, 1);

        txn.write_column(rows.get_mut(&1).unwrap(), 0, Value::Int(2));
        assert!(txn.sg.refused);
    }

    #[test]
    fn test_repeated_read_of_changed_column_cannot_commit() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.read_column(rows.get_mut(&1).unwrap(), 0);
        txn.read_column(rows.get_mut(&1).unwrap(), 0);
        assert!(!txn.sg.refused);

        let row = rows.get_mut(&1).unwrap();
        let other = row.write_column(0, Value::Int(50), 0, 6);
        row.finalize(6, 0, other.index, crate::types::Decision::Finalized, 1);

        let v = txn.read_column(rows.get_mut(&1).unwrap(), 0);
        assert_eq!(v, Some(Value::Int(50)));
        assert!(txn.sg.refused);
    }

    #[test]
    fn test_read_after_own_write_stays_valid() {
        let mut rows = rows();
        let mut txn = AccTxn::new(5, 1);
        txn.write_column(rows.get_mut(&1).unwrap(), 0, Value::Int(7));
        let v = txn.read_column(rows.get_mut(&1).unwrap(), 0);
        assert_eq!(v, Some(Value::Int(7)));
        assert!(!txn.sg.refused);
    }
}
