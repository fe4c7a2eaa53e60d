//! Per-transaction safeguard: aggregated SSID bounds, the accesses to
//! validate and finalize later, and the StatusQuery callbacks other
//! transactions parked on this one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{
    ColumnId, Decision, RowKey, SSID_INFINITY, SnapshotId, SsidRange, StatusReply, TxnId,
    VersionIndex,
};

/// Address of one access: `(row, column)`.
pub type AccessKey = (RowKey, ColumnId);

/// A one-shot reply channel for a StatusQuery answer.
///
/// `send` consumes the slot, so a reply can never be delivered twice.
pub struct ReplySlot {
    reply: Box<dyn FnOnce(StatusReply) + Send>,
}

impl ReplySlot {
    pub fn new(reply: impl FnOnce(StatusReply) + Send + 'static) -> Self {
        Self {
            reply: Box::new(reply),
        }
    }

    pub fn send(self, reply: StatusReply) {
        (self.reply)(reply)
    }
}

impl fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplySlot")
    }
}

struct PendingState {
    remaining: usize,
    /// Highest commit position among the owners finalized so far.
    ssid_commit: SnapshotId,
    slot: Option<ReplySlot>,
}

/// A StatusQuery waiting on one or more undecided owners.
///
/// Answers ABORTED on the first aborted owner, FINALIZED once every owner
/// finalized. Shared by the callbacks registered on each owner.
#[derive(Clone)]
pub struct PendingQuery {
    state: Arc<Mutex<PendingState>>,
}

impl PendingQuery {
    /// `ssid_floor` covers the dependencies that were already finalized when
    /// the query arrived.
    pub fn new(slot: ReplySlot, waiting_on: usize, ssid_floor: SnapshotId) -> Self {
        assert!(waiting_on > 0, "pending query with nothing to wait on");
        Self {
            state: Arc::new(Mutex::new(PendingState {
                remaining: waiting_on,
                ssid_commit: ssid_floor,
                slot: Some(slot),
            })),
        }
    }

    fn resolve(&self, owner: StatusReply) {
        let answer = {
            let mut st = self.state.lock();
            match owner.decision {
                Decision::Aborted => st.slot.take().map(|slot| (slot, StatusReply::aborted())),
                Decision::Finalized => {
                    st.remaining = st.remaining.saturating_sub(1);
                    st.ssid_commit = st.ssid_commit.max(owner.ssid_commit);
                    if st.remaining == 0 {
                        let reply = StatusReply::finalized(st.ssid_commit);
                        st.slot.take().map(|slot| (slot, reply))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some((slot, reply)) = answer {
            slot.send(reply);
        }
    }

    /// True once the reply was sent.
    pub fn is_answered(&self) -> bool {
        self.state.lock().slot.is_none()
    }
}

/// A callback registered by `dependent` on the owner of a version it read.
pub struct QueryCallback {
    pub dependent: TxnId,
    pending: PendingQuery,
}

impl QueryCallback {
    pub fn new(dependent: TxnId, pending: PendingQuery) -> Self {
        Self { dependent, pending }
    }

    /// Report the owner's decision and commit position.
    pub fn fire(self, owner: StatusReply) {
        self.pending.resolve(owner);
    }
}

impl fmt::Debug for QueryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCallback")
            .field("dependent", &self.dependent)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Safeguard {
    /// Client-supplied speculative position.
    pub ssid_spec: SnapshotId,
    pub highest_ssid_low: SnapshotId,
    pub lowest_ssid_high: SnapshotId,
    /// Position assigned to writes on validate.
    pub highest_write_ssid: SnapshotId,
    /// Every version read so far is already decided.
    pub decided: bool,
    /// The offset-1 shortcut applies to this partition's accesses.
    pub offset_safe: bool,
    /// A write was refused behind another transaction's pending write, or
    /// a column changed between two accesses of this transaction. The
    /// transaction cannot commit.
    pub refused: bool,
    pub validate_done: bool,
    pub status_query_done: bool,
    pub indices: BTreeMap<AccessKey, VersionIndex>,
    pub reads_for_query: BTreeMap<AccessKey, VersionIndex>,
    query_callbacks: Vec<QueryCallback>,
    op_offsets_safe: bool,
    offset_tolerance: u64,
    outcome: Option<StatusReply>,
}

impl Safeguard {
    pub fn new(offset_tolerance: u64) -> Self {
        Self {
            ssid_spec: 0,
            highest_ssid_low: 0,
            lowest_ssid_high: SSID_INFINITY,
            highest_write_ssid: 0,
            decided: true,
            offset_safe: true,
            refused: false,
            validate_done: false,
            status_query_done: false,
            indices: BTreeMap::new(),
            reads_for_query: BTreeMap::new(),
            query_callbacks: Vec::new(),
            op_offsets_safe: true,
            offset_tolerance,
            outcome: None,
        }
    }

    pub fn load_speculative_ssid(&mut self, ssid_spec: SnapshotId) {
        self.ssid_spec = ssid_spec;
        self.highest_write_ssid = self.highest_write_ssid.max(ssid_spec);
    }

    /// Fold one access's range into the aggregate.
    pub fn update_metadata(&mut self, ssid: SsidRange, op_offset_safe: bool) {
        self.highest_ssid_low = self.highest_ssid_low.max(ssid.low);
        self.lowest_ssid_high = self.lowest_ssid_high.min(ssid.high);
        self.highest_write_ssid = self.highest_write_ssid.max(ssid.low).max(self.ssid_spec);
        self.op_offsets_safe &= op_offset_safe;
        self.offset_safe = self.op_offsets_safe
            && self.highest_ssid_low.saturating_sub(self.lowest_ssid_high) <= self.offset_tolerance;
    }

    /// The aggregated ranges overlap.
    pub fn is_consistent(&self) -> bool {
        self.highest_ssid_low <= self.lowest_ssid_high
    }

    /// Remember an access for later validate/finalize.
    pub fn record_access(&mut self, key: AccessKey, index: VersionIndex) {
        self.indices.insert(key, index);
    }

    /// Remember a read of an undecided version for StatusQuery.
    pub fn record_dependency(&mut self, key: AccessKey, index: VersionIndex) {
        self.decided = false;
        self.reads_for_query.insert(key, index);
    }

    /// Park a dependent's callback until this transaction is finalized.
    /// If it already is, the callback fires right away.
    pub fn insert_callback(&mut self, callback: QueryCallback) {
        match self.outcome {
            Some(outcome) => callback.fire(outcome),
            None => self.query_callbacks.push(callback),
        }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.query_callbacks.len()
    }

    /// Record the outcome and hand back the parked callbacks, in
    /// registration order. Later calls return nothing.
    pub fn mark_finalized(&mut self, outcome: StatusReply) -> Vec<QueryCallback> {
        if let Some(prev) = self.outcome {
            assert_eq!(
                prev.decision, outcome.decision,
                "conflicting decisions for one transaction"
            );
        }
        self.outcome = Some(outcome);
        std::mem::take(&mut self.query_callbacks)
    }

    /// Clear aggregation, accesses and callbacks. The outcome stays.
    pub fn reset_safeguard(&mut self) {
        let tolerance = self.offset_tolerance;
        let outcome = self.outcome;
        *self = Self::new(tolerance);
        self.outcome = outcome;
    }
}
