//! Coordinator: drives one transaction at a time through the five-phase
//! protocol.
//!
//! ```text
//! INIT_END --dispatch--> DISPATCH --all acks--> VALIDATE --shortcut--> EARLY_DECIDE
//!                                               VALIDATE --validate acks--> EARLY_DECIDE
//! EARLY_DECIDE --commit/abort--> DECIDE --> INIT_END
//! ```
//!
//! Handlers never call each other through the lock. Each transition is one
//! call to `advance`, which reports whether the next phase can start right
//! away or has to wait for acks; `drive` loops until it waits.
//!
//! Dispatch, Validate and FinalizeAbort acks carry the phase counter they
//! were sent in and are dropped once the counter moved on. StatusQuery acks
//! carry the transaction id instead, since they may land in any later phase.
//!
//! Every commit has a commit position: the highest low bound for a shortcut
//! commit, `ssid_new` for a validated one. Finalize carries it so committed
//! writes move there. A StatusQuery answer reports the latest position the
//! versions read speculatively committed at; a dependency that committed
//! later than this transaction aborts it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::commo::{Commo, DispatchReply, DispatchRequest, PieceData, PieceOp, PieceOutput};
use crate::config::ProtocolConfig;
use crate::error::SubmitError;
use crate::types::{
    ColumnId, Decision, InnId, PartitionId, RowKey, SSID_INFINITY, SnapshotId, StatusReply, TxnId,
    ValidateResult, Value,
};

const N_PHASE: u64 = 5;

/// Bits of a transaction id below the coordinator id.
const TXN_SEQ_BITS: u32 = 48;

/// Hands out transaction ids.
///
/// The top 16 bits hold the coordinator id and the rest a per-coordinator
/// sequence starting at 1, so coordinators never collide and id 0 stays
/// with the loader.
#[derive(Debug)]
pub struct TxnIdGenerator {
    base: TxnId,
    next: AtomicU64,
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TxnIdGenerator {
    pub fn new(coordinator_id: u16) -> Self {
        Self {
            base: TxnId::from(coordinator_id) << TXN_SEQ_BITS,
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TxnId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(seq < 1 << TXN_SEQ_BITS, "transaction id space exhausted");
        self.base | seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitEnd,
    Dispatch,
    Validate,
    EarlyDecide,
    Decide,
}

impl Phase {
    fn of(counter: u64) -> Self {
        match counter % N_PHASE {
            0 => Phase::InitEnd,
            1 => Phase::Dispatch,
            2 => Phase::Validate,
            3 => Phase::EarlyDecide,
            _ => Phase::Decide,
        }
    }
}

/// Value of a write: a literal, or a value read by an earlier piece.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Literal(Value),
    Output { piece: InnId, slot: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Read { row: RowKey, col: ColumnId },
    Write { row: RowKey, col: ColumnId, value: WriteValue },
}

/// A unit of work bound for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub inn_id: InnId,
    pub partition: PartitionId,
    pub ops: Vec<Op>,
    /// Pieces that must be acked before this one is dispatched.
    pub deps: Vec<InnId>,
}

impl Piece {
    pub fn new(inn_id: InnId, partition: PartitionId) -> Self {
        Self {
            inn_id,
            partition,
            ops: Vec::new(),
            deps: Vec::new(),
        }
    }

    pub fn read(mut self, row: RowKey, col: ColumnId) -> Self {
        self.ops.push(Op::Read { row, col });
        self
    }

    pub fn write(mut self, row: RowKey, col: ColumnId, value: impl Into<Value>) -> Self {
        self.ops.push(Op::Write {
            row,
            col,
            value: WriteValue::Literal(value.into()),
        });
        self
    }

    /// Write the value that op `slot` of piece `piece` read. Adds the
    /// dependency.
    pub fn write_output(mut self, row: RowKey, col: ColumnId, piece: InnId, slot: u32) -> Self {
        self.ops.push(Op::Write {
            row,
            col,
            value: WriteValue::Output { piece, slot },
        });
        self.after(piece)
    }

    pub fn after(mut self, dep: InnId) -> Self {
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
        self
    }
}

/// A client transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnRequest {
    /// Speculative position hint sent with every Dispatch.
    pub ssid_spec: SnapshotId,
    pub pieces: Vec<Piece>,
}

impl TxnRequest {
    pub fn new(ssid_spec: SnapshotId) -> Self {
        Self {
            ssid_spec,
            pieces: Vec::new(),
        }
    }

    pub fn piece(mut self, piece: Piece) -> Self {
        self.pieces.push(piece);
        self
    }

    /// Reject requests that could never finish dispatching.
    pub fn check(&self) -> Result<(), SubmitError> {
        if self.pieces.is_empty() {
            return Err(SubmitError::Empty);
        }
        let mut ids = BTreeSet::new();
        for piece in &self.pieces {
            if !ids.insert(piece.inn_id) {
                return Err(SubmitError::DuplicatePiece(piece.inn_id));
            }
        }
        for piece in &self.pieces {
            for &dep in &piece.deps {
                if !ids.contains(&dep) || dep == piece.inn_id {
                    return Err(SubmitError::UnknownDependency {
                        piece: piece.inn_id,
                        dep,
                    });
                }
            }
            for op in &piece.ops {
                let Op::Write {
                    value: WriteValue::Output { piece: source, .. },
                    ..
                } = op
                else {
                    continue;
                };
                if !piece.deps.contains(source) {
                    return Err(SubmitError::UnresolvedOutput {
                        piece: piece.inn_id,
                        source_piece: *source,
                    });
                }
            }
        }

        // Kahn's algorithm: every piece must become ready eventually.
        let mut indegree: HashMap<InnId, usize> = self
            .pieces
            .iter()
            .map(|p| (p.inn_id, p.deps.iter().collect::<BTreeSet<_>>().len()))
            .collect();
        let mut ready: Vec<InnId> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut seen = 0;
        while let Some(id) = ready.pop() {
            seen += 1;
            for piece in self.pieces.iter().filter(|p| p.deps.contains(&id)) {
                if let Some(d) = indegree.get_mut(&piece.inn_id) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(piece.inn_id);
                    }
                }
            }
        }
        if seen != self.pieces.len() {
            return Err(SubmitError::DependencyCycle);
        }
        Ok(())
    }
}

/// Per-transaction counters, accumulated across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Commits that skipped the Validate round.
    pub safeguard_commits: u32,
    /// Shortcut commits whose ranges did not overlap but sat within the
    /// offset tolerance.
    pub offset_saves: u32,
    pub validate_rounds: u32,
    /// Commits whose reads were all decided at dispatch time.
    pub decided_commits: u32,
    /// Aborts caused by an aborted dependency.
    pub cascading_aborts: u32,
    /// Aborts caused by a dependency that committed after this transaction.
    pub late_dependencies: u32,
    /// Attempts aborted because a partition refused one of their accesses.
    pub refused_attempts: u32,
}

/// What the caller of [`Coordinator::submit`] receives. The bounds are
/// those of the final attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnOutcome {
    /// Id of the final attempt.
    pub txn_id: TxnId,
    pub decision: Decision,
    pub outputs: BTreeMap<InnId, PieceOutput>,
    pub restarts: u32,
    pub stats: CoordinatorStats,
    pub ssid_low: SnapshotId,
    pub ssid_high: SnapshotId,
    /// Position the transaction committed at.
    pub ssid_commit: SnapshotId,
    /// The final attempt went through a Validate round.
    pub validated: bool,
}

type OutcomeCallback = Box<dyn FnOnce(TxnOutcome) + Send>;

enum Step {
    Advance,
    Await,
}

struct CoordState {
    phase: u64,
    txn_id: TxnId,
    in_flight: bool,
    ssid_spec: SnapshotId,
    pieces: Vec<Piece>,
    dispatched: Vec<bool>,
    dispatch_acks: BTreeMap<InnId, bool>,
    outputs: BTreeMap<InnId, PieceOutput>,
    partitions: BTreeSet<PartitionId>,
    undecided_partitions: BTreeSet<PartitionId>,

    highest_ssid_low: SnapshotId,
    lowest_ssid_high: SnapshotId,
    ssid_new: SnapshotId,
    is_consistent: bool,
    offset_invalid: bool,
    decided: bool,
    refused: bool,
    ssid_commit: SnapshotId,
    /// Committed through the offset window rather than overlapping ranges.
    offset_commit: bool,
    validated: bool,

    n_validate_rpc: usize,
    n_validate_ack: usize,
    status_query_done: bool,
    n_status_query: usize,
    n_status_callback: usize,
    n_abort_sent: usize,
    n_abort_ack: usize,

    committed: bool,
    aborted: bool,
    /// Committed but still waiting on StatusQuery acks.
    deciding: bool,

    restarts: u32,
    stats: CoordinatorStats,
    on_done: Option<OutcomeCallback>,
    completion: Option<(OutcomeCallback, TxnOutcome)>,
}

impl CoordState {
    fn new() -> Self {
        Self {
            phase: 0,
            txn_id: 0,
            in_flight: false,
            ssid_spec: 0,
            pieces: Vec::new(),
            dispatched: Vec::new(),
            dispatch_acks: BTreeMap::new(),
            outputs: BTreeMap::new(),
            partitions: BTreeSet::new(),
            undecided_partitions: BTreeSet::new(),
            highest_ssid_low: 0,
            lowest_ssid_high: SSID_INFINITY,
            ssid_new: 0,
            is_consistent: true,
            offset_invalid: false,
            decided: true,
            refused: false,
            ssid_commit: 0,
            offset_commit: false,
            validated: false,
            n_validate_rpc: 0,
            n_validate_ack: 0,
            status_query_done: false,
            n_status_query: 0,
            n_status_callback: 0,
            n_abort_sent: 0,
            n_abort_ack: 0,
            committed: false,
            aborted: false,
            deciding: false,
            restarts: 0,
            stats: CoordinatorStats::default(),
            on_done: None,
            completion: None,
        }
    }

    fn phase(&self) -> Phase {
        Phase::of(self.phase)
    }

    /// Clear everything an attempt accumulated. The request, the phase
    /// counter and the run-wide counters survive.
    fn reset_all_members(&mut self) {
        self.dispatched.iter_mut().for_each(|d| *d = false);
        self.dispatch_acks.clear();
        self.outputs.clear();
        self.partitions.clear();
        self.undecided_partitions.clear();
        self.highest_ssid_low = 0;
        self.lowest_ssid_high = SSID_INFINITY;
        self.ssid_new = 0;
        self.is_consistent = true;
        self.offset_invalid = false;
        self.decided = true;
        self.refused = false;
        self.ssid_commit = 0;
        self.offset_commit = false;
        self.validated = false;
        self.n_validate_rpc = 0;
        self.n_validate_ack = 0;
        self.status_query_done = false;
        self.n_status_query = 0;
        self.n_status_callback = 0;
        self.n_abort_sent = 0;
        self.n_abort_ack = 0;
        self.committed = false;
        self.aborted = false;
        self.deciding = false;
    }

    fn has_unsent_piece(&self) -> bool {
        self.dispatched.iter().any(|d| !d)
    }

    fn all_sent_acked(&self) -> bool {
        self.dispatch_acks.values().all(|&a| a)
    }

    fn offset_1_check_pass(&self, tolerance: u64) -> bool {
        !self.offset_invalid
            && self.highest_ssid_low.saturating_sub(self.lowest_ssid_high) <= tolerance
    }

    /// Whether a dependency that committed at `ssid_commit` sits before
    /// this transaction. An offset commit sits just below its position.
    fn dependency_precedes(&self, ssid_commit: SnapshotId) -> bool {
        if self.offset_commit {
            ssid_commit < self.ssid_commit
        } else {
            ssid_commit <= self.ssid_commit
        }
    }

    fn resolve(&self, value: &WriteValue) -> Value {
        match value {
            WriteValue::Literal(v) => v.clone(),
            WriteValue::Output { piece, slot } => self
                .outputs
                .get(piece)
                .and_then(|out| out.get(slot))
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Runs one transaction at a time against the partitions behind a
/// [`Commo`]. Shared as `Arc<Coordinator>`; ack callbacks hold a clone.
pub struct Coordinator {
    commo: Arc<dyn Commo>,
    config: ProtocolConfig,
    ids: Arc<TxnIdGenerator>,
    state: Mutex<CoordState>,
}

impl Coordinator {
    pub fn new(
        commo: Arc<dyn Commo>,
        config: ProtocolConfig,
        ids: Arc<TxnIdGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            commo,
            config,
            ids,
            state: Mutex::new(CoordState::new()),
        })
    }

    /// Start `request`. `on_done` runs exactly once, with the final commit
    /// or with the abort that exhausted `max_restarts`. Returns the id of
    /// the first attempt.
    pub fn submit(
        self: &Arc<Self>,
        request: TxnRequest,
        on_done: impl FnOnce(TxnOutcome) + Send + 'static,
    ) -> Result<TxnId, SubmitError> {
        request.check()?;
        let mut txn_id = 0;
        self.locked(|this, st| {
            if st.in_flight {
                return Err(SubmitError::Busy);
            }
            debug_assert_eq!(st.phase(), Phase::InitEnd);
            st.reset_all_members();
            st.txn_id = this.ids.next_id();
            st.in_flight = true;
            st.ssid_spec = request.ssid_spec;
            st.dispatched = vec![false; request.pieces.len()];
            st.pieces = request.pieces;
            st.restarts = 0;
            st.stats = CoordinatorStats::default();
            st.on_done = Some(Box::new(on_done));
            txn_id = st.txn_id;
            debug!(txn_id, pieces = st.pieces.len(), "submit");
            this.drive(st);
            Ok(())
        })?;
        Ok(txn_id)
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase()
    }

    /// Id of the running attempt, if a transaction is in flight.
    pub fn current_txn_id(&self) -> Option<TxnId> {
        let st = self.state.lock();
        st.in_flight.then_some(st.txn_id)
    }

    pub fn is_idle(&self) -> bool {
        !self.state.lock().in_flight
    }

    /// Run `f` under the state lock, then hand a finished outcome to its
    /// callback with the lock released.
    fn locked<R>(self: &Arc<Self>, f: impl FnOnce(&Arc<Self>, &mut CoordState) -> R) -> R {
        let (result, completion) = {
            let mut st = self.state.lock();
            let result = f(self, &mut st);
            (result, st.completion.take())
        };
        if let Some((callback, outcome)) = completion {
            callback(outcome);
        }
        result
    }

    fn drive(self: &Arc<Self>, st: &mut CoordState) {
        while let Step::Advance = self.advance(st) {}
    }

    /// Leave the current phase, doing the work that starts the next one.
    fn advance(self: &Arc<Self>, st: &mut CoordState) -> Step {
        let from = st.phase();
        st.phase += 1;
        trace!(txn_id = st.txn_id, ?from, to = ?st.phase(), "phase");
        match from {
            Phase::InitEnd => {
                self.dispatch_async(st);
                Step::Await
            }
            Phase::Dispatch => {
                self.safeguard_check(st);
                Step::Advance
            }
            Phase::Validate => {
                if st.committed || st.aborted {
                    Step::Advance
                } else {
                    self.acc_validate(st);
                    Step::Await
                }
            }
            Phase::EarlyDecide => {
                if st.committed {
                    self.acc_commit(st);
                } else if st.aborted {
                    self.acc_abort(st);
                } else {
                    unreachable!("txn {}: deciding without a decision", st.txn_id);
                }
                Step::Await
            }
            Phase::Decide => Step::Await,
        }
    }

    /// Send every piece whose dependencies are acked, one message per
    /// partition.
    fn dispatch_async(self: &Arc<Self>, st: &mut CoordState) {
        let mut by_partition: BTreeMap<PartitionId, Vec<PieceData>> = BTreeMap::new();
        for i in 0..st.pieces.len() {
            if st.dispatched[i] {
                continue;
            }
            let piece = &st.pieces[i];
            let ready = piece
                .deps
                .iter()
                .all(|dep| st.dispatch_acks.get(dep).copied().unwrap_or(false));
            if !ready {
                continue;
            }
            let ops = piece
                .ops
                .iter()
                .map(|op| match op {
                    Op::Read { row, col } => PieceOp::Read {
                        row: *row,
                        col: *col,
                    },
                    Op::Write { row, col, value } => PieceOp::Write {
                        row: *row,
                        col: *col,
                        value: st.resolve(value),
                    },
                })
                .collect();
            let (inn_id, partition) = (piece.inn_id, piece.partition);
            by_partition
                .entry(partition)
                .or_default()
                .push(PieceData { inn_id, ops });
            st.dispatched[i] = true;
            st.dispatch_acks.insert(inn_id, false);
            st.partitions.insert(partition);
        }

        debug!(
            txn_id = st.txn_id,
            partitions = by_partition.len(),
            "dispatch wave"
        );
        for (partition, pieces) in by_partition {
            let this = Arc::clone(self);
            let phase = st.phase;
            self.commo.broadcast_dispatch(
                partition,
                DispatchRequest {
                    txn_id: st.txn_id,
                    ssid_spec: st.ssid_spec,
                    pieces,
                },
                Box::new(move |reply| this.on_dispatch_ack(phase, partition, reply)),
            );
        }
    }

    fn on_dispatch_ack(self: &Arc<Self>, phase: u64, partition: PartitionId, reply: DispatchReply) {
        self.locked(|this, st| {
            if phase != st.phase {
                trace!(txn_id = st.txn_id, partition, "stale dispatch ack");
                return;
            }
            for (inn_id, output) in reply.outputs {
                match st.dispatch_acks.get_mut(&inn_id) {
                    Some(acked) => {
                        assert!(!*acked, "txn {}: piece {inn_id} acked twice", st.txn_id);
                        *acked = true;
                    }
                    None => panic!("txn {}: ack for unknown piece {inn_id}", st.txn_id),
                }
                st.outputs.insert(inn_id, output);
            }
            if !reply.result.offset_safe() {
                st.offset_invalid = true;
            }
            if reply.refused {
                st.refused = true;
            }
            if !reply.result.decided() {
                st.decided = false;
                st.undecided_partitions.insert(partition);
            }
            st.ssid_new = st.ssid_new.max(reply.ssid_new);
            st.highest_ssid_low = st.highest_ssid_low.max(reply.ssid_low);
            st.lowest_ssid_high = st.lowest_ssid_high.min(reply.ssid_high);
            if st.highest_ssid_low > st.lowest_ssid_high {
                st.is_consistent = false;
            }
            debug!(
                txn_id = st.txn_id,
                partition,
                result = ?reply.result,
                refused = reply.refused,
                highest_ssid_low = st.highest_ssid_low,
                lowest_ssid_high = st.lowest_ssid_high,
                "dispatch ack"
            );

            // A refused access dooms the attempt, so later waves stay unsent.
            if st.has_unsent_piece() && !st.refused {
                this.dispatch_async(st);
            } else if st.all_sent_acked() {
                if st.decided || st.refused {
                    st.status_query_done = true;
                } else {
                    this.status_query(st);
                }
                this.drive(st);
            }
        });
    }

    /// Commit without a Validate round when the ranges overlap or sit
    /// within the offset tolerance. A refused access aborts the attempt.
    fn safeguard_check(&self, st: &mut CoordState) {
        assert!(!st.committed, "txn {}: safeguard check after commit", st.txn_id);
        if st.refused {
            debug!(txn_id = st.txn_id, "access refused, aborting attempt");
            st.aborted = true;
            st.stats.refused_attempts += 1;
            return;
        }
        let offset_pass = st.offset_1_check_pass(self.config.offset_tolerance);
        let may_skip = st.decided || !self.config.validate_undecided;
        if (st.is_consistent || offset_pass) && may_skip {
            st.committed = true;
            st.ssid_commit = st.highest_ssid_low;
            st.offset_commit = !st.is_consistent;
            st.stats.safeguard_commits += 1;
            if st.offset_commit {
                st.stats.offset_saves += 1;
            }
        }
        debug!(
            txn_id = st.txn_id,
            consistent = st.is_consistent,
            offset_pass,
            decided = st.decided,
            shortcut = st.committed,
            "safeguard check"
        );
    }

    fn acc_validate(self: &Arc<Self>, st: &mut CoordState) {
        assert!(!st.partitions.is_empty(), "txn {}: nothing to validate", st.txn_id);
        st.stats.validate_rounds += 1;
        st.validated = true;
        st.ssid_commit = st.ssid_new;
        for &partition in &st.partitions {
            st.n_validate_rpc += 1;
            let this = Arc::clone(self);
            let phase = st.phase;
            self.commo.broadcast_validate(
                partition,
                st.txn_id,
                st.ssid_new,
                Box::new(move |result| this.on_validate_ack(phase, result)),
            );
        }
    }

    fn on_validate_ack(self: &Arc<Self>, phase: u64, result: ValidateResult) {
        self.locked(|this, st| {
            if phase != st.phase {
                trace!(txn_id = st.txn_id, "stale validate ack");
                return;
            }
            st.n_validate_ack += 1;
            if result == ValidateResult::Inconsistent {
                st.aborted = true;
            }
            if st.n_validate_ack == st.n_validate_rpc {
                st.committed = !st.aborted;
                this.drive(st);
            }
        });
    }

    fn status_query(self: &Arc<Self>, st: &mut CoordState) {
        for &partition in &st.undecided_partitions {
            st.n_status_query += 1;
            let this = Arc::clone(self);
            let txn_id = st.txn_id;
            self.commo.broadcast_status_query(
                partition,
                txn_id,
                Box::new(move |reply| this.on_status_query_ack(txn_id, reply)),
            );
        }
        debug!(txn_id = st.txn_id, queries = st.n_status_query, "status query");
    }

    fn on_status_query_ack(self: &Arc<Self>, txn_id: TxnId, reply: StatusReply) {
        self.locked(|this, st| {
            if txn_id != st.txn_id || !st.in_flight {
                trace!(txn_id, "status ack for a finished attempt");
                return;
            }
            if st.status_query_done {
                return;
            }
            st.n_status_callback += 1;
            let dependency_aborted = reply.decision == Decision::Aborted;
            if dependency_aborted || !st.dependency_precedes(reply.ssid_commit) {
                if dependency_aborted {
                    debug!(txn_id, "dependency aborted");
                    st.stats.cascading_aborts += 1;
                } else {
                    debug!(
                        txn_id,
                        dependency_commit = reply.ssid_commit,
                        ssid_commit = st.ssid_commit,
                        "dependency committed after this transaction"
                    );
                    st.stats.late_dependencies += 1;
                }
                st.committed = false;
                st.aborted = true;
                st.status_query_done = true;
                match st.phase() {
                    Phase::EarlyDecide => this.drive(st),
                    Phase::InitEnd if st.deciding => {
                        st.deciding = false;
                        this.acc_abort(st);
                    }
                    _ => {}
                }
                return;
            }
            if st.n_status_callback == st.n_status_query {
                st.status_query_done = true;
                if st.phase() == Phase::InitEnd && st.deciding {
                    st.deciding = false;
                    this.acc_commit(st);
                }
            }
        });
    }

    fn acc_commit(self: &Arc<Self>, st: &mut CoordState) {
        if st.phase() == Phase::Decide {
            st.phase += 1;
        }
        if !(st.decided || st.status_query_done) {
            debug!(txn_id = st.txn_id, "commit waits on status query");
            st.deciding = true;
            return;
        }
        if st.decided {
            st.stats.decided_commits += 1;
        }
        self.acc_finalize(st, Decision::Finalized);
        self.end(st, Decision::Finalized);
    }

    fn acc_abort(self: &Arc<Self>, st: &mut CoordState) {
        assert!(st.aborted, "txn {}: abort without cause", st.txn_id);
        self.acc_finalize(st, Decision::Aborted);
    }

    /// Commit is fire-and-forget; abort counts the acks so the restart
    /// waits until every partition dropped the attempt.
    fn acc_finalize(self: &Arc<Self>, st: &mut CoordState, decision: Decision) {
        assert!(!st.partitions.is_empty(), "txn {}: nothing to finalize", st.txn_id);
        for &partition in &st.partitions {
            match decision {
                Decision::Finalized => {
                    self.commo
                        .broadcast_finalize(partition, st.txn_id, decision, st.ssid_commit);
                }
                Decision::Aborted => {
                    st.n_abort_sent += 1;
                    let this = Arc::clone(self);
                    let phase = st.phase;
                    self.commo.broadcast_finalize_abort(
                        partition,
                        st.txn_id,
                        Box::new(move || this.on_finalize_ack(phase)),
                    );
                }
            }
        }
    }

    fn on_finalize_ack(self: &Arc<Self>, phase: u64) {
        self.locked(|this, st| {
            if phase != st.phase {
                trace!(txn_id = st.txn_id, "stale finalize ack");
                return;
            }
            st.n_abort_ack += 1;
            if st.n_abort_ack == st.n_abort_sent {
                if st.phase() == Phase::Decide {
                    st.phase += 1;
                }
                this.restart(st);
            }
        });
    }

    fn restart(self: &Arc<Self>, st: &mut CoordState) {
        debug_assert_eq!(st.phase(), Phase::InitEnd);
        if self
            .config
            .max_restarts
            .is_some_and(|max| st.restarts >= max)
        {
            info!(txn_id = st.txn_id, restarts = st.restarts, "restart limit reached");
            self.end(st, Decision::Aborted);
            return;
        }
        let old = st.txn_id;
        let ssid_spec = st.ssid_spec.max(st.highest_ssid_low);
        st.reset_all_members();
        st.txn_id = self.ids.next_id();
        st.ssid_spec = ssid_spec;
        st.restarts += 1;
        info!(
            old_txn_id = old,
            txn_id = st.txn_id,
            restarts = st.restarts,
            ssid_spec,
            "restart"
        );
        self.drive(st);
    }

    fn end(&self, st: &mut CoordState, decision: Decision) {
        info!(
            txn_id = st.txn_id,
            ?decision,
            restarts = st.restarts,
            ssid_commit = st.ssid_commit,
            "transaction decided"
        );
        st.in_flight = false;
        let outcome = TxnOutcome {
            txn_id: st.txn_id,
            decision,
            outputs: std::mem::take(&mut st.outputs),
            restarts: st.restarts,
            stats: st.stats.clone(),
            ssid_low: st.highest_ssid_low,
            ssid_high: st.lowest_ssid_high,
            ssid_commit: st.ssid_commit,
            validated: st.validated,
        };
        if let Some(callback) = st.on_done.take() {
            st.completion = Some((callback, outcome));
        }
    }
}
