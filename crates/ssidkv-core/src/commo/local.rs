//! In-process transport.
//!
//! Every message and every reply becomes a task in one FIFO queue. Nothing
//! runs until the queue is pumped, so a test decides exactly which message
//! is delivered when. The pump never holds the queue lock while a task
//! runs; tasks only ever push further tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::scheduler::PartitionScheduler;
use crate::txn::ReplySlot;
use crate::types::{Decision, PartitionId, SnapshotId, TxnId};

use super::{
    Commo, DispatchCallback, DispatchRequest, FinalizeAckCallback, StatusCallback,
    ValidateCallback,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Dispatch,
    DispatchAck,
    Validate,
    ValidateAck,
    Finalize,
    FinalizeAbort,
    FinalizeAck,
    StatusQuery,
    StatusQueryAck,
}

/// Label of a queued message: what it is, which partition it concerns and
/// on behalf of which transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Envelope {
    pub kind: MessageKind,
    pub partition: PartitionId,
    pub txn_id: TxnId,
}

impl Envelope {
    fn new(kind: MessageKind, partition: PartitionId, txn_id: TxnId) -> Self {
        Self {
            kind,
            partition,
            txn_id,
        }
    }
}

struct Task {
    envelope: Envelope,
    run: Box<dyn FnOnce() + Send>,
}

struct LocalInner {
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionScheduler>>>,
    queue: Mutex<VecDeque<Task>>,
}

impl LocalInner {
    fn push(&self, envelope: Envelope, run: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Task {
            envelope,
            run: Box::new(run),
        });
    }
}

/// Queue-backed [`Commo`] over in-process partition schedulers.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct LocalCommo {
    inner: Arc<LocalInner>,
}

impl Default for LocalCommo {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCommo {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalInner {
                partitions: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn add_partition(&self, scheduler: Arc<PartitionScheduler>) {
        self.inner
            .partitions
            .write()
            .insert(scheduler.partition(), scheduler);
    }

    pub fn partition(&self, partition: PartitionId) -> Arc<PartitionScheduler> {
        match self.inner.partitions.read().get(&partition) {
            Some(s) => s.clone(),
            None => panic!("no partition {partition}"),
        }
    }

    /// Deliver the oldest queued message. Returns false when idle.
    pub fn deliver_one(&self) -> bool {
        self.deliver_first(|_| true)
    }

    /// Deliver the queued message at `position` (oldest is 0). Returns
    /// false when there is no such message.
    pub fn deliver_at(&self, position: usize) -> bool {
        let task = self.inner.queue.lock().remove(position);
        match task {
            Some(task) => {
                trace!(envelope = ?task.envelope, position, "deliver");
                (task.run)();
                true
            }
            None => false,
        }
    }

    /// Deliver the oldest queued message matching `pred`, leaving the
    /// others in place.
    pub fn deliver_first(&self, pred: impl Fn(&Envelope) -> bool) -> bool {
        let task = {
            let mut queue = self.inner.queue.lock();
            queue
                .iter()
                .position(|t| pred(&t.envelope))
                .and_then(|pos| queue.remove(pos))
        };
        match task {
            Some(task) => {
                trace!(envelope = ?task.envelope, "deliver");
                (task.run)();
                true
            }
            None => false,
        }
    }

    /// Deliver matching messages, including ones they trigger, until none
    /// match. Returns how many were delivered.
    pub fn run_while(&self, pred: impl Fn(&Envelope) -> bool) -> usize {
        let mut delivered = 0;
        while self.deliver_first(&pred) {
            delivered += 1;
        }
        delivered
    }

    /// Deliver everything. Returns how many messages were delivered.
    pub fn run_until_idle(&self) -> usize {
        self.run_while(|_| true)
    }

    /// Labels of the queued messages, oldest first.
    pub fn pending(&self) -> Vec<Envelope> {
        self.inner
            .queue
            .lock()
            .iter()
            .map(|t| t.envelope)
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

impl Commo for LocalCommo {
    fn broadcast_dispatch(
        &self,
        partition: PartitionId,
        request: DispatchRequest,
        callback: DispatchCallback,
    ) {
        let scheduler = self.partition(partition);
        let inner = self.inner.clone();
        let txn_id = request.txn_id;
        self.inner.push(
            Envelope::new(MessageKind::Dispatch, partition, txn_id),
            move || {
                let reply = scheduler.on_dispatch(request);
                inner.push(
                    Envelope::new(MessageKind::DispatchAck, partition, txn_id),
                    move || callback(reply),
                );
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
        let scheduler = self.partition(partition);
        let inner = self.inner.clone();
        self.inner.push(
            Envelope::new(MessageKind::Validate, partition, txn_id),
            move || {
                let result = scheduler.on_validate(txn_id, ssid_new);
                inner.push(
                    Envelope::new(MessageKind::ValidateAck, partition, txn_id),
                    move || callback(result),
                );
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
        let scheduler = self.partition(partition);
        self.inner.push(
            Envelope::new(MessageKind::Finalize, partition, txn_id),
            move || scheduler.on_finalize(txn_id, decision, ssid_commit),
        );
    }

    fn broadcast_finalize_abort(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: FinalizeAckCallback,
    ) {
        let scheduler = self.partition(partition);
        let inner = self.inner.clone();
        self.inner.push(
            Envelope::new(MessageKind::FinalizeAbort, partition, txn_id),
            move || {
                scheduler.on_finalize(txn_id, Decision::Aborted, 0);
                inner.push(
                    Envelope::new(MessageKind::FinalizeAck, partition, txn_id),
                    callback,
                );
            },
        );
    }

    fn broadcast_status_query(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        callback: StatusCallback,
    ) {
        let scheduler = self.partition(partition);
        let inner = self.inner.clone();
        self.inner.push(
            Envelope::new(MessageKind::StatusQuery, partition, txn_id),
            move || {
                let slot = ReplySlot::new(move |reply| {
                    inner.push(
                        Envelope::new(MessageKind::StatusQueryAck, partition, txn_id),
                        move || callback(reply),
                    );
                });
                scheduler.on_status_query(txn_id, slot);
            },
        );
    }
}
