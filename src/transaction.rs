//! Propagation cycles and batch transactions.
//!
//! Every observable mutation runs inside a *cycle*:
//!
//! 1. The mutated node is recorded as changed and its direct dependents are
//!    marked Dirty and queued, keyed by depth.
//! 2. Settle: queued nodes are popped in ascending depth order. Active nodes
//!    are refreshed, which may record further changes and queue their own
//!    dependents; inactive nodes stay Dirty and recompute when read.
//! 3. Flush: once the graph is quiet, every changed node delivers one
//!    coalesced change to its listeners, in first-change order.
//!
//! Outside a batch each mutation runs its own cycle. [`run_in_batch`] opens a
//! cycle that stays open until the outermost batch returns, so all mutations
//! inside it (and everything they induce) settle once and notify once.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::{NodeId, ReactiveState};
use crate::change::{Batch, BatchEntry};
use crate::hash::{NodeSet, node_set};
use crate::listener::NotifyReport;
use crate::middleware::{self, Hooks};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// State of the open propagation cycle.
struct Cycle {
    /// Min-heap of (depth, sequence, node).
    queue: BinaryHeap<Reverse<(u32, u64, NodeId)>>,
    queued: NodeSet,
    sequence: u64,
    /// Nodes whose value changed, in first-change order.
    changed: NodeSet,
    /// Mutations recorded for batch middleware, in mutation order.
    entries: Vec<BatchEntry>,
    /// Opened by `run_in_batch` (commits through `on_batch`).
    batch: bool,
}

impl Cycle {
    fn new(batch: bool) -> Self {
        Self {
            queue: BinaryHeap::new(),
            queued: node_set(),
            sequence: 0,
            changed: node_set(),
            entries: Vec::new(),
            batch,
        }
    }

    fn enqueue(&mut self, node: NodeId) {
        if self.queued.insert(node) {
            self.sequence += 1;
            self.queue.push(Reverse((node.depth(), self.sequence, node)));
        }
    }

    /// Pop the shallowest queued node. A node whose depth grew since it was
    /// queued goes back in at its new depth.
    fn pop(&mut self) -> Option<NodeId> {
        while let Some(Reverse((depth, _, node))) = self.queue.pop() {
            let current = node.depth();
            if current > depth {
                self.sequence += 1;
                self.queue.push(Reverse((current, self.sequence, node)));
                continue;
            }
            self.queued.shift_remove(&node);
            return Some(node);
        }
        None
    }

    fn record_change(&mut self, node: NodeId) {
        self.changed.insert(node);
        for dependent in node.subscribers() {
            dependent.set_state(ReactiveState::Dirty);
            self.enqueue(dependent);
        }
    }
}

thread_local! {
    static CYCLE: RefCell<Option<Cycle>> = const { RefCell::new(None) };
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn with_cycle<R>(f: impl FnOnce(&mut Cycle) -> R) -> Option<R> {
    CYCLE
        .try_with(|cycle| cycle.borrow_mut().as_mut().map(f))
        .ok()
        .flatten()
}

fn open_cycle(batch: bool) -> bool {
    CYCLE.with(|cycle| {
        let mut cycle = cycle.borrow_mut();
        match cycle.as_mut() {
            Some(open) => {
                open.batch |= batch;
                false
            }
            None => {
                *cycle = Some(Cycle::new(batch));
                true
            }
        }
    })
}

fn take_cycle() -> Option<Cycle> {
    CYCLE.try_with(|cycle| cycle.borrow_mut().take()).ok().flatten()
}

/// Owns the cycle opened by the current call.
///
/// If the owner unwinds before committing, the cycle is abandoned: pending
/// changes are dropped without notifying and queued nodes stay Dirty, so
/// they recompute on their next read.
struct CycleGuard {
    armed: bool,
}

impl CycleGuard {
    fn commit(mut self) -> Option<Cycle> {
        self.armed = false;
        take_cycle()
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cycle) = take_cycle() {
            cov_mark::hit!(abandoned_cycle_discarded);
            tracing::debug!(changed = cycle.changed.len(), "propagation cycle abandoned");
            flush(&cycle.changed, false);
        }
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let _ = BATCH_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// =========================================================================
// Engine entry points
// =========================================================================

/// Report that `node`'s value changed.
///
/// Inside an open cycle the change is folded into it. Otherwise a cycle is
/// run to completion before this returns.
pub(crate) fn node_changed(node: NodeId) {
    if with_cycle(|cycle| cycle.record_change(node)).is_some() {
        return;
    }
    if !node.has_subscribers() && node.listener_count() == 0 {
        cov_mark::hit!(unobserved_change_fast_path);
        return;
    }
    run_cycle(|cycle| cycle.record_change(node));
}

/// Queue `node` itself for a refresh (used by `invalidate`).
pub(crate) fn schedule_refresh(node: NodeId) {
    node.set_state(ReactiveState::Dirty);
    if with_cycle(|cycle| cycle.enqueue(node)).is_some() {
        return;
    }
    if !node.is_active() {
        return;
    }
    run_cycle(|cycle| cycle.enqueue(node));
}

/// Record a mutation for the batch middleware, if a batch is open.
pub(crate) fn record_entry(entry: BatchEntry) {
    with_cycle(|cycle| {
        if cycle.batch {
            cycle.entries.push(entry);
        }
    });
}

fn run_cycle(seed: impl FnOnce(&mut Cycle)) {
    open_cycle(false);
    let guard = CycleGuard { armed: true };
    with_cycle(seed);
    settle();
    if let Some(cycle) = guard.commit() {
        commit(cycle);
    }
}

/// Refresh queued nodes until the graph is quiet.
fn settle() {
    while let Some(node) = with_cycle(Cycle::pop).flatten() {
        if node.state() != ReactiveState::Dirty {
            continue;
        }
        if !node.is_active() {
            cov_mark::hit!(inactive_node_left_dirty);
            continue;
        }
        if let Some(handle) = node.handle() {
            handle.refresh();
        }
    }
}

fn commit(cycle: Cycle) {
    if !cycle.batch {
        flush(&cycle.changed, true).finish();
        return;
    }
    if cycle.entries.is_empty() && cycle.changed.is_empty() {
        cov_mark::hit!(empty_batch_skipped);
        return;
    }

    let batch = Batch::new(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed), cycle.entries);
    tracing::debug!(
        batch = batch.id(),
        entries = batch.len(),
        changed = cycle.changed.len(),
        "committing batch"
    );
    if !middleware::has(Hooks::BATCH) {
        flush(&cycle.changed, true).finish();
        return;
    }

    let mut report: Option<NotifyReport> = None;
    middleware::dispatch_batch(&batch, &mut |_: &Batch| {
        // A layer may call `next` more than once; the first pass delivers.
        let pass = flush(&cycle.changed, true);
        report.get_or_insert_with(NotifyReport::new).absorb(pass);
    });
    match report {
        Some(report) => report.finish(),
        None => {
            cov_mark::hit!(batch_notification_suppressed);
            flush(&cycle.changed, false);
        }
    }
}

/// Deliver (or drop) the pending change of every node in `changed`.
fn flush(changed: &NodeSet, deliver: bool) -> NotifyReport {
    let mut report = NotifyReport::new();
    for node in changed {
        if let Some(handle) = node.handle() {
            handle.flush(&mut report, deliver);
        }
    }
    report
}

// =========================================================================
// Public API
// =========================================================================

/// Run `f` as a batch: every mutation inside settles once and notifies once.
///
/// Nested calls join the outermost batch, which commits when it returns. The
/// commit recomputes dependents in ascending depth order, folds any mutation
/// they induce into the same batch, then sends one composite [`Batch`]
/// through the `on_batch` middleware chain before listeners are notified.
///
/// If `f` panics the batch is abandoned: values already written stay written,
/// but no listener is notified for them.
///
/// # Example
/// ```ignore
/// let c = Signal::new(0);
/// let d = Computed::new({
///     let c = c.clone();
///     move || c.get() * 2
/// });
///
/// run_in_batch(|| {
///     c.set(1);
///     c.set(2);
/// });
/// assert_eq!(d.get(), 4); // `1` was never observed
/// ```
pub fn run_in_batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let opened = open_cycle(true);
    let guard = opened.then_some(CycleGuard { armed: true });

    let result = {
        let _depth = DepthGuard::enter();
        f()
    };

    if let Some(guard) = guard {
        settle();
        if let Some(cycle) = guard.commit() {
            commit(cycle);
        }
    }
    result
}

/// Whether a batch is open on this thread.
pub fn is_batch_active() -> bool {
    with_cycle(|cycle| cycle.batch).unwrap_or(false)
}

/// Number of nested [`run_in_batch`] calls currently executing.
pub fn batch_depth() -> usize {
    BATCH_DEPTH.with(Cell::get)
}

/// Batch multiple mutations into a single settle-and-notify pass.
///
/// Same as [`run_in_batch`], kept as a type for call sites that read better
/// with it:
/// ```ignore
/// Transaction::run(|| {
///     voltage.set(230.0);
///     current.set(1.5);
/// }); // listeners of `power` run once
/// ```
pub struct Transaction;

impl Transaction {
    /// Run a function within a batch.
    pub fn run<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        run_in_batch(f)
    }
}

/// Drop any open cycle without notifying. Part of [`reset_runtime`](crate::reset_runtime).
pub(crate) fn reset() {
    drop(take_cycle());
    let _ = BATCH_DEPTH.try_with(|depth| depth.set(0));
}
