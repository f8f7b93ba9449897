// Tracking stack - ambient dependency capture
//
// Every evaluation pushes a frame naming the reader node. Reads performed
// while the frame is on top are recorded in it and subscribe the reader to the
// source immediately. Frames nest: a computed that pulls another computed
// while evaluating pushes a second frame, and the outer frame resumes once the
// inner evaluation returns.
//
// A frame that is dropped without `finish()` (the derivation panicked) rolls
// back every edge it created, so a failed pass never leaves partial
// subscriptions behind.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::hash::{NodeSet, node_set};

use super::node_arena::{NodeId, add_edge, remove_edge};

struct TrackingFrame {
    /// None for `untracked` sections.
    reader: Option<NodeId>,
    /// False when the reader keeps its previous dependency set (static deps).
    record: bool,
    reads: NodeSet,
    /// Edges created by this frame, for rollback.
    added: Vec<NodeId>,
}

thread_local! {
    static TRACKING_STACK: RefCell<Vec<TrackingFrame>> = const { RefCell::new(Vec::new()) };
}

/// Reads recorded by a finished frame.
#[derive(Default)]
pub struct TrackedReads {
    pub reads: NodeSet,
    pub added: Vec<NodeId>,
}

/// RAII guard for one tracking frame.
///
/// Pops the frame when dropped, rolling back its edges unless
/// [`finish`](TrackingGuard::finish) was called first.
pub struct TrackingGuard {
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl TrackingGuard {
    pub fn push(reader: Option<NodeId>, record: bool) -> Self {
        TRACKING_STACK.with(|stack| {
            stack.borrow_mut().push(TrackingFrame {
                reader,
                record,
                reads: node_set(),
                added: Vec::new(),
            });
        });
        Self {
            finished: false,
            _not_send: PhantomData,
        }
    }

    /// Pop the frame and keep its edges.
    pub fn finish(mut self) -> TrackedReads {
        self.finished = true;
        match pop_frame() {
            Some(frame) => TrackedReads {
                reads: frame.reads,
                added: frame.added,
            },
            None => TrackedReads {
                reads: node_set(),
                added: Vec::new(),
            },
        }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(frame) = pop_frame() else {
            return;
        };
        if let Some(reader) = frame.reader {
            if !frame.added.is_empty() {
                cov_mark::hit!(failed_evaluation_rolled_back);
            }
            for source in frame.added {
                remove_edge(source, reader);
            }
        }
    }
}

fn pop_frame() -> Option<TrackingFrame> {
    TRACKING_STACK
        .try_with(|stack| stack.borrow_mut().pop())
        .ok()
        .flatten()
}

/// Record a read of `source` in the innermost frame, subscribing its reader.
pub fn track_read(source: NodeId) {
    let reader = TRACKING_STACK
        .try_with(|stack| {
            let mut stack = stack.borrow_mut();
            let frame = stack.last_mut()?;
            let reader = frame.reader?;
            if !frame.record || reader == source || !frame.reads.insert(source) {
                return None;
            }
            Some(reader)
        })
        .ok()
        .flatten();

    let Some(reader) = reader else {
        return;
    };
    // The edge may already exist from a previous evaluation; only new edges
    // are rolled back on failure.
    if add_edge(source, reader) {
        TRACKING_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                frame.added.push(source);
            }
        });
    }
}

/// Whether `node` is currently evaluating somewhere up the stack.
pub fn is_evaluating(node: NodeId) -> bool {
    TRACKING_STACK
        .try_with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|frame| frame.reader == Some(node))
        })
        .unwrap_or(false)
}

/// Drop every frame. Only meaningful between tests.
pub(crate) fn reset() {
    TRACKING_STACK.with(|stack| stack.borrow_mut().clear());
}

/// Run `f` without recording any reads as dependencies.
///
/// ```ignore
/// let total = Computed::new(move || {
///     let a = a.get();                     // tracked
///     let b = untracked(|| b.get());       // not a dependency
///     a + b
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = TrackingGuard::push(None, false);
    let result = f();
    guard.finish();
    result
}
