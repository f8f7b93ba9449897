use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::change::{AnyChange, Batch, reapply_all, restore_all};
use crate::middleware::{Hooks, Middleware, SetCall};
use crate::transaction::is_batch_active;

type Step = Vec<Rc<dyn AnyChange>>;

/// Undo/redo middleware
///
/// Records every committed change as an undo step. A set outside a batch is
/// one step; a whole batch is one step, undone newest entry first. Undoing
/// and redoing run as a batch themselves and are not recorded.
///
/// ```ignore
/// let history = HistoryMiddleware::new();
/// middleware::add(history.clone());
///
/// let count = Signal::new(0);
/// count.set(1);
/// history.undo();
/// assert_eq!(count.get(), 0);
/// ```
pub struct HistoryMiddleware {
    undo: RefCell<VecDeque<Step>>,
    redo: RefCell<Vec<Step>>,
    replaying: Cell<bool>,
    limit: Option<usize>,
}

impl HistoryMiddleware {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::build(None))
    }

    /// Keep at most `limit` undo steps, dropping the oldest first.
    pub fn with_limit(limit: usize) -> Rc<Self> {
        Rc::new(Self::build(Some(limit)))
    }

    fn build(limit: Option<usize>) -> Self {
        Self {
            undo: RefCell::new(VecDeque::new()),
            redo: RefCell::new(Vec::new()),
            replaying: Cell::new(false),
            limit,
        }
    }

    /// Revert the most recent step. Returns false if there is nothing to undo.
    pub fn undo(&self) -> bool {
        let Some(step) = self.undo.borrow_mut().pop_back() else {
            return false;
        };
        self.replay(|| restore_all(step.iter()));
        self.redo.borrow_mut().push(step);
        true
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&self) -> bool {
        let Some(step) = self.redo.borrow_mut().pop() else {
            return false;
        };
        self.replay(|| reapply_all(step.iter()));
        self.undo.borrow_mut().push_back(step);
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.borrow().is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.borrow().is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.borrow().len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.borrow().len()
    }

    pub fn clear(&self) {
        self.undo.borrow_mut().clear();
        self.redo.borrow_mut().clear();
    }

    fn replay(&self, f: impl FnOnce() -> usize) {
        let previous = self.replaying.replace(true);
        let restored = f();
        self.replaying.set(previous);
        tracing::trace!(restored, "history step replayed");
    }

    fn record(&self, step: Step) {
        if self.replaying.get() || step.is_empty() {
            return;
        }
        let mut undo = self.undo.borrow_mut();
        undo.push_back(step);
        if let Some(limit) = self.limit {
            while undo.len() > limit {
                undo.pop_front();
            }
        }
        self.redo.borrow_mut().clear();
    }
}

impl Middleware for HistoryMiddleware {
    fn hooks(&self) -> Hooks {
        Hooks::SET | Hooks::BATCH
    }

    fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
        next(call);
        // Sets inside a batch are recorded with the batch.
        if is_batch_active() {
            return;
        }
        if let Some(change) = call.shared_change() {
            self.record(vec![change]);
        }
    }

    fn on_batch(&self, batch: &Batch, next: &mut dyn FnMut(&Batch)) {
        self.record(batch.entries().iter().map(|entry| entry.shared_change()).collect());
        next(batch);
    }
}
