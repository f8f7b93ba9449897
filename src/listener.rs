//! Listener registry and per-listener fault isolation.
//!
//! Every cell owns a [`ListenerList`]. Notification iterates over a snapshot
//! of the list, so a listener may remove itself (or a sibling) while being
//! notified. Each listener runs under `catch_unwind`; a panicking listener
//! never keeps its siblings from running.

use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::change::Change;
use crate::error::{ReactiveError, capture_trace, panic_message};
use crate::info::CellInfo;
use crate::middleware;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Diagnostic metadata describing who subscribed to a cell.
///
/// Passed to [`Middleware::started_listening`](crate::Middleware::started_listening)
/// and [`Middleware::stopped_listening`](crate::Middleware::stopped_listening).
/// Dependency edges created by the tracker use the `"dependency"` kind with
/// the dependent cell's id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerContext {
    kind: Cow<'static, str>,
    id: Option<String>,
    data: Option<String>,
}

impl ListenerContext {
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Context used for plain `add_listener` calls.
    pub fn listener() -> Self {
        Self::new("listener")
    }

    /// Context describing `dependent` subscribing through the tracker.
    pub(crate) fn dependency(dependent: &CellInfo) -> Self {
        let context = Self::new("dependency").with_id(dependent.id().to_string());
        match dependent.name() {
            Some(name) => context.with_data(name),
            None => context,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }
}

impl Default for ListenerContext {
    fn default() -> Self {
        Self::listener()
    }
}

type Callback<T> = RefCell<Box<dyn FnMut(&Change<T>)>>;

struct ListenerEntry<T> {
    id: ListenerId,
    callback: Callback<T>,
    context: ListenerContext,
    removed: Cell<bool>,
}

/// Ordered set of listeners attached to one cell.
pub(crate) struct ListenerList<T> {
    entries: RefCell<Vec<Rc<ListenerEntry<T>>>>,
}

impl<T> ListenerList<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub(crate) fn add(
        &self,
        cell: &CellInfo,
        callback: Box<dyn FnMut(&Change<T>)>,
        context: ListenerContext,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.entries.borrow_mut().push(Rc::new(ListenerEntry {
            id,
            callback: RefCell::new(callback),
            context: context.clone(),
            removed: Cell::new(false),
        }));
        if middleware::has(middleware::Hooks::STARTED_LISTENING) {
            middleware::started_listening(cell, &context);
        }
        id
    }

    pub(crate) fn remove(&self, cell: &CellInfo, id: ListenerId) -> bool {
        let entry = {
            let mut entries = self.entries.borrow_mut();
            let Some(position) = entries.iter().position(|entry| entry.id == id) else {
                return false;
            };
            entries.remove(position)
        };
        entry.removed.set(true);
        if middleware::has(middleware::Hooks::STOPPED_LISTENING) {
            middleware::stopped_listening(cell, &entry.context);
        }
        true
    }

    /// Remove every listener, reporting each one as stopped.
    pub(crate) fn clear(&self, cell: &CellInfo) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        for entry in &entries {
            entry.removed.set(true);
        }
        if middleware::has(middleware::Hooks::STOPPED_LISTENING) {
            for entry in &entries {
                middleware::stopped_listening(cell, &entry.context);
            }
        }
    }

    /// Deliver `change` to every listener registered when the call started.
    ///
    /// Listeners removed mid-pass are skipped. A listener that is still
    /// running further up the stack (it mutated the cell it listens to) is
    /// not re-entered. Panics are caught per listener and routed through
    /// `report`.
    pub(crate) fn notify(&self, cell: &CellInfo, change: &Change<T>, report: &mut NotifyReport) {
        let snapshot: Vec<Rc<ListenerEntry<T>>> = self.entries.borrow().clone();
        let single = snapshot.len() == 1;

        for entry in snapshot {
            if change.is_propagation_stopped() {
                cov_mark::hit!(listener_propagation_stopped);
                break;
            }
            if entry.removed.get() {
                cov_mark::hit!(removed_listener_skipped);
                continue;
            }
            let Ok(mut callback) = entry.callback.try_borrow_mut() else {
                cov_mark::hit!(reentrant_listener_skipped);
                continue;
            };
            let result = catch_unwind(AssertUnwindSafe(|| (*callback)(change)));
            drop(callback);
            if let Err(payload) = result {
                report.listener_panicked(cell, payload, single);
            }
        }
    }
}

/// Outcome of one notification pass.
///
/// Collects the panic payload that has to be re-raised once every pending
/// change of the cycle has been delivered.
#[derive(Default)]
pub struct NotifyReport {
    rethrow: Option<Box<dyn Any + Send>>,
}

impl NotifyReport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Route a listener panic.
    ///
    /// With an error hook registered the error goes there and notification
    /// continues. Without one, a cell with a single listener re-raises the
    /// panic to whoever mutated the cell (after the pass completes), while a
    /// cell with several listeners logs the error and keeps going.
    fn listener_panicked(&mut self, cell: &CellInfo, payload: Box<dyn Any + Send>, single: bool) {
        let error = ReactiveError::Listener {
            cell: cell.clone(),
            message: panic_message(payload.as_ref()),
            trace: capture_trace(),
        };
        if middleware::report_error(&error) {
            cov_mark::hit!(listener_error_forwarded);
            return;
        }
        if single && self.rethrow.is_none() {
            cov_mark::hit!(single_listener_rethrows);
            self.rethrow = Some(payload);
            return;
        }
        cov_mark::hit!(listener_error_logged);
        tracing::error!(cell = %cell, "{error}");
    }

    /// Keep the first collected panic of either report.
    pub(crate) fn absorb(&mut self, other: NotifyReport) {
        if self.rethrow.is_none() {
            self.rethrow = other.rethrow;
        }
    }

    /// Re-raise a collected listener panic, if any.
    pub(crate) fn finish(self) {
        if let Some(payload) = self.rethrow {
            resume_unwind(payload);
        }
    }
}

impl fmt::Debug for NotifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyReport")
            .field("rethrow", &self.rethrow.is_some())
            .finish()
    }
}

/// RAII listener registration returned by `subscribe`.
///
/// The listener is removed when the subscription is dropped.
#[must_use = "dropping a Subscription removes the listener immediately"]
pub struct Subscription {
    id: ListenerId,
    remove: Option<Box<dyn FnOnce(ListenerId)>>,
}

impl Subscription {
    pub(crate) fn new(id: ListenerId, remove: Box<dyn FnOnce(ListenerId)>) -> Self {
        Self {
            id,
            remove: Some(remove),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered for the lifetime of the cell.
    pub fn detach(mut self) -> ListenerId {
        self.remove = None;
        self.id
    }

    fn release(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.remove.is_some())
            .finish()
    }
}
