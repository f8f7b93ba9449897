use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::arena::{
    NodeId, NodeMetadata, ReactiveNode, ReactiveState, TrackingGuard, apply_dependency_diff,
    detach, is_evaluating, node_arena_insert, node_arena_remove, track_read, untracked,
};
use crate::change::Change;
use crate::error::{ReactiveError, panic_message};
use crate::info::{CellInfo, CellKind};
use crate::listener::{ListenerContext, ListenerId, ListenerList, NotifyReport, Subscription};
use crate::middleware;
use crate::transaction;

/// Construction options for [`Computed`].
#[derive(Clone, Debug, Default)]
pub struct ComputedOptions {
    name: Option<Rc<str>>,
    eager: bool,
    static_deps: bool,
}

impl ComputedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<Rc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Evaluate at construction and keep recomputing on every dependency
    /// change, even without observers.
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// Track dependencies during the first evaluation only.
    ///
    /// Later evaluations reuse the first dependency set and skip the diff,
    /// so dependencies read conditionally after the first run are not seen.
    pub fn static_deps(mut self, static_deps: bool) -> Self {
        self.static_deps = static_deps;
        self
    }
}

/// Memoized derived value that automatically updates when dependencies change
///
/// The derive function runs inside a tracking frame: every
/// [`Signal`](crate::Signal), `Computed` or [`AsyncComputed`](crate::AsyncComputed)
/// it reads becomes a dependency. After each successful evaluation the new
/// dependency set replaces the old one.
///
/// # Laziness
/// A computed with no listeners and no dependents is lazy: a dependency change
/// only marks it dirty, and the derive function runs on the next read. Once
/// observed it recomputes during propagation, in depth order, so it never
/// sees a half-updated graph. Listeners and dependents are only notified when
/// the output actually changed (`T: PartialEq`).
///
/// # Failure
/// If the derive function panics, the subscriptions made during the failed
/// pass are rolled back and the previous dependencies stay in place.
/// [`get`](Computed::get) re-raises the failure, [`try_get`](Computed::try_get)
/// returns it.
///
/// # Example
/// ```ignore
/// let voltage = Signal::new(230.0);
/// let current = Signal::new(2.0);
///
/// let power = Computed::new({
///     let (voltage, current) = (voltage.clone(), current.clone());
///     move || voltage.get() * current.get()
/// });
///
/// assert_eq!(power.get(), 460.0);
/// current.set(1.0);
/// assert_eq!(power.get(), 230.0);  // recomputed on read
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    id: NodeId,
    info: CellInfo,
    derive: Box<dyn Fn() -> T>,
    value: RefCell<Option<T>>,
    /// Value before the first change of the running cycle.
    pending: RefCell<Option<T>>,
    listeners: ListenerList<T>,
    static_deps: bool,
    evaluated: Cell<bool>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> Computed<T> {
    /// Create a lazy computed value.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self::with_options(f, ComputedOptions::new())
    }

    /// Create a computed value that evaluates immediately and stays eager.
    ///
    /// # Panics
    /// Re-raises a panic of the first evaluation.
    pub fn eager<F>(f: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self::with_options(f, ComputedOptions::new().eager(true))
    }

    pub fn with_options<F>(f: F, options: ComputedOptions) -> Self
    where
        F: Fn() -> T + 'static,
    {
        let info = CellInfo::new::<T>(CellKind::Computed, options.name, None, false);
        let mut metadata = NodeMetadata::new(info.clone(), 1, options.eager);
        metadata.state = ReactiveState::Dirty;
        let id = node_arena_insert(metadata);

        let inner = Rc::new(ComputedInner {
            id,
            info,
            derive: Box::new(f),
            value: RefCell::new(None),
            pending: RefCell::new(None),
            listeners: ListenerList::new(),
            static_deps: options.static_deps,
            evaluated: Cell::new(false),
        });
        let handle: Weak<dyn ReactiveNode> = Rc::downgrade(&inner) as Weak<_>;
        id.set_handle(handle);
        middleware::notify_init(&inner.info);

        let computed = Self { inner };
        if options.eager {
            computed.peek();
        }
        computed
    }

    /// Get the memoized value, recomputing first if it is stale.
    ///
    /// Inside another derivation this also subscribes the reader.
    ///
    /// # Panics
    /// Panics if the derive function panics or if the computed reads itself.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    /// Like [`get`](Computed::get), returning evaluation failures instead of
    /// panicking.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        let value = self.inner.fresh_value()?;
        track_read(self.inner.id);
        Ok(value)
    }

    /// Read without subscribing the running derivation.
    pub fn peek(&self) -> T {
        untracked(|| self.get())
    }

    /// Mark the value stale. Observed computeds recompute right away (or
    /// when the open batch commits); unobserved ones on their next read.
    pub fn invalidate(&self) {
        transaction::schedule_refresh(self.inner.id);
    }

    /// Register a listener called whenever the computed value changes.
    ///
    /// Forces an evaluation so the listener has a baseline to compare with.
    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&Change<T>) + 'static,
    {
        self.add_listener_with_context(f, ListenerContext::listener())
    }

    pub fn add_listener_with_context<F>(&self, f: F, context: ListenerContext) -> ListenerId
    where
        F: FnMut(&Change<T>) + 'static,
    {
        let inner = &self.inner;
        if inner.info.is_disposed() {
            cov_mark::hit!(listener_on_disposed_computed_ignored);
            return ListenerId::next();
        }
        if let Err(error) = untracked(|| inner.fresh_value()) {
            inner.report_failure(&error);
        }
        let id = inner.listeners.add(&inner.info, Box::new(f), context);
        inner.id.set_listener_count(inner.listeners.len());
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let inner = &self.inner;
        let removed = inner.listeners.remove(&inner.info, id);
        if removed {
            inner.id.set_listener_count(inner.listeners.len());
        }
        removed
    }

    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&Change<T>) + 'static,
    {
        let id = self.add_listener(f);
        let weak = Rc::downgrade(&self.inner);
        Subscription::new(
            id,
            Box::new(move |id| {
                if let Some(inner) = weak.upgrade() {
                    Computed { inner }.remove_listener(id);
                }
            }),
        )
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Whether the next read has to run the derive function.
    pub fn is_dirty(&self) -> bool {
        self.inner.id.state() == ReactiveState::Dirty
    }

    /// Stop tracking, drop every listener and mark the cell disposed. The
    /// last value stays readable.
    pub fn close(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.info.is_disposed()
    }

    pub fn info(&self) -> &CellInfo {
        &self.inner.info
    }

    pub fn id(&self) -> u64 {
        self.inner.info.id()
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> ComputedInner<T> {
    /// Bring the cached value up to date and return it.
    fn fresh_value(&self) -> Result<T, ReactiveError> {
        if is_evaluating(self.id) {
            cov_mark::hit!(circular_read_detected);
            return Err(ReactiveError::CircularDependency {
                cell: self.info.clone(),
            });
        }
        let stale = self.id.state() == ReactiveState::Dirty || self.value.borrow().is_none();
        if stale && self.evaluate()? {
            transaction::node_changed(self.id);
        }
        Ok(self
            .value
            .borrow()
            .clone()
            .expect("computed value should always be set after evaluation"))
    }

    /// Run the derive function. Returns whether the value changed.
    ///
    /// The first evaluation establishes the value and is not a change.
    fn evaluate(&self) -> Result<bool, ReactiveError> {
        let disposed = self.info.is_disposed();
        let record = !disposed && !(self.static_deps && self.evaluated.get());
        if self.static_deps && self.evaluated.get() {
            cov_mark::hit!(static_deps_skip_tracking);
        }

        // Clean before running, so a source changing mid-evaluation marks
        // the node dirty again.
        self.id.set_state(ReactiveState::Clean);
        let guard = TrackingGuard::push(Some(self.id), record);
        let value = match catch_unwind(AssertUnwindSafe(|| (self.derive)())) {
            Ok(value) => value,
            Err(payload) => {
                drop(guard);
                self.id.set_state(ReactiveState::Dirty);
                return Err(ReactiveError::Evaluation {
                    cell: self.info.clone(),
                    message: panic_message(payload.as_ref()),
                });
            }
        };
        let tracked = guard.finish();
        if record {
            apply_dependency_diff(self.id, &tracked.reads, &tracked.added);
        }
        self.evaluated.set(true);

        let mut slot = self.value.borrow_mut();
        match slot.as_ref().map(|old| *old == value) {
            None => {
                *slot = Some(value);
                return Ok(false);
            }
            Some(true) => {
                cov_mark::hit!(computed_value_unchanged);
                return Ok(false);
            }
            Some(false) => {}
        }
        let old = slot.replace(value);
        drop(slot);

        if let Some(old) = old.filter(|_| !self.listeners.is_empty()) {
            self.pending.borrow_mut().get_or_insert(old);
        }
        Ok(true)
    }

    fn report_failure(&self, error: &ReactiveError) {
        if !middleware::report_error(error) {
            tracing::warn!(cell = %self.info, "{error}");
        }
    }

    fn dispose(&self) {
        if self.info.is_disposed() {
            return;
        }
        detach(self.id);
        self.listeners.clear(&self.info);
        self.id.set_listener_count(0);
        self.pending.borrow_mut().take();
        middleware::notify_dispose(&self.info);
        self.info.mark_disposed();
        tracing::trace!(cell = %self.info, "computed disposed");
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> ReactiveNode for ComputedInner<T> {
    fn refresh(&self) {
        match self.evaluate() {
            Ok(true) => transaction::node_changed(self.id),
            Ok(false) => {}
            Err(error) => self.report_failure(&error),
        }
    }

    fn flush(&self, report: &mut NotifyReport, deliver: bool) {
        let Some(old) = self.pending.borrow_mut().take() else {
            return;
        };
        if !deliver || self.info.is_disposed() {
            return;
        }
        let Some(new) = self.value.borrow().clone() else {
            return;
        };
        if old == new {
            cov_mark::hit!(computed_net_equal_skipped);
            return;
        }
        self.listeners.notify(&self.info, &Change::new(old, new), report);
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        if !self.info.is_disposed() {
            detach(self.id);
            self.listeners.clear(&self.info);
            middleware::notify_dispose(&self.info);
            self.info.mark_disposed();
        }
        node_arena_remove(self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("info", &self.inner.info)
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}
