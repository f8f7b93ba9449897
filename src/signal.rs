use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::arena::{
    NodeId, NodeMetadata, ReactiveNode, detach, node_arena_insert, node_arena_remove, track_read,
};
use crate::change::{AnyChange, BatchEntry, Change, Writer};
use crate::error::ReactiveError;
use crate::info::{CellInfo, CellKind};
use crate::listener::{ListenerContext, ListenerId, ListenerList, NotifyReport, Subscription};
use crate::middleware::{self, Hooks, SetCall};
use crate::transaction;

type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// Construction options for [`Signal`].
///
/// ```ignore
/// let token = Signal::with_options(
///     String::new(),
///     SignalOptions::new().name("session-token").sensitive(true),
/// );
/// ```
pub struct SignalOptions<T> {
    name: Option<Rc<str>>,
    owner_id: Option<u64>,
    sensitive: bool,
    on_listen: Option<Box<dyn Fn()>>,
    on_cancel: Option<Box<dyn Fn()>>,
    equals: Option<Equality<T>>,
}

impl<T> SignalOptions<T> {
    pub fn new() -> Self {
        Self {
            name: None,
            owner_id: None,
            sensitive: false,
            on_listen: None,
            on_cancel: None,
            equals: None,
        }
    }

    /// Debug name shown in diagnostics.
    pub fn name(mut self, name: impl Into<Rc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn owner_id(mut self, owner_id: u64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Redact this cell's values in diagnostics.
    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Called when the signal gains its first observer (listener or dependent).
    pub fn on_listen(mut self, f: impl Fn() + 'static) -> Self {
        self.on_listen = Some(Box::new(f));
        self
    }

    /// Called when the signal loses its last observer.
    pub fn on_cancel(mut self, f: impl Fn() + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Replace `PartialEq` as the rule deciding whether a `set` is a no-op.
    pub fn equals(mut self, f: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Some(Rc::new(f));
        self
    }
}

impl<T> Default for SignalOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writable reactive cell.
///
/// A `Signal` owns its value. Reading it with [`get`](Signal::get) inside a
/// [`Computed`](crate::Computed) derivation makes the computed depend on it;
/// writing it with [`set`](Signal::set) propagates to every dependent and
/// notifies listeners.
///
/// Handles are cheap to clone and all point at the same cell. The cell is
/// closed when [`close`](Signal::close) is called or the last handle is
/// dropped.
///
/// # Example
/// ```ignore
/// let count = Signal::new(0);
/// let _sub = count.subscribe(|change| {
///     println!("{} -> {}", change.old_value(), change.new_value());
/// });
///
/// count.set(1);               // prints "0 -> 1"
/// count.set(1);               // equal value, nothing happens
/// count.update(|n| *n += 1);  // prints "1 -> 2"
/// ```
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

struct SignalInner<T> {
    this: Weak<SignalInner<T>>,
    id: NodeId,
    info: CellInfo,
    value: RefCell<T>,
    /// Value before the first change of the running cycle.
    pending: RefCell<Option<T>>,
    listeners: ListenerList<T>,
    equals: Option<Equality<T>>,
    on_listen: Option<Box<dyn Fn()>>,
    on_cancel: Option<Box<dyn Fn()>>,
    observed: Cell<bool>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self::with_options(value, SignalOptions::new())
    }

    pub fn with_options(value: T, options: SignalOptions<T>) -> Self {
        let info = CellInfo::new::<T>(
            CellKind::Signal,
            options.name,
            options.owner_id,
            options.sensitive,
        );
        let id = node_arena_insert(NodeMetadata::new(info.clone(), 0, false));
        let inner = Rc::new_cyclic(|this| SignalInner {
            this: this.clone(),
            id,
            info,
            value: RefCell::new(value),
            pending: RefCell::new(None),
            listeners: ListenerList::new(),
            equals: options.equals,
            on_listen: options.on_listen,
            on_cancel: options.on_cancel,
            observed: Cell::new(false),
        });
        let handle: Weak<dyn ReactiveNode> = Rc::downgrade(&inner) as Weak<_>;
        id.set_handle(handle);

        middleware::notify_init(&inner.info);
        Self { inner }
    }

    /// Read the value, subscribing the running derivation.
    pub fn get(&self) -> T {
        track_read(self.inner.id);
        self.inner.value.borrow().clone()
    }

    /// Read the value without subscribing anything.
    pub fn peek(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the value (tracked).
    ///
    /// # Panics
    /// Panics if `f` writes to this same signal.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        track_read(self.inner.id);
        f(&self.inner.value.borrow())
    }

    /// Write a new value.
    ///
    /// Goes through the `on_set` middleware chain. Equal values (under the
    /// signal's equality rule) are ignored, as are writes to a closed signal.
    pub fn set(&self, value: T) {
        self.inner.set(value);
    }

    /// Like [`set`](Signal::set), but reports a closed signal.
    pub fn try_set(&self, value: T) -> Result<(), ReactiveError> {
        if self.inner.info.is_disposed() {
            return Err(ReactiveError::Disposed {
                cell: self.inner.info.clone(),
            });
        }
        self.inner.set(value);
        Ok(())
    }

    /// Modify a copy of the value in place and write it back.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.peek();
        f(&mut value);
        self.set(value);
    }

    /// Register a listener called with the coalesced change of every cycle
    /// that modified the value.
    ///
    /// Listeners added after [`close`](Signal::close) are accepted but never
    /// invoked.
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
            cov_mark::hit!(listener_on_disposed_signal_ignored);
            return ListenerId::next();
        }
        let id = inner.listeners.add(&inner.info, Box::new(f), context);
        inner.listeners_changed();
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let inner = &self.inner;
        let removed = inner.listeners.remove(&inner.info, id);
        if removed {
            inner.listeners_changed();
        }
        removed
    }

    /// [`add_listener`](Signal::add_listener) with RAII removal.
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
                    Signal { inner }.remove_listener(id);
                }
            }),
        )
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Detach from the graph, drop every listener, run the `on_dispose`
    /// hooks and mark the cell disposed. Idempotent.
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

    pub fn set_owner(&self, owner_id: Option<u64>) {
        self.inner.info.set_owner(owner_id);
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> SignalInner<T> {
    fn set(&self, value: T) {
        if self.info.is_disposed() {
            cov_mark::hit!(set_after_close_ignored);
            tracing::warn!(cell = %self.info, "set on a disposed signal ignored");
            return;
        }
        if !middleware::has(Hooks::SET) {
            self.commit(value);
            return;
        }

        let current = self.value.borrow().clone();
        let mut pending = Some(value);
        let mut call = SetCall::new(&self.info, &current, &mut pending);
        middleware::dispatch_set(&mut call, &mut |call: &mut SetCall<'_>| {
            if let Some(value) = call.take::<T>() {
                let change = self.commit(value);
                call.set_change(change);
            }
        });
    }

    fn is_equal(&self, a: &T, b: &T) -> bool {
        match &self.equals {
            Some(equals) => equals(a, b),
            None => a == b,
        }
    }

    /// The core setter, innermost in the `on_set` chain.
    fn commit(&self, value: T) -> Option<Rc<dyn AnyChange>> {
        if self.info.is_disposed() {
            return None;
        }
        if self.is_equal(&self.value.borrow(), &value) {
            cov_mark::hit!(equal_set_ignored);
            return None;
        }
        let old = self.value.replace(value);

        let change = middleware::has(Hooks::SET | Hooks::BATCH).then(|| {
            let new = self.value.borrow().clone();
            Rc::new(Change::new(old.clone(), new).with_writer(self.writer())) as Rc<dyn AnyChange>
        });
        if !self.listeners.is_empty() {
            let mut pending = self.pending.borrow_mut();
            if pending.is_none() {
                *pending = Some(old);
            }
        }
        if let Some(change) = &change {
            transaction::record_entry(BatchEntry::new(self.info.clone(), change.clone()));
        }

        transaction::node_changed(self.id);
        change
    }

    fn writer(&self) -> Writer<T> {
        let this = self.this.clone();
        Rc::new(move |value| {
            if let Some(inner) = this.upgrade() {
                inner.set(value);
            }
        })
    }

    fn listeners_changed(&self) {
        self.id.set_listener_count(self.listeners.len());
        self.observers_changed();
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
        tracing::trace!(cell = %self.info, "signal disposed");
        self.observers_changed();
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> ReactiveNode for SignalInner<T> {
    fn refresh(&self) {}

    fn flush(&self, report: &mut NotifyReport, deliver: bool) {
        let Some(old) = self.pending.borrow_mut().take() else {
            return;
        };
        if !deliver || self.info.is_disposed() {
            return;
        }
        let new = self.value.borrow().clone();
        if self.is_equal(&old, &new) {
            cov_mark::hit!(net_equal_change_skipped);
            return;
        }
        let change = Change::new(old, new).with_writer(self.writer());
        self.listeners.notify(&self.info, &change, report);
    }

    fn observers_changed(&self) {
        let observed = !self.info.is_disposed()
            && (!self.listeners.is_empty() || self.id.has_subscribers());
        if self.observed.replace(observed) == observed {
            return;
        }
        let callback = if observed {
            &self.on_listen
        } else {
            &self.on_cancel
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        if !self.info.is_disposed() {
            detach(self.id);
            self.listeners.clear(&self.info);
            middleware::notify_dispose(&self.info);
            self.info.mark_disposed();
            if self.observed.get() {
                if let Some(on_cancel) = &self.on_cancel {
                    on_cancel();
                }
            }
        }
        node_arena_remove(self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Signal");
        debug.field("info", &self.inner.info);
        if self.inner.info.is_sensitive() {
            debug.field("value", &"<redacted>");
        } else {
            debug.field("value", &self.inner.value.borrow());
        }
        debug.finish()
    }
}
