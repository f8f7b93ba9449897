//! Middleware pipeline
//!
//! Middleware observe and decorate engine operations without touching the
//! engine itself. Registration is ordered: the first registered middleware is
//! the outermost layer, so its code before `next` runs first and its code
//! after `next` runs last.
//!
//! ## Fast path
//!
//! Each middleware declares the hooks it implements through
//! [`Middleware::hooks`]. The registry keeps the union of those flags in a
//! thread-local, and every call site checks [`has`] before building any
//! dispatch state. With no middleware registered a `set` costs one flag test.
//!
//! ## Usage
//!
//! ```ignore
//! struct Audit;
//!
//! impl Middleware for Audit {
//!     fn hooks(&self) -> Hooks {
//!         Hooks::SET
//!     }
//!
//!     fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
//!         if call.value::<i32>().is_some_and(|value| *value < 0) {
//!             return; // veto
//!         }
//!         next(call);
//!     }
//! }
//!
//! middleware::add_with_token("audit", Rc::new(Audit));
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::change::{AnyChange, Batch};
use crate::error::ReactiveError;
use crate::info::CellInfo;
use crate::listener::ListenerContext;

bitflags! {
    /// The hooks a middleware implements.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Hooks: u16 {
        const SET = 1 << 0;
        const BATCH = 1 << 1;
        const DISPOSE = 1 << 2;
        const INIT = 1 << 3;
        const GRAPH_CHANGE = 1 << 4;
        const STARTED_LISTENING = 1 << 5;
        const STOPPED_LISTENING = 1 << 6;
        const REACTIVE_ERROR = 1 << 7;
    }
}

/// Cross-cutting interceptor for engine operations.
///
/// Every hook has a no-op default. Only the hooks named by [`hooks`](Middleware::hooks)
/// are ever called.
pub trait Middleware: 'static {
    /// Which hooks this middleware implements.
    fn hooks(&self) -> Hooks;

    /// Wraps every `set`. Call `next` to continue towards the core setter;
    /// returning without calling it vetoes the write.
    fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
        next(call);
    }

    /// Wraps the commit of a batch. The innermost `next` delivers the
    /// batch's changes to listeners, unless propagation was stopped.
    fn on_batch(&self, batch: &Batch, next: &mut dyn FnMut(&Batch)) {
        next(batch);
    }

    fn on_dispose(&self, _cell: &CellInfo) {}

    /// Runs synchronously inside the cell's constructor.
    fn on_init(&self, _cell: &CellInfo) {}

    fn on_graph_change(&self, _change: &GraphChange) {}

    fn started_listening(&self, _cell: &CellInfo, _context: &ListenerContext) {}

    fn stopped_listening(&self, _cell: &CellInfo, _context: &ListenerContext) {}

    /// Receives listener failures (and failed derivations) instead of the
    /// default handling.
    fn on_reactive_error(&self, _error: &ReactiveError) {}
}

/// A dependency set change of a derived cell.
#[derive(Clone, Debug)]
pub struct GraphChange {
    /// The derived cell whose dependencies changed.
    pub cell: CellInfo,
    pub added: Vec<CellInfo>,
    pub removed: Vec<CellInfo>,
}

/// State of one `set` travelling through the `on_set` chain.
///
/// Values are type-erased; use the cell's value type with [`value`](SetCall::value)
/// and friends. Middleware may replace the pending value before calling
/// `next`, and inspect the resulting [`change`](SetCall::change) after it.
pub struct SetCall<'a> {
    cell: &'a CellInfo,
    current: &'a dyn Any,
    /// Points at an `Option<T>`; the core takes the value out.
    pending: &'a mut dyn Any,
    change: Option<Rc<dyn AnyChange>>,
}

impl<'a> SetCall<'a> {
    pub(crate) fn new<T: 'static>(cell: &'a CellInfo, current: &'a T, pending: &'a mut Option<T>) -> Self {
        Self {
            cell,
            current,
            pending,
            change: None,
        }
    }

    pub fn cell(&self) -> &CellInfo {
        self.cell
    }

    /// The value before this set.
    pub fn current<T: 'static>(&self) -> Option<&T> {
        self.current.downcast_ref()
    }

    /// The value about to be written. None once the core consumed it, or
    /// if `T` is not the cell's type.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.pending.downcast_ref::<Option<T>>()?.as_ref()
    }

    pub fn value_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.pending.downcast_mut::<Option<T>>()?.as_mut()
    }

    /// Swap the pending value. Returns false if `T` is not the cell's type.
    pub fn replace<T: 'static>(&mut self, value: T) -> bool {
        match self.pending.downcast_mut::<Option<T>>() {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take<T: 'static>(&mut self) -> Option<T> {
        self.pending.downcast_mut::<Option<T>>()?.take()
    }

    /// The change committed by the core. None before `next` ran, or when the
    /// write was a no-op (equal value, disposed cell, veto).
    pub fn change(&self) -> Option<&dyn AnyChange> {
        self.change.as_deref()
    }

    pub fn shared_change(&self) -> Option<Rc<dyn AnyChange>> {
        self.change.clone()
    }

    pub(crate) fn set_change(&mut self, change: Option<Rc<dyn AnyChange>>) {
        self.change = change;
    }
}

impl fmt::Debug for SetCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetCall")
            .field("cell", self.cell)
            .field("committed", &self.change.is_some())
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Registry
// =========================================================================

#[derive(Clone)]
struct Layer {
    hooks: Hooks,
    middleware: Rc<dyn Middleware>,
}

struct Registration {
    token: Option<String>,
    layer: Layer,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Registration>,
    /// Immutable copy handed to dispatch, so a hook may (un)register
    /// middleware while the chain is running.
    snapshot: Rc<[Layer]>,
}

impl Registry {
    fn rebuild(&mut self) {
        self.snapshot = self.entries.iter().map(|entry| entry.layer.clone()).collect();
        let caps = self
            .entries
            .iter()
            .fold(Hooks::empty(), |caps, entry| caps | entry.layer.hooks);
        CAPS.with(|c| c.set(caps));
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
    static CAPS: Cell<Hooks> = const { Cell::new(Hooks::empty()) };
}

fn layer(middleware: Rc<dyn Middleware>) -> Layer {
    Layer {
        hooks: middleware.hooks(),
        middleware,
    }
}

fn update<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let result = f(&mut registry);
        registry.rebuild();
        result
    })
}

/// Register `middleware` as the new innermost layer.
pub fn add(middleware: Rc<dyn Middleware>) {
    update(|registry| {
        registry.entries.push(Registration {
            token: None,
            layer: layer(middleware),
        });
    });
}

/// Register `middleware` under `token`.
///
/// If a middleware is already registered under the same token it is replaced
/// in place, keeping its position in the chain.
pub fn add_with_token(token: impl Into<String>, middleware: Rc<dyn Middleware>) {
    let token = token.into();
    update(|registry| {
        let layer = layer(middleware);
        match registry
            .entries
            .iter_mut()
            .find(|entry| entry.token.as_deref() == Some(token.as_str()))
        {
            Some(entry) => {
                cov_mark::hit!(middleware_token_replaced);
                entry.layer = layer;
            }
            None => registry.entries.push(Registration {
                token: Some(token),
                layer,
            }),
        }
    });
}

fn same<M: Middleware + ?Sized>(layer: &Layer, middleware: &Rc<M>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(&layer.middleware), Rc::as_ptr(middleware))
}

/// Unregister `middleware`. Returns false if it was not registered.
pub fn remove<M: Middleware + ?Sized>(middleware: &Rc<M>) -> bool {
    update(|registry| {
        let before = registry.entries.len();
        registry.entries.retain(|entry| !same(&entry.layer, middleware));
        registry.entries.len() != before
    })
}

pub fn remove_by_token(token: &str) -> bool {
    update(|registry| {
        let before = registry.entries.len();
        registry
            .entries
            .retain(|entry| entry.token.as_deref() != Some(token));
        registry.entries.len() != before
    })
}

pub fn contains<M: Middleware + ?Sized>(middleware: &Rc<M>) -> bool {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .entries
            .iter()
            .any(|entry| same(&entry.layer, middleware))
    })
}

pub fn contains_token(token: &str) -> bool {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .entries
            .iter()
            .any(|entry| entry.token.as_deref() == Some(token))
    })
}

/// Remove every middleware registered on this thread.
pub fn clear() {
    update(|registry| registry.entries.clear());
}

pub fn len() -> usize {
    REGISTRY.with(|registry| registry.borrow().entries.len())
}

pub fn is_empty() -> bool {
    len() == 0
}

// =========================================================================
// Dispatch
// =========================================================================

/// Whether any registered middleware implements one of `hooks`.
#[inline]
pub(crate) fn has(hooks: Hooks) -> bool {
    CAPS.try_with(|caps| caps.get().intersects(hooks))
        .unwrap_or(false)
}

fn layers(hook: Hooks) -> Vec<Rc<dyn Middleware>> {
    REGISTRY
        .try_with(|registry| {
            registry
                .borrow()
                .snapshot
                .iter()
                .filter(|layer| layer.hooks.contains(hook))
                .map(|layer| layer.middleware.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Run `core` wrapped in every `on_set` layer.
pub(crate) fn dispatch_set(call: &mut SetCall<'_>, core: &mut dyn FnMut(&mut SetCall<'_>)) {
    let layers = layers(Hooks::SET);
    run_set(&layers, call, core);
}

fn run_set(
    layers: &[Rc<dyn Middleware>],
    call: &mut SetCall<'_>,
    core: &mut dyn FnMut(&mut SetCall<'_>),
) {
    match layers.split_first() {
        Some((outer, rest)) => {
            outer.on_set(call, &mut |call: &mut SetCall<'_>| run_set(rest, call, core));
        }
        None => core(call),
    }
}

/// Run `core` wrapped in every `on_batch` layer. A layer that stopped
/// propagation short-circuits the remaining layers and the core.
pub(crate) fn dispatch_batch(batch: &Batch, core: &mut dyn FnMut(&Batch)) {
    let layers = layers(Hooks::BATCH);
    run_batch(&layers, batch, core);
}

fn run_batch(layers: &[Rc<dyn Middleware>], batch: &Batch, core: &mut dyn FnMut(&Batch)) {
    if batch.is_propagation_stopped() {
        cov_mark::hit!(batch_propagation_stopped);
        return;
    }
    match layers.split_first() {
        Some((outer, rest)) => {
            outer.on_batch(batch, &mut |batch: &Batch| run_batch(rest, batch, core));
        }
        None => core(batch),
    }
}

pub(crate) fn notify_init(cell: &CellInfo) {
    if !has(Hooks::INIT) {
        return;
    }
    for middleware in layers(Hooks::INIT) {
        middleware.on_init(cell);
    }
}

pub(crate) fn notify_dispose(cell: &CellInfo) {
    if !has(Hooks::DISPOSE) {
        return;
    }
    for middleware in layers(Hooks::DISPOSE) {
        middleware.on_dispose(cell);
    }
}

pub(crate) fn graph_change(change: &GraphChange) {
    if !has(Hooks::GRAPH_CHANGE) {
        return;
    }
    for middleware in layers(Hooks::GRAPH_CHANGE) {
        middleware.on_graph_change(change);
    }
}

pub(crate) fn started_listening(cell: &CellInfo, context: &ListenerContext) {
    if !has(Hooks::STARTED_LISTENING) {
        cov_mark::hit!(listening_dispatch_skipped);
        return;
    }
    for middleware in layers(Hooks::STARTED_LISTENING) {
        middleware.started_listening(cell, context);
    }
}

pub(crate) fn stopped_listening(cell: &CellInfo, context: &ListenerContext) {
    if !has(Hooks::STOPPED_LISTENING) {
        cov_mark::hit!(listening_dispatch_skipped);
        return;
    }
    for middleware in layers(Hooks::STOPPED_LISTENING) {
        middleware.stopped_listening(cell, context);
    }
}

/// Forward `error` to every error hook. Returns false if none is registered.
pub(crate) fn report_error(error: &ReactiveError) -> bool {
    if !has(Hooks::REACTIVE_ERROR) {
        return false;
    }
    for middleware in layers(Hooks::REACTIVE_ERROR) {
        middleware.on_reactive_error(error);
    }
    true
}

/// Drop every registration. Part of [`reset_runtime`](crate::reset_runtime).
pub(crate) fn reset() {
    let removed = REGISTRY.try_with(|registry| {
        let mut registry = registry.borrow_mut();
        let removed = std::mem::take(&mut registry.entries);
        registry.rebuild();
        removed
    });
    drop(removed);
}
