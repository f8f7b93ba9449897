use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};

use crate::arena::{
    NodeId, NodeMetadata, ReactiveNode, ReactiveState, TrackedReads, TrackingGuard,
    apply_dependency_diff, detach, node_arena_insert, node_arena_remove, remove_edge, track_read,
};
use crate::change::Change;
use crate::error::{AsyncError, ReactiveError};
use crate::executor;
use crate::hash::NodeSet;
use crate::info::{CellInfo, CellKind};
use crate::listener::{ListenerContext, ListenerId, ListenerList, NotifyReport, Subscription};
use crate::middleware;
use crate::transaction;

/// Observable state of an [`AsyncComputed`].
#[derive(Clone, Debug, PartialEq)]
pub enum AsyncStatus<T> {
    /// No derivation has been started yet.
    Idle,
    /// A derivation is in flight.
    Waiting,
    Success(T),
    Error(AsyncError),
}

impl<T> AsyncStatus<T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, AsyncStatus::Idle)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, AsyncStatus::Waiting)
    }

    /// Success or Error.
    pub fn is_settled(&self) -> bool {
        matches!(self, AsyncStatus::Success(_) | AsyncStatus::Error(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            AsyncStatus::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AsyncError> {
        match self {
            AsyncStatus::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// Construction options for [`AsyncComputed`].
#[derive(Clone, Debug, Default)]
pub struct AsyncOptions {
    name: Option<Rc<str>>,
    static_deps: bool,
    lazy: bool,
}

impl AsyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<Rc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Track dependencies during the first derivation only.
    pub fn static_deps(mut self, static_deps: bool) -> Self {
        self.static_deps = static_deps;
        self
    }

    /// Start the first derivation on first access instead of at
    /// construction, and only restart on access after a dependency changed.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }
}

type Derive<T> = Box<dyn Fn() -> LocalBoxFuture<'static, anyhow::Result<T>>>;

/// Derived value produced by a future
///
/// Every start of the derive function is tagged with a new generation. Reads
/// made before the first `.await` and during every later poll are tracked,
/// so dependencies work the same way as for [`Computed`](crate::Computed).
/// When a dependency changes, a new derivation starts and the status goes
/// back to [`AsyncStatus::Waiting`]; a derivation that finishes after a newer
/// one was started is discarded, whatever order the futures complete in.
///
/// Futures run on the thread-local executor (see [`executor`](crate::executor)),
/// so results are always applied on the thread that owns the graph.
///
/// # Example
/// ```ignore
/// let user_id = Signal::new(1);
/// let profile = AsyncComputed::new({
///     let user_id = user_id.clone();
///     move || {
///         let id = user_id.get();
///         async move { fetch_profile(id).await }
///     }
/// });
///
/// assert_eq!(profile.status(), AsyncStatus::Waiting);
/// let loaded = block_on(profile.settled());
/// ```
pub struct AsyncComputed<T> {
    inner: Rc<AsyncInner<T>>,
}

struct AsyncInner<T> {
    this: Weak<AsyncInner<T>>,
    id: NodeId,
    info: CellInfo,
    derive: Derive<T>,
    status: RefCell<AsyncStatus<T>>,
    /// Status before the first change of the running cycle.
    pending: RefCell<Option<AsyncStatus<T>>>,
    generation: Rc<Cell<u64>>,
    listeners: ListenerList<AsyncStatus<T>>,
    waiters: RefCell<Vec<oneshot::Sender<Result<T, AsyncError>>>>,
    static_deps: bool,
    started: Cell<bool>,
}

impl<T> Clone for AsyncComputed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> AsyncComputed<T> {
    /// Create an async computed and start its first derivation.
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self::with_options(f, AsyncOptions::new())
    }

    pub fn with_options<F, Fut, E>(f: F, options: AsyncOptions) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let info = CellInfo::new::<T>(CellKind::AsyncComputed, options.name, None, false);
        let mut metadata = NodeMetadata::new(info.clone(), 1, !options.lazy);
        metadata.state = ReactiveState::Dirty;
        let id = node_arena_insert(metadata);

        let derive: Derive<T> = Box::new(move || {
            let future = f();
            async move {
                let result: anyhow::Result<T> = future.await.map_err(Into::into);
                result
            }
            .boxed_local()
        });

        let inner = Rc::new_cyclic(|this| AsyncInner {
            this: this.clone(),
            id,
            info,
            derive,
            status: RefCell::new(AsyncStatus::Idle),
            pending: RefCell::new(None),
            generation: Rc::new(Cell::new(0)),
            listeners: ListenerList::new(),
            waiters: RefCell::new(Vec::new()),
            static_deps: options.static_deps,
            started: Cell::new(false),
        });
        let handle: Weak<dyn ReactiveNode> = Rc::downgrade(&inner) as Weak<_>;
        id.set_handle(handle);
        middleware::notify_init(&inner.info);

        if !options.lazy {
            inner.start();
        }
        Self { inner }
    }

    /// Current status. Inside another derivation this subscribes the reader.
    ///
    /// A lazy async computed starts deriving on this call.
    pub fn status(&self) -> AsyncStatus<T> {
        self.inner.ensure_started();
        track_read(self.inner.id);
        self.inner.status.borrow().clone()
    }

    /// Current status without subscribing or starting anything.
    pub fn peek_status(&self) -> AsyncStatus<T> {
        self.inner.status.borrow().clone()
    }

    /// The value of the last successful derivation, if the current status is
    /// `Success`.
    pub fn value(&self) -> Option<T> {
        self.status().value().cloned()
    }

    pub fn error(&self) -> Option<AsyncError> {
        self.status().error().cloned()
    }

    /// Resolves with the current result if settled, or with the result of
    /// the derivation in flight otherwise.
    ///
    /// Resolves to an error if the cell is closed before that happens.
    pub fn settled(&self) -> LocalBoxFuture<'static, Result<T, AsyncError>> {
        let inner = &self.inner;
        inner.ensure_started();
        match &*inner.status.borrow() {
            AsyncStatus::Success(value) => return future::ready(Ok(value.clone())).boxed_local(),
            AsyncStatus::Error(error) => return future::ready(Err(error.clone())).boxed_local(),
            _ if inner.info.is_disposed() => {
                return future::ready(Err(AsyncError::closed())).boxed_local();
            }
            _ => {}
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.borrow_mut().push(tx);
        rx.map(|result| result.unwrap_or_else(|_| Err(AsyncError::closed())))
            .boxed_local()
    }

    /// Generation of the most recently started derivation. Zero until the
    /// first start. Closing the cell retires the generation in flight, which
    /// also advances this.
    pub fn generation(&self) -> u64 {
        self.inner.generation.get()
    }

    /// Discard the current result and start a new derivation. Lazy cells
    /// only restart on their next access.
    pub fn restart(&self) {
        transaction::schedule_refresh(self.inner.id);
    }

    /// Register a listener called on every status change.
    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&Change<AsyncStatus<T>>) + 'static,
    {
        self.add_listener_with_context(f, ListenerContext::listener())
    }

    pub fn add_listener_with_context<F>(&self, f: F, context: ListenerContext) -> ListenerId
    where
        F: FnMut(&Change<AsyncStatus<T>>) + 'static,
    {
        let inner = &self.inner;
        if inner.info.is_disposed() {
            return ListenerId::next();
        }
        inner.ensure_started();
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
        F: FnMut(&Change<AsyncStatus<T>>) + 'static,
    {
        let id = self.add_listener(f);
        let weak = Rc::downgrade(&self.inner);
        Subscription::new(
            id,
            Box::new(move |id| {
                if let Some(inner) = weak.upgrade() {
                    AsyncComputed { inner }.remove_listener(id);
                }
            }),
        )
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Stop tracking and drop every listener and pending
    /// [`settled`](AsyncComputed::settled) future. A derivation still in
    /// flight is never applied.
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

impl<T: Clone + PartialEq + fmt::Debug + 'static> AsyncInner<T> {
    fn ensure_started(&self) {
        if self.info.is_disposed() {
            return;
        }
        if !self.started.get() || self.id.state() == ReactiveState::Dirty {
            self.start();
        }
    }

    /// Start a new generation.
    fn start(&self) {
        if self.info.is_disposed() {
            return;
        }
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let record = !(self.static_deps && self.started.get());
        if !record {
            cov_mark::hit!(async_static_deps_skip_tracking);
        }
        self.started.set(true);
        self.id.set_state(ReactiveState::Clean);

        // Everything up to the first suspension point runs here, under its
        // own frame.
        let guard = TrackingGuard::push(Some(self.id), record);
        let future = match catch_unwind(AssertUnwindSafe(|| (self.derive)())) {
            Ok(future) => future,
            Err(payload) => {
                cov_mark::hit!(sync_derivation_panic_captured);
                let tracked = guard.finish();
                self.settle(generation, record, Err(AsyncError::from_panic(payload)), tracked);
                return;
            }
        };
        let tracked = guard.finish();
        self.set_status(AsyncStatus::Waiting);

        let task = Tracked {
            future: AssertUnwindSafe(future)
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(AsyncError::new(error)),
                    Err(payload) => Err(AsyncError::from_panic(payload)),
                })
                .boxed_local(),
            node: self.id,
            generation,
            current: self.generation.clone(),
            record,
            reads: tracked.reads,
            added: tracked.added,
        };
        let this = self.this.clone();
        let spawned = executor::spawn_local(async move {
            let (outcome, tracked) = task.await;
            if let Some(inner) = this.upgrade() {
                inner.settle(generation, record, outcome, tracked);
            }
        });
        if let Err(error) = spawned {
            // Keep the edges of the synchronous part; there is nothing to diff against.
            let error = AsyncError::new(anyhow::anyhow!("failed to spawn derivation: {error}"));
            self.settle(generation, false, Err(error), TrackedReads::default());
        }
    }

    fn settle(
        &self,
        generation: u64,
        record: bool,
        outcome: Result<T, AsyncError>,
        tracked: TrackedReads,
    ) {
        if self.info.is_disposed() {
            cov_mark::hit!(async_result_after_close_dropped);
            for source in tracked.added {
                remove_edge(source, self.id);
            }
            return;
        }
        let latest = self.generation.get();
        if generation != latest {
            // Edges this generation added are reconciled by the diff of the
            // latest one, which cannot have been applied before they existed.
            cov_mark::hit!(stale_async_result_discarded);
            tracing::trace!(cell = %self.info, generation, latest, "stale async result discarded");
            return;
        }
        if record {
            apply_dependency_diff(self.id, &tracked.reads, &tracked.added);
        }
        if let Err(error) = &outcome {
            let error = ReactiveError::AsyncDerivation {
                cell: self.info.clone(),
                error: error.clone(),
            };
            if !middleware::report_error(&error) {
                tracing::debug!(cell = %self.info, "{error}");
            }
        }
        for waiter in self.waiters.take() {
            let _ = waiter.send(outcome.clone());
        }
        self.set_status(match outcome {
            Ok(value) => AsyncStatus::Success(value),
            Err(error) => AsyncStatus::Error(error),
        });
    }

    fn set_status(&self, status: AsyncStatus<T>) {
        let old = {
            let mut current = self.status.borrow_mut();
            if *current == status {
                return;
            }
            mem::replace(&mut *current, status)
        };
        if !self.listeners.is_empty() {
            self.pending.borrow_mut().get_or_insert(old);
        }
        transaction::node_changed(self.id);
    }

    fn dispose(&self) {
        if self.info.is_disposed() {
            return;
        }
        invalidate_in_flight(&self.generation);
        detach(self.id);
        self.listeners.clear(&self.info);
        self.id.set_listener_count(0);
        self.pending.borrow_mut().take();
        self.waiters.borrow_mut().clear();
        middleware::notify_dispose(&self.info);
        self.info.mark_disposed();
        tracing::trace!(cell = %self.info, "async computed disposed");
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> ReactiveNode for AsyncInner<T> {
    fn refresh(&self) {
        self.start();
    }

    fn flush(&self, report: &mut NotifyReport, deliver: bool) {
        let Some(old) = self.pending.borrow_mut().take() else {
            return;
        };
        if !deliver || self.info.is_disposed() {
            return;
        }
        let new = self.status.borrow().clone();
        if old == new {
            return;
        }
        self.listeners.notify(&self.info, &Change::new(old, new), report);
    }
}

/// Retire the generation in flight, so its remaining polls record nothing.
fn invalidate_in_flight(generation: &Cell<u64>) {
    generation.set(generation.get() + 1);
}

impl<T> Drop for AsyncInner<T> {
    fn drop(&mut self) {
        // The task can outlive the node; its slot may be reused after this.
        invalidate_in_flight(&self.generation);
        if !self.info.is_disposed() {
            detach(self.id);
            self.listeners.clear(&self.info);
            middleware::notify_dispose(&self.info);
            self.info.mark_disposed();
        }
        node_arena_remove(self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncComputed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("info", &self.inner.info)
            .field("generation", &self.inner.generation.get())
            .field("status", &self.inner.status.borrow())
            .finish()
    }
}

/// Wraps a derivation so every poll runs under a tracking frame for its node.
///
/// Reads are only recorded while the derivation's generation is the latest.
/// Once it is retired the polls run untracked, since the node may be closed
/// or its slot reused.
struct Tracked<T> {
    future: LocalBoxFuture<'static, Result<T, AsyncError>>,
    node: NodeId,
    generation: u64,
    current: Rc<Cell<u64>>,
    record: bool,
    reads: NodeSet,
    added: Vec<NodeId>,
}

impl<T> Future for Tracked<T> {
    type Output = (Result<T, AsyncError>, TrackedReads);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let current = this.current.get() == this.generation;
        let guard = TrackingGuard::push(current.then_some(this.node), this.record && current);
        let poll = this.future.as_mut().poll(cx);
        let tracked = guard.finish();
        this.reads.extend(tracked.reads);
        this.added.extend(tracked.added);

        poll.map(|outcome| {
            let tracked = TrackedReads {
                reads: mem::take(&mut this.reads),
                added: mem::take(&mut this.added),
            };
            (outcome, tracked)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{block_on, run_until_stalled};
    use crate::{Computed, Signal, SignalOptions};

    type Gates = Rc<RefCell<Vec<oneshot::Sender<()>>>>;

    async fn yield_once() {
        let mut yielded = false;
        future::poll_fn(move |cx| {
            if yielded {
                return Poll::Ready(());
            }
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        })
        .await
    }

    /// Async computed that reads `late` only after its first suspension.
    fn reads_after_yield(late: &Signal<i32>) -> AsyncComputed<i32> {
        let late = late.clone();
        AsyncComputed::new(move || {
            let late = late.clone();
            async move {
                yield_once().await;
                Ok::<_, anyhow::Error>(late.get())
            }
        })
    }

    /// Async computed over `source` that waits for a gate per derivation.
    fn gated(source: &Signal<i32>) -> (AsyncComputed<i32>, Gates) {
        let gates: Gates = Rc::new(RefCell::new(Vec::new()));
        let computed = AsyncComputed::new({
            let source = source.clone();
            let gates = gates.clone();
            move || {
                let value = source.get();
                let (tx, rx) = oneshot::channel::<()>();
                gates.borrow_mut().push(tx);
                async move {
                    let _ = rx.await;
                    Ok::<_, anyhow::Error>(value)
                }
            }
        });
        (computed, gates)
    }

    #[test]
    fn resolves_to_success() {
        let source = Signal::new(2);
        let doubled = AsyncComputed::new({
            let source = source.clone();
            move || {
                let value = source.get();
                async move { Ok::<_, anyhow::Error>(value * 2) }
            }
        });

        assert_eq!(doubled.peek_status(), AsyncStatus::Waiting);
        assert_eq!(block_on(doubled.settled()), Ok(4));
        assert_eq!(doubled.status(), AsyncStatus::Success(4));
    }

    #[test]
    fn dependency_change_starts_a_new_generation() {
        let source = Signal::new(1);
        let (computed, gates) = gated(&source);
        assert_eq!(computed.generation(), 1);

        source.set(2);
        assert_eq!(computed.generation(), 2);
        assert_eq!(computed.peek_status(), AsyncStatus::Waiting);
        assert_eq!(gates.borrow().len(), 2);
    }

    #[test]
    fn late_result_of_an_older_generation_is_discarded() {
        cov_mark::check!(stale_async_result_discarded);
        let source = Signal::new(0);
        let (computed, gates) = gated(&source);
        source.set(1);
        source.set(2);

        let mut gates = mem::take(&mut *gates.borrow_mut());
        let latest = gates.pop().unwrap();
        let older = gates.pop().unwrap();

        let _ = latest.send(());
        run_until_stalled();
        assert_eq!(computed.peek_status(), AsyncStatus::Success(2));

        let _ = older.send(());
        drop(gates);
        run_until_stalled();
        assert_eq!(computed.peek_status(), AsyncStatus::Success(2));
    }

    #[test]
    fn failure_becomes_error_status() {
        let computed = AsyncComputed::new(|| async { Err::<i32, _>(anyhow::anyhow!("offline")) });

        let error = block_on(computed.settled()).unwrap_err();
        assert_eq!(error.to_string(), "offline");
        assert_eq!(computed.status(), AsyncStatus::Error(error));
    }

    #[test]
    fn synchronous_panic_becomes_error_status() {
        cov_mark::check!(sync_derivation_panic_captured);
        let computed = AsyncComputed::with_options(
            || -> future::Ready<anyhow::Result<i32>> { panic!("bad input") },
            AsyncOptions::new().static_deps(true),
        );

        let status = computed.peek_status();
        let error = status.error().expect("status should be an error");
        assert!(error.to_string().contains("bad input"));
    }

    #[test]
    fn panic_after_suspension_becomes_error_status() {
        let computed = AsyncComputed::new(|| async {
            yield_once().await;
            if true {
                panic!("lost connection");
            }
            Ok::<i32, anyhow::Error>(0)
        });

        let error = block_on(computed.settled()).unwrap_err();
        assert!(error.to_string().contains("lost connection"));
    }

    #[test]
    fn close_suppresses_the_result_in_flight() {
        cov_mark::check!(async_result_after_close_dropped);
        let source = Signal::new(1);
        let (computed, gates) = gated(&source);
        let pending = computed.settled();

        computed.close();
        for gate in gates.borrow_mut().drain(..) {
            let _ = gate.send(());
        }
        run_until_stalled();

        assert_eq!(computed.peek_status(), AsyncStatus::Waiting);
        assert!(block_on(pending).is_err());
    }

    #[test]
    fn lazy_computed_stays_idle_until_read() {
        let calls = Rc::new(Cell::new(0));
        let computed = AsyncComputed::with_options(
            {
                let calls = calls.clone();
                move || {
                    calls.set(calls.get() + 1);
                    async { Ok::<_, anyhow::Error>(1) }
                }
            },
            AsyncOptions::new().lazy(true),
        );

        assert_eq!(computed.peek_status(), AsyncStatus::Idle);
        assert_eq!(calls.get(), 0);
        assert_eq!(block_on(computed.settled()), Ok(1));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn listeners_see_waiting_then_success() {
        let source = Signal::new(1);
        let (computed, gates) = gated(&source);
        for gate in gates.borrow_mut().drain(..) {
            let _ = gate.send(());
        }
        run_until_stalled();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        computed.add_listener(move |change: &Change<AsyncStatus<i32>>| {
            log.borrow_mut().push(change.new_value().clone())
        });

        source.set(5);
        for gate in gates.borrow_mut().drain(..) {
            let _ = gate.send(());
        }
        run_until_stalled();

        assert_eq!(
            *seen.borrow(),
            vec![AsyncStatus::Waiting, AsyncStatus::Success(5)]
        );
    }

    #[test]
    fn reads_after_suspension_are_tracked() {
        let first = Signal::new(1);
        let second = Signal::new(10);
        let sum = AsyncComputed::new({
            let (first, second) = (first.clone(), second.clone());
            move || {
                let a = first.get();
                let second = second.clone();
                async move {
                    yield_once().await;
                    Ok::<_, anyhow::Error>(a + second.get())
                }
            }
        });
        assert_eq!(block_on(sum.settled()), Ok(11));

        second.set(20);
        assert_eq!(block_on(sum.settled()), Ok(21));
    }

    #[test]
    fn closed_cell_is_not_resubscribed_by_its_derivation_in_flight() {
        let listens = Rc::new(Cell::new(0));
        let late = Signal::with_options(
            1,
            SignalOptions::new().on_listen({
                let listens = listens.clone();
                move || listens.set(listens.get() + 1)
            }),
        );
        let computed = reads_after_yield(&late);

        computed.close();
        run_until_stalled();

        assert_eq!(listens.get(), 0);
        assert_eq!(computed.peek_status(), AsyncStatus::Waiting);
    }

    #[test]
    fn dropped_cell_leaves_no_edge_for_the_node_reusing_its_slot() {
        let late = Signal::new(1);
        let other = Signal::new(0);
        let runs = Rc::new(Cell::new(0));
        let computed = reads_after_yield(&late);

        drop(computed);
        let unrelated = Computed::new({
            let (other, runs) = (other.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                other.get()
            }
        });
        let _listener = unrelated.subscribe(|_: &Change<i32>| {});
        run_until_stalled();

        let before = runs.get();
        late.set(2);
        assert_eq!(runs.get(), before);
    }

    #[test]
    fn reads_of_a_superseded_derivation_are_reconciled() {
        let source = Signal::new(1);
        let extra = Signal::new(0);
        let gates: Gates = Rc::new(RefCell::new(Vec::new()));
        let computed = AsyncComputed::new({
            let (source, extra, gates) = (source.clone(), extra.clone(), gates.clone());
            move || {
                let value = source.get();
                let extra = extra.clone();
                let (tx, rx) = oneshot::channel::<()>();
                gates.borrow_mut().push(tx);
                async move {
                    yield_once().await;
                    if value == 1 {
                        let _ = extra.get();
                    }
                    let _ = rx.await;
                    Ok::<_, anyhow::Error>(value)
                }
            }
        });
        run_until_stalled();
        source.set(2);
        run_until_stalled();

        let mut gates = mem::take(&mut *gates.borrow_mut());
        let latest = gates.pop().unwrap();
        let older = gates.pop().unwrap();
        let _ = latest.send(());
        run_until_stalled();
        let _ = older.send(());
        run_until_stalled();

        assert_eq!(computed.peek_status(), AsyncStatus::Success(2));
        extra.set(1);
        assert_eq!(computed.generation(), 2);
    }
}
