//! End-to-end scenarios across cells, batches and middleware.
use crate::{
    AsyncComputed, AsyncStatus, Batch, CellInfo, Change, Computed, ComputedOptions, GraphChange,
    Hooks, ListenerContext, Middleware, ReactiveError, SetCall, Signal, middleware, reset_runtime,
    run_in_batch, run_until_stalled,
};
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use tracing_test::traced_test;

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

/// Records whatever hooks it is registered for.
struct Recorder {
    hooks: Hooks,
    log: Log,
    errors: RefCell<Vec<ReactiveError>>,
    stop_batches: bool,
}

impl Recorder {
    fn new(hooks: Hooks, log: &Log) -> Rc<Self> {
        Rc::new(Self {
            hooks,
            log: log.clone(),
            errors: RefCell::new(Vec::new()),
            stop_batches: false,
        })
    }

    fn stopping(log: &Log) -> Rc<Self> {
        Rc::new(Self {
            hooks: Hooks::BATCH,
            log: log.clone(),
            errors: RefCell::new(Vec::new()),
            stop_batches: true,
        })
    }

    fn push(&self, entry: String) {
        self.log.borrow_mut().push(entry);
    }
}

fn label(cell: &CellInfo) -> String {
    cell.name().map_or_else(|| cell.id().to_string(), str::to_string)
}

impl Middleware for Recorder {
    fn hooks(&self) -> Hooks {
        self.hooks
    }

    fn on_batch(&self, batch: &Batch, next: &mut dyn FnMut(&Batch)) {
        let entries: Vec<String> = batch
            .entries()
            .iter()
            .map(|entry| format!("{}: {}", label(entry.cell()), entry.change().describe()))
            .collect();
        self.push(format!("batch [{}]", entries.join(", ")));
        if self.stop_batches {
            batch.stop_propagation();
        }
        next(batch);
    }

    fn on_init(&self, cell: &CellInfo) {
        self.push(format!("init {}", label(cell)));
    }

    fn on_dispose(&self, cell: &CellInfo) {
        self.push(format!("dispose {}", label(cell)));
    }

    fn on_graph_change(&self, change: &GraphChange) {
        let added: Vec<String> = change.added.iter().map(label).collect();
        let removed: Vec<String> = change.removed.iter().map(label).collect();
        self.push(format!(
            "graph {} +[{}] -[{}]",
            label(&change.cell),
            added.join(","),
            removed.join(",")
        ));
    }

    fn started_listening(&self, cell: &CellInfo, context: &ListenerContext) {
        self.push(format!("start {} {}", label(cell), context.kind()));
    }

    fn stopped_listening(&self, cell: &CellInfo, context: &ListenerContext) {
        self.push(format!("stop {} {}", label(cell), context.kind()));
    }

    fn on_reactive_error(&self, error: &ReactiveError) {
        self.errors.borrow_mut().push(error.clone());
    }
}

fn named(value: i32, name: &str) -> Signal<i32> {
    Signal::with_options(value, crate::SignalOptions::new().name(name))
}

#[test]
fn doubled_computed_follows_its_source() {
    let c = Signal::new(0);
    let d = Computed::new({
        let c = c.clone();
        move || c.get() * 2
    });

    assert_eq!(d.get(), 0);
    c.set(5);
    assert_eq!(d.get(), 10);
}

#[test]
fn batch_only_exposes_the_final_value() {
    let c = Signal::new(0);
    let derived = log();
    let d = Computed::new({
        let (c, derived) = (c.clone(), derived.clone());
        move || {
            let value = c.get() * 2;
            derived.borrow_mut().push(value.to_string());
            value
        }
    });
    let seen = log();
    let _listener = d.subscribe({
        let seen = seen.clone();
        move |change: &Change<i32>| {
            seen.borrow_mut()
                .push(format!("{} -> {}", change.old_value(), change.new_value()))
        }
    });

    run_in_batch(|| {
        c.set(1);
        c.set(2);
    });

    assert_eq!(d.get(), 4);
    assert_eq!(*derived.borrow(), vec!["0", "4"]);
    assert_eq!(*seen.borrow(), vec!["0 -> 4"]);
}

#[test]
fn late_async_result_never_overwrites_a_newer_one() {
    let c = Signal::new(0);
    let gates: Rc<RefCell<Vec<oneshot::Sender<()>>>> = Rc::new(RefCell::new(Vec::new()));
    let derived = AsyncComputed::new({
        let (c, gates) = (c.clone(), gates.clone());
        move || {
            let value = c.get();
            let (tx, rx) = oneshot::channel::<()>();
            gates.borrow_mut().push(tx);
            async move {
                let _ = rx.await;
                Ok::<_, anyhow::Error>(value)
            }
        }
    });
    let statuses = Rc::new(RefCell::new(Vec::new()));
    derived.add_listener({
        let statuses = statuses.clone();
        move |change: &Change<AsyncStatus<i32>>| statuses.borrow_mut().push(change.new_value().clone())
    });

    c.set(1);
    c.set(2);
    let mut gates = std::mem::take(&mut *gates.borrow_mut());
    // Resolve in reverse start order.
    while let Some(gate) = gates.pop() {
        let _ = gate.send(());
        run_until_stalled();
    }

    assert_eq!(derived.peek_status(), AsyncStatus::Success(2));
    assert!(!statuses.borrow().contains(&AsyncStatus::Success(1)));
    assert!(!statuses.borrow().contains(&AsyncStatus::Success(0)));
}

#[test]
fn diamond_recomputes_the_join_once_with_settled_inputs() {
    let source = Signal::new(1);
    let left = Computed::new({
        let source = source.clone();
        move || source.get() + 1
    });
    let right = Computed::new({
        let source = source.clone();
        move || source.get() * 2
    });
    let runs = Rc::new(RefCell::new(Vec::new()));
    let join = Computed::new({
        let (left, right, runs) = (left.clone(), right.clone(), runs.clone());
        move || {
            let (l, r) = (left.get(), right.get());
            runs.borrow_mut().push((l, r));
            l + r
        }
    });
    let notified = counter();
    join.add_listener({
        let notified = notified.clone();
        move |_: &Change<i32>| notified.set(notified.get() + 1)
    });
    runs.borrow_mut().clear();

    source.set(5);

    assert_eq!(*runs.borrow(), vec![(6, 10)]);
    assert_eq!(notified.get(), 1);
    assert_eq!(join.get(), 16);
}

#[test]
fn independent_mutations_form_one_ordered_batch() {
    let events = log();
    let _recorder = Registration::add(Recorder::new(Hooks::BATCH, &events));
    let a = named(0, "a");
    let b = named(0, "b");
    let c = named(0, "c");

    run_in_batch(|| {
        b.set(1);
        a.set(1);
        c.set(1);
        a.set(2);
    });

    assert_eq!(
        *events.borrow(),
        vec!["batch [b: 0 -> 1, a: 0 -> 1, c: 0 -> 1, a: 1 -> 2]"]
    );
}

#[test]
fn nested_batches_commit_once() {
    let events = log();
    let _recorder = Registration::add(Recorder::new(Hooks::BATCH, &events));
    let a = named(0, "a");

    run_in_batch(|| {
        a.set(1);
        run_in_batch(|| a.set(2));
        assert!(events.borrow().is_empty());
    });

    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn stopped_batch_suppresses_listeners() {
    let events = log();
    let _stopper = Registration::add(Recorder::stopping(&events));
    let a = named(0, "a");
    let calls = counter();
    a.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| calls.set(calls.get() + 1)
    });

    run_in_batch(|| a.set(1));
    assert_eq!(calls.get(), 0);
    assert_eq!(a.get(), 1);

    // Outside a batch listeners run as usual.
    a.set(2);
    assert_eq!(calls.get(), 1);
}

#[test]
fn every_listener_runs_and_every_failure_is_reported() {
    let events = log();
    let recorder = Recorder::new(Hooks::REACTIVE_ERROR, &events);
    let _registration = Registration::add(recorder.clone());
    let cell = Signal::new(0);
    let calls = Rc::new(RefCell::new(vec![0; 5]));
    for i in 0..5 {
        let calls = calls.clone();
        cell.add_listener(move |_: &Change<i32>| {
            calls.borrow_mut()[i] += 1;
            if i % 2 == 1 {
                panic!("listener {i} failed");
            }
        });
    }

    cell.set(1);

    assert_eq!(*calls.borrow(), vec![1; 5]);
    let errors = recorder.errors.borrow();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|error| matches!(error, ReactiveError::Listener { .. })));
    assert!(errors[0].to_string().contains("listener 1 failed"));
    assert!(errors[1].to_string().contains("listener 3 failed"));
}

#[test]
fn single_listener_failure_reaches_the_setter() {
    let cell = Signal::new(0);
    cell.add_listener(|_: &Change<i32>| panic!("only listener"));

    let result = catch_unwind(AssertUnwindSafe(|| cell.set(1)));

    assert!(result.is_err());
    assert_eq!(cell.get(), 1);
}

#[test]
#[traced_test]
fn failures_among_several_listeners_are_logged_and_skipped() {
    let cell = Signal::new(0);
    let calls = counter();
    cell.add_listener(|_: &Change<i32>| panic!("first listener broke"));
    cell.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| calls.set(calls.get() + 1)
    });

    cell.set(1);

    assert_eq!(calls.get(), 1);
    assert!(logs_contain("first listener broke"));
}

#[test]
fn listener_mutations_are_applied_inline() {
    let a = Signal::new(0);
    let b = Signal::new(0);
    let seen = log();
    b.add_listener({
        let seen = seen.clone();
        move |change: &Change<i32>| seen.borrow_mut().push(format!("b={}", change.new_value()))
    });
    a.add_listener({
        let (b, seen) = (b.clone(), seen.clone());
        move |change: &Change<i32>| {
            b.set(change.new_value() * 10);
            seen.borrow_mut().push(format!("a={}", change.new_value()));
        }
    });

    a.set(1);

    assert_eq!(b.get(), 10);
    assert_eq!(*seen.borrow(), vec!["b=10", "a=1"]);
}

#[test]
fn listener_can_remove_a_sibling_mid_notification() {
    let cell = Signal::new(0);
    let calls = counter();
    let victim = Rc::new(Cell::new(None));
    cell.add_listener({
        let (cell, victim) = (cell.clone(), victim.clone());
        move |_: &Change<i32>| {
            if let Some(id) = victim.take() {
                cell.remove_listener(id);
            }
        }
    });
    let id = cell.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| calls.set(calls.get() + 1)
    });
    victim.set(Some(id));

    cell.set(1);
    cell.set(2);

    assert_eq!(calls.get(), 0);
    assert_eq!(cell.listener_count(), 1);
}

/// Claims every new cell, the way an owning scope would.
struct Owner {
    id: u64,
}

impl Middleware for Owner {
    fn hooks(&self) -> Hooks {
        Hooks::INIT
    }

    fn on_init(&self, cell: &CellInfo) {
        cell.set_owner(Some(self.id));
    }
}

#[test]
fn init_hook_claims_ownership_before_construction_returns() {
    let _owner = Registration::add(Rc::new(Owner { id: 42 }));

    let cell = Signal::new(1);
    let doubled = Computed::new({
        let cell = cell.clone();
        move || cell.get() * 2
    });

    assert_eq!(cell.info().owner_id(), Some(42));
    assert_eq!(doubled.info().owner_id(), Some(42));
}

#[test]
fn graph_and_listening_hooks_follow_dependencies() {
    let events = log();
    let hooks = Hooks::GRAPH_CHANGE | Hooks::STARTED_LISTENING | Hooks::STOPPED_LISTENING;
    let _recorder = Registration::add(Recorder::new(hooks, &events));
    let flag = named(1, "flag");
    let a = named(1, "a");
    let b = named(2, "b");
    let picked = Computed::with_options(
        {
            let (flag, a, b) = (flag.clone(), a.clone(), b.clone());
            move || if flag.get() > 0 { a.get() } else { b.get() }
        },
        ComputedOptions::new().name("picked"),
    );

    picked.get();
    events.borrow_mut().clear();
    flag.set(0);
    picked.get();

    assert_eq!(
        *events.borrow(),
        vec![
            "stop a dependency",
            "start b dependency",
            "graph picked +[b] -[a]"
        ]
    );
}

#[test]
fn listener_context_reaches_the_hooks() {
    let events = log();
    let hooks = Hooks::STARTED_LISTENING | Hooks::STOPPED_LISTENING;
    let _recorder = Registration::add(Recorder::new(hooks, &events));
    let cell = named(0, "cell");

    let id = cell.add_listener_with_context(
        |_: &Change<i32>| {},
        ListenerContext::new("widget").with_id("w1"),
    );
    cell.remove_listener(id);

    assert_eq!(*events.borrow(), vec!["start cell widget", "stop cell widget"]);
}

#[test]
fn closed_cell_ignores_listeners_and_writes() {
    let events = log();
    let _recorder = Registration::add(Recorder::new(Hooks::DISPOSE, &events));
    let cell = named(1, "cell");
    let calls = counter();
    cell.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| calls.set(calls.get() + 1)
    });

    cell.close();
    cell.close();
    assert_eq!(cell.listener_count(), 0);
    assert_eq!(*events.borrow(), vec!["dispose cell"]);

    cell.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| calls.set(calls.get() + 1)
    });
    cell.set(2);
    assert_eq!(calls.get(), 0);
    assert_eq!(cell.get(), 1);
    assert!(matches!(cell.try_set(3), Err(ReactiveError::Disposed { .. })));
}

#[test]
fn closed_dependent_leaves_the_graph() {
    let source = Signal::new(1);
    let calls = counter();
    let doubled = Computed::eager({
        let (source, calls) = (source.clone(), calls.clone());
        move || {
            calls.set(calls.get() + 1);
            source.get() * 2
        }
    });

    doubled.close();
    source.set(2);

    assert_eq!(calls.get(), 1);
    assert_eq!(doubled.get(), 2);
}

#[test]
fn static_dependencies_ignore_unrelated_cells() {
    let a = Signal::new(1);
    let unrelated = Signal::new(0);
    let calls = counter();
    let plus_one = Computed::with_options(
        {
            let (a, calls) = (a.clone(), calls.clone());
            move || {
                calls.set(calls.get() + 1);
                a.get() + 1
            }
        },
        ComputedOptions::new().eager(true).static_deps(true),
    );

    for value in 1..10 {
        unrelated.set(value);
    }

    assert_eq!(calls.get(), 1);
    assert_eq!(plus_one.get(), 2);
}

#[test]
fn failed_eager_evaluation_leaves_no_subscription() {
    let source = Signal::new(1);
    let calls = counter();
    let result = catch_unwind(AssertUnwindSafe(|| {
        Computed::eager({
            let (source, calls) = (source.clone(), calls.clone());
            move || {
                calls.set(calls.get() + 1);
                let value = source.get();
                panic!("cannot derive from {value}");
            }
        })
    }));

    assert!(result.is_err());
    source.set(2);
    assert_eq!(calls.get(), 1);
}

/// Computed that doubles `source` and panics once it holds 2.
fn fragile(source: &Signal<i32>) -> Computed<i32> {
    let source = source.clone();
    Computed::new(move || {
        let value = source.get();
        if value == 2 {
            panic!("cannot derive from {value}");
        }
        value * 2
    })
}

#[test]
fn failed_recompute_is_reported_and_retried_on_read() {
    let events = log();
    let recorder = Recorder::new(Hooks::REACTIVE_ERROR, &events);
    let _registration = Registration::add(recorder.clone());
    let source = Signal::new(1);
    let derived = fragile(&source);
    let seen = log();
    let _listener = derived.subscribe({
        let seen = seen.clone();
        move |change: &Change<i32>| {
            seen.borrow_mut()
                .push(format!("{} -> {}", change.old_value(), change.new_value()))
        }
    });

    source.set(2);

    {
        let errors = recorder.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ReactiveError::Evaluation { .. }));
        assert!(errors[0].to_string().contains("cannot derive from 2"));
    }
    assert!(derived.is_dirty());
    assert!(seen.borrow().is_empty());
    let retried = derived.try_get();
    assert!(matches!(retried, Err(ReactiveError::Evaluation { .. })));

    source.set(3);
    assert_eq!(derived.get(), 6);
    assert!(!derived.is_dirty());
}

#[test]
#[traced_test]
fn failed_recompute_without_error_hook_is_logged() {
    let source = Signal::new(1);
    let derived = fragile(&source);
    let _listener = derived.subscribe(|_: &Change<i32>| {});

    source.set(2);

    assert!(logs_contain("cannot derive from 2"));
    assert!(derived.is_dirty());
}

#[test]
fn failed_async_derivations_reach_the_error_hook() {
    let events = log();
    let recorder = Recorder::new(Hooks::REACTIVE_ERROR, &events);
    let _registration = Registration::add(recorder.clone());
    let rejected = AsyncComputed::new(|| async { Err::<i32, _>(anyhow::anyhow!("offline")) });
    let panicked = AsyncComputed::new(|| async {
        if true {
            panic!("decoder crashed");
        }
        Ok::<i32, anyhow::Error>(0)
    });

    run_until_stalled();

    assert!(rejected.peek_status().error().is_some());
    assert!(panicked.peek_status().error().is_some());
    let errors = recorder.errors.borrow();
    assert_eq!(errors.len(), 2);
    assert!(
        errors
            .iter()
            .all(|error| matches!(error, ReactiveError::AsyncDerivation { .. }))
    );
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    assert!(messages.iter().any(|message| message.contains("offline")));
    assert!(messages.iter().any(|message| message.contains("decoder crashed")));
}

#[test]
fn error_hook_takes_over_from_single_listener_rethrow() {
    let events = log();
    let recorder = Recorder::new(Hooks::REACTIVE_ERROR, &events);
    let _registration = Registration::add(recorder.clone());
    let cell = Signal::new(0);
    cell.add_listener(|_: &Change<i32>| panic!("only listener"));

    let result = catch_unwind(AssertUnwindSafe(|| cell.set(1)));

    assert!(result.is_ok());
    assert_eq!(cell.get(), 1);
    let errors = recorder.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ReactiveError::Listener { .. }));
}

/// Runs the rest of the batch chain twice.
struct Twice;

impl Middleware for Twice {
    fn hooks(&self) -> Hooks {
        Hooks::BATCH
    }

    fn on_batch(&self, batch: &Batch, next: &mut dyn FnMut(&Batch)) {
        next(batch);
        next(batch);
    }
}

#[test]
fn repeated_batch_continuation_keeps_the_listener_failure() {
    let _twice = Registration::add(Rc::new(Twice));
    let cell = Signal::new(0);
    let calls = counter();
    cell.add_listener({
        let calls = calls.clone();
        move |_: &Change<i32>| {
            calls.set(calls.get() + 1);
            panic!("only listener");
        }
    });

    let result = catch_unwind(AssertUnwindSafe(|| cell.set(1)));

    assert!(result.is_err());
    assert_eq!(calls.get(), 1);
}

/// Doubles every `i32` written through it.
struct Doubler;

impl Middleware for Doubler {
    fn hooks(&self) -> Hooks {
        Hooks::SET
    }

    fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
        if let Some(value) = call.value_mut::<i32>() {
            *value *= 2;
        }
        next(call);
    }
}

/// Drops writes of negative numbers.
struct RejectNegative;

impl Middleware for RejectNegative {
    fn hooks(&self) -> Hooks {
        Hooks::SET
    }

    fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
        if call.value::<i32>().is_some_and(|value| *value < 0) {
            return;
        }
        next(call);
    }
}

#[test]
fn set_middleware_can_veto_and_rewrite() {
    let _reject = Registration::add(Rc::new(RejectNegative));
    let _double = Registration::add(Rc::new(Doubler));
    let cell = Signal::new(0);

    cell.set(3);
    assert_eq!(cell.get(), 6);

    cell.set(-1);
    assert_eq!(cell.get(), 6);

    // Values of other types pass through untouched.
    let text = Signal::new(String::new());
    text.set("hi".to_string());
    assert_eq!(text.get(), "hi");
}

#[test]
fn reset_runtime_drops_middleware() {
    let events = log();
    middleware::add(Recorder::new(Hooks::INIT, &events));
    assert_eq!(middleware::len(), 1);

    reset_runtime();

    assert!(middleware::is_empty());
    let _cell = Signal::new(0);
    assert!(events.borrow().is_empty());
}

/// Removes its middleware when dropped.
struct Registration<M: Middleware> {
    middleware: Rc<M>,
}

impl<M: Middleware> Registration<M> {
    fn add(middleware: Rc<M>) -> Self {
        middleware::add(middleware.clone());
        Self { middleware }
    }
}

impl<M: Middleware> Drop for Registration<M> {
    fn drop(&mut self) {
        middleware::remove(&self.middleware);
    }
}
