//! Local executor for async derivations
//!
//! Async computeds never touch the graph from another thread. Their futures
//! are spawned onto a per-thread [`LocalPool`], so every poll, and therefore
//! every read, status change and notification, happens on the thread that
//! owns the cells. Wakers may fire from anywhere; the work still runs here.
//!
//! ## Driving the pool
//!
//! ```ignore
//! let c = Signal::new(1);
//! let doubled = AsyncComputed::new({
//!     let c = c.clone();
//!     move || {
//!         let value = c.get();
//!         async move { Ok::<_, anyhow::Error>(value * 2) }
//!     }
//! });
//!
//! run_until_stalled();                       // poll ready tasks
//! assert_eq!(block_on(doubled.settled()), Ok(2));
//! ```
//!
//! ## Custom spawners
//!
//! Applications that already run a single-threaded runtime can route
//! derivations into it instead:
//!
//! ```ignore
//! set_spawner(|future| {
//!     tokio::task::spawn_local(future);
//! });
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::{LocalSpawnExt, SpawnError};

type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

struct Executor {
    pool: RefCell<LocalPool>,
    spawner: RefCell<LocalSpawner>,
    custom: RefCell<Option<Spawner>>,
}

impl Executor {
    fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            pool: RefCell::new(pool),
            spawner: RefCell::new(spawner),
            custom: RefCell::new(None),
        }
    }
}

thread_local! {
    static EXECUTOR: Executor = Executor::new();
}

/// Spawn a task on this thread's executor.
///
/// Uses the spawner installed with [`set_spawner`] if there is one, the
/// built-in pool otherwise.
pub fn spawn_local<F>(future: F) -> Result<(), SpawnError>
where
    F: Future<Output = ()> + 'static,
{
    EXECUTOR.with(|executor| {
        let custom = executor.custom.borrow().clone();
        match custom {
            Some(spawn) => {
                spawn(Box::pin(future));
                Ok(())
            }
            None => executor.spawner.borrow().spawn_local(future),
        }
    })
}

/// Route future derivations through `spawn` instead of the built-in pool.
pub fn set_spawner<F>(spawn: F)
where
    F: Fn(LocalBoxFuture<'static, ()>) + 'static,
{
    EXECUTOR.with(|executor| {
        *executor.custom.borrow_mut() = Some(Rc::new(spawn));
    });
}

/// Go back to the built-in pool.
pub fn clear_spawner() {
    EXECUTOR.with(|executor| {
        executor.custom.borrow_mut().take();
    });
}

/// Poll every task on the built-in pool until none can make progress.
///
/// # Panics
/// Panics if called from inside a task running on the pool.
pub fn run_until_stalled() {
    EXECUTOR.with(|executor| {
        let mut pool = executor
            .pool
            .try_borrow_mut()
            .unwrap_or_else(|_| panic!("run_until_stalled called from inside a pool task"));
        pool.run_until_stalled();
    });
}

/// Drive the built-in pool until `future` completes.
///
/// # Panics
/// Panics if called from inside a task running on the pool.
pub fn block_on<F: Future>(future: F) -> F::Output {
    EXECUTOR.with(|executor| {
        let mut pool = executor
            .pool
            .try_borrow_mut()
            .unwrap_or_else(|_| panic!("block_on called from inside a pool task"));
        pool.run_until(future)
    })
}

/// Replace the pool (dropping every pending task) and forget any custom
/// spawner. Part of [`reset_runtime`](crate::reset_runtime).
pub(crate) fn reset() {
    let _ = EXECUTOR.try_with(|executor| {
        let Ok(mut pool) = executor.pool.try_borrow_mut() else {
            return;
        };
        let fresh = LocalPool::new();
        *executor.spawner.borrow_mut() = fresh.spawner();
        let stale = std::mem::replace(&mut *pool, fresh);
        drop(pool);
        executor.custom.borrow_mut().take();
        drop(stale);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use std::cell::Cell;

    #[test]
    fn spawned_tasks_run_when_the_pool_is_driven() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        spawn_local(async move { flag.set(true) }).unwrap();

        assert!(!ran.get());
        run_until_stalled();
        assert!(ran.get());
    }

    #[test]
    fn block_on_drives_spawned_tasks() {
        let (tx, rx) = oneshot::channel();
        spawn_local(async move {
            let _ = tx.send(7);
        })
        .unwrap();

        assert_eq!(block_on(rx), Ok(7));
    }

    #[test]
    fn custom_spawner_receives_tasks() {
        let spawned = Rc::new(Cell::new(0));
        let count = spawned.clone();
        set_spawner(move |_future| count.set(count.get() + 1));

        spawn_local(async {}).unwrap();
        assert_eq!(spawned.get(), 1);

        clear_spawner();
        spawn_local(async {}).unwrap();
        assert_eq!(spawned.get(), 1);
    }

    #[test]
    fn reset_drops_pending_tasks() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        spawn_local(async move { flag.set(true) }).unwrap();

        reset();
        run_until_stalled();
        assert!(!ran.get());
    }
}
