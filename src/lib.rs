//! Fine-grained reactive state with glitch-free propagation.
//!
//! Cells hold values, derivations discover what they read, and every change
//! reaches each dependent exactly once, in dependency order, after all of its
//! inputs are up to date. Middleware can observe and rewrite what flows
//! through the engine without touching it.
//!
//! # Quick Start
//!
//! ```ignore
//! use cellflow::{Computed, Signal, run_in_batch};
//!
//! let width = Signal::new(3);
//! let height = Signal::new(4);
//!
//! // Dependencies are discovered while the closure runs
//! let area = Computed::new({
//!     let (width, height) = (width.clone(), height.clone());
//!     move || width.get() * height.get()
//! });
//!
//! let _log = area.subscribe(|change| {
//!     println!("area {} -> {}", change.old_value(), change.new_value());
//! });
//!
//! // One notification for both writes: "area 12 -> 30"
//! run_in_batch(|| {
//!     width.set(5);
//!     height.set(6);
//! });
//! ```
//!
//! # Core Types
//!
//! - [`Signal<T>`] - Mutable cell. Setting an equal value is a no-op.
//! - [`Computed<T>`] - Memoized derivation. Lazy until observed.
//! - [`AsyncComputed<T>`] - Derivation backed by a future, with an
//!   [`AsyncStatus`] and out-of-order results discarded by generation.
//! - [`Change<T>`] - What a listener receives: old and new value, restorable
//!   when produced for middleware.
//! - [`Batch`] - Every change committed by one [`run_in_batch`] call.
//!
//! # Batching
//!
//! ```ignore
//! run_in_batch(|| {
//!     a.set(1);
//!     b.set(2);
//!     a.set(3);
//! });
//! // Listeners of `a` see one change, from the value before the batch to 3.
//! // Middleware see one batch with three entries, in order.
//! ```
//!
//! Batches nest; only the outermost one commits.
//!
//! # Middleware
//!
//! ```ignore
//! let history = HistoryMiddleware::new();
//! middleware::add(history.clone());
//! middleware::add_with_token("trace", TracingMiddleware::new());
//!
//! count.set(10);
//! history.undo();
//! ```
//!
//! See [`middleware`] for writing your own.
//!
//! # Threading
//!
//! The graph belongs to the thread that created it; handles are `!Send`.
//! Async derivations run on the thread-local [`executor`], driven with
//! [`run_until_stalled`] or [`block_on`], or routed into an existing local
//! runtime through [`set_spawner`].

pub(crate) mod arena;
mod async_computed;
mod change;
mod computed;
mod diagnostics;
mod error;
pub mod executor;
mod hash;
mod history;
mod info;
mod listener;
pub mod middleware;
mod signal;
mod transaction;

// Cells
pub use async_computed::{AsyncComputed, AsyncOptions, AsyncStatus};
pub use computed::{Computed, ComputedOptions};
pub use signal::{Signal, SignalOptions};

// Changes and batches
pub use change::{AnyChange, Batch, BatchEntry, Change};
pub use transaction::{Transaction, batch_depth, is_batch_active, run_in_batch};

// Metadata and errors
pub use error::{AsyncError, ReactiveError};
pub use info::{CellInfo, CellKind};
pub use listener::{ListenerContext, ListenerId, Subscription};

// Middleware
pub use diagnostics::TracingMiddleware;
pub use history::HistoryMiddleware;
pub use middleware::{GraphChange, Hooks, Middleware, SetCall};

// Key functions
pub use arena::untracked;
pub use executor::{block_on, clear_spawner, run_until_stalled, set_spawner, spawn_local};

/// Reset the current thread's runtime.
///
/// Drops every registered middleware, any open tracking frames and batch
/// state, and every task still pending on the local executor. Cells created
/// before the reset keep working but are no longer part of a batch that was
/// open. Meant for isolating tests.
pub fn reset_runtime() {
    transaction::reset();
    arena::tracking::reset();
    middleware::reset();
    executor::reset();
    tracing::debug!("reactive runtime reset");
}

#[cfg(test)]
mod tests;
