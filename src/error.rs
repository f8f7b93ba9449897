use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::info::CellInfo;

/// Errors surfaced by the reactive engine.
///
/// Only [`ReactiveError::Evaluation`] and [`ReactiveError::CircularDependency`]
/// ever reach a caller directly (through [`Computed::try_get`](crate::Computed::try_get)).
/// Listener failures are routed to [`Middleware::on_reactive_error`](crate::Middleware::on_reactive_error),
/// async failures become [`AsyncStatus::Error`](crate::AsyncStatus::Error), and
/// operations on disposed cells are silent no-ops.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A computed's derive function panicked.
    #[error("evaluation of {cell} panicked: {message}")]
    Evaluation { cell: CellInfo, message: String },

    /// A listener panicked while being notified.
    #[error("listener on {cell} panicked: {message}")]
    Listener {
        cell: CellInfo,
        message: String,
        trace: Rc<str>,
    },

    /// An async derivation returned an error or panicked.
    #[error("async derivation of {cell} failed: {error}")]
    AsyncDerivation {
        cell: CellInfo,
        #[source]
        error: AsyncError,
    },

    /// The cell was closed.
    #[error("{cell} is disposed")]
    Disposed { cell: CellInfo },

    /// A computed was read while its own evaluation was running.
    #[error("circular dependency: {cell} was read while it was being evaluated")]
    CircularDependency { cell: CellInfo },
}

impl ReactiveError {
    /// The cell the error originated from.
    pub fn cell(&self) -> &CellInfo {
        match self {
            ReactiveError::Evaluation { cell, .. }
            | ReactiveError::Listener { cell, .. }
            | ReactiveError::AsyncDerivation { cell, .. }
            | ReactiveError::Disposed { cell }
            | ReactiveError::CircularDependency { cell } => cell,
        }
    }

    /// Captured trace, if the error kind carries one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            ReactiveError::Listener { trace, .. } => Some(trace),
            ReactiveError::AsyncDerivation { error, .. } => Some(error.trace()),
            _ => None,
        }
    }
}

/// Failure of an async derivation, stored in [`AsyncStatus::Error`](crate::AsyncStatus::Error).
///
/// Cheap to clone; clones compare equal to each other.
#[derive(Clone)]
pub struct AsyncError {
    error: Rc<anyhow::Error>,
    trace: Rc<str>,
}

impl AsyncError {
    pub(crate) fn new(error: anyhow::Error) -> Self {
        let trace = error.backtrace().to_string();
        Self {
            error: Rc::new(error),
            trace: trace.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            error: Rc::new(anyhow::anyhow!("derivation panicked: {message}")),
            trace: capture_trace(),
        }
    }

    pub(crate) fn closed() -> Self {
        Self {
            error: Rc::new(anyhow::anyhow!("async computed was closed before settling")),
            trace: Rc::from(""),
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref()
    }
}

impl PartialEq for AsyncError {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.error, f)
    }
}

impl fmt::Debug for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncError")
            .field("error", &format_args!("{:#}", self.error))
            .finish_non_exhaustive()
    }
}

impl std::error::Error for AsyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Extract the human readable part of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

pub(crate) fn capture_trace() -> Rc<str> {
    Backtrace::capture().to_string().into()
}
