use std::rc::Rc;

use crate::change::Batch;
use crate::error::ReactiveError;
use crate::info::CellInfo;
use crate::listener::ListenerContext;
use crate::middleware::{GraphChange, Hooks, Middleware, SetCall};

const REDACTED: &str = "<redacted>";

/// Middleware that logs every engine hook through `tracing`.
///
/// Values of cells created with [`SignalOptions::sensitive`](crate::SignalOptions::sensitive)
/// are replaced by `<redacted>`.
#[derive(Debug, Default)]
pub struct TracingMiddleware {
    _private: (),
}

impl TracingMiddleware {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

fn names(cells: &[CellInfo]) -> String {
    let names: Vec<String> = cells.iter().map(ToString::to_string).collect();
    names.join(", ")
}

impl Middleware for TracingMiddleware {
    fn hooks(&self) -> Hooks {
        Hooks::all()
    }

    fn on_set(&self, call: &mut SetCall<'_>, next: &mut dyn FnMut(&mut SetCall<'_>)) {
        next(call);
        let cell = call.cell();
        let Some(change) = call.change() else {
            tracing::trace!(cell = %cell, "set without effect");
            return;
        };
        if cell.is_sensitive() {
            tracing::debug!(cell = %cell, change = REDACTED, "set");
        } else {
            tracing::debug!(cell = %cell, change = %change.describe(), "set");
        }
    }

    fn on_batch(&self, batch: &Batch, next: &mut dyn FnMut(&Batch)) {
        tracing::debug!(batch = batch.id(), entries = batch.len(), "batch committed");
        for entry in batch.entries() {
            let cell = entry.cell();
            if cell.is_sensitive() {
                tracing::trace!(batch = batch.id(), cell = %cell, change = REDACTED, "batch entry");
            } else {
                tracing::trace!(
                    batch = batch.id(),
                    cell = %cell,
                    change = %entry.change().describe(),
                    "batch entry"
                );
            }
        }
        next(batch);
    }

    fn on_dispose(&self, cell: &CellInfo) {
        tracing::debug!(cell = %cell, "disposed");
    }

    fn on_init(&self, cell: &CellInfo) {
        tracing::debug!(
            cell = %cell,
            kind = ?cell.kind(),
            type_name = cell.type_name(),
            "created"
        );
    }

    fn on_graph_change(&self, change: &GraphChange) {
        tracing::trace!(
            cell = %change.cell,
            added = %names(&change.added),
            removed = %names(&change.removed),
            "dependencies changed"
        );
    }

    fn started_listening(&self, cell: &CellInfo, context: &ListenerContext) {
        tracing::debug!(cell = %cell, kind = context.kind(), id = ?context.id(), "started listening");
    }

    fn stopped_listening(&self, cell: &CellInfo, context: &ListenerContext) {
        tracing::debug!(cell = %cell, kind = context.kind(), id = ?context.id(), "stopped listening");
    }

    fn on_reactive_error(&self, error: &ReactiveError) {
        tracing::error!(cell = %error.cell(), "{error}");
    }
}
