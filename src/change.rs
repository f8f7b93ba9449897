//! Change records handed to listeners and middleware.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::SystemTime;

use crate::info::CellInfo;
use crate::transaction::run_in_batch;

/// Writes a value back into the cell a change came from.
pub(crate) type Writer<T> = Rc<dyn Fn(T)>;

/// A single observed transition of a cell from `old` to `new`.
///
/// Listeners receive the coalesced change of a whole cycle: `old` is the value
/// before the first mutation, `new` the value after the last one. Changes
/// recorded for middleware additionally carry a writer, which makes them
/// restorable (undo) and re-appliable (redo).
pub struct Change<T> {
    timestamp: SystemTime,
    old: T,
    new: T,
    writer: Option<Writer<T>>,
    stopped: Cell<bool>,
}

impl<T> Change<T> {
    pub(crate) fn new(old: T, new: T) -> Self {
        Self {
            timestamp: SystemTime::now(),
            old,
            new,
            writer: None,
            stopped: Cell::new(false),
        }
    }

    pub(crate) fn with_writer(mut self, writer: Writer<T>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn old_value(&self) -> &T {
        &self.old
    }

    pub fn new_value(&self) -> &T {
        &self.new
    }

    /// Type tag of the changed value.
    pub fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    /// Prevent the remaining listeners of this notification from running.
    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }

    pub fn can_restore(&self) -> bool {
        self.writer.is_some()
    }
}

impl<T: Clone> Change<T> {
    /// Write the old value back. Returns false if the change is not restorable.
    pub fn restore(&self) -> bool {
        self.write(self.old.clone())
    }

    /// Write the new value again. Returns false if the change is not restorable.
    pub fn reapply(&self) -> bool {
        self.write(self.new.clone())
    }

    fn write(&self, value: T) -> bool {
        match &self.writer {
            Some(writer) => {
                writer(value);
                true
            }
            None => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Change<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Change")
            .field("old", &self.old)
            .field("new", &self.new)
            .field("restorable", &self.writer.is_some())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

/// Type-erased view of a [`Change`], used where changes of different value
/// types travel together (batches, middleware).
pub trait AnyChange {
    fn timestamp(&self) -> SystemTime;
    fn type_name(&self) -> &'static str;
    fn can_restore(&self) -> bool;
    fn restore(&self) -> bool;
    fn reapply(&self) -> bool;
    /// `old -> new` rendered with `Debug`.
    fn describe(&self) -> String;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + fmt::Debug + 'static> AnyChange for Change<T> {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn type_name(&self) -> &'static str {
        Change::type_name(self)
    }

    fn can_restore(&self) -> bool {
        Change::can_restore(self)
    }

    fn restore(&self) -> bool {
        Change::restore(self)
    }

    fn reapply(&self) -> bool {
        Change::reapply(self)
    }

    fn describe(&self) -> String {
        format!("{:?} -> {:?}", self.old, self.new)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyChange + '_ {
    /// Recover the typed change.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&Change<T>> {
        self.as_any().downcast_ref()
    }
}

/// One mutation inside a [`Batch`].
#[derive(Clone)]
pub struct BatchEntry {
    cell: CellInfo,
    change: Rc<dyn AnyChange>,
}

impl BatchEntry {
    pub(crate) fn new(cell: CellInfo, change: Rc<dyn AnyChange>) -> Self {
        Self { cell, change }
    }

    pub fn cell(&self) -> &CellInfo {
        &self.cell
    }

    pub fn change(&self) -> &dyn AnyChange {
        &*self.change
    }

    /// Shared handle to the change, for middleware that keeps it around.
    pub fn shared_change(&self) -> Rc<dyn AnyChange> {
        Rc::clone(&self.change)
    }
}

impl fmt::Debug for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEntry")
            .field("cell", &self.cell)
            .field("type_name", &self.change.type_name())
            .finish()
    }
}

/// The composite notification of a committed batch.
///
/// Entries are every mutation performed inside the batch (including those
/// induced while the batch settled), in mutation order. A cell mutated twice
/// appears twice.
pub struct Batch {
    id: u64,
    entries: Vec<BatchEntry>,
    stopped: Cell<bool>,
}

impl Batch {
    pub(crate) fn new(id: u64, entries: Vec<BatchEntry>) -> Self {
        Self {
            id,
            entries,
            stopped: Cell::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Suppress the rest of the middleware chain and the default listener
    /// notification for this batch.
    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Restore every entry, newest first, as a single new batch.
    ///
    /// Returns the number of entries that could be restored.
    pub fn restore(&self) -> usize {
        restore_all(self.entries.iter().map(|entry| &entry.change))
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("entries", &self.entries)
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

/// Restore `changes` newest first inside one batch.
pub(crate) fn restore_all<'a, I>(changes: I) -> usize
where
    I: DoubleEndedIterator<Item = &'a Rc<dyn AnyChange>>,
{
    run_in_batch(|| changes.rev().filter(|change| change.restore()).count())
}

/// Re-apply `changes` oldest first inside one batch.
pub(crate) fn reapply_all<'a, I>(changes: I) -> usize
where
    I: Iterator<Item = &'a Rc<dyn AnyChange>>,
{
    run_in_batch(|| changes.filter(|change| change.reapply()).count())
}
