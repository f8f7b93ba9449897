use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide id counter. Ids are never reused, even though arena slots are.
static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

fn next_cell_id() -> u64 {
    NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)
}

/// What kind of node a [`CellInfo`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// A writable [`Signal`](crate::Signal).
    Signal,
    /// A synchronous [`Computed`](crate::Computed).
    Computed,
    /// An [`AsyncComputed`](crate::AsyncComputed).
    AsyncComputed,
}

/// Shared, cheaply clonable description of a reactive cell.
///
/// This is what middleware, listener errors and diagnostics get to see. It
/// never exposes the value itself, so it can be handed out for sensitive cells.
#[derive(Clone)]
pub struct CellInfo {
    inner: Rc<CellInfoInner>,
}

struct CellInfoInner {
    id: u64,
    name: Option<Rc<str>>,
    kind: CellKind,
    type_name: &'static str,
    sensitive: bool,
    owner_id: Cell<Option<u64>>,
    disposed: Cell<bool>,
}

impl CellInfo {
    pub(crate) fn new<T: 'static>(
        kind: CellKind,
        name: Option<Rc<str>>,
        owner_id: Option<u64>,
        sensitive: bool,
    ) -> Self {
        Self {
            inner: Rc::new(CellInfoInner {
                id: next_cell_id(),
                name,
                kind,
                type_name: std::any::type_name::<T>(),
                sensitive,
                owner_id: Cell::new(owner_id),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Unique, monotonically increasing id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Optional debug name.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn kind(&self) -> CellKind {
        self.inner.kind
    }

    /// Type name of the value held by the cell.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// Whether diagnostics must redact this cell's values.
    pub fn is_sensitive(&self) -> bool {
        self.inner.sensitive
    }

    /// Id of the external owner that claimed this cell, if any.
    pub fn owner_id(&self) -> Option<u64> {
        self.inner.owner_id.get()
    }

    /// Claim (or release) ownership of the cell.
    ///
    /// Intended to be called from [`Middleware::on_init`](crate::Middleware::on_init),
    /// which runs before the constructor returns.
    pub fn set_owner(&self, owner_id: Option<u64>) {
        self.inner.owner_id.set(owner_id);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.set(true);
    }

    /// Whether two infos describe the same cell.
    pub fn same_cell(&self, other: &CellInfo) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for CellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "#{} '{}'", self.id(), name),
            None => write!(f, "#{}", self.id()),
        }
    }
}

impl fmt::Debug for CellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellInfo")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("type_name", &self.type_name())
            .field("sensitive", &self.is_sensitive())
            .field("owner_id", &self.owner_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
