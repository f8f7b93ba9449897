// Node arena - storage for graph metadata of every reactive cell
//
// Each node records:
// - sources: the nodes it read during its last successful evaluation
// - subscribers: the derived nodes that read it
// - depth: 0 for signals, 1 + max(depth of sources) for derived nodes
// - state: Clean/Dirty for lazy recomputation
// - listeners: number of external listeners (drives "active")
// - handle: weak, type-erased pointer back to the typed cell
//
// Edges are only ever created by the tracking stack (reads during an
// evaluation) and removed by dependency diffs or disposal. Nothing outside the
// engine splices the graph directly.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slab::Slab;

use crate::hash::{NodeSet, node_set};
use crate::info::CellInfo;
use crate::listener::{ListenerContext, NotifyReport};
use crate::middleware::{self, GraphChange, Hooks};

/// Reactive node states.
///
/// Dirty means a source changed since the last evaluation. Active nodes are
/// brought back to Clean during the settle pass; inactive ones stay Dirty
/// until they are read.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactiveState {
    /// Value is current, use cached
    Clean = 0,
    /// A dependency changed, must recompute before the next read
    Dirty = 1,
}

/// Type-erased operations the propagation engine performs on a typed cell.
pub trait ReactiveNode {
    /// Bring a dirty node up to date. Implementations report an observable
    /// change through [`crate::transaction::node_changed`].
    fn refresh(&self);

    /// Deliver the change accumulated during the cycle to listeners, or drop
    /// it when `deliver` is false.
    fn flush(&self, report: &mut NotifyReport, deliver: bool);

    /// Called after the subscriber set of this node changed.
    fn observers_changed(&self) {}
}

thread_local! {
    static NODE_ARENA: RefCell<Slab<NodeMetadata>> = const { RefCell::new(Slab::new()) };
}

/// Unique identifier for a node in the arena.
///
/// This is a zero-cost wrapper around a slab index. The slot is only freed
/// when the owning handle is dropped, so a live handle never observes a
/// reused id.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(u32);

/// Graph metadata for a node stored in the arena.
pub struct NodeMetadata {
    pub(crate) info: CellInfo,
    pub(crate) state: ReactiveState,
    pub(crate) depth: u32,
    /// Eager nodes are recomputed during settle even without observers.
    pub(crate) eager: bool,
    pub(crate) listeners: usize,
    pub(crate) sources: NodeSet,
    pub(crate) subscribers: NodeSet,
    pub(crate) handle: Option<Weak<dyn ReactiveNode>>,
}

impl NodeMetadata {
    pub fn new(info: CellInfo, depth: u32, eager: bool) -> Self {
        Self {
            info,
            state: ReactiveState::Clean,
            depth,
            eager,
            listeners: 0,
            sources: node_set(),
            subscribers: node_set(),
            handle: None,
        }
    }

    fn is_active(&self) -> bool {
        self.eager || self.listeners > 0 || !self.subscribers.is_empty()
    }
}

impl NodeId {
    /// Create a new NodeId from a raw index
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the node metadata with a closure (read-only)
    ///
    /// Returns None if the node has been removed, or if the arena is gone
    /// because the thread is shutting down.
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&NodeMetadata) -> R,
    {
        NODE_ARENA
            .try_with(|arena| arena.borrow().get(self.index()).map(f))
            .ok()
            .flatten()
    }

    /// Access the node metadata with a closure (mutable)
    pub fn with_mut<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut NodeMetadata) -> R,
    {
        NODE_ARENA
            .try_with(|arena| arena.borrow_mut().get_mut(self.index()).map(f))
            .ok()
            .flatten()
    }

    pub fn info(self) -> Option<CellInfo> {
        self.with(|meta| meta.info.clone())
    }

    pub fn state(self) -> ReactiveState {
        self.with(|meta| meta.state)
            .unwrap_or(ReactiveState::Clean)
    }

    pub fn set_state(self, state: ReactiveState) {
        self.with_mut(|meta| meta.state = state);
    }

    pub fn depth(self) -> u32 {
        self.with(|meta| meta.depth).unwrap_or(0)
    }

    pub fn is_disposed(self) -> bool {
        self.with(|meta| meta.info.is_disposed()).unwrap_or(true)
    }

    /// Active nodes have someone downstream: an external listener, a
    /// dependent node, or the eager flag.
    pub fn is_active(self) -> bool {
        self.with(NodeMetadata::is_active).unwrap_or(false)
    }

    pub fn has_subscribers(self) -> bool {
        self.with(|meta| !meta.subscribers.is_empty())
            .unwrap_or(false)
    }

    pub fn listener_count(self) -> usize {
        self.with(|meta| meta.listeners).unwrap_or(0)
    }

    pub fn set_listener_count(self, count: usize) {
        self.with_mut(|meta| meta.listeners = count);
    }

    /// Snapshot of the dependents, in subscription order.
    pub fn subscribers(self) -> Vec<NodeId> {
        self.with(|meta| meta.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the dependencies, in first-read order.
    pub fn sources(self) -> Vec<NodeId> {
        self.with(|meta| meta.sources.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_handle(self, handle: Weak<dyn ReactiveNode>) {
        self.with_mut(|meta| meta.handle = Some(handle));
    }

    /// Upgrade the type-erased handle. None once the typed cell is gone.
    pub fn handle(self) -> Option<Rc<dyn ReactiveNode>> {
        self.with(|meta| meta.handle.as_ref().and_then(Weak::upgrade))
            .flatten()
    }

    fn notify_observers_changed(self) {
        if let Some(handle) = self.handle() {
            handle.observers_changed();
        }
    }
}

/// Insert a node into the arena and return its ID
pub fn node_arena_insert(metadata: NodeMetadata) -> NodeId {
    NODE_ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        let entry = arena.vacant_entry();
        let key = entry.key();
        entry.insert(metadata);
        NodeId::new(key as u32)
    })
}

/// Remove a node from the arena
pub fn node_arena_remove(id: NodeId) -> Option<NodeMetadata> {
    NODE_ARENA
        .try_with(|arena| arena.borrow_mut().try_remove(id.index()))
        .ok()
        .flatten()
}

// =========================================================================
// Graph edges
// =========================================================================

/// Subscribe `dependent` to `source`.
///
/// Returns true if the edge is new. Edges to disposed nodes are refused so a
/// closed cell can never be re-attached by a late read.
pub fn add_edge(source: NodeId, dependent: NodeId) -> bool {
    let inserted = NODE_ARENA
        .try_with(|arena| {
            let mut arena = arena.borrow_mut();
            if !arena.contains(dependent.index()) {
                return false;
            }
            let Some(meta) = arena.get_mut(source.index()) else {
                return false;
            };
            if meta.info.is_disposed() || !meta.subscribers.insert(dependent) {
                return false;
            }
            arena[dependent.index()].sources.insert(source);
            true
        })
        .unwrap_or(false);

    if inserted {
        source.notify_observers_changed();
    }
    inserted
}

/// Remove the edge between `source` and `dependent`.
pub fn remove_edge(source: NodeId, dependent: NodeId) -> bool {
    let removed = NODE_ARENA
        .try_with(|arena| {
            let mut arena = arena.borrow_mut();
            let removed = arena
                .get_mut(source.index())
                .is_some_and(|meta| meta.subscribers.shift_remove(&dependent));
            if let Some(meta) = arena.get_mut(dependent.index()) {
                meta.sources.shift_remove(&source);
            }
            removed
        })
        .unwrap_or(false);

    if removed {
        source.notify_observers_changed();
    }
    removed
}

/// Reconcile `node`'s sources with the reads of its last successful pass.
///
/// Edges for new reads already exist (the tracking stack subscribes on first
/// read); this removes the edges that were not read again, recomputes the
/// depth and reports the difference to middleware.
pub fn apply_dependency_diff(node: NodeId, reads: &NodeSet, added: &[NodeId]) {
    let stale: Vec<NodeId> = node
        .with(|meta| {
            meta.sources
                .iter()
                .filter(|source| !reads.contains(*source))
                .copied()
                .collect()
        })
        .unwrap_or_default();

    for &source in &stale {
        remove_edge(source, node);
    }

    let depth = 1 + reads.iter().map(|source| source.depth()).max().unwrap_or(0);
    set_depth(node, depth);

    if !stale.is_empty() || !added.is_empty() {
        cov_mark::hit!(dependency_set_changed);
        report_graph_change(node, added, &stale);
    }
}

/// Set a node's depth, pushing dependents down when it grows so that a
/// dependent always sorts after everything it reads.
fn set_depth(node: NodeId, depth: u32) {
    let previous = node.with_mut(|meta| std::mem::replace(&mut meta.depth, depth));
    if previous.is_none_or(|previous| depth <= previous) {
        return;
    }

    let mut worklist = vec![node];
    while let Some(current) = worklist.pop() {
        let floor = current.depth() + 1;
        for dependent in current.subscribers() {
            let raised = dependent
                .with_mut(|meta| {
                    if meta.depth < floor {
                        meta.depth = floor;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if raised {
                worklist.push(dependent);
            }
        }
    }
}

/// Remove a node from the graph entirely: unsubscribe from every source and
/// drop it from every dependent's source set.
pub fn detach(node: NodeId) {
    let sources = node.sources();
    let subscribers = node.subscribers();

    for &source in &sources {
        remove_edge(source, node);
    }
    for &dependent in &subscribers {
        remove_edge(node, dependent);
    }

    if !middleware::has(Hooks::STOPPED_LISTENING | Hooks::GRAPH_CHANGE) {
        return;
    }
    let Some(info) = node.info() else {
        return;
    };

    for source in sources.iter().filter_map(|source| source.info()) {
        middleware::stopped_listening(&source, &ListenerContext::dependency(&info));
    }
    for dependent in subscribers.iter().filter_map(|dependent| dependent.info()) {
        middleware::stopped_listening(&info, &ListenerContext::dependency(&dependent));
        middleware::graph_change(&GraphChange {
            cell: dependent,
            added: Vec::new(),
            removed: vec![info.clone()],
        });
    }
}

fn report_graph_change(node: NodeId, added: &[NodeId], removed: &[NodeId]) {
    if !middleware::has(Hooks::STARTED_LISTENING | Hooks::STOPPED_LISTENING | Hooks::GRAPH_CHANGE)
    {
        return;
    }
    let Some(info) = node.info() else {
        return;
    };
    let added: Vec<CellInfo> = added.iter().filter_map(|id| id.info()).collect();
    let removed: Vec<CellInfo> = removed.iter().filter_map(|id| id.info()).collect();

    let context = ListenerContext::dependency(&info);
    if middleware::has(Hooks::STOPPED_LISTENING) {
        for source in &removed {
            middleware::stopped_listening(source, &context);
        }
    }
    if middleware::has(Hooks::STARTED_LISTENING) {
        for source in &added {
            middleware::started_listening(source, &context);
        }
    }
    if middleware::has(Hooks::GRAPH_CHANGE) {
        middleware::graph_change(&GraphChange {
            cell: info,
            added,
            removed,
        });
    }
}
