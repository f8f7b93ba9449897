// Arena-based storage for the reactive graph
//
// This module provides:
// - Node arena: one slab of NodeMetadata per thread, shared by signals,
//   computeds and async computeds (graph edges, depth, dirty state)
// - Tracking stack: the ambient capture context that records which nodes are
//   read while a derivation runs
//
// NodeId is a lightweight newtype that indexes into the slab. Values never
// live in the arena; they stay in the typed handles.

pub mod node_arena;
pub mod tracking;

pub use node_arena::{
    NodeId, NodeMetadata, ReactiveNode, ReactiveState, apply_dependency_diff, detach,
    node_arena_insert, node_arena_remove, remove_edge,
};

pub use tracking::{TrackedReads, TrackingGuard, is_evaluating, track_read, untracked};
