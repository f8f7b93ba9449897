//! Zero-sized hash builder for the graph's internal collections.
//!
//! Node ids are small dense integers handed out by the arena, so HashDoS
//! resistance is irrelevant and a fixed-seed foldhash is the fastest option.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::IndexSet;

use crate::arena::NodeId;

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// All instances produce identical hash values, so sets built from it can be
/// compared and rebuilt without carrying hasher state around.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2d35_8dcc_aa6c_78a5).build_hasher()
    }
}

/// Insertion-ordered set of graph nodes.
///
/// Ordering matters: dependency diffs and change lists are replayed in the
/// order nodes were first seen.
pub(crate) type NodeSet = IndexSet<NodeId, FastHashBuilder>;

pub(crate) fn node_set() -> NodeSet {
    IndexSet::with_hasher(FastHashBuilder)
}
