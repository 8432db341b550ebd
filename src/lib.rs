//! A skiplist is a way of storing sorted elements in such a way that they can
//! be accessed, inserted and removed, all in `O(log(n))` on average.
//!
//! Conceptually, a skiplist resembles something like:
//!
//! ```text
//! <head> ----------> [2] --------------------------------------------------> [9] ---------->
//! <head> ----------> [2] ------------------------------------[7] ----------> [9] ---------->
//! <head> ----------> [2] ----------> [4] ------------------> [7] ----------> [9] --> [10] ->
//! <head> --> [1] --> [2] --> [3] --> [4] --> [5] --> [6] --> [7] --> [8] --> [9] --> [10] ->
//! ```
//!
//! where each node `[x]` has references to nodes further along the list,
//! allowing a search to skip ahead.
//!
//! This crate adds a twist for machines whose memory is split into a small,
//! fast *local* region and a large, slow *far* (swappable) region: the same
//! level structure that accelerates searches also tells us which nodes are
//! crossed most often. [`SkipMap`] therefore keeps a priority order over its
//! nodes (tall towers first, larger keys first within a height) and pins a
//! prefix of that order into the local region, relocating nodes between the
//! tiers as the map grows and shrinks. The remaining far nodes can be
//! compacted into page-sized clusters with [`SkipMap::batch_block`], and the
//! resulting layout inspected with [`SkipMap::analyze_edges`] and
//! [`SkipMap::analyze_locality_in_traversal`].
//!
//! Storage comes from a [`CollectiveAllocator`], a family of suballocators
//! that each own a distinct address range; [`Collective`] is the bundled
//! implementation. Node heights come from a [`LevelGenerator`], by default
//! [`LeadingZeros`]. Both are injectable, mainly so that tests can be
//! deterministic.
//!
//! ```
//! use tiered_skiplist::SkipMap;
//!
//! // A map whose local tier may hold up to a mebibyte.
//! let mut map = SkipMap::new(1 << 20)?;
//! map.insert(1954, "Turing")?;
//! map.insert(1912, "Church")?;
//! assert_eq!(map.front(), Some((&1912, &"Church")));
//! # Ok::<(), tiered_skiplist::Error>(())
//! ```

mod collective;
mod level_generator;
mod skipmap;
mod skipnode;

pub use collective::{
    Collective, CollectiveAllocator, PAGE_SIZE, Relocation, Suballocator, SuballocatorTag,
};
pub use level_generator::{LeadingZeros, LevelGenerator, MAX_LEVEL};
pub use skipmap::{EdgeCounts, Error, SkipMap, TraversalCounts};
pub use skipnode::{Iter, IterMut};
