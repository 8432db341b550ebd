//! SkipMap stores key-value pairs, with the keys being unique and always
//! sorted, while continuously deciding which storage tier each node should
//! occupy.
//!
//! # Placement priority
//!
//! The map derives a total *priority order* over its nodes from the skip
//! list's own level structure, with no auxiliary index: nodes at the highest
//! populated level come first, larger keys first within a level, and when a
//! ring is exhausted the order continues at the next lower level. Higher
//! towers are crossed by more searches, which is exactly why they deserve the
//! local tier.
//!
//! The set of locally resident nodes is always a contiguous prefix of that
//! order, ending at the *frontier* (`last_local`). Insertions admit new nodes
//! locally when their priority predecessor is local, evicting the frontier to
//! make room; erasures backfill freed local space by promoting the
//! highest-priority far node. Both directions keep the prefix property
//! intact.
//!
//! # Relocation
//!
//! Nodes embed raw neighbor addresses, so moving a node between tiers has a
//! strict protocol: acquire storage in the target tier, transfer the value
//! and link array, then repair both neighbors' pointers at every level before
//! the old storage is released. Callers never observe a half-moved node.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use thiserror::Error;

use crate::collective::{
    Collective, CollectiveAllocator, Relocation, Suballocator, SuballocatorTag,
};
use crate::level_generator::{LeadingZeros, LevelGenerator, MAX_LEVEL};
use crate::skipnode::{Iter, IterMut, Link, SkipNode};

/// Errors surfaced by the map.
///
/// Allocation failures inside best-effort passes (eviction retries, backfill,
/// batch clustering) are consumed locally and never escalate; only an
/// unavoidable allocation can produce this error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Every storage tier refused an allocation that the operation could not
    /// proceed without.
    #[error("out of memory: every storage tier refused the allocation")]
    OutOfMemory,
}

/// Edge classification produced by [`SkipMap::analyze_edges`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EdgeCounts {
    /// Both endpoints reside in the purely-local tier.
    pub purely_local: usize,
    /// Endpoints in different tiers but on the same page.
    pub same_page: usize,
    /// Endpoints on different pages.
    pub diff_pages: usize,
}

impl EdgeCounts {
    /// Total number of classified edges.
    #[must_use]
    pub fn total(&self) -> usize {
        self.purely_local + self.same_page + self.diff_pages
    }
}

/// Simulated traversal cost produced by
/// [`SkipMap::analyze_locality_in_traversal`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalCounts {
    /// Nodes resident in the purely-local tier.
    pub resident_local: usize,
    /// Far nodes whose page was in the simulated cache.
    pub cache_hit: usize,
    /// Far nodes whose page had to be faulted in.
    pub cache_miss: usize,
}

// ////////////////////////////////////////////////////////////////////////////
// SkipMap
// ////////////////////////////////////////////////////////////////////////////

/// An ordered map over a skip list whose nodes are spread across storage
/// tiers by search priority.
///
/// The map behaves as an ordinary sorted map; tiering only changes *where*
/// nodes live, never what the map contains. Memory comes from an injected
/// [`CollectiveAllocator`] and node levels from an injected
/// [`LevelGenerator`], so both are substitutable (and, for tests,
/// deterministic).
///
/// # Examples
///
/// ```
/// use tiered_skiplist::SkipMap;
///
/// let mut map = SkipMap::new(1 << 20)?;
/// map.insert(1, "Hello")?;
/// map.insert(2, "World")?;
/// assert_eq!(map.len(), 2);
/// # Ok::<(), tiered_skiplist::Error>(())
/// ```
pub struct SkipMap<K, V, A = Collective, G = LeadingZeros>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    header: *mut SkipNode<K, V>,
    /// The frontier: lowest-priority node still resident in the local tier,
    /// or the header when nothing is.
    last_local: *mut SkipNode<K, V>,
    len: usize,
    alloc: A,
    level_generator: G,
}

// ///////////////////////////////////////////////
// Inherent methods
// ///////////////////////////////////////////////

impl<K, V> SkipMap<K, V> {
    /// Create a map whose purely-local tier may hold at most
    /// `local_capacity` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if even the header sentinel cannot be
    /// allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use tiered_skiplist::SkipMap;
    ///
    /// let map = SkipMap::<i64, String>::new(1 << 20)?;
    /// assert!(map.is_empty());
    /// # Ok::<(), tiered_skiplist::Error>(())
    /// ```
    pub fn new(local_capacity: usize) -> Result<Self, Error> {
        Self::with_parts(Collective::new(local_capacity), LeadingZeros::new())
    }
}

impl<K, V, A, G> SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    /// Create a map from an explicit allocator and level generator.
    ///
    /// The header sentinel is allocated from the purely-local tier and links
    /// to itself at all levels, which is the empty-list state.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the header allocation fails.
    pub fn with_parts(mut alloc: A, level_generator: G) -> Result<Self, Error> {
        let local = alloc
            .suballocator(SuballocatorTag::PurelyLocal)
            .ok_or(Error::OutOfMemory)?;
        let [node, links] = alloc
            .batch_allocate(local, SkipNode::<K, V>::layouts(MAX_LEVEL))
            .ok_or(Error::OutOfMemory)?;
        let header = node.as_ptr().cast::<SkipNode<K, V>>();
        // SAFETY: freshly allocated storage of the right layouts.
        unsafe { SkipNode::init_header(header, links.as_ptr().cast::<Link<K, V>>()) };
        Ok(SkipMap {
            header,
            last_local: header,
            len: 0,
            alloc,
            level_generator,
        })
    }

    /// Returns the number of entries in the map.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes all entries, resetting the header and the frontier to the
    /// empty state.
    ///
    /// # Examples
    ///
    /// ```
    /// use tiered_skiplist::SkipMap;
    ///
    /// let mut map = SkipMap::new(1 << 20)?;
    /// map.insert(3, ())?;
    /// map.clear();
    /// assert!(map.is_empty());
    /// # Ok::<(), tiered_skiplist::Error>(())
    /// ```
    pub fn clear(&mut self) {
        // SAFETY: the header and all rings are well formed.
        unsafe {
            self.drop_nodes();
            for level in 0..=MAX_LEVEL as usize {
                (*self.header).links.add(level).write(Link {
                    prev: self.header,
                    next: self.header,
                });
            }
        }
        self.len = 0;
        self.last_local = self.header;
    }

    /// An iterator over the entries in ascending key order.
    ///
    /// Reverse iteration is `.iter().rev()`; both directions walk the
    /// level-0 ring only.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        // SAFETY: the level-0 ring is well formed and `len` counts its
        // element nodes.
        unsafe {
            Iter {
                front: (*self.header).link(0).next,
                back: (*self.header).link(0).prev,
                remaining: self.len,
                _marker: PhantomData,
            }
        }
    }

    /// An iterator over the entries with mutable access to the values.
    #[must_use]
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        // SAFETY: as for `iter`; the borrow of `self` is exclusive.
        unsafe {
            IterMut {
                front: (*self.header).link(0).next,
                back: (*self.header).link(0).prev,
                remaining: self.len,
                _marker: PhantomData,
            }
        }
    }

    /// The entry with the smallest key, or `None` if the map is empty.
    #[must_use]
    pub fn front(&self) -> Option<(&K, &V)> {
        self.iter().next()
    }

    /// The entry with the largest key, or `None` if the map is empty.
    #[must_use]
    pub fn back(&self) -> Option<(&K, &V)> {
        self.iter().next_back()
    }
}

impl<K, V, A, G> SkipMap<K, V, A, G>
where
    K: Ord,
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    /// Returns a reference to the value of `key`, or `None` if absent.
    ///
    /// An absent key is not an error; it is the end sentinel of the search.
    ///
    /// # Examples
    ///
    /// ```
    /// use tiered_skiplist::SkipMap;
    ///
    /// let mut map = SkipMap::new(1 << 20)?;
    /// map.insert(1, "one")?;
    /// assert_eq!(map.get(&1), Some(&"one"));
    /// assert_eq!(map.get(&2), None);
    /// # Ok::<(), tiered_skiplist::Error>(())
    /// ```
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: `lower_bound` returns the header or a live element node.
        unsafe {
            let node = self.lower_bound(key);
            if node != self.header && *key >= *Self::key_of(node) {
                (*node).item.as_ref().map(|(_, value)| value)
            } else {
                None
            }
        }
    }

    /// Returns a mutable reference to the value of `key`, or `None` if
    /// absent.
    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        // SAFETY: as for `get`; the borrow of `self` is exclusive.
        unsafe {
            let node = self.lower_bound(key);
            if node != self.header && *key >= *Self::key_of(node) {
                (*node).item.as_mut().map(|(_, value)| value)
            } else {
                None
            }
        }
    }

    /// Returns `true` if the map contains `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert a key-value pair.
    ///
    /// Returns `Ok(true)` if the entry was inserted and `Ok(false)` if the
    /// key was already present, in which case the map is left untouched and
    /// nothing is allocated.
    ///
    /// The new node is admitted to the purely-local tier whenever its
    /// priority predecessor is local, evicting the frontier node to far
    /// storage if space must be made; otherwise it is placed next to its
    /// key-neighbor's page, falling back to plain swappable storage.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] only after every tier, including the unbounded
    /// swappable one, refused the allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use tiered_skiplist::SkipMap;
    ///
    /// let mut map = SkipMap::new(1 << 20)?;
    /// assert!(map.insert(1, "Hello")?);
    /// assert!(!map.insert(1, "again")?);
    /// assert_eq!(map.get(&1), Some(&"Hello"));
    /// # Ok::<(), tiered_skiplist::Error>(())
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, Error> {
        let new_level = self.level_generator.level();

        // SAFETY: all ring walks stay within live nodes; the new node is
        // spliced into every ring it participates in before anything else
        // can observe it.
        unsafe {
            // Descending search, remembering the lower bound at the new
            // node's level: the walk goes backward while the predecessor's
            // key is not less than the search key, and `prev_in_upper_level`
            // stops lower levels from re-examining already-excluded nodes.
            let mut cursor = self.header;
            let mut prev_in_upper_level = self.header;
            let mut bound_at_new_level = self.header;
            let mut level = (*self.header).level();
            loop {
                loop {
                    let prev = (*cursor).link(level).prev;
                    if prev == prev_in_upper_level {
                        break;
                    }
                    if *Self::key_of(prev) < key {
                        prev_in_upper_level = prev;
                        break;
                    }
                    cursor = prev;
                }
                if level == new_level {
                    bound_at_new_level = cursor;
                }
                if level == 0 {
                    break;
                }
                level -= 1;
            }

            if cursor != self.header && key >= *Self::key_of(cursor) {
                return Ok(false);
            }

            // The node immediately ahead of the new node in priority order.
            let one_more_prioritized = self.prev_in_priority(bound_at_new_level, new_level);
            let layouts = SkipNode::<K, V>::layouts(new_level);
            let mut allocated: Option<[NonNull<u8>; 2]> = None;

            let local = self
                .alloc
                .suballocator(SuballocatorTag::PurelyLocal)
                .ok_or(Error::OutOfMemory)?;
            if self.alloc.contains(local, one_more_prioritized.cast()) {
                loop {
                    allocated = self.alloc.batch_allocate(local, layouts);
                    match allocated {
                        Some([node, _]) => {
                            if one_more_prioritized == self.last_local {
                                self.last_local = node.as_ptr().cast();
                            }
                            break;
                        }
                        // No space, and the blocking predecessor is the
                        // frontier itself: evicting would not help the new
                        // node, so stop trying locally.
                        None if one_more_prioritized == self.last_local => break,
                        None => {
                            let relocate_cursor = self.last_local == cursor;
                            let relocated = self.relocate_frontier_to_far();
                            if relocate_cursor {
                                cursor = relocated;
                            }
                        }
                    }
                }
            }
            if allocated.is_none() && !self.alloc.contains(local, cursor.cast()) {
                // Cluster with the key-neighbor's page.
                if let Some(sub) = self.alloc.suballocator(SuballocatorTag::Owning(cursor.cast()))
                {
                    allocated = self.alloc.batch_allocate(sub, layouts);
                }
            }
            if allocated.is_none() {
                let far = self
                    .alloc
                    .suballocator(SuballocatorTag::SwappablePlain)
                    .ok_or(Error::OutOfMemory)?;
                allocated = self.alloc.batch_allocate(far, layouts);
            }
            let [node_ptr, links_ptr] = allocated.ok_or(Error::OutOfMemory)?;

            let node = node_ptr.as_ptr().cast::<SkipNode<K, V>>();
            let links = links_ptr.as_ptr().cast::<Link<K, V>>();
            SkipNode::init_element(node, links, new_level, key, value);

            // Splice into every ring 0..=new_level between the discovered
            // neighbors, climbing to each neighbor's next participant where
            // its own tower is too short.
            let mut prev_in_level = (*cursor).link(0).prev;
            for level in 0..=new_level {
                while (*cursor).level() < level {
                    cursor = (*cursor).link(level - 1).next;
                }
                while (*prev_in_level).level() < level {
                    prev_in_level = (*prev_in_level).link(level - 1).prev;
                }
                links.add(level as usize).write(Link {
                    prev: prev_in_level,
                    next: cursor,
                });
                (*prev_in_level).link_mut(level).next = node;
                (*cursor).link_mut(level).prev = node;
            }

            self.len += 1;
            Ok(true)
        }
    }

    /// Remove `key`, returning its value if it was present.
    ///
    /// If the removed node was the frontier, the frontier retreats to its
    /// priority predecessor; in either case freed local space is backfilled
    /// by promoting far nodes in priority order, best-effort.
    ///
    /// # Examples
    ///
    /// ```
    /// use tiered_skiplist::SkipMap;
    ///
    /// let mut map = SkipMap::new(1 << 20)?;
    /// map.insert(1, "one")?;
    /// assert_eq!(map.remove(&1), Some("one"));
    /// assert_eq!(map.remove(&1), None);
    /// # Ok::<(), tiered_skiplist::Error>(())
    /// ```
    pub fn remove(&mut self, key: &K) -> Option<V> {
        // SAFETY: the node is unspliced from every ring it participates in
        // before its storage is released.
        unsafe {
            let node = self.lower_bound(key);
            if node == self.header || *key < *Self::key_of(node) {
                return None;
            }

            if node == self.last_local {
                let level = (*node).level();
                self.last_local = self.prev_in_priority((*node).link(level).next, level);
            }

            for level in 0..=(*node).level() {
                let Link { prev, next } = (*node).link(level);
                (*prev).link_mut(level).next = next;
                (*next).link_mut(level).prev = prev;
            }

            let value = (*node).item.take().map(|(_, value)| value);
            self.release(node);
            self.len -= 1;

            self.backfill();
            value
        }
    }

    /// Remove `key`, returning how many entries were removed (0 or 1).
    pub fn erase(&mut self, key: &K) -> usize {
        usize::from(self.remove(key).is_some())
    }

    /// The level-0 node with the smallest key not less than `key`, or the
    /// header if every key is smaller.
    ///
    /// Starts at the header's top level; at each level walks backward while
    /// the predecessor's key is not less than `key`, never re-examining
    /// nodes already excluded at an upper level; terminates at level 0 with
    /// the exact bound. Expected cost `O(log n)`.
    ///
    /// # Safety
    ///
    /// All rings must be well formed.
    unsafe fn lower_bound(&self, key: &K) -> *mut SkipNode<K, V> {
        unsafe {
            let mut bound = self.header;
            let mut prev_in_upper_level = self.header;
            let mut level = (*self.header).level();
            loop {
                loop {
                    let prev = (*bound).link(level).prev;
                    if prev == prev_in_upper_level {
                        break;
                    }
                    if *Self::key_of(prev) < *key {
                        prev_in_upper_level = prev;
                        break;
                    }
                    bound = prev;
                }
                if level == 0 {
                    return bound;
                }
                level -= 1;
            }
        }
    }

    /// Key of an element node.
    ///
    /// # Safety
    ///
    /// `node` must be a live element node; the header never enters key
    /// comparisons because the search loops test for it first.
    unsafe fn key_of<'a>(node: *const SkipNode<K, V>) -> &'a K
    where
        K: 'a,
        V: 'a,
    {
        unsafe { (*node).key().expect("the header has no key") }
    }
}

// ///////////////////////////////////////////////
// Placement tiering
// ///////////////////////////////////////////////

impl<K, V, A, G> SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    /// The first node at-or-after `candidate`'s ring position whose own
    /// level equals `level`, climbing a level each time a ring is exhausted.
    ///
    /// This is the node one position *ahead* in priority order: within a
    /// level, larger keys come first, so walking `next` moves toward higher
    /// priority. The header is the order's maximum (lowest-priority)
    /// sentinel and is returned when the walk runs off the top.
    ///
    /// # Safety
    ///
    /// `candidate` must be a live node participating at `level`, and all
    /// rings must be well formed.
    unsafe fn prev_in_priority(
        &self,
        mut candidate: *mut SkipNode<K, V>,
        mut level: u8,
    ) -> *mut SkipNode<K, V> {
        unsafe {
            loop {
                while candidate != self.header {
                    if (*candidate).level() == level {
                        return candidate;
                    }
                    candidate = (*candidate).link(level).next;
                }
                if level == MAX_LEVEL {
                    return self.header;
                }
                level += 1;
                candidate = (*self.header).link(level).next;
            }
        }
    }

    /// The symmetric backward walk: first level-`level` peer at-or-before
    /// `candidate`, descending a level on exhaustion; `None` once the order
    /// runs out below level 0.
    ///
    /// # Safety
    ///
    /// As for [`Self::prev_in_priority`].
    unsafe fn next_in_priority(
        &self,
        mut candidate: *mut SkipNode<K, V>,
        mut level: u8,
    ) -> Option<*mut SkipNode<K, V>> {
        unsafe {
            loop {
                while candidate != self.header {
                    if (*candidate).level() == level {
                        return Some(candidate);
                    }
                    candidate = (*candidate).link(level).prev;
                }
                if level == 0 {
                    return None;
                }
                level -= 1;
                candidate = (*self.header).link(level).prev;
            }
        }
    }

    /// Evict the frontier node to far storage, retreating the frontier to
    /// its priority predecessor first.
    ///
    /// Returns the node's address after the move (unchanged if far storage
    /// refused it; the eviction loop then keeps retreating regardless, which
    /// is what guarantees its termination). A refusal strands the node in
    /// local storage past the frontier; the prefix property holds again only
    /// once a later backfill or clustering pass picks the node up.
    ///
    /// # Safety
    ///
    /// The frontier must be an element node, not the header.
    unsafe fn relocate_frontier_to_far(&mut self) -> *mut SkipNode<K, V> {
        debug_assert!(self.last_local != self.header);
        unsafe {
            let node = self.last_local;
            let level = (*node).level();
            self.last_local = self.prev_in_priority((*node).link(level).next, level);
            let Some(far) = self.alloc.suballocator(SuballocatorTag::SwappablePlain) else {
                return node;
            };
            self.relocate_node(node, far).unwrap_or(node)
        }
    }

    /// Promote far nodes just past the frontier into the local tier until
    /// none remain or the local tier refuses an allocation.
    ///
    /// Best-effort: an allocation failure ends the pass, it is never an
    /// error.
    ///
    /// # Safety
    ///
    /// All rings must be well formed.
    unsafe fn backfill(&mut self) {
        unsafe {
            loop {
                let level = (*self.last_local).level();
                let candidate = (*self.last_local).link(level).prev;
                let Some(next) = self.next_in_priority(candidate, level) else {
                    break;
                };
                let Some(local) = self.alloc.suballocator(SuballocatorTag::PurelyLocal) else {
                    break;
                };
                match self.relocate_node(next, local) {
                    Some(promoted) => self.last_local = promoted,
                    None => break,
                }
            }
        }
    }

    /// Move a node's storage into `dest` and repair every neighbor pointer.
    ///
    /// Returns the node's new address, or `None` if `dest` refused the
    /// allocation. The value and the link array are transferred bitwise (a
    /// Rust move), and only after both neighbors of every level reference
    /// the new address is the old storage released; no caller can observe an
    /// intermediate state.
    ///
    /// # Safety
    ///
    /// `node` must be a live element node and all rings well formed.
    unsafe fn relocate_node(
        &mut self,
        node: *mut SkipNode<K, V>,
        dest: Suballocator,
    ) -> Option<*mut SkipNode<K, V>> {
        unsafe {
            let level = (*node).level();
            let links = (*node).links;
            let [node_layout, links_layout] = SkipNode::<K, V>::layouts(level);
            let regions = [
                (NonNull::new_unchecked(node.cast::<u8>()), node_layout),
                (NonNull::new_unchecked(links.cast::<u8>()), links_layout),
            ];
            let outcome = self
                .alloc
                .relocate(dest, regions, &mut |from, layout, to| {
                    // SAFETY: source and destination regions are live,
                    // disjoint and of identical layout. The enclosing unsafe
                    // block extends into this closure.
                    std::ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), layout.size());
                });
            match outcome {
                Relocation::Moved([new_node, new_links]) => {
                    let new_node = new_node.as_ptr().cast::<SkipNode<K, V>>();
                    let new_links = new_links.as_ptr().cast::<Link<K, V>>();
                    (*new_node).links = new_links;
                    for level in 0..=level {
                        let Link { prev, next } = *new_links.add(level as usize);
                        (*prev).link_mut(level).next = new_node;
                        (*next).link_mut(level).prev = new_node;
                    }
                    Some(new_node)
                }
                Relocation::InPlace => Some(node),
                Relocation::Failed => None,
            }
        }
    }

    /// Release a node's storage back to whichever suballocator owns it.
    ///
    /// # Safety
    ///
    /// `node` must be unspliced from every ring and its item already taken
    /// or dropped.
    unsafe fn release(&mut self, node: *mut SkipNode<K, V>) {
        unsafe {
            let [node_layout, links_layout] = SkipNode::<K, V>::layouts((*node).level());
            let links = (*node).links;
            self.alloc.batch_deallocate([
                (NonNull::new_unchecked(node.cast::<u8>()), node_layout),
                (NonNull::new_unchecked(links.cast::<u8>()), links_layout),
            ]);
        }
    }

    /// Drop and release every element node, walking the level-0 ring in
    /// descending key order. The header and its links are left untouched.
    ///
    /// # Safety
    ///
    /// All rings must be well formed; the caller must reset or release the
    /// header afterwards.
    unsafe fn drop_nodes(&mut self) {
        unsafe {
            let mut node = (*self.header).link(0).prev;
            while node != self.header {
                let prev = (*node).link(0).prev;
                drop((*node).item.take());
                self.release(node);
                node = prev;
            }
        }
    }
}

// ///////////////////////////////////////////////
// Batch placement & diagnostics
// ///////////////////////////////////////////////

impl<K, V, A, G> SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    /// Cluster every far-resident node into page-sized blocks, in descending
    /// key order.
    ///
    /// A fresh block is started whenever the current one's occupancy exceeds
    /// 70%, and a failed relocation is retried once into a fresh block; a
    /// second failure ends the pass. Does nothing when the entire non-header
    /// structure is already within the local frontier.
    pub fn batch_block(&mut self) {
        // SAFETY: all ring walks stay within live nodes; relocation repairs
        // every neighbor pointer before continuing.
        unsafe {
            if self.prev_in_priority((*self.header).link(0).next, 0) == self.last_local {
                return;
            }
            let Some(local) = self.alloc.suballocator(SuballocatorTag::PurelyLocal) else {
                return;
            };
            let Some(mut block) = self.alloc.suballocator(SuballocatorTag::NewPerPage) else {
                return;
            };

            let mut node = (*self.header).link(0).prev;
            while node != self.header {
                if !self.alloc.contains(local, node.cast()) {
                    if !self.alloc.occupancy_under(block, 0.7) {
                        match self.alloc.suballocator(SuballocatorTag::NewPerPage) {
                            Some(fresh) => block = fresh,
                            None => return,
                        }
                    }
                    match self.relocate_node(node, block) {
                        Some(moved) => node = moved,
                        None => {
                            // Retry once into a fresh block; give up on the
                            // pass if even that fails.
                            let Some(fresh) = self.alloc.suballocator(SuballocatorTag::NewPerPage)
                            else {
                                return;
                            };
                            block = fresh;
                            match self.relocate_node(node, block) {
                                Some(moved) => node = moved,
                                None => return,
                            }
                        }
                    }
                }
                node = (*node).link(0).prev;
            }
        }
    }

    /// Classify every `(node, level-ℓ predecessor)` link of the structure,
    /// header included, by the tiers and pages of its endpoints.
    ///
    /// Purely diagnostic; the structure is never mutated.
    pub fn analyze_edges(&mut self, page_size: usize) -> EdgeCounts {
        let mut counts = EdgeCounts::default();
        let Some(local) = self.alloc.suballocator(SuballocatorTag::PurelyLocal) else {
            return counts;
        };
        // SAFETY: the walk visits each live node once via the level-0 ring.
        unsafe {
            let mut node = self.header;
            loop {
                let node_local = self.alloc.contains(local, node.cast());
                for level in 0..=(*node).level() {
                    let adj = (*node).link(level).prev;
                    let adj_local = self.alloc.contains(local, adj.cast());
                    if node_local && adj_local {
                        counts.purely_local += 1;
                    } else if node as usize / page_size == adj as usize / page_size {
                        counts.same_page += 1;
                    } else {
                        counts.diff_pages += 1;
                    }
                }
                node = (*node).link(0).prev;
                if node == self.header {
                    break;
                }
            }
        }
        counts
    }

    /// Simulate one forward traversal with a capacity-bounded page cache,
    /// approximating the page-fault cost of a scan under a given cache
    /// budget.
    ///
    /// The cache holds page ids and is replaced round-robin, not by strict
    /// recency.
    pub fn analyze_locality_in_traversal(
        &mut self,
        page_size: usize,
        cache_capacity: usize,
    ) -> TraversalCounts {
        let mut counts = TraversalCounts::default();
        let Some(local) = self.alloc.suballocator(SuballocatorTag::PurelyLocal) else {
            return counts;
        };
        let mut cached_pages = vec![usize::MAX; cache_capacity];
        let mut round_robin = 0;

        // SAFETY: the walk visits each live node once via the level-0 ring.
        unsafe {
            let mut node = (*self.header).link(0).next;
            while node != self.header {
                if self.alloc.contains(local, node.cast()) {
                    counts.resident_local += 1;
                } else {
                    let page_id = node as usize / page_size;
                    if cached_pages.contains(&page_id) {
                        counts.cache_hit += 1;
                    } else {
                        counts.cache_miss += 1;
                        if cache_capacity > 0 {
                            cached_pages[round_robin] = page_id;
                            round_robin = (round_robin + 1) % cache_capacity;
                        }
                    }
                }
                node = (*node).link(0).next;
            }
        }
        counts
    }
}

// ///////////////////////////////////////////////
// Trait implementations
// ///////////////////////////////////////////////

impl<K, V, A, G> Drop for SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    fn drop(&mut self) {
        // SAFETY: every node is released exactly once, the header last.
        unsafe {
            self.drop_nodes();
            let header = self.header;
            self.release(header);
        }
    }
}

impl<'a, K, V, A, G> IntoIterator for &'a SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, A, G> IntoIterator for &'a mut SkipMap<K, V, A, G>
where
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<K, V, A, G> fmt::Debug for SkipMap<K, V, A, G>
where
    K: fmt::Debug,
    V: fmt::Debug,
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ///////////////////////////////////////////////
// Test-only structural checks
// ///////////////////////////////////////////////

#[cfg(test)]
impl<K, V, A, G> SkipMap<K, V, A, G>
where
    K: Ord,
    A: CollectiveAllocator,
    G: LevelGenerator,
{
    /// Tower invariant: for every level, the ring contains exactly the nodes
    /// whose level is at least that level, in strictly ascending key order,
    /// as a closed cycle through the header with consistent back links.
    fn assert_rings_consistent(&self) {
        unsafe {
            let mut census: Vec<(*mut SkipNode<K, V>, u8)> = Vec::new();
            let mut node = (*self.header).link(0).next;
            while node != self.header {
                census.push((node, (*node).level()));
                node = (*node).link(0).next;
            }
            assert_eq!(census.len(), self.len, "level-0 ring disagrees with len");

            for level in 0..=MAX_LEVEL {
                let mut ring: Vec<*mut SkipNode<K, V>> = Vec::new();
                let mut prev = self.header;
                let mut node = (*self.header).link(level).next;
                while node != self.header {
                    assert!((*node).level() >= level, "node in a ring above its level");
                    assert_eq!((*node).link(level).prev, prev, "broken back link");
                    if prev != self.header {
                        assert!(
                            *Self::key_of(prev) < *Self::key_of(node),
                            "ring out of order"
                        );
                    }
                    ring.push(node);
                    prev = node;
                    node = (*node).link(level).next;
                }
                assert_eq!((*self.header).link(level).prev, prev, "cycle not closed");

                let expected: Vec<_> = census
                    .iter()
                    .filter(|(_, l)| *l >= level)
                    .map(|(p, _)| *p)
                    .collect();
                assert_eq!(ring, expected, "ring membership mismatch at a level");
            }
        }
    }

    /// Frontier invariant: walking the whole priority order, residency flips
    /// from local to far exactly once, at `last_local`.
    fn assert_frontier_invariant(&mut self) {
        unsafe {
            let local = self
                .alloc
                .suballocator(SuballocatorTag::PurelyLocal)
                .expect("purely local tier always exists");

            let mut visited = 0;
            let mut flipped = false;
            let mut last_local_seen = self.header;
            let mut cursor =
                self.next_in_priority((*self.header).link(MAX_LEVEL).prev, MAX_LEVEL);
            while let Some(node) = cursor {
                visited += 1;
                if self.alloc.contains(local, node.cast()) {
                    assert!(!flipped, "local node after a far node in priority order");
                    last_local_seen = node;
                } else {
                    flipped = true;
                }
                let level = (*node).level();
                cursor = self.next_in_priority((*node).link(level).prev, level);
            }
            assert_eq!(visited, self.len, "priority order missed nodes");
            assert_eq!(last_local_seen, self.last_local, "frontier out of place");
        }
    }

    /// `Σ(level + 1)` over all nodes including the header, i.e. the number
    /// of edges `analyze_edges` must account for.
    fn total_links(&self) -> usize {
        unsafe {
            let mut total = MAX_LEVEL as usize + 1;
            let mut node = (*self.header).link(0).next;
            while node != self.header {
                total += (*node).level() as usize + 1;
                node = (*node).link(0).next;
            }
            total
        }
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;
    use std::ptr::NonNull;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    use super::{Error, SkipMap};
    use crate::collective::{
        Collective, CollectiveAllocator, Relocation, Suballocator, SuballocatorTag,
    };
    use crate::level_generator::{LeadingZeros, LevelGenerator, MAX_LEVEL};

    /// Replays a fixed sequence of levels, cycling when exhausted.
    struct Scripted {
        levels: Vec<u8>,
        at: usize,
    }

    impl Scripted {
        fn new(levels: Vec<u8>) -> Self {
            Scripted { levels, at: 0 }
        }
    }

    impl LevelGenerator for Scripted {
        fn total(&self) -> usize {
            MAX_LEVEL as usize + 1
        }

        fn level(&mut self) -> u8 {
            let level = self.levels[self.at % self.levels.len()];
            self.at += 1;
            level
        }
    }

    /// Serves exactly one batch from the global allocator (enough for the
    /// header sentinel), then refuses every further request.
    #[derive(Default)]
    struct OneShot {
        served: Vec<(NonNull<u8>, Layout)>,
    }

    impl CollectiveAllocator for OneShot {
        fn suballocator(&mut self, _tag: SuballocatorTag) -> Option<Suballocator> {
            Some(Suballocator(0))
        }

        fn batch_allocate<const N: usize>(
            &mut self,
            _sub: Suballocator,
            layouts: [Layout; N],
        ) -> Option<[NonNull<u8>; N]> {
            if !self.served.is_empty() {
                return None;
            }
            let mut offsets = [0_usize; N];
            let mut size = 0_usize;
            let mut align = 1_usize;
            for (i, layout) in layouts.iter().enumerate() {
                size = size.next_multiple_of(layout.align());
                offsets[i] = size;
                size += layout.size();
                align = align.max(layout.align());
            }
            let span = Layout::from_size_align(size.max(1), align).ok()?;
            // SAFETY: `span` has non-zero size.
            let base = NonNull::new(unsafe { std::alloc::alloc(span) })?;
            self.served.push((base, span));
            // SAFETY: every offset is within the span just allocated.
            Some(offsets.map(|off| unsafe { NonNull::new_unchecked(base.as_ptr().add(off)) }))
        }

        fn batch_deallocate<const N: usize>(&mut self, regions: [(NonNull<u8>, Layout); N]) {
            let first = regions.first().map(|(ptr, _)| ptr.as_ptr());
            if let Some(pos) = self
                .served
                .iter()
                .position(|(base, _)| Some(base.as_ptr()) == first)
            {
                let (base, span) = self.served.swap_remove(pos);
                // SAFETY: the span was allocated with exactly this layout.
                unsafe { std::alloc::dealloc(base.as_ptr(), span) };
            }
        }

        fn contains(&self, _sub: Suballocator, addr: *const u8) -> bool {
            self.served.iter().any(|(base, span)| {
                let base = base.as_ptr() as usize;
                (base..base + span.size()).contains(&(addr as usize))
            })
        }

        fn relocate<const N: usize>(
            &mut self,
            _dest: Suballocator,
            _regions: [(NonNull<u8>, Layout); N],
            _transfer: &mut dyn FnMut(NonNull<u8>, Layout, NonNull<u8>),
        ) -> Relocation<N> {
            Relocation::Failed
        }

        fn occupancy_under(&self, _sub: Suballocator, _fraction: f64) -> bool {
            true
        }

        fn page_size(&self) -> usize {
            4096
        }
    }

    /// Delegates to a real allocator but refuses every relocation into the
    /// swappable tier, stranding would-be evictees in local storage.
    struct StickyFar {
        inner: Collective,
    }

    impl CollectiveAllocator for StickyFar {
        fn suballocator(&mut self, tag: SuballocatorTag) -> Option<Suballocator> {
            self.inner.suballocator(tag)
        }

        fn batch_allocate<const N: usize>(
            &mut self,
            sub: Suballocator,
            layouts: [Layout; N],
        ) -> Option<[NonNull<u8>; N]> {
            self.inner.batch_allocate(sub, layouts)
        }

        fn batch_deallocate<const N: usize>(&mut self, regions: [(NonNull<u8>, Layout); N]) {
            self.inner.batch_deallocate(regions);
        }

        fn contains(&self, sub: Suballocator, addr: *const u8) -> bool {
            self.inner.contains(sub, addr)
        }

        fn relocate<const N: usize>(
            &mut self,
            dest: Suballocator,
            regions: [(NonNull<u8>, Layout); N],
            transfer: &mut dyn FnMut(NonNull<u8>, Layout, NonNull<u8>),
        ) -> Relocation<N> {
            if self.inner.suballocator(SuballocatorTag::SwappablePlain) == Some(dest) {
                return Relocation::Failed;
            }
            self.inner.relocate(dest, regions, transfer)
        }

        fn occupancy_under(&self, sub: Suballocator, fraction: f64) -> bool {
            self.inner.occupancy_under(sub, fraction)
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
    }

    fn seeded_map<K: Ord, V>(local_capacity: usize, seed: u64) -> SkipMap<K, V> {
        SkipMap::with_parts(
            Collective::new(local_capacity),
            LeadingZeros::with_rng(SmallRng::seed_from_u64(seed)),
        )
        .expect("header allocation cannot fail with a page of local budget")
    }

    #[test]
    fn forced_level_zero_example() -> Result<()> {
        let mut map: SkipMap<i32, i32, _, _> =
            SkipMap::with_parts(Collective::new(1 << 16), Scripted::new(vec![0]))?;
        for key in [10, 5, 20, 1] {
            assert!(map.insert(key, key * 10)?);
        }
        let keys: Vec<_> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 5, 10, 20]);
        map.assert_rings_consistent();

        assert_eq!(map.erase(&5), 1);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&5), None);
        let keys: Vec<_> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 10, 20]);
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn iteration_is_sorted_and_total() -> Result<()> {
        let mut map = seeded_map::<u64, u64>(1 << 20, 3);
        let mut keys: Vec<u64> = (0..500).map(|i| i * 7 % 499).collect();
        keys.sort_unstable();
        keys.dedup();
        let mut shuffled = keys.clone();
        shuffled.shuffle(&mut SmallRng::seed_from_u64(9));
        for &key in &shuffled {
            assert!(map.insert(key, key + 1)?);
        }

        assert_eq!(map.len(), keys.len());
        let seen: Vec<u64> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(seen, keys);
        for window in seen.windows(2) {
            assert!(window[0] < window[1]);
        }
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn duplicate_insert_is_a_noop() -> Result<()> {
        let mut map = seeded_map::<u32, &str>(1 << 20, 5);
        assert!(map.insert(7, "first")?);
        assert!(!map.insert(7, "second")?);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&7), Some(&"first"));
        Ok(())
    }

    #[test]
    fn insert_erase_round_trip() -> Result<()> {
        let mut map = seeded_map::<u64, String>(1 << 20, 11);
        for key in 0..100_u64 {
            assert!(map.insert(key, format!("v{key}"))?);
        }
        for key in 0..100_u64 {
            assert_eq!(map.erase(&key), 1);
            assert_eq!(map.get(&key), None);
            assert_eq!(map.erase(&key), 0);
        }
        assert!(map.is_empty());
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn remove_returns_the_value() -> Result<()> {
        let mut map = seeded_map::<u8, String>(1 << 20, 13);
        map.insert(1, "one".to_owned())?;
        assert_eq!(map.remove(&1), Some("one".to_owned()));
        assert_eq!(map.remove(&1), None);
        Ok(())
    }

    #[test]
    fn reverse_iteration() -> Result<()> {
        let mut map = seeded_map::<i64, ()>(1 << 20, 17);
        for key in 0..50 {
            map.insert(key, ())?;
        }
        let backwards: Vec<i64> = map.iter().rev().map(|(k, _)| *k).collect();
        let expected: Vec<i64> = (0..50).rev().collect();
        assert_eq!(backwards, expected);
        Ok(())
    }

    #[test]
    fn front_back_get_mut() -> Result<()> {
        let mut map = seeded_map::<u64, u64>(1 << 20, 19);
        assert_eq!(map.front(), None);
        assert_eq!(map.back(), None);
        for key in [4, 2, 9] {
            map.insert(key, key)?;
        }
        assert_eq!(map.front(), Some((&2, &2)));
        assert_eq!(map.back(), Some((&9, &9)));
        assert!(map.contains_key(&4));

        *map.get_mut(&4).expect("key 4 present") = 40;
        assert_eq!(map.get(&4), Some(&40));
        for (_, value) in map.iter_mut() {
            *value += 1;
        }
        assert_eq!(map.get(&4), Some(&41));
        Ok(())
    }

    #[test]
    fn clear_resets_to_empty() -> Result<()> {
        let mut map = seeded_map::<u64, String>(1 << 16, 23);
        for key in 0..200_u64 {
            map.insert(key, format!("{key}"))?;
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        map.assert_rings_consistent();
        map.assert_frontier_invariant();

        map.insert(1, "back".to_owned())?;
        assert_eq!(map.get(&1), Some(&"back".to_owned()));
        Ok(())
    }

    // At one page of local budget the header consumes most of the local
    // tier, so almost every insert goes through the eviction and fallback
    // paths; larger budgets shift the mix toward local admission.
    #[rstest]
    #[case::one_page(4096)]
    #[case::two_pages(2 * 4096)]
    #[case::roomy(1 << 16)]
    fn values_survive_relocation(#[case] local_capacity: usize) -> Result<()> {
        let mut map = seeded_map::<u64, String>(local_capacity, 29);
        for key in 0..300_u64 {
            assert!(map.insert(key, format!("value-{key}"))?);
        }
        for key in (0..300_u64).step_by(3) {
            assert_eq!(map.erase(&key), 1);
        }
        for key in 0..300_u64 {
            let expected = (key % 3 != 0).then(|| format!("value-{key}"));
            assert_eq!(map.get(&key).cloned(), expected);
        }
        map.assert_rings_consistent();
        map.assert_frontier_invariant();
        Ok(())
    }

    #[test]
    fn frontier_is_a_priority_prefix() -> Result<()> {
        let mut map = seeded_map::<u64, [u8; 64]>(3 * 4096, 31);
        for key in 0..150_u64 {
            map.insert(key, [0; 64])?;
            if key % 10 == 0 {
                map.assert_frontier_invariant();
            }
        }
        map.assert_frontier_invariant();
        for key in (0..150_u64).step_by(2) {
            map.erase(&key);
            if key % 20 == 0 {
                map.assert_frontier_invariant();
            }
        }
        map.assert_frontier_invariant();
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn stress_interleaved_under_tiny_budget() -> Result<()> {
        // Adversarial insert/erase interleavings against a local tier of a
        // few pages: every operation must terminate and preserve both the
        // tower and the frontier invariants.
        let mut map = seeded_map::<u64, u64>(2 * 4096, 37);
        let mut rng = SmallRng::seed_from_u64(38);
        let mut shadow = std::collections::BTreeMap::new();

        for step in 0..4000_u64 {
            let key = rng.random_range(0..512);
            if rng.random_bool(0.6) {
                let inserted = map.insert(key, step)?;
                assert_eq!(inserted, shadow.insert(key, step).is_none());
                if !inserted {
                    // An existing key keeps its stored value.
                    shadow.insert(key, map.get(&key).copied().expect("key present"));
                }
            } else {
                assert_eq!(map.erase(&key), usize::from(shadow.remove(&key).is_some()));
            }
            if step % 500 == 0 {
                map.assert_rings_consistent();
                map.assert_frontier_invariant();
            }
        }

        assert_eq!(map.len(), shadow.len());
        let entries: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<(u64, u64)> = shadow.into_iter().collect();
        assert_eq!(entries, expected);
        map.assert_rings_consistent();
        map.assert_frontier_invariant();
        Ok(())
    }

    #[test]
    fn edge_accounting_matches_link_totals() -> Result<()> {
        let mut map = seeded_map::<u64, [u8; 32]>(2 * 4096, 41);
        for key in 0..200_u64 {
            map.insert(key, [0; 32])?;
        }
        let counts = map.analyze_edges(4096);
        assert_eq!(counts.total(), map.total_links());

        map.batch_block();
        let counts = map.analyze_edges(4096);
        assert_eq!(counts.total(), map.total_links());
        Ok(())
    }

    #[test]
    fn empty_map_edges_are_all_local() -> Result<()> {
        let mut map = seeded_map::<u64, u64>(1 << 16, 43);
        let counts = map.analyze_edges(4096);
        // Only the header's self-links exist, all within the local tier.
        assert_eq!(counts.purely_local, MAX_LEVEL as usize + 1);
        assert_eq!(counts.same_page + counts.diff_pages, 0);
        Ok(())
    }

    #[test]
    fn batch_block_is_idempotent() -> Result<()> {
        let mut map = seeded_map::<u64, [u8; 48]>(2 * 4096, 47);
        for key in 0..250_u64 {
            map.insert(key, [7; 48])?;
        }
        map.batch_block();
        map.assert_rings_consistent();
        let first = map.analyze_edges(4096);

        map.batch_block();
        let second = map.analyze_edges(4096);
        assert_eq!(first, second);

        // The clustering pass must not disturb the map's contents.
        assert_eq!(map.len(), 250);
        let keys: Vec<u64> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..250).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn batch_block_reduces_cross_page_edges() -> Result<()> {
        let mut map = seeded_map::<u64, [u8; 48]>(4096, 53);
        // Shuffled insertion scatters key-adjacent nodes across swappable
        // pages; the clustering pass regroups them in key order.
        let mut keys: Vec<u64> = (0..400).collect();
        keys.shuffle(&mut SmallRng::seed_from_u64(54));
        for &key in &keys {
            map.insert(key, [1; 48])?;
        }
        let before = map.analyze_edges(4096);
        map.batch_block();
        let after = map.analyze_edges(4096);
        assert!(after.diff_pages < before.diff_pages);
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn traversal_counts_cover_every_node() -> Result<()> {
        let mut map = seeded_map::<u64, [u8; 64]>(2 * 4096, 59);
        for key in 0..180_u64 {
            map.insert(key, [2; 64])?;
        }
        let counts = map.analyze_locality_in_traversal(4096, 4);
        assert_eq!(
            counts.resident_local + counts.cache_hit + counts.cache_miss,
            map.len()
        );

        // With an effectively unbounded cache only the first touch of each
        // page can miss.
        let generous = map.analyze_locality_in_traversal(4096, 1024);
        assert!(generous.cache_miss <= counts.cache_miss + counts.cache_hit);
        Ok(())
    }

    #[test]
    fn everything_local_when_budget_is_generous() -> Result<()> {
        let mut map = seeded_map::<u64, u64>(1 << 20, 61);
        for key in 0..100_u64 {
            map.insert(key, key)?;
        }
        let counts = map.analyze_locality_in_traversal(4096, 1);
        assert_eq!(counts.resident_local, 100);
        assert_eq!(counts.cache_hit + counts.cache_miss, 0);
        map.assert_frontier_invariant();
        Ok(())
    }

    #[test]
    fn tall_towers_outrank_short_ones() -> Result<()> {
        // Two pages of local budget: the header fills most of the first and
        // exactly one of these fat nodes fits the second. The frontier
        // invariant then pins that single local slot to the level-3 tower,
        // which outranks every level-0 node.
        let mut map: SkipMap<u64, [u8; 2048], _, _> = SkipMap::with_parts(
            Collective::new(2 * 4096),
            Scripted::new(vec![0, 0, 3, 0, 0]),
        )?;
        for key in 0..5_u64 {
            map.insert(key, [0; 2048])?;
        }
        let counts = map.analyze_locality_in_traversal(4096, 0);
        assert_eq!(counts.resident_local, 1);
        assert_eq!(counts.cache_hit + counts.cache_miss, 4);
        map.assert_frontier_invariant();
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn eviction_terminates_when_the_far_tier_refuses_relocation() -> Result<()> {
        // Refused evictions strand nodes locally while the frontier keeps
        // retreating; every operation must still terminate and keep the
        // rings and contents intact.
        let mut map: SkipMap<u64, [u8; 256], _, _> = SkipMap::with_parts(
            StickyFar {
                inner: Collective::new(2 * 4096),
            },
            LeadingZeros::with_rng(SmallRng::seed_from_u64(71)),
        )?;
        for key in 0..200_u64 {
            assert!(map.insert(key, [9; 256])?);
        }
        for key in (0..200_u64).step_by(4) {
            assert_eq!(map.erase(&key), 1);
        }
        assert_eq!(map.len(), 150);
        let keys: Vec<u64> = map.iter().map(|(k, _)| *k).collect();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(map.get(&1).is_some());
        map.assert_rings_consistent();
        Ok(())
    }

    #[test]
    fn out_of_memory_when_every_tier_refuses() -> Result<()> {
        let mut map: SkipMap<u64, u64, _, _> =
            SkipMap::with_parts(OneShot::default(), Scripted::new(vec![0]))?;
        assert_eq!(map.insert(1, 1), Err(Error::OutOfMemory));
        assert!(map.is_empty());
        assert_eq!(
            Error::OutOfMemory.to_string(),
            "out of memory: every storage tier refused the allocation"
        );
        Ok(())
    }

    #[test]
    fn debug_formats_as_a_map() -> Result<()> {
        let mut map = seeded_map::<u32, &str>(1 << 16, 67);
        map.insert(1, "a")?;
        map.insert(2, "b")?;
        assert_eq!(format!("{map:?}"), r#"{1: "a", 2: "b"}"#);
        Ok(())
    }
}
