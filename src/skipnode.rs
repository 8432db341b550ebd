//! The node and link layer underneath [`SkipMap`][crate::SkipMap].
//!
//! Every element is one [`SkipNode`] plus a co-allocated array of exactly
//! `level + 1` [`Link`]s, obtained from the collective allocator as a single
//! co-located batch so that node and links share an allocation lifetime. For
//! each level `L` present in the structure, the level-`L` links form a sorted
//! doubly-linked *cycle* over exactly the nodes whose level is at least `L`,
//! closed through the header sentinel.
//!
//! Nodes deliberately hold raw addresses of their neighbors: residency in a
//! storage tier is a property of the address itself, and relocating a node is
//! what moves it between tiers. The price is that a relocation must fix both
//! neighbors' pointers at every level before the old storage is released; the
//! map owns that protocol.

use std::alloc::Layout;
use std::marker::PhantomData;

use crate::level_generator::MAX_LEVEL;

// ////////////////////////////////////////////////////////////////////////////
// SkipNode
// ////////////////////////////////////////////////////////////////////////////

/// One bidirectional link of a node's tower.
pub(crate) struct Link<K, V> {
    pub prev: *mut SkipNode<K, V>,
    pub next: *mut SkipNode<K, V>,
}

// Derived impls would demand `K: Clone, V: Clone`; links are raw pointers and
// always copyable.
impl<K, V> Clone for Link<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K, V> Copy for Link<K, V> {}

/// A single element of the skip list.
///
/// The `level` is drawn once at creation and never changes, so the link array
/// is never resized. A node participating at level `L` implicitly
/// participates at every level below `L`.
pub(crate) struct SkipNode<K, V> {
    /// Co-allocated array of exactly `level + 1` links.
    pub links: *mut Link<K, V>,
    /// The stored entry; `None` only for the header sentinel.
    pub item: Option<(K, V)>,
    level: u8,
}

impl<K, V> SkipNode<K, V> {
    /// Layouts of the node and its link array, in batch order.
    pub(crate) fn layouts(level: u8) -> [Layout; 2] {
        [
            Layout::new::<Self>(),
            Layout::array::<Link<K, V>>(level as usize + 1)
                .expect("level is at most MAX_LEVEL, the array layout cannot overflow"),
        ]
    }

    /// How high the node reaches.
    #[inline]
    pub(crate) fn level(&self) -> u8 {
        self.level
    }

    #[inline]
    pub(crate) fn key(&self) -> Option<&K> {
        self.item.as_ref().map(|(key, _)| key)
    }

    /// Write a header sentinel into `node`: no value, maximum level, and
    /// every link pointing back at the header itself (the empty-list state).
    ///
    /// # Safety
    ///
    /// `node` and `links` must point to uninitialized storage obtained for
    /// [`SkipNode::layouts`]`(MAX_LEVEL)`.
    pub(crate) unsafe fn init_header(node: *mut Self, links: *mut Link<K, V>) {
        unsafe {
            node.write(SkipNode {
                links,
                item: None,
                level: MAX_LEVEL,
            });
            for level in 0..=MAX_LEVEL as usize {
                links.add(level).write(Link {
                    prev: node,
                    next: node,
                });
            }
        }
    }

    /// Write an element node into `node`, constructing the entry in place.
    ///
    /// The links are *not* initialized; the inserting caller fills them while
    /// splicing the node into its rings.
    ///
    /// # Safety
    ///
    /// `node` and `links` must point to uninitialized storage obtained for
    /// [`SkipNode::layouts`]`(level)`.
    pub(crate) unsafe fn init_element(
        node: *mut Self,
        links: *mut Link<K, V>,
        level: u8,
        key: K,
        value: V,
    ) {
        unsafe {
            node.write(SkipNode {
                links,
                item: Some((key, value)),
                level,
            });
        }
    }

    /// The link at `level`.
    ///
    /// # Safety
    ///
    /// `level` must not exceed the node's level and the link array must be
    /// initialized.
    #[inline]
    pub(crate) unsafe fn link(&self, level: u8) -> Link<K, V> {
        unsafe { *self.links.add(level as usize) }
    }

    /// Mutable access to the link at `level`.
    ///
    /// # Safety
    ///
    /// Same as [`SkipNode::link`].
    #[inline]
    pub(crate) unsafe fn link_mut(&mut self, level: u8) -> &mut Link<K, V> {
        unsafe { &mut *self.links.add(level as usize) }
    }
}

// /////////////////////////////////
// Iterators
// /////////////////////////////////
// Iteration walks the level-0 ring only. The header is the end sentinel in
// both directions, so the iterators carry an element count instead of
// comparing against it: `remaining == 0` is exhaustion.

/// Iterator over entries by reference.
pub struct Iter<'a, K, V> {
    pub(crate) front: *const SkipNode<K, V>,
    pub(crate) back: *const SkipNode<K, V>,
    pub(crate) remaining: usize,
    pub(crate) _marker: PhantomData<&'a (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // SAFETY: `remaining > 0` implies `front` is a live element node.
        unsafe {
            let node = &*self.front;
            self.front = node.link(0).next;
            node.item.as_ref().map(|(key, value)| (key, value))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for Iter<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // SAFETY: `remaining > 0` implies `back` is a live element node.
        unsafe {
            let node = &*self.back;
            self.back = node.link(0).prev;
            node.item.as_ref().map(|(key, value)| (key, value))
        }
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

/// Iterator over entries with mutable access to the values.
///
/// Keys stay immutable; mutating a key could break the ordering.
pub struct IterMut<'a, K, V> {
    pub(crate) front: *mut SkipNode<K, V>,
    pub(crate) back: *mut SkipNode<K, V>,
    pub(crate) remaining: usize,
    pub(crate) _marker: PhantomData<&'a mut (K, V)>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // SAFETY: `remaining > 0` implies `front` is a live element node, and
        // each node is yielded at most once.
        unsafe {
            let node = &mut *self.front;
            self.front = node.link(0).next;
            node.item.as_mut().map(|(key, value)| (&*key, value))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for IterMut<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // SAFETY: `remaining > 0` implies `back` is a live element node, and
        // each node is yielded at most once.
        unsafe {
            let node = &mut *self.back;
            self.back = node.link(0).prev;
            node.item.as_mut().map(|(key, value)| (&*key, value))
        }
    }
}

impl<K, V> ExactSizeIterator for IterMut<'_, K, V> {}

#[cfg(test)]
mod tests {
    use std::alloc::{alloc, dealloc};

    use pretty_assertions::assert_eq;

    use super::{Link, SkipNode};
    use crate::level_generator::MAX_LEVEL;

    #[test]
    fn layouts_cover_the_tower() {
        let [node, links] = SkipNode::<u64, u64>::layouts(3);
        assert!(node.size() > 0);
        assert_eq!(links.size(), 4 * size_of::<Link<u64, u64>>());
    }

    #[test]
    fn header_links_to_itself_at_every_level() {
        let [node_layout, links_layout] = SkipNode::<u64, u64>::layouts(MAX_LEVEL);
        unsafe {
            let node = alloc(node_layout).cast::<SkipNode<u64, u64>>();
            let links = alloc(links_layout).cast::<Link<u64, u64>>();
            SkipNode::init_header(node, links);

            assert_eq!((*node).level(), MAX_LEVEL);
            assert!((*node).item.is_none());
            for level in 0..=MAX_LEVEL {
                let link = (*node).link(level);
                assert_eq!(link.prev, node);
                assert_eq!(link.next, node);
            }

            dealloc(node.cast(), node_layout);
            dealloc(links.cast(), links_layout);
        }
    }

    #[test]
    fn element_holds_its_entry() {
        let [node_layout, links_layout] = SkipNode::<u64, &str>::layouts(2);
        unsafe {
            let node = alloc(node_layout).cast::<SkipNode<u64, &str>>();
            let links = alloc(links_layout).cast::<Link<u64, &str>>();
            SkipNode::init_element(node, links, 2, 17, "seventeen");

            assert_eq!((*node).level(), 2);
            assert_eq!((*node).key(), Some(&17));
            assert_eq!((*node).item.take(), Some((17, "seventeen")));

            dealloc(node.cast(), node_layout);
            dealloc(links.cast(), links_layout);
        }
    }
}
