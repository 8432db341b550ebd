//! The collective allocator: a family of *suballocators*, each owning a
//! distinct address range, that together decide which storage tier a node
//! lives in.
//!
//! The map never stores a tier flag on a node. Residency is always re-derived
//! by asking which suballocator's range contains the node's address, and the
//! only way a node changes tier is a [`CollectiveAllocator::relocate`] call
//! that moves its bytes into another suballocator.
//!
//! Three kinds of suballocator exist:
//!
//! - **purely local**: a byte-capacity-bounded pool that is never paged out.
//!   The hottest nodes (in priority order) are kept here.
//! - **swappable**: an unbounded pool backing everything that did not fit
//!   locally; in a deployment this range is served by a far-memory pager.
//! - **page blocks**: freshly minted one-page pools used by the batch
//!   clustering pass to co-locate key-adjacent far nodes.
//!
//! [`Collective`] is the in-crate implementation of the contract; anything
//! else implementing [`CollectiveAllocator`] is substitutable.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Default page size used by [`Collective::new`].
pub const PAGE_SIZE: usize = 4096;

// ////////////////////////////////////////////////////////////////////////////
// Contract
// ////////////////////////////////////////////////////////////////////////////

/// Selector for [`CollectiveAllocator::suballocator`].
#[derive(Clone, Copy, Debug)]
pub enum SuballocatorTag {
    /// The capacity-bounded local tier.
    PurelyLocal,
    /// The unbounded far (swappable) tier.
    SwappablePlain,
    /// Mint a fresh suballocator owning exactly one page.
    NewPerPage,
    /// The suballocator whose address range contains the given address.
    Owning(*const u8),
}

/// A cheap, copyable handle to one suballocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Suballocator(pub(crate) u32);

/// Outcome of a [`CollectiveAllocator::relocate`] call.
#[derive(Debug)]
pub enum Relocation<const N: usize> {
    /// The regions now live at the returned addresses; old storage has been
    /// released.
    Moved([NonNull<u8>; N]),
    /// The regions were already inside the destination suballocator; nothing
    /// was moved.
    InPlace,
    /// The destination could not provide storage; the regions are untouched.
    Failed,
}

/// The allocator contract the tiered skip list is written against.
///
/// A *batch* of layouts is always served from one contiguous, co-located
/// span inside a single suballocator, in request order. This is what lets a
/// node and its link array share an allocation lifetime.
pub trait CollectiveAllocator {
    /// Resolve a tag to a suballocator handle.
    ///
    /// Returns `None` only for [`SuballocatorTag::Owning`] addresses this
    /// allocator does not own.
    fn suballocator(&mut self, tag: SuballocatorTag) -> Option<Suballocator>;

    /// Allocate a co-located group of regions, or `None` if the suballocator
    /// cannot hold them.
    fn batch_allocate<const N: usize>(
        &mut self,
        sub: Suballocator,
        layouts: [Layout; N],
    ) -> Option<[NonNull<u8>; N]>;

    /// Release regions previously obtained from any suballocator.
    fn batch_deallocate<const N: usize>(&mut self, regions: [(NonNull<u8>, Layout); N]);

    /// Whether the suballocator's address range contains `addr`.
    fn contains(&self, sub: Suballocator, addr: *const u8) -> bool;

    /// Transactionally move a co-located group into `dest`.
    ///
    /// `transfer` is called once per region as `(from, layout, to)` and must
    /// move the region's contents into the uninitialized destination. Old
    /// storage is released only after every region has been transferred, so
    /// the caller never observes a partially relocated group.
    fn relocate<const N: usize>(
        &mut self,
        dest: Suballocator,
        regions: [(NonNull<u8>, Layout); N],
        transfer: &mut dyn FnMut(NonNull<u8>, Layout, NonNull<u8>),
    ) -> Relocation<N>;

    /// Whether the suballocator's occupancy is strictly under `fraction`.
    fn occupancy_under(&self, sub: Suballocator, fraction: f64) -> bool;

    /// The page size this allocator aligns its storage to.
    ///
    /// Pages are `page_size`-aligned, so `addr / page_size` is a usable page
    /// id for locality diagnostics.
    fn page_size(&self) -> usize;
}

// ////////////////////////////////////////////////////////////////////////////
// Default implementation
// ////////////////////////////////////////////////////////////////////////////

/// One page-aligned slab of raw storage.
#[derive(Debug)]
struct Page {
    base: NonNull<u8>,
    layout: Layout,
    /// Offset of the first never-used byte.
    bump: usize,
    /// Live bytes currently allocated out of this page.
    used: usize,
    /// Returned `(offset, len)` blocks available for first-fit reuse.
    free: Vec<(usize, usize)>,
}

impl Page {
    fn contains(&self, addr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.layout.size()
    }
}

/// One suballocator: a set of pages plus an optional byte budget.
#[derive(Debug)]
struct Pool {
    pages: Vec<Page>,
    /// Maximum total bytes of pages this pool may acquire; `None` means
    /// unbounded.
    budget: Option<usize>,
}

impl Pool {
    fn page_bytes(&self) -> usize {
        self.pages.iter().map(|page| page.layout.size()).sum()
    }

    fn used_bytes(&self) -> usize {
        self.pages.iter().map(|page| page.used).sum()
    }
}

const PURELY_LOCAL: Suballocator = Suballocator(0);
const SWAPPABLE: Suballocator = Suballocator(1);

/// The default [`CollectiveAllocator`]: page-granular slab pools.
///
/// Pool 0 is the purely-local tier, pool 1 the swappable tier, and every
/// further pool is a one-page block minted by [`SuballocatorTag::NewPerPage`].
/// Within a page, allocation is first-fit over returned blocks with a bump
/// fallback; a page whose live bytes drop to zero is reset wholesale.
#[derive(Debug)]
pub struct Collective {
    page_size: usize,
    pools: Vec<Pool>,
}

impl Collective {
    /// Create an allocator whose purely-local tier may hold at most
    /// `local_capacity` bytes of pages, using the default [`PAGE_SIZE`].
    #[must_use]
    pub fn new(local_capacity: usize) -> Self {
        Self::with_page_size(PAGE_SIZE, local_capacity)
    }

    /// Create an allocator with an explicit page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn with_page_size(page_size: usize, local_capacity: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        let local_budget = local_capacity.max(page_size);
        Collective {
            page_size,
            pools: vec![
                Pool {
                    pages: Vec::new(),
                    budget: Some(local_budget),
                },
                Pool {
                    pages: Vec::new(),
                    budget: None,
                },
            ],
        }
    }

    /// Acquire a fresh page able to hold `size` bytes at `align`, if the
    /// pool's budget allows it.
    fn grow(&mut self, sub: Suballocator, size: usize, align: usize) -> Option<usize> {
        let page_size = self.page_size;
        let pool = &mut self.pools[sub.0 as usize];

        let bytes = size
            .checked_next_multiple_of(page_size)?
            .max(page_size);
        if let Some(budget) = pool.budget {
            if pool.page_bytes() + bytes > budget {
                return None;
            }
        }

        let layout = Layout::from_size_align(bytes, align.max(page_size)).ok()?;
        // SAFETY: `layout` has non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc(layout) })?;
        pool.pages.push(Page {
            base,
            layout,
            bump: 0,
            used: 0,
            free: Vec::new(),
        });
        Some(pool.pages.len() - 1)
    }

    /// Carve `size` bytes at `align` out of one page of the pool.
    fn allocate_span(&mut self, sub: Suballocator, size: usize, align: usize) -> Option<NonNull<u8>> {
        let pool = &mut self.pools[sub.0 as usize];
        for page in &mut pool.pages {
            if let Some(ptr) = Self::carve(page, size, align) {
                return Some(ptr);
            }
        }
        let idx = self.grow(sub, size, align)?;
        let page = &mut self.pools[sub.0 as usize].pages[idx];
        Self::carve(page, size, align)
    }

    fn carve(page: &mut Page, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = page.base.as_ptr() as usize;

        // First fit over returned blocks.
        for i in 0..page.free.len() {
            let (off, len) = page.free[i];
            let aligned = (base + off).next_multiple_of(align) - base;
            if aligned + size <= off + len {
                page.free.swap_remove(i);
                if aligned > off {
                    page.free.push((off, aligned - off));
                }
                if aligned + size < off + len {
                    page.free.push((aligned + size, off + len - (aligned + size)));
                }
                page.used += size;
                // SAFETY: the offset stays within the page allocation.
                return Some(unsafe { NonNull::new_unchecked(page.base.as_ptr().add(aligned)) });
            }
        }

        // Bump fallback.
        let aligned = (base + page.bump).next_multiple_of(align) - base;
        if aligned + size <= page.layout.size() {
            if aligned > page.bump {
                page.free.push((page.bump, aligned - page.bump));
            }
            page.bump = aligned + size;
            page.used += size;
            // SAFETY: the offset stays within the page allocation.
            return Some(unsafe { NonNull::new_unchecked(page.base.as_ptr().add(aligned)) });
        }
        None
    }

    /// Locate the pool and page owning `addr`.
    fn owner(&self, addr: *const u8) -> Option<(usize, usize)> {
        for (pool_idx, pool) in self.pools.iter().enumerate() {
            for (page_idx, page) in pool.pages.iter().enumerate() {
                if page.contains(addr) {
                    return Some((pool_idx, page_idx));
                }
            }
        }
        None
    }

    /// Combined span for a co-located batch: total size, alignment, and the
    /// offset of each region within the span.
    fn batch_span<const N: usize>(layouts: &[Layout; N]) -> (usize, usize, [usize; N]) {
        let mut offsets = [0_usize; N];
        let mut size = 0_usize;
        let mut align = 1_usize;
        for (i, layout) in layouts.iter().enumerate() {
            size = size.next_multiple_of(layout.align());
            offsets[i] = size;
            size += layout.size();
            align = align.max(layout.align());
        }
        (size.max(1), align, offsets)
    }
}

impl CollectiveAllocator for Collective {
    fn suballocator(&mut self, tag: SuballocatorTag) -> Option<Suballocator> {
        match tag {
            SuballocatorTag::PurelyLocal => Some(PURELY_LOCAL),
            SuballocatorTag::SwappablePlain => Some(SWAPPABLE),
            SuballocatorTag::NewPerPage => {
                let budget = self.page_size;
                self.pools.push(Pool {
                    pages: Vec::new(),
                    budget: Some(budget),
                });
                Some(Suballocator(u32::try_from(self.pools.len() - 1).ok()?))
            }
            SuballocatorTag::Owning(addr) => self
                .owner(addr)
                .map(|(pool_idx, _)| Suballocator(pool_idx as u32)),
        }
    }

    fn batch_allocate<const N: usize>(
        &mut self,
        sub: Suballocator,
        layouts: [Layout; N],
    ) -> Option<[NonNull<u8>; N]> {
        let (size, align, offsets) = Self::batch_span(&layouts);
        let span = self.allocate_span(sub, size, align)?;
        // SAFETY: every offset is within the span just carved.
        Some(offsets.map(|off| unsafe { NonNull::new_unchecked(span.as_ptr().add(off)) }))
    }

    fn batch_deallocate<const N: usize>(&mut self, regions: [(NonNull<u8>, Layout); N]) {
        // Regions of one batch are contiguous, but they may straddle padding,
        // so each is returned individually together with its padding gap.
        let (_, _, offsets) = Self::batch_span(&regions.map(|(_, layout)| layout));
        for (i, (ptr, layout)) in regions.iter().enumerate() {
            let Some((pool_idx, page_idx)) = self.owner(ptr.as_ptr()) else {
                debug_assert!(false, "deallocating an address the collective does not own");
                return;
            };
            let page = &mut self.pools[pool_idx].pages[page_idx];
            let off = ptr.as_ptr() as usize - page.base.as_ptr() as usize;
            // Fold the alignment gap before the next region into this block.
            let len = if i + 1 < N {
                offsets[i + 1] - offsets[i]
            } else {
                layout.size()
            };
            page.free.push((off, len));
            page.used -= len.min(page.used);
            if page.used == 0 {
                page.bump = 0;
                page.free.clear();
            }
        }
    }

    fn contains(&self, sub: Suballocator, addr: *const u8) -> bool {
        self.pools[sub.0 as usize]
            .pages
            .iter()
            .any(|page| page.contains(addr))
    }

    fn relocate<const N: usize>(
        &mut self,
        dest: Suballocator,
        regions: [(NonNull<u8>, Layout); N],
        transfer: &mut dyn FnMut(NonNull<u8>, Layout, NonNull<u8>),
    ) -> Relocation<N> {
        if N == 0 {
            return Relocation::InPlace;
        }
        if self.contains(dest, regions[0].0.as_ptr()) {
            return Relocation::InPlace;
        }
        let Some(new) = self.batch_allocate(dest, regions.map(|(_, layout)| layout)) else {
            return Relocation::Failed;
        };
        for (i, (from, layout)) in regions.iter().enumerate() {
            transfer(*from, *layout, new[i]);
        }
        self.batch_deallocate(regions);
        Relocation::Moved(new)
    }

    fn occupancy_under(&self, sub: Suballocator, fraction: f64) -> bool {
        let pool = &self.pools[sub.0 as usize];
        let capacity = pool.budget.unwrap_or_else(|| pool.page_bytes());
        if capacity == 0 {
            return true;
        }
        (pool.used_bytes() as f64) < fraction * (capacity as f64)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Drop for Collective {
    fn drop(&mut self) {
        for pool in &mut self.pools {
            for page in pool.pages.drain(..) {
                // SAFETY: the page was allocated with exactly this layout and
                // is not referenced anymore.
                unsafe { alloc::dealloc(page.base.as_ptr(), page.layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use pretty_assertions::assert_eq;

    use super::{
        Collective, CollectiveAllocator, Relocation, Suballocator, SuballocatorTag,
    };

    fn local(alloc: &mut Collective) -> Suballocator {
        alloc
            .suballocator(SuballocatorTag::PurelyLocal)
            .expect("purely local tier always exists")
    }

    fn swappable(alloc: &mut Collective) -> Suballocator {
        alloc
            .suballocator(SuballocatorTag::SwappablePlain)
            .expect("swappable tier always exists")
    }

    #[test]
    fn batch_is_co_located_and_ordered() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let sub = local(&mut alloc);
        let layouts = [Layout::new::<u64>(), Layout::array::<u64>(4).unwrap()];
        let [a, b] = alloc.batch_allocate(sub, layouts).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert!(alloc.contains(sub, a.as_ptr()));
        assert!(alloc.contains(sub, b.as_ptr()));
    }

    #[test]
    fn local_budget_is_enforced() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let sub = local(&mut alloc);
        let chunk = Layout::array::<u8>(1024).unwrap();
        for _ in 0..4 {
            assert!(alloc.batch_allocate(sub, [chunk]).is_some());
        }
        // The single budgeted page is full and no second page may be acquired.
        assert!(alloc.batch_allocate(sub, [chunk]).is_none());
    }

    #[test]
    fn deallocate_enables_reuse() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let sub = local(&mut alloc);
        let chunk = Layout::array::<u8>(2048).unwrap();
        let [a] = alloc.batch_allocate(sub, [chunk]).unwrap();
        let [_b] = alloc.batch_allocate(sub, [chunk]).unwrap();
        assert!(alloc.batch_allocate(sub, [chunk]).is_none());
        alloc.batch_deallocate([(a, chunk)]);
        assert!(alloc.batch_allocate(sub, [chunk]).is_some());
    }

    #[test]
    fn swappable_is_unbounded() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let sub = swappable(&mut alloc);
        let chunk = Layout::array::<u8>(3000).unwrap();
        for _ in 0..64 {
            assert!(alloc.batch_allocate(sub, [chunk]).is_some());
        }
    }

    #[test]
    fn owning_tag_resolves_addresses() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let far = swappable(&mut alloc);
        let [ptr] = alloc.batch_allocate(far, [Layout::new::<u64>()]).unwrap();
        let owner = alloc
            .suballocator(SuballocatorTag::Owning(ptr.as_ptr()))
            .unwrap();
        assert_eq!(owner, far);
        assert!(
            alloc
                .suballocator(SuballocatorTag::Owning(std::ptr::null()))
                .is_none()
        );
    }

    #[test]
    fn relocate_moves_bytes_between_tiers() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let near = local(&mut alloc);
        let far = swappable(&mut alloc);
        let layout = Layout::new::<u64>();
        let [src] = alloc.batch_allocate(far, [layout]).unwrap();
        // SAFETY: freshly allocated, properly aligned storage.
        unsafe { src.as_ptr().cast::<u64>().write(0xDEAD_BEEF) };

        let outcome = alloc.relocate(near, [(src, layout)], &mut |from, l, to| {
            // SAFETY: both regions are live and disjoint.
            unsafe { std::ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), l.size()) };
        });
        let Relocation::Moved([dst]) = outcome else {
            panic!("expected relocation to happen");
        };
        assert!(alloc.contains(near, dst.as_ptr()));
        // SAFETY: dst holds the transferred u64.
        assert_eq!(unsafe { dst.as_ptr().cast::<u64>().read() }, 0xDEAD_BEEF);
    }

    #[test]
    fn relocate_into_owning_tier_is_in_place() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let far = swappable(&mut alloc);
        let layout = Layout::new::<u64>();
        let [src] = alloc.batch_allocate(far, [layout]).unwrap();
        let outcome = alloc.relocate(far, [(src, layout)], &mut |_, _, _| {
            panic!("no transfer may happen for an in-place relocation");
        });
        assert!(matches!(outcome, Relocation::InPlace));
    }

    #[test]
    fn page_block_fills_up_and_fails() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let block = alloc.suballocator(SuballocatorTag::NewPerPage).unwrap();
        let chunk = Layout::array::<u8>(1500).unwrap();
        assert!(alloc.occupancy_under(block, 0.7));
        assert!(alloc.batch_allocate(block, [chunk]).is_some());
        assert!(alloc.occupancy_under(block, 0.7));
        assert!(alloc.batch_allocate(block, [chunk]).is_some());
        assert!(!alloc.occupancy_under(block, 0.7));
        assert!(alloc.batch_allocate(block, [chunk]).is_none());
    }

    #[test]
    fn pages_are_page_aligned() {
        let mut alloc = Collective::with_page_size(4096, 4096);
        let far = swappable(&mut alloc);
        let [ptr] = alloc.batch_allocate(far, [Layout::new::<u8>()]).unwrap();
        assert_eq!(ptr.as_ptr() as usize % alloc.page_size(), 0);
    }
}
