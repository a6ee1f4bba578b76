//! Region allocator: the bottom of the allocator stack.
//!
//! The arena's data area is carved into fixed-size regions of fixed-size
//! pages. Each region tracks its pages with a used-bitmap; allocation is
//! first-fit over regions, and a run never crosses a region boundary.
//! Freed pages clear their bits, so adjacent free pages coalesce for free
//! in the bitmap.
//!
//! Per-page metadata lives in one `PageMeta` array shared by every layer
//! of the stack: this layer owns the page state machine (free / run head /
//! run body), the page pool adds cached-free-run states and the free-run
//! tree node, and the slab layer adds class bookkeeping.

use shtab_util::bitmap;
use shtab_util::status::{Result, Status};

use crate::config::{MAX_PAGES_PER_REGION, MAX_REGIONS};
use crate::intrusive::{ListNode, RbNode};
use crate::mem::Arena;
use crate::sync::RobustMutex;

/// Page states. FREE pages belong to the region layer; HEAD/BODY mark an
/// allocated run; FREE_HEAD/FREE_BODY mark a run cached by the page pool.
pub const PG_FREE: u8 = 0;
pub const PG_HEAD: u8 = 1;
pub const PG_BODY: u8 = 2;
pub const PG_FREE_HEAD: u8 = 3;
pub const PG_FREE_BODY: u8 = 4;

/// Slab class byte for pages that carry no slab objects.
pub const CLASS_NONE: u8 = 0xFF;
/// Slab class byte for whole-run ("big") allocations.
pub const CLASS_BIG: u8 = 0xFE;

/// In-page free-list terminator.
pub const OBJ_NONE: u32 = u32::MAX;

/// Per-page metadata, one entry per data page, stored in the shared header
/// area between the library state and the data pages.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageMeta {
    pub state: u8,
    /// Slab class shift, or `CLASS_NONE` / `CLASS_BIG`.
    pub class: u8,
    _pad: [u8; 2],
    /// Length of the run; meaningful on run heads.
    pub run_len: u32,
    /// Page index of the run head; meaningful on bodies.
    pub head: u32,
    /// Live slab objects on this page.
    pub used_cnt: u32,
    /// In-page byte offset of the first free slab object, or `OBJ_NONE`.
    pub free_head: u32,
    _pad2: u32,
    /// Slab partial-page list linkage.
    pub lnode: ListNode,
    /// Page-pool free-run tree linkage (run heads only).
    pub rbnode: RbNode,
}

/// Free-page bitmap of one region. Bit set = page allocated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionMeta {
    pub used: [u64; MAX_PAGES_PER_REGION / 64],
}

/// Scan one region's bitmap for a free stretch of at least `n` pages,
/// returning (start, full stretch length). The full length matters: the
/// page pool claims whole stretches so nothing free stays untracked.
fn find_free_stretch(words: &[u64], ppr: usize, n: usize) -> Result<Option<(usize, usize)>> {
    let mut start = 0usize;
    while let Some(free) = bitmap::find_next_bit(words, ppr, start, false)? {
        let mut len = 1usize;
        while free + len < ppr && !bitmap::get(words, free + len) {
            len += 1;
        }
        if len >= n {
            return Ok(Some((free, len)));
        }
        start = free + len;
        if start >= ppr {
            break;
        }
    }
    Ok(None)
}

/// The region allocator. Lives in the shared header.
#[repr(C)]
pub struct RegionPool {
    pub inited: u32,
    pub region_count: u32,
    pub pages_per_region: u32,
    pub page_size: u32,
    /// Arena offset of the first data page.
    pub data_off: u64,
    /// Arena offset of the `PageMeta` array.
    pub meta_off: u64,
    pub lock: RobustMutex,
    pub regions: [RegionMeta; MAX_REGIONS],
}

impl RegionPool {
    /// Arena offset of page `idx`'s metadata.
    #[inline]
    pub fn meta_of(&self, idx: u32) -> u64 {
        self.meta_off + idx as u64 * std::mem::size_of::<PageMeta>() as u64
    }

    /// Arena offset of page `idx`'s data.
    #[inline]
    pub fn data_of(&self, idx: u32) -> u64 {
        self.data_off + idx as u64 * self.page_size as u64
    }

    /// Page index owning the arena offset `off` (which must be in the data
    /// area).
    #[inline]
    pub fn page_of(&self, off: u64) -> Result<u32> {
        if off < self.data_off {
            return Err(Status::ArgInvalid("offset below data area"));
        }
        let idx = (off - self.data_off) / self.page_size as u64;
        if idx >= self.total_pages() as u64 {
            return Err(Status::ArgInvalid("offset beyond data area"));
        }
        Ok(idx as u32)
    }

    #[inline]
    pub fn total_pages(&self) -> u32 {
        self.region_count * self.pages_per_region
    }

    /// Initialise the pool in place over `[data_off, data_off + pages)`.
    ///
    /// `zeroed` tells whether the backing memory is already zero-filled
    /// (fresh shared segments are); otherwise the metadata is cleared here.
    ///
    /// # Safety
    ///
    /// `self_off` must address a `RegionPool`-sized, 8-aligned range that
    /// no other process touches until init returns; `meta_off` must hold
    /// room for one `PageMeta` per page and `data_off` for all data pages.
    pub unsafe fn init(
        arena: &Arena,
        self_off: u64,
        data_off: u64,
        meta_off: u64,
        page_size: u32,
        pages_per_region: u32,
        region_count: u32,
        zeroed: bool,
    ) -> Result<()> {
        if region_count == 0 || region_count as usize > MAX_REGIONS {
            return Err(Status::ArgInvalid("region_count out of bounds"));
        }
        if pages_per_region == 0 || pages_per_region as usize > MAX_PAGES_PER_REGION {
            return Err(Status::ArgInvalid("pages_per_region out of bounds"));
        }

        let pool = arena.at_mut::<RegionPool>(self_off);
        if pool.inited != 0 {
            return Err(Status::InitTwice);
        }

        pool.region_count = region_count;
        pool.pages_per_region = pages_per_region;
        pool.page_size = page_size;
        pool.data_off = data_off;
        pool.meta_off = meta_off;

        if !zeroed {
            for r in pool.regions.iter_mut() {
                r.used.fill(0);
            }
            let total = region_count as u64 * pages_per_region as u64;
            arena
                .bytes_mut(meta_off, total as usize * std::mem::size_of::<PageMeta>())
                .fill(0);
        }
        // Zeroed PageMeta is PG_FREE with detached links; only the class
        // byte needs a non-zero idle value.
        for idx in 0..pool.total_pages() {
            arena.at_mut::<PageMeta>(pool.meta_of(idx)).class = CLASS_NONE;
        }

        pool.lock.init()?;
        pool.inited = 1;
        Ok(())
    }

    /// Allocate a run of exactly `n` contiguous pages. First-fit over
    /// regions; returns the global index of the run head.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool in `arena`.
    pub unsafe fn alloc_pages(arena: &Arena, self_off: u64, n: u32) -> Result<u32> {
        Ok(Self::alloc_inner(arena, self_off, n, false)?.0)
    }

    /// Allocate at least `n` pages by claiming the *entire* first-fit free
    /// stretch that can hold them. Returns (run head, run length).
    ///
    /// The page pool grows through this so every page of a stretch it
    /// touches enters its run cache at once; the carved-off remainder goes
    /// straight into the free-run tree instead of lingering as untracked
    /// region capacity.
    ///
    /// # Safety
    ///
    /// As [`alloc_pages`](Self::alloc_pages).
    pub unsafe fn alloc_run(arena: &Arena, self_off: u64, n: u32) -> Result<(u32, u32)> {
        Self::alloc_inner(arena, self_off, n, true)
    }

    unsafe fn alloc_inner(
        arena: &Arena,
        self_off: u64,
        n: u32,
        whole_stretch: bool,
    ) -> Result<(u32, u32)> {
        let pool = arena.at_mut::<RegionPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        let ppr = pool.pages_per_region as usize;
        if n == 0 || n as usize > ppr {
            return Err(Status::ArgInvalid("run length out of bounds"));
        }

        let _g = pool.lock.guard()?;

        for r in 0..pool.region_count as usize {
            let words: &mut [u64] = &mut pool.regions[r].used;
            if let Some((free, stretch)) = find_free_stretch(words, ppr, n as usize)? {
                let take = if whole_stretch { stretch } else { n as usize };
                for i in free..free + take {
                    bitmap::set(words, i);
                }
                let head = (r * ppr + free) as u32;
                Self::mark_run(arena, pool, head, take as u32, PG_HEAD, PG_BODY);
                return Ok((head, take as u32));
            }
        }

        Err(Status::OutOfMemory {
            requested: n as usize * pool.page_size as usize,
        })
    }

    /// Claim the untouched free stretch starting at `start_idx`, up to the
    /// first allocated page or the region end. Returns its length.
    ///
    /// The page pool uses this while coalescing to absorb neighbouring
    /// pages that are free at the bitmap level but were never handed out,
    /// so its cached view cannot diverge from the region's true free
    /// capacity. The pages come back marked as an allocated run; the
    /// caller restates them.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool; `start_idx` must be a
    /// page the pool does not currently own.
    pub unsafe fn claim_free_run(arena: &Arena, self_off: u64, start_idx: u32) -> Result<u32> {
        let pool = arena.at_mut::<RegionPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        if start_idx >= pool.total_pages() {
            return Err(Status::IndexOutOfRange {
                index: start_idx as usize,
                len: pool.total_pages() as usize,
            });
        }

        let _g = pool.lock.guard()?;

        let ppr = pool.pages_per_region as usize;
        let r = (start_idx / pool.pages_per_region) as usize;
        let first = (start_idx % pool.pages_per_region) as usize;
        let words: &mut [u64] = &mut pool.regions[r].used;

        if bitmap::get(words, first) {
            return Err(Status::StateInvalid("claim of an allocated page"));
        }
        let mut len = 1usize;
        while first + len < ppr && !bitmap::get(words, first + len) {
            len += 1;
        }
        for i in first..first + len {
            bitmap::set(words, i);
        }
        Self::mark_run(arena, pool, start_idx, len as u32, PG_HEAD, PG_BODY);
        Ok(len as u32)
    }

    /// Free the run whose head is `head_idx`, returning its pages to the
    /// region bitmap. Accepts allocated runs and page-pool cached runs.
    ///
    /// # Safety
    ///
    /// `head_idx` must be a run head previously produced by this pool.
    pub unsafe fn free_pages(arena: &Arena, self_off: u64, head_idx: u32) -> Result<()> {
        let pool = arena.at_mut::<RegionPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        if head_idx >= pool.total_pages() {
            return Err(Status::IndexOutOfRange {
                index: head_idx as usize,
                len: pool.total_pages() as usize,
            });
        }

        let _g = pool.lock.guard()?;

        let head = arena.at_mut::<PageMeta>(pool.meta_of(head_idx));
        if head.state != PG_HEAD && head.state != PG_FREE_HEAD {
            return Err(Status::StateInvalid("free of a non-head page"));
        }
        let len = head.run_len;

        let ppr = pool.pages_per_region as u32;
        let region = (head_idx / ppr) as usize;
        let first_in_region = head_idx % ppr;
        debug_assert!(first_in_region + len <= ppr);

        for i in 0..len {
            let meta = arena.at_mut::<PageMeta>(pool.meta_of(head_idx + i));
            *meta = std::mem::zeroed();
            meta.class = CLASS_NONE;
            bitmap::clear(&mut pool.regions[region].used, (first_in_region + i) as usize);
        }
        Ok(())
    }

    unsafe fn mark_run(
        arena: &Arena,
        pool: &RegionPool,
        head_idx: u32,
        len: u32,
        head_state: u8,
        body_state: u8,
    ) {
        for i in 0..len {
            let meta = arena.at_mut::<PageMeta>(pool.meta_of(head_idx + i));
            meta.state = if i == 0 { head_state } else { body_state };
            meta.run_len = if i == 0 { len } else { 0 };
            meta.head = head_idx;
            meta.class = CLASS_NONE;
            meta.used_cnt = 0;
            meta.free_head = OBJ_NONE;
        }
    }

    /// Tear the pool down. Every page must have been freed.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool; no other process may
    /// be using it.
    pub unsafe fn destroy(arena: &Arena, self_off: u64) -> Result<()> {
        let pool = arena.at_mut::<RegionPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        for r in 0..pool.region_count as usize {
            if !bitmap::all_cleared(&pool.regions[r].used, pool.pages_per_region as usize) {
                return Err(Status::NotEmpty);
            }
        }
        pool.lock.destroy()?;
        pool.inited = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::align_up;

    struct Fixture {
        _buf: Vec<u8>,
        arena: Arena,
        pool_off: u64,
    }

    /// Build a region pool over a plain heap buffer:
    /// [pad | RegionPool | PageMeta[] | data pages].
    fn fixture(page_size: u32, ppr: u32, regions: u32) -> Fixture {
        let pool_off = 64u64;
        let meta_off = align_up(
            pool_off as usize + std::mem::size_of::<RegionPool>(),
            64,
        ) as u64;
        let total_pages = (ppr * regions) as usize;
        let data_off = align_up(
            meta_off as usize + total_pages * std::mem::size_of::<PageMeta>(),
            page_size as usize,
        ) as u64;
        let len = data_off as usize + total_pages * page_size as usize;

        let mut buf = vec![0u8; len];
        let arena = unsafe { Arena::new(buf.as_mut_ptr(), buf.len()) };
        unsafe {
            RegionPool::init(
                &arena, pool_off, data_off, meta_off, page_size, ppr, regions, true,
            )
            .unwrap();
        }
        Fixture {
            _buf: buf,
            arena,
            pool_off,
        }
    }

    #[test]
    fn alloc_is_first_fit_and_contiguous() {
        let f = fixture(4096, 8, 2);
        unsafe {
            let a = RegionPool::alloc_pages(&f.arena, f.pool_off, 3).unwrap();
            let b = RegionPool::alloc_pages(&f.arena, f.pool_off, 2).unwrap();
            assert_eq!(a, 0);
            assert_eq!(b, 3);

            let pool = f.arena.at::<RegionPool>(f.pool_off);
            let head = f.arena.at::<PageMeta>(pool.meta_of(a));
            assert_eq!(head.state, PG_HEAD);
            assert_eq!(head.run_len, 3);
            assert_eq!(f.arena.at::<PageMeta>(pool.meta_of(1)).state, PG_BODY);
        }
    }

    #[test]
    fn runs_do_not_cross_regions() {
        let f = fixture(4096, 4, 2);
        unsafe {
            let a = RegionPool::alloc_pages(&f.arena, f.pool_off, 3).unwrap();
            // 1 page left in region 0; a 2-page run must come from region 1.
            let b = RegionPool::alloc_pages(&f.arena, f.pool_off, 2).unwrap();
            assert_eq!(a, 0);
            assert_eq!(b, 4);
        }
    }

    #[test]
    fn exhaustion_reports_oom_without_partial_allocation() {
        let f = fixture(4096, 4, 1);
        unsafe {
            RegionPool::alloc_pages(&f.arena, f.pool_off, 3).unwrap();
            let err = RegionPool::alloc_pages(&f.arena, f.pool_off, 2).unwrap_err();
            assert!(matches!(err, Status::OutOfMemory { .. }));
            // The single remaining page is still allocatable.
            assert_eq!(RegionPool::alloc_pages(&f.arena, f.pool_off, 1).unwrap(), 3);
        }
    }

    #[test]
    fn free_coalesces_in_bitmap() {
        let f = fixture(4096, 8, 1);
        unsafe {
            let a = RegionPool::alloc_pages(&f.arena, f.pool_off, 2).unwrap();
            let b = RegionPool::alloc_pages(&f.arena, f.pool_off, 2).unwrap();
            RegionPool::free_pages(&f.arena, f.pool_off, a).unwrap();
            RegionPool::free_pages(&f.arena, f.pool_off, b).unwrap();
            // The two freed runs merge: a 4-page run fits again at 0.
            assert_eq!(RegionPool::alloc_pages(&f.arena, f.pool_off, 4).unwrap(), 0);
        }
    }

    #[test]
    fn alloc_run_claims_the_whole_stretch() {
        let f = fixture(4096, 8, 2);
        unsafe {
            let (head, len) = RegionPool::alloc_run(&f.arena, f.pool_off, 2).unwrap();
            assert_eq!((head, len), (0, 8));

            let pool = f.arena.at::<RegionPool>(f.pool_off);
            assert_eq!(f.arena.at::<PageMeta>(pool.meta_of(0)).run_len, 8);

            // Region 0 is fully claimed; the next growth takes region 1.
            let (head, len) = RegionPool::alloc_run(&f.arena, f.pool_off, 1).unwrap();
            assert_eq!((head, len), (8, 8));
        }
    }

    #[test]
    fn claim_free_run_absorbs_untouched_pages() {
        let f = fixture(4096, 8, 1);
        unsafe {
            // Take the first three pages exactly, leaving 3..8 untouched.
            let a = RegionPool::alloc_pages(&f.arena, f.pool_off, 3).unwrap();
            assert_eq!(a, 0);

            let claimed = RegionPool::claim_free_run(&f.arena, f.pool_off, 3).unwrap();
            assert_eq!(claimed, 5);

            // Claiming an owned page is an invariant breach.
            assert!(matches!(
                RegionPool::claim_free_run(&f.arena, f.pool_off, 4),
                Err(Status::StateInvalid(_))
            ));

            RegionPool::free_pages(&f.arena, f.pool_off, a).unwrap();
            RegionPool::free_pages(&f.arena, f.pool_off, 3).unwrap();
            RegionPool::destroy(&f.arena, f.pool_off).unwrap();
        }
    }

    #[test]
    fn destroy_requires_everything_freed() {
        let f = fixture(4096, 4, 1);
        unsafe {
            let a = RegionPool::alloc_pages(&f.arena, f.pool_off, 1).unwrap();
            assert_eq!(
                RegionPool::destroy(&f.arena, f.pool_off),
                Err(Status::NotEmpty)
            );
            RegionPool::free_pages(&f.arena, f.pool_off, a).unwrap();
            RegionPool::destroy(&f.arena, f.pool_off).unwrap();
        }
    }
}
