//! Slab pool: power-of-two object classes carved out of pages.
//!
//! Each class keeps a list of *partial* pages; within a page, free objects
//! form a singly-linked list threaded through their first four bytes. A
//! page leaves the partial list when it fills, and goes back to the page
//! pool when its last object is freed. Requests larger than a page bypass
//! the classes and take a whole run ("big" allocations).
//!
//! Concurrency: one robust mutex per class; the page pool's own mutex
//! serialises page traffic underneath.

use std::sync::atomic::{AtomicI64, Ordering};

use shtab_util::status::{Result, Status};

use crate::config::{MAX_SLAB_CLASSES, SLAB_MIN_SHIFT};
use crate::intrusive::list;
use crate::intrusive::ListNode;
use crate::mem::pagepool::{region_off, PagePool};
use crate::mem::region::{PageMeta, RegionPool, CLASS_BIG, CLASS_NONE, OBJ_NONE, PG_HEAD};
use crate::mem::Arena;
use crate::sync::RobustMutex;
use crate::util::ceil_log2;

/// Usage counters of one class. Observability only; maintained under the
/// class lock but readable without it.
#[repr(C)]
#[derive(Debug)]
pub struct SlabStats {
    pub current: AtomicI64,
    pub peak: AtomicI64,
    pub alloc_total: AtomicI64,
    pub free_total: AtomicI64,
}

impl SlabStats {
    fn on_alloc(&self) {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.alloc_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_free(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
        self.free_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain-data snapshot of a class's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabStatsSnapshot {
    pub current: i64,
    pub peak: i64,
    pub alloc_total: i64,
    pub free_total: i64,
}

/// One size class.
#[repr(C)]
pub struct SlabClass {
    pub obj_size: u32,
    pub inited: u32,
    /// Partial pages of this class.
    pub partial: ListNode,
    pub stats: SlabStats,
    pub lock: RobustMutex,
}

/// The slab pool. Lives in the shared header, wrapping the page pool.
#[repr(C)]
pub struct SlabPool {
    pub inited: u32,
    pub min_shift: u32,
    pub max_shift: u32,
    _pad: u32,
    pub classes: [SlabClass; MAX_SLAB_CLASSES],
    /// Counters for whole-run allocations.
    pub big_stats: SlabStats,
    pub page_pool: PagePool,
}

/// Offset of the nested page pool, given the slab pool's offset.
#[inline]
pub fn pagepool_off(pool_off: u64) -> u64 {
    pool_off + std::mem::offset_of!(SlabPool, page_pool) as u64
}

#[inline]
fn class_off(pool_off: u64, shift: u32) -> u64 {
    pool_off
        + std::mem::offset_of!(SlabPool, classes) as u64
        + shift as u64 * std::mem::size_of::<SlabClass>() as u64
}

#[inline]
fn partial_head_off(pool_off: u64, shift: u32) -> u64 {
    class_off(pool_off, shift) + std::mem::offset_of!(SlabClass, partial) as u64
}

#[inline]
fn lnode_off(region: &RegionPool, idx: u32) -> u64 {
    region.meta_of(idx) + std::mem::offset_of!(PageMeta, lnode) as u64
}

#[inline]
fn idx_of_lnode(region: &RegionPool, node_off: u64) -> u32 {
    let rel = node_off - region.meta_off - std::mem::offset_of!(PageMeta, lnode) as u64;
    (rel / std::mem::size_of::<PageMeta>() as u64) as u32
}

impl SlabPool {
    /// Initialise the class table in place. The nested page pool (and its
    /// region allocator) must have been initialised first; the class range
    /// is derived from the configured page size.
    ///
    /// # Safety
    ///
    /// `self_off` must address a `SlabPool` range whose page-pool member
    /// is initialised.
    pub unsafe fn init(arena: &Arena, self_off: u64) -> Result<()> {
        let pool = arena.at_mut::<SlabPool>(self_off);
        if pool.inited != 0 {
            return Err(Status::InitTwice);
        }
        if pool.page_pool.inited == 0 {
            return Err(Status::NotReady);
        }

        let page_size = pool.page_pool.region.page_size;
        let max_shift = ceil_log2(page_size as usize);
        if max_shift as usize >= MAX_SLAB_CLASSES {
            return Err(Status::ArgInvalid("page size too large for class table"));
        }

        pool.min_shift = SLAB_MIN_SHIFT;
        pool.max_shift = max_shift;

        for shift in SLAB_MIN_SHIFT..=max_shift {
            let class = arena.at_mut::<SlabClass>(class_off(self_off, shift));
            class.obj_size = 1 << shift;
            class.stats.current.store(0, Ordering::Relaxed);
            class.stats.peak.store(0, Ordering::Relaxed);
            class.stats.alloc_total.store(0, Ordering::Relaxed);
            class.stats.free_total.store(0, Ordering::Relaxed);
            list::init_head(arena, partial_head_off(self_off, shift));
            class.lock.init()?;
            class.inited = 1;
        }

        pool.inited = 1;
        Ok(())
    }

    /// Map a request size to its class shift, or `None` for big requests.
    unsafe fn shift_for(arena: &Arena, self_off: u64, size: usize) -> Option<u32> {
        let pool = arena.at::<SlabPool>(self_off);
        let shift = ceil_log2(size.max(1 << pool.min_shift)).max(pool.min_shift);
        (shift <= pool.max_shift).then_some(shift)
    }

    /// Allocate `size` bytes; returns the arena offset of the object.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool in `arena`.
    pub unsafe fn alloc(arena: &Arena, self_off: u64, size: usize) -> Result<u64> {
        let pool = arena.at::<SlabPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        if size == 0 {
            return Err(Status::ArgInvalid("zero-size allocation"));
        }

        let Some(shift) = Self::shift_for(arena, self_off, size) else {
            return Self::alloc_big(arena, self_off, size);
        };

        let region: &RegionPool =
            arena.at(region_off(pagepool_off(self_off)));
        let class = arena.at_mut::<SlabClass>(class_off(self_off, shift));
        let obj_size = class.obj_size;
        let page_size = region.page_size;

        let _g = class.lock.guard()?;

        let head_off = partial_head_off(self_off, shift);
        let page_idx = match list::first(arena, head_off) {
            Some(node) => idx_of_lnode(region, node),
            None => {
                let idx = PagePool::alloc(arena, pagepool_off(self_off), 1)?;
                Self::carve_page(arena, region, idx, shift, obj_size, page_size);
                list::insert_last(arena, head_off, lnode_off(region, idx));
                idx
            }
        };

        let meta = arena.at_mut::<PageMeta>(region.meta_of(page_idx));
        debug_assert_ne!(meta.free_head, OBJ_NONE);

        let in_page = meta.free_head;
        let obj_off = region.data_of(page_idx) + in_page as u64;
        // The first four bytes of a free object hold the in-page offset of
        // the next free object; objects are at least 8-aligned.
        meta.free_head = *arena.at::<u32>(obj_off);
        meta.used_cnt += 1;

        if meta.free_head == OBJ_NONE {
            // Page is full; drop it from the partial list.
            list::remove(arena, lnode_off(region, page_idx));
        }

        class.stats.on_alloc();
        Ok(obj_off)
    }

    /// Free the object at `obj_off`, previously returned by [`alloc`].
    ///
    /// # Safety
    ///
    /// `obj_off` must be a live allocation of this pool.
    ///
    /// [`alloc`]: Self::alloc
    pub unsafe fn free(arena: &Arena, self_off: u64, obj_off: u64) -> Result<()> {
        let pool = arena.at::<SlabPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }

        let region: &RegionPool =
            arena.at(region_off(pagepool_off(self_off)));
        let page_idx = region.page_of(obj_off)?;
        let class_byte = arena.at::<PageMeta>(region.meta_of(page_idx)).class;

        match class_byte {
            CLASS_BIG => Self::free_big(arena, self_off, obj_off, page_idx),
            CLASS_NONE => Err(Status::StateInvalid("free on a classless page")),
            shift => {
                let shift = shift as u32;
                if shift < pool.min_shift || shift > pool.max_shift {
                    return Err(Status::StateInvalid("corrupt class byte"));
                }
                let class = arena.at_mut::<SlabClass>(class_off(self_off, shift));
                let _g = class.lock.guard()?;

                let meta = arena.at_mut::<PageMeta>(region.meta_of(page_idx));
                let in_page = (obj_off - region.data_of(page_idx)) as u32;
                debug_assert_eq!(in_page % class.obj_size, 0);

                let was_full = meta.free_head == OBJ_NONE;
                *arena.at_mut::<u32>(obj_off) = meta.free_head;
                meta.free_head = in_page;
                meta.used_cnt -= 1;

                if meta.used_cnt == 0 {
                    // Last object gone: page returns to the page pool.
                    if !was_full {
                        list::remove(arena, lnode_off(region, page_idx));
                    }
                    meta.class = CLASS_NONE;
                    meta.free_head = OBJ_NONE;
                    PagePool::free(arena, pagepool_off(self_off), page_idx)?;
                } else if was_full {
                    list::insert_last(
                        arena,
                        partial_head_off(self_off, shift),
                        lnode_off(region, page_idx),
                    );
                }

                class.stats.on_free();
                Ok(())
            }
        }
    }

    unsafe fn alloc_big(arena: &Arena, self_off: u64, size: usize) -> Result<u64> {
        let pool = arena.at::<SlabPool>(self_off);
        let region: &RegionPool =
            arena.at(region_off(pagepool_off(self_off)));
        let page_size = region.page_size as usize;
        let pages = size.div_ceil(page_size) as u32;

        let head = PagePool::alloc(arena, pagepool_off(self_off), pages)?;
        arena.at_mut::<PageMeta>(region.meta_of(head)).class = CLASS_BIG;
        pool.big_stats.on_alloc();
        Ok(region.data_of(head))
    }

    unsafe fn free_big(arena: &Arena, self_off: u64, obj_off: u64, page_idx: u32) -> Result<()> {
        let pool = arena.at::<SlabPool>(self_off);
        let region: &RegionPool =
            arena.at(region_off(pagepool_off(self_off)));

        let meta = arena.at_mut::<PageMeta>(region.meta_of(page_idx));
        if meta.state != PG_HEAD || obj_off != region.data_of(page_idx) {
            return Err(Status::StateInvalid("big free must hit the run head"));
        }
        meta.class = CLASS_NONE;
        PagePool::free(arena, pagepool_off(self_off), page_idx)?;
        pool.big_stats.on_free();
        Ok(())
    }

    unsafe fn carve_page(
        arena: &Arena,
        region: &RegionPool,
        page_idx: u32,
        shift: u32,
        obj_size: u32,
        page_size: u32,
    ) {
        let meta = arena.at_mut::<PageMeta>(region.meta_of(page_idx));
        meta.class = shift as u8;
        meta.used_cnt = 0;
        meta.free_head = 0;

        let page_data = region.data_of(page_idx);
        let count = page_size / obj_size;
        for i in 0..count {
            let next = if i + 1 == count {
                OBJ_NONE
            } else {
                (i + 1) * obj_size
            };
            *arena.at_mut::<u32>(page_data + (i * obj_size) as u64) = next;
        }
    }

    /// Statistics snapshot of the class serving `size`, or the big-run
    /// counters for oversized requests.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool in `arena`.
    pub unsafe fn stats_for(arena: &Arena, self_off: u64, size: usize) -> Result<SlabStatsSnapshot> {
        let pool = arena.at::<SlabPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        let stats = match Self::shift_for(arena, self_off, size) {
            Some(shift) => &arena.at::<SlabClass>(class_off(self_off, shift)).stats,
            None => &pool.big_stats,
        };
        Ok(SlabStatsSnapshot {
            current: stats.current.load(Ordering::Relaxed),
            peak: stats.peak.load(Ordering::Relaxed),
            alloc_total: stats.alloc_total.load(Ordering::Relaxed),
            free_total: stats.free_total.load(Ordering::Relaxed),
        })
    }

    /// Tear down: every class must be empty.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool; no other process may
    /// be using it.
    pub unsafe fn destroy(arena: &Arena, self_off: u64) -> Result<()> {
        let pool = arena.at_mut::<SlabPool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }

        for shift in pool.min_shift..=pool.max_shift {
            let class = arena.at::<SlabClass>(class_off(self_off, shift));
            if class.stats.current.load(Ordering::Relaxed) != 0 {
                return Err(Status::NotEmpty);
            }
        }
        if pool.big_stats.current.load(Ordering::Relaxed) != 0 {
            return Err(Status::NotEmpty);
        }

        for shift in pool.min_shift..=pool.max_shift {
            let class = arena.at_mut::<SlabClass>(class_off(self_off, shift));
            class.lock.destroy()?;
            class.inited = 0;
        }
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

    fn fixture(page_size: u32, ppr: u32, regions: u32) -> Fixture {
        let pool_off = 64u64;
        let meta_off =
            align_up(pool_off as usize + std::mem::size_of::<SlabPool>(), 64) as u64;
        let total_pages = (ppr * regions) as usize;
        let data_off = align_up(
            meta_off as usize + total_pages * std::mem::size_of::<PageMeta>(),
            page_size as usize,
        ) as u64;
        let len = data_off as usize + total_pages * page_size as usize;

        let mut buf = vec![0u8; len];
        let arena = unsafe { Arena::new(buf.as_mut_ptr(), buf.len()) };
        unsafe {
            crate::mem::region::RegionPool::init(
                &arena,
                region_off(pagepool_off(pool_off)),
                data_off,
                meta_off,
                page_size,
                ppr,
                regions,
                true,
            )
            .unwrap();
            PagePool::init(&arena, pagepool_off(pool_off)).unwrap();
            SlabPool::init(&arena, pool_off).unwrap();
        }
        Fixture {
            _buf: buf,
            arena,
            pool_off,
        }
    }

    #[test]
    fn alloc_rounds_to_class_size() {
        let f = fixture(4096, 8, 1);
        unsafe {
            let a = SlabPool::alloc(&f.arena, f.pool_off, 9).unwrap();
            let b = SlabPool::alloc(&f.arena, f.pool_off, 16).unwrap();
            // Both land in the 16-byte class, adjacent in one page.
            assert_eq!(b - a, 16);
            let stats = SlabPool::stats_for(&f.arena, f.pool_off, 16).unwrap();
            assert_eq!(stats.current, 2);
        }
    }

    #[test]
    fn class_roundtrip_returns_pages() {
        // Test scenario: region of 4 pages, classes {8, 16, 32} ten times
        // each, freed in reverse order; everything must drain back to one
        // free run per region.
        let f = fixture(4096, 4, 1);
        unsafe {
            let mut objs = Vec::new();
            for size in [8usize, 16, 32] {
                for _ in 0..10 {
                    objs.push((size, SlabPool::alloc(&f.arena, f.pool_off, size).unwrap()));
                }
                let stats = SlabPool::stats_for(&f.arena, f.pool_off, size).unwrap();
                assert_eq!(stats.current, 10);
                assert_eq!(stats.peak, 10);
            }

            for (_, obj) in objs.iter().rev() {
                SlabPool::free(&f.arena, f.pool_off, *obj).unwrap();
            }

            for size in [8usize, 16, 32] {
                let stats = SlabPool::stats_for(&f.arena, f.pool_off, size).unwrap();
                assert_eq!(stats.current, 0);
                assert_eq!(stats.alloc_total, 10);
                assert_eq!(stats.free_total, 10);
            }

            // All three class pages returned; the cache holds exactly one
            // run spanning the whole region.
            let runs =
                PagePool::free_runs(&f.arena, pagepool_off(f.pool_off)).unwrap();
            assert_eq!(runs, vec![(0, 4)]);
        }
    }

    #[test]
    fn page_capacity_invariant() {
        let f = fixture(4096, 8, 1);
        unsafe {
            let region: &RegionPool =
                f.arena.at(region_off(pagepool_off(f.pool_off)));
            let cap = 4096 / 64;
            let mut objs = Vec::new();
            for _ in 0..cap {
                objs.push(SlabPool::alloc(&f.arena, f.pool_off, 64).unwrap());
            }
            // One full page: free objects + used objects == capacity.
            let idx = region.page_of(objs[0]).unwrap();
            let meta = f.arena.at::<PageMeta>(region.meta_of(idx));
            assert_eq!(meta.used_cnt as usize, cap);
            assert_eq!(meta.free_head, OBJ_NONE);

            // The next allocation of the class opens a second page.
            let extra = SlabPool::alloc(&f.arena, f.pool_off, 64).unwrap();
            assert_ne!(region.page_of(extra).unwrap(), idx);

            for o in objs {
                SlabPool::free(&f.arena, f.pool_off, o).unwrap();
            }
            SlabPool::free(&f.arena, f.pool_off, extra).unwrap();
        }
    }

    #[test]
    fn big_allocations_take_whole_runs() {
        let f = fixture(4096, 8, 1);
        unsafe {
            let a = SlabPool::alloc(&f.arena, f.pool_off, 4096 * 2 + 1).unwrap();
            let stats = SlabPool::stats_for(&f.arena, f.pool_off, 4096 * 3).unwrap();
            assert_eq!(stats.current, 1);
            SlabPool::free(&f.arena, f.pool_off, a).unwrap();
            let stats = SlabPool::stats_for(&f.arena, f.pool_off, 4096 * 3).unwrap();
            assert_eq!(stats.current, 0);
        }
    }

    #[test]
    fn destroy_refuses_leaks() {
        let f = fixture(4096, 4, 1);
        unsafe {
            let a = SlabPool::alloc(&f.arena, f.pool_off, 32).unwrap();
            assert_eq!(
                SlabPool::destroy(&f.arena, f.pool_off),
                Err(Status::NotEmpty)
            );
            SlabPool::free(&f.arena, f.pool_off, a).unwrap();
            SlabPool::destroy(&f.arena, f.pool_off).unwrap();
        }
    }
}
