//! Page pool: run cache between the slab layer and the region allocator.
//!
//! Freed runs are not returned to the region bitmap; they are kept in a
//! free-run tree keyed by (length, head index) so allocation can best-fit
//! and split. Freeing coalesces with adjacent cached runs inside the same
//! region and reinserts the merged run. One robust mutex serialises all
//! page traffic.

use shtab_util::status::{Result, Status};

use crate::intrusive::rbtree::Tree;
use crate::intrusive::RbRoot;
use crate::mem::region::{
    PageMeta, RegionPool, CLASS_NONE, OBJ_NONE, PG_BODY, PG_FREE_BODY, PG_FREE_HEAD, PG_HEAD,
};
use crate::mem::Arena;
use crate::sync::RobustMutex;

/// The page pool. Lives in the shared header, wrapping the region pool.
#[repr(C)]
pub struct PagePool {
    pub inited: u32,
    _pad: u32,
    /// Free runs keyed by (run length, head index).
    pub free_tree: RbRoot,
    pub lock: RobustMutex,
    pub region: RegionPool,
}

/// Offset of the nested region pool, given the page pool's offset.
#[inline]
pub fn region_off(pool_off: u64) -> u64 {
    pool_off + std::mem::offset_of!(PagePool, region) as u64
}

#[inline]
fn free_tree_off(pool_off: u64) -> u64 {
    pool_off + std::mem::offset_of!(PagePool, free_tree) as u64
}

#[inline]
fn rbnode_off(region: &RegionPool, idx: u32) -> u64 {
    region.meta_of(idx) + std::mem::offset_of!(PageMeta, rbnode) as u64
}

#[inline]
fn idx_of_rbnode(region: &RegionPool, node_off: u64) -> u32 {
    let rel = node_off - region.meta_off - std::mem::offset_of!(PageMeta, rbnode) as u64;
    (rel / std::mem::size_of::<PageMeta>() as u64) as u32
}

impl PagePool {
    /// Initialise the pool in place. The nested region allocator must have
    /// been initialised first (the library init sequence records a phase
    /// marker between the two).
    ///
    /// # Safety
    ///
    /// `self_off` must address a `PagePool` range whose region member is
    /// initialised.
    pub unsafe fn init(arena: &Arena, self_off: u64) -> Result<()> {
        let pool = arena.at_mut::<PagePool>(self_off);
        if pool.inited != 0 {
            return Err(Status::InitTwice);
        }
        if pool.region.inited == 0 {
            return Err(Status::NotReady);
        }
        pool.free_tree.root = 0;
        pool.lock.init()?;
        pool.inited = 1;
        Ok(())
    }

    /// Allocate a run of `n` pages: best-fit from the free tree, splitting
    /// the tail back in. When no cached run is large enough, the pool
    /// grows by claiming an entire free stretch from the region allocator
    /// and carving `n` off its front — the leftover is indexed like any
    /// other free run, so every page of a touched stretch stays visible
    /// to the cache.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool in `arena`.
    pub unsafe fn alloc(arena: &Arena, self_off: u64, n: u32) -> Result<u32> {
        let pool = arena.at_mut::<PagePool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        if n == 0 {
            return Err(Status::ArgInvalid("run length must be positive"));
        }

        let _g = pool.lock.guard()?;
        let region: &RegionPool = arena.at(region_off(self_off));
        let tree = Tree::new(arena, free_tree_off(self_off));

        let run_key = |idx: u32| {
            let meta = arena.at::<PageMeta>(region.meta_of(idx));
            (meta.run_len, idx)
        };

        let found = tree.search_ge(&mut |node| {
            let idx = idx_of_rbnode(region, node);
            (n, 0u32).cmp(&run_key(idx))
        });

        let (head, len) = match found {
            Some(node) => {
                let head = idx_of_rbnode(region, node);
                let len = arena.at::<PageMeta>(region.meta_of(head)).run_len;
                tree.delete(node);
                (head, len)
            }
            None => RegionPool::alloc_run(arena, region_off(self_off), n)?,
        };

        for i in 0..n {
            let meta = arena.at_mut::<PageMeta>(region.meta_of(head + i));
            meta.state = if i == 0 { PG_HEAD } else { PG_BODY };
            meta.run_len = if i == 0 { n } else { 0 };
            meta.head = head;
            meta.class = CLASS_NONE;
            meta.used_cnt = 0;
            meta.free_head = OBJ_NONE;
        }

        if len > n {
            Self::make_free_run(arena, region, head + n, len - n);
            tree.insert(rbnode_off(region, head + n), &mut |a, b| {
                run_key(idx_of_rbnode(region, a)).cmp(&run_key(idx_of_rbnode(region, b)))
            })
            .map_err(|_| Status::StateInvalid("split run already indexed"))?;
        }

        Ok(head)
    }

    /// Return the run headed at `head_idx` to the cache, coalescing with
    /// free neighbours inside the same region — both runs already cached
    /// here and pages the region allocator never handed out, which are
    /// claimed on the spot. The cache therefore always reflects the full
    /// free capacity of every region it has touched.
    ///
    /// # Safety
    ///
    /// `head_idx` must be the head of an allocated run from this pool.
    pub unsafe fn free(arena: &Arena, self_off: u64, head_idx: u32) -> Result<()> {
        let pool = arena.at_mut::<PagePool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }

        let _g = pool.lock.guard()?;
        let region: &RegionPool = arena.at(region_off(self_off));
        let tree = Tree::new(arena, free_tree_off(self_off));

        let meta = arena.at::<PageMeta>(region.meta_of(head_idx));
        if meta.state != PG_HEAD {
            return Err(Status::StateInvalid("free of a non-head page"));
        }

        let ppr = region.pages_per_region;
        let region_first = (head_idx / ppr) * ppr;
        let region_end = region_first + ppr;

        let mut head = head_idx;
        let mut len = meta.run_len;

        // Coalesce right until the neighbour is neither cached nor
        // untouched. An adopted untouched stretch may itself border a
        // cached run, hence the loop.
        loop {
            let right = head + len;
            if right >= region_end {
                break;
            }
            let rmeta = arena.at::<PageMeta>(region.meta_of(right));
            match rmeta.state {
                PG_FREE_HEAD => {
                    len += rmeta.run_len;
                    tree.delete(rbnode_off(region, right));
                }
                PG_FREE => {
                    len += RegionPool::claim_free_run(arena, region_off(self_off), right)?;
                }
                _ => break,
            }
        }

        // Coalesce left, same rules.
        loop {
            if head == region_first {
                break;
            }
            let lmeta = arena.at::<PageMeta>(region.meta_of(head - 1));
            match lmeta.state {
                PG_FREE_HEAD | PG_FREE_BODY => {
                    let lhead = if lmeta.state == PG_FREE_HEAD {
                        head - 1
                    } else {
                        lmeta.head
                    };
                    len += arena.at::<PageMeta>(region.meta_of(lhead)).run_len;
                    tree.delete(rbnode_off(region, lhead));
                    head = lhead;
                }
                PG_FREE => {
                    let mut start = head - 1;
                    while start > region_first
                        && arena.at::<PageMeta>(region.meta_of(start - 1)).state == PG_FREE
                    {
                        start -= 1;
                    }
                    let claimed =
                        RegionPool::claim_free_run(arena, region_off(self_off), start)?;
                    debug_assert_eq!(start + claimed, head);
                    head = start;
                    len += claimed;
                }
                _ => break,
            }
        }

        Self::make_free_run(arena, region, head, len);

        let run_key = |idx: u32| {
            let m = arena.at::<PageMeta>(region.meta_of(idx));
            (m.run_len, idx)
        };
        tree.insert(rbnode_off(region, head), &mut |a, b| {
            run_key(idx_of_rbnode(region, a)).cmp(&run_key(idx_of_rbnode(region, b)))
        })
        .map_err(|_| Status::StateInvalid("coalesced run already indexed"))
    }

    unsafe fn make_free_run(arena: &Arena, region: &RegionPool, head: u32, len: u32) {
        for i in 0..len {
            let meta = arena.at_mut::<PageMeta>(region.meta_of(head + i));
            meta.state = if i == 0 { PG_FREE_HEAD } else { PG_FREE_BODY };
            meta.run_len = if i == 0 { len } else { 0 };
            meta.head = head;
            meta.class = CLASS_NONE;
            meta.used_cnt = 0;
            meta.free_head = OBJ_NONE;
        }
    }

    /// Snapshot of the cached free runs as (head index, length) pairs in
    /// tree order. Observability and tests.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool in `arena`.
    pub unsafe fn free_runs(arena: &Arena, self_off: u64) -> Result<Vec<(u32, u32)>> {
        let pool = arena.at_mut::<PagePool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        let _g = pool.lock.guard()?;
        let region: &RegionPool = arena.at(region_off(self_off));
        let tree = Tree::new(arena, free_tree_off(self_off));

        let mut out = Vec::new();
        let mut cur = tree.left_most();
        while let Some(node) = cur {
            let idx = idx_of_rbnode(region, node);
            let len = arena.at::<PageMeta>(region.meta_of(idx)).run_len;
            out.push((idx, len));
            cur = tree.next(node);
        }
        Ok(out)
    }

    /// Tear down: drain the cache back to the region allocator and verify
    /// nothing is still allocated. The nested region allocator is left
    /// initialised; the library teardown destroys it in its own phase.
    ///
    /// # Safety
    ///
    /// `self_off` must address an initialised pool; no other process may
    /// be using it.
    pub unsafe fn destroy(arena: &Arena, self_off: u64) -> Result<()> {
        let pool = arena.at_mut::<PagePool>(self_off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }

        {
            let _g = pool.lock.guard()?;
            let region: &RegionPool = arena.at(region_off(self_off));
            let tree = Tree::new(arena, free_tree_off(self_off));

            for idx in 0..region.total_pages() {
                let state = arena.at::<PageMeta>(region.meta_of(idx)).state;
                if state == PG_HEAD || state == PG_BODY {
                    return Err(Status::NotEmpty);
                }
            }

            while let Some(node) = tree.left_most() {
                let idx = idx_of_rbnode(region, node);
                tree.delete(node);
                RegionPool::free_pages(arena, region_off(self_off), idx)?;
            }
        }

        pool.lock.destroy()?;
        pool.inited = 0;
        Ok(())
    }
}
