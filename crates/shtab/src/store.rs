//! Library façade: the per-process handle to the shared store.
//!
//! The master process calls [`Store::init`] once; it creates the shared
//! segment, lays out `[header | page metadata | data pages]`, and brings
//! the stack up in phases, recording a marker after each so a partial
//! failure (or a later [`Store::destroy`]) unwinds exactly the phases that
//! completed. Worker processes inherit the mapping across `fork` (the
//! `Store` value itself is inherited) or map the passed fd via
//! [`Store::attach`], then call [`Store::worker_init`].
//!
//! Every attached process owns a *proot* table — the root anchoring its
//! exported references — and a record in the shared `p_roots` list whose
//! *alive* mutex it holds for life. A surviving peer that can try-lock
//! that mutex has definitive evidence the owner died and may recycle the
//! record via [`Store::recycle_roots`].
//!
//! ## Lock order
//!
//! Highest to lowest, always acquired downward:
//! 1. header lock (`p_roots`)
//! 2. collector lock
//! 3. table lock (the per-process root nests after a target table)
//! 4. slab class lock
//! 5. page-pool lock
//! 6. region lock
//!
//! Alive mutexes stand outside the order: peers only ever try-lock them
//! and never hold one while taking another lock.

use parking_lot::Mutex;

use shtab_util::status::{Result, Status};

use crate::config::Config;
use crate::intrusive::list;
use crate::intrusive::ListNode;
use crate::mem::pagepool::{self, PagePool};
use crate::mem::region::{PageMeta, RegionPool};
use crate::mem::slab::{SlabPool, SlabStatsSnapshot};
use crate::mem::{Arena, ShmSegment};
use crate::sync::{RobustMutex, TryLock};
use crate::table::{PoolRef, TableHeader, TablePool};
use crate::types::TableId;
use crate::util::align_up;

/// Identifies a segment laid out by this library version.
pub const SHM_MAGIC: u64 = 0x7368_7461_6231_2e32; // "shtab1.2"

// Init phases, recorded in the header after each successful step.
const PHASE_NONE: u32 = 0;
const PHASE_SHM: u32 = 1;
const PHASE_REGION: u32 = 2;
const PHASE_PAGEPOOL: u32 = 3;
const PHASE_SLAB: u32 = 4;
const PHASE_TABLE: u32 = 5;
const PHASE_GROOT: u32 = 6;
const PHASE_PROOT: u32 = 7;
const PHASE_DONE: u32 = 8;

/// The library state at offset 0 of the segment.
#[repr(C)]
pub struct SharedHeader {
    pub magic: u64,
    pub init_state: u32,
    _pad: u32,
    pub seg_len: u64,
    pub page_size: u64,
    pub meta_off: u64,
    pub data_off: u64,
    pub total_pages: u64,
    /// The process-global user-visible root table.
    pub g_root: u64,
    /// List of per-process records.
    pub p_roots: ListNode,
    pub plock: RobustMutex,
    pub pool: TablePool,
}

const POOL_OFF: u64 = std::mem::offset_of!(SharedHeader, pool) as u64;
const P_ROOTS_OFF: u64 = std::mem::offset_of!(SharedHeader, p_roots) as u64;

#[inline]
fn slab_off() -> u64 {
    POOL_OFF + std::mem::offset_of!(TablePool, slab) as u64
}

#[inline]
fn pp_off() -> u64 {
    slab_off() + std::mem::offset_of!(SlabPool, page_pool) as u64
}

#[inline]
fn rg_off() -> u64 {
    pagepool::region_off(pp_off())
}

/// One attached process, slab-allocated in the segment.
#[repr(C)]
pub struct ProcRecord {
    pub lnode: ListNode,
    pub pid: i32,
    _pad: u32,
    /// This process's root table.
    pub proot: u64,
    /// Held locked for the owner's lifetime; lockable by a peer only once
    /// the owner is gone.
    pub alive: RobustMutex,
}

#[derive(Default)]
struct ProcessLocal {
    inited: bool,
    pid: i32,
    proot: u64,
    record: u64,
}

/// Per-process handle to the shared table store.
///
/// The handle is cheap state: the mapped segment plus this process's
/// attachment. All shared data lives in the segment and is reached by
/// offset, so a forked child keeps using the inherited `Store` after
/// calling [`worker_init`](Store::worker_init).
pub struct Store {
    seg: ShmSegment,
    arena: Arena,
    local: Mutex<ProcessLocal>,
}

impl Store {
    pub(crate) fn pool(&self) -> PoolRef<'_> {
        PoolRef::new(&self.arena, POOL_OFF)
    }

    unsafe fn header(&self) -> &SharedHeader {
        self.arena.at(0)
    }

    unsafe fn header_mut(&self) -> &mut SharedHeader {
        self.arena.at_mut(0)
    }

    /// Create the shared segment, bring the stack up, and attach the
    /// calling process as the master.
    pub fn init(config: Config) -> Result<Store> {
        config.validate()?;

        let page = page_size::get();
        let header_size = align_up(std::mem::size_of::<SharedHeader>(), page);
        let total_pages = config.total_pages();
        let meta_size = align_up(total_pages * std::mem::size_of::<PageMeta>(), page);
        let data_size = total_pages * page;

        let seg = ShmSegment::create(header_size + meta_size + data_size)?;
        // SAFETY: the segment stays mapped for the store's lifetime.
        let arena = unsafe { Arena::new(seg.base(), seg.len()) };
        let store = Store {
            seg,
            arena,
            local: Mutex::new(ProcessLocal::default()),
        };

        // SAFETY: fresh zero-filled segment, single process.
        let ret = unsafe { store.init_phases(&config, header_size as u64, meta_size as u64) };
        if let Err(e) = ret {
            log::error!("store init failed: {e}; unwinding completed phases");
            let _ = unsafe { store.destroy_phases() };
            return Err(e);
        }
        Ok(store)
    }

    unsafe fn init_phases(&self, config: &Config, header_size: u64, meta_size: u64) -> Result<()> {
        let page = page_size::get() as u64;

        let header = self.header_mut();
        if header.init_state != PHASE_NONE {
            return Err(Status::InitTwice);
        }
        header.magic = SHM_MAGIC;
        header.seg_len = self.arena.len() as u64;
        header.page_size = page;
        header.meta_off = header_size;
        header.data_off = header_size + meta_size;
        header.total_pages = config.total_pages() as u64;
        header.init_state = PHASE_SHM;

        RegionPool::init(
            &self.arena,
            rg_off(),
            header.data_off,
            header.meta_off,
            page as u32,
            config.pages_per_region as u32,
            config.region_count as u32,
            true,
        )?;
        self.header_mut().init_state = PHASE_REGION;

        PagePool::init(&self.arena, pp_off())?;
        self.header_mut().init_state = PHASE_PAGEPOOL;

        SlabPool::init(&self.arena, slab_off())?;
        self.header_mut().init_state = PHASE_SLAB;

        self.pool()
            .pool_init(config.run_gc_periodical, config.gc_step_usec)?;
        self.header_mut().init_state = PHASE_TABLE;

        let g_root = self.pool().table_new()?;
        if let Err(e) = self.pool().gc_add_root(g_root.off()) {
            let _ = self.pool().table_release(g_root);
            return Err(e);
        }
        self.header_mut().g_root = g_root.off();
        self.header_mut().init_state = PHASE_GROOT;

        list::init_head(&self.arena, P_ROOTS_OFF);
        self.header_mut().plock.init()?;
        self.header_mut().init_state = PHASE_PROOT;

        // The master is an attached process like any worker.
        let pid = libc::getpid();
        let mut local = self.local.lock();
        self.attach_process(pid, &mut local)?;
        self.header_mut().init_state = PHASE_DONE;
        log::debug!("store initialised: pid {pid}, {} pages", config.total_pages());
        Ok(())
    }

    /// Map an existing segment by its backing file (received over fd
    /// passing). The caller must still [`worker_init`](Store::worker_init).
    pub fn attach(file: std::fs::File) -> Result<Store> {
        let seg = ShmSegment::attach(file)?;
        // SAFETY: the segment stays mapped for the store's lifetime.
        let arena = unsafe { Arena::new(seg.base(), seg.len()) };
        let store = Store {
            seg,
            arena,
            local: Mutex::new(ProcessLocal::default()),
        };

        // SAFETY: validated before any deeper access.
        let header = unsafe { store.header() };
        if header.magic != SHM_MAGIC {
            return Err(Status::ArgInvalid("segment magic mismatch"));
        }
        if header.init_state != PHASE_DONE {
            return Err(Status::NotReady);
        }
        if header.seg_len != store.arena.len() as u64 {
            return Err(Status::ArgInvalid("segment length mismatch"));
        }
        Ok(store)
    }

    /// The backing file of the segment, for passing to another process.
    pub fn shm_file(&self) -> &std::fs::File {
        self.seg.file()
    }

    /// Attach the calling process: find-or-create its record and proot,
    /// take its alive mutex, and register the proot with the collector.
    /// Call once per process (after `fork`, the child calls it again; the
    /// inherited attachment belongs to the parent pid).
    pub fn worker_init(&self) -> Result<()> {
        // SAFETY: attach/init validated the header.
        unsafe {
            if self.header().init_state != PHASE_DONE {
                return Err(Status::NotReady);
            }
        }

        let pid = unsafe { libc::getpid() };
        let mut local = self.local.lock();
        if local.inited && local.pid == pid {
            return Err(Status::InitTwice);
        }

        // SAFETY: header is DONE; single-threaded within this process.
        unsafe { self.attach_process(pid, &mut local) }
    }

    unsafe fn attach_process(&self, pid: i32, local: &mut ProcessLocal) -> Result<()> {
        let header = self.header();
        let _pl = header.plock.guard()?;

        // Reuse a record left behind by a crashed instance of this pid.
        let mut cur = list::first(&self.arena, P_ROOTS_OFF);
        while let Some(node) = cur {
            let rec = self.arena.at::<ProcRecord>(node);
            if rec.pid == pid {
                return match rec.alive.try_lock()? {
                    TryLock::Busy => Err(Status::Existed),
                    TryLock::Acquired | TryLock::OwnerDied => {
                        local.inited = true;
                        local.pid = pid;
                        local.proot = rec.proot;
                        local.record = node;
                        log::warn!("reattached stale record for pid {pid}");
                        Ok(())
                    }
                };
            }
            cur = list::next(&self.arena, P_ROOTS_OFF, node);
        }

        let pool = self.pool();
        let proot = pool.table_new()?;
        if let Err(e) = pool.gc_add_root(proot.off()) {
            let _ = pool.table_release(proot);
            return Err(e);
        }

        let rec_off = match SlabPool::alloc(
            &self.arena,
            slab_off(),
            std::mem::size_of::<ProcRecord>(),
        ) {
            Ok(off) => off,
            Err(e) => {
                let _ = pool.gc_remove_root(proot.off());
                let _ = pool.table_release(proot);
                return Err(e);
            }
        };

        let rec = self.arena.at_mut::<ProcRecord>(rec_off);
        *rec = std::mem::zeroed();
        rec.pid = pid;
        rec.proot = proot.off();
        if let Err(e) = rec.alive.init().and_then(|()| rec.alive.lock()) {
            let _ = SlabPool::free(&self.arena, slab_off(), rec_off);
            let _ = pool.gc_remove_root(proot.off());
            let _ = pool.table_release(proot);
            return Err(e);
        }

        list::insert_last(&self.arena, P_ROOTS_OFF, rec_off);

        local.inited = true;
        local.pid = pid;
        local.proot = proot.off();
        local.record = rec_off;
        Ok(())
    }

    pub(crate) fn proot(&self) -> Result<TableId> {
        let local = self.local.lock();
        if !local.inited {
            return Err(Status::Uninited);
        }
        Ok(TableId(local.proot))
    }

    /// The handle of the process-global root table.
    pub(crate) fn g_root(&self) -> Result<TableId> {
        // SAFETY: header validated at init/attach.
        unsafe {
            if self.header().init_state != PHASE_DONE {
                return Err(Status::NotReady);
            }
            Ok(TableId(self.header().g_root))
        }
    }

    /// Reclaim records of dead processes: try-lock each alive mutex; a
    /// successful acquisition is proof of owner death. At most `max`
    /// records are processed (`0` = no cap). Returns the number recycled.
    pub fn recycle_roots(&self, max: usize) -> Result<usize> {
        let own_record = {
            let local = self.local.lock();
            local.record
        };

        // SAFETY: header validated at init/attach.
        unsafe {
            let header = self.header();
            let _pl = header.plock.guard()?;

            let mut recycled = 0usize;
            let mut cur = list::first(&self.arena, P_ROOTS_OFF);
            while let Some(node) = cur {
                let next = list::next(&self.arena, P_ROOTS_OFF, node);
                if max != 0 && recycled >= max {
                    break;
                }
                if node != own_record {
                    let rec = self.arena.at::<ProcRecord>(node);
                    match rec.alive.try_lock()? {
                        TryLock::Busy => {}
                        TryLock::Acquired | TryLock::OwnerDied => {
                            let pid = rec.pid;
                            rec.alive.unlock()?;
                            self.reclaim_record(node)?;
                            recycled += 1;
                            log::warn!("recycled root of dead process {pid}");
                        }
                    }
                }
                cur = next;
            }
            Ok(recycled)
        }
    }

    /// Free one record and its proot. Caller holds the header lock; the
    /// record's alive mutex must be unlocked.
    unsafe fn reclaim_record(&self, rec_off: u64) -> Result<()> {
        let rec = self.arena.at::<ProcRecord>(rec_off);
        let proot = TableId(rec.proot);

        rec.alive.destroy()?;
        list::remove(&self.arena, rec_off);
        self.drop_root_table(proot)?;
        SlabPool::free(&self.arena, slab_off(), rec_off)
    }

    /// Unreference a root table: empty it (children go to the sweep
    /// queue), remove it from the collector's root set, detach any queue
    /// linkage, and release it.
    unsafe fn drop_root_table(&self, root: TableId) -> Result<()> {
        let pool = self.pool();
        pool.remove_all(root)?;
        pool.gc_remove_root(root.off())?;
        {
            // A root may sit in the mark queue of a cycle in progress.
            let _gc = pool.gc_lock()?;
            let header = self.arena.at::<TableHeader>(root.off());
            if header.gc_head.mark_node.is_linked() {
                list::remove(&self.arena, root.off());
            }
            if header.gc_head.sweep_node.is_linked() {
                list::remove(
                    &self.arena,
                    root.off() + std::mem::offset_of!(crate::gc::GcHead, sweep_node) as u64,
                );
            }
        }
        pool.table_release(root)
    }

    /// Tear the store down, unwinding exactly the phases init completed.
    /// The caller must be the last attached process.
    pub fn destroy(self) -> Result<()> {
        // SAFETY: exclusive access is the caller's contract.
        let ret = unsafe { self.destroy_phases() };
        // The mapping itself is released on drop.
        ret
    }

    unsafe fn destroy_phases(&self) -> Result<()> {
        loop {
            let state = self.header().init_state;
            match state {
                PHASE_NONE => return Ok(()),
                PHASE_DONE => {
                    // Detach ourselves: our own record is recycled along
                    // with any dead peers in the PROOT phase.
                    let mut local = self.local.lock();
                    if local.inited {
                        let rec = self.arena.at::<ProcRecord>(local.record);
                        rec.alive.unlock()?;
                        local.inited = false;
                    }
                }
                PHASE_PROOT => {
                    let header = self.header();
                    {
                        let _pl = header.plock.guard()?;
                        while let Some(node) = list::first(&self.arena, P_ROOTS_OFF) {
                            let rec = self.arena.at::<ProcRecord>(node);
                            match rec.alive.try_lock()? {
                                TryLock::Busy => {
                                    return Err(Status::NotReady);
                                }
                                TryLock::Acquired | TryLock::OwnerDied => {
                                    rec.alive.unlock()?;
                                }
                            }
                            self.reclaim_record(node)?;
                        }
                    }
                    header.plock.destroy()?;
                }
                PHASE_GROOT => {
                    let g_root = TableId(self.header().g_root);
                    self.drop_root_table(g_root)?;
                    self.header_mut().g_root = 0;
                }
                PHASE_TABLE => {
                    self.pool().pool_destroy()?;
                }
                PHASE_SLAB => {
                    SlabPool::destroy(&self.arena, slab_off())?;
                }
                PHASE_PAGEPOOL => {
                    PagePool::destroy(&self.arena, pp_off())?;
                }
                PHASE_REGION => {
                    RegionPool::destroy(&self.arena, rg_off())?;
                }
                PHASE_SHM => {
                    self.header_mut().magic = 0;
                }
                _ => return Err(Status::StateInvalid("unknown init phase")),
            }
            self.header_mut().init_state = state - 1;
        }
    }

    // ----- observability --------------------------------------------------

    /// The calling process's attachment: pid and proot handle, or `None`
    /// before `init`/`worker_init`.
    pub fn process_state(&self) -> Option<(i32, TableId)> {
        let local = self.local.lock();
        local.inited.then(|| (local.pid, TableId(local.proot)))
    }

    /// Number of live tables in the pool.
    pub fn table_count(&self) -> i64 {
        // SAFETY: pool embedded in the validated header.
        unsafe {
            self.pool()
                .pool()
                .table_cnt
                .load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    /// Allocation statistics of the slab class serving `size`.
    pub fn slab_stats(&self, size: usize) -> Result<SlabStatsSnapshot> {
        // SAFETY: slab embedded in the validated header.
        unsafe { SlabPool::stats_for(&self.arena, slab_off(), size) }
    }

    /// Cached free page runs as (head page, length) pairs.
    pub fn free_page_runs(&self) -> Result<Vec<(u32, u32)>> {
        // SAFETY: page pool embedded in the validated header.
        unsafe { PagePool::free_runs(&self.arena, pp_off()) }
    }

    /// Drive one collector step. `NoGcData` means there was nothing to do.
    pub fn gc_run(&self) -> Result<()> {
        // SAFETY: pool embedded in the validated header.
        unsafe { self.pool().gc_run() }
    }

    /// Collector internals snapshot (round, queue depths, step budgets).
    pub fn gc_diagnostics(&self) -> Result<indexmap::IndexMap<String, String>> {
        // SAFETY: pool embedded in the validated header.
        unsafe { self.pool().gc_diagnostics() }
    }
}
