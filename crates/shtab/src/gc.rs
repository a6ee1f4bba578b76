//! The tracing collector.
//!
//! Incremental mark-and-sweep over the table graph, time-bounded per step.
//! Each call to `run` does a bounded amount of work and returns; a cycle
//! spans many calls. State lives in shared memory so any attached process
//! may drive collection.
//!
//! ## Mark-word encoding
//!
//! Marks are epoch-encoded against the monotonically increasing `round`:
//! `round + 1` decodes as *reachable*, `round + 2` as *garbage*, anything
//! else as *unknown*. Ending a cycle advances `round` by 4, which demotes
//! every mark written this cycle to *unknown* without touching a single
//! table.
//!
//! ## Queues
//!
//! - `mark_queue`: work list for the mark phase, seeded from the roots;
//! - `prev_sweep_queue`: sweep candidates carried over from the previous
//!   cycle;
//! - `sweep_queue`: candidates announced since the current cycle began;
//! - `garbage_queue`: tables condemned this cycle, waiting for the free
//!   phase;
//! - `remained_queue`: candidates that proved reachable, deferred to the
//!   next cycle.
//!
//! A table that loses its last external reference sits in the sweep queue
//! for the cycle that discovers it and is freed no later than the second
//! cycle after, including cycles of mutually-referencing tables.

use indexmap::IndexMap;
use shtab_util::sorted;
use shtab_util::status::{Result, Status};

use crate::config::GC_MAX_ROOTS;
use crate::intrusive::list;
use crate::intrusive::ListNode;
use crate::mem::Arena;
use crate::sync::{RobustGuard, RobustMutex};
use crate::table::{table_off_from_value, PoolRef, TableHeader};
use crate::types::{TableId, Tag};
use crate::util::monotonic_usec;

/// Collector head embedded at the start of every table: the two queue
/// links plus the epoch-encoded mark word.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GcHead {
    pub mark_node: ListNode,
    pub sweep_node: ListNode,
    pub mark: u64,
}

const SWEEP_NODE_OFF: u64 = std::mem::offset_of!(GcHead, sweep_node) as u64;

// Sweep-queue nodes are mapped back to heads by subtracting this offset.
static_assertions::const_assert!(std::mem::offset_of!(GcHead, mark_node) == 0);

/// Collector state, embedded in the table pool.
#[repr(C)]
pub struct Gc {
    pub inited: u32,
    /// Whether a cycle is in progress.
    pub begin: u32,
    /// Mark epoch; advances by 4 per completed cycle.
    pub round: u64,
    /// Per-step wall-time budget in microseconds.
    pub step_usec: i64,
    /// Self-calibrated work budgets.
    pub mark_cnt_per_step: i64,
    pub free_cnt_per_step: i64,
    /// Start/end of the cycle in progress.
    pub cycle_start_usec: i64,
    pub cycle_end_usec: i64,
    pub mark_queue: ListNode,
    pub prev_sweep_queue: ListNode,
    pub sweep_queue: ListNode,
    pub garbage_queue: ListNode,
    pub remained_queue: ListNode,
    pub roots_cnt: u64,
    /// Sorted array of root gc-head offsets.
    pub roots: [u64; GC_MAX_ROOTS],
    pub lock: RobustMutex,
}

#[inline]
fn queue_off(gc_off: u64, field: usize) -> u64 {
    gc_off + field as u64
}

macro_rules! gc_queue {
    ($gc_off:expr, $field:ident) => {
        queue_off($gc_off, std::mem::offset_of!(Gc, $field))
    };
}

/// Initialise collector state in place.
///
/// # Safety
///
/// `gc_off` must address a zeroed `Gc` in shared memory.
pub(crate) unsafe fn gc_init(arena: &Arena, gc_off: u64, step_usec: i64) -> Result<()> {
    let gc = arena.at_mut::<Gc>(gc_off);
    if gc.inited != 0 {
        return Err(Status::InitTwice);
    }

    gc.round = 0;
    gc.begin = 0;
    gc.step_usec = step_usec;
    gc.mark_cnt_per_step = 100;
    gc.free_cnt_per_step = 50;
    gc.cycle_start_usec = monotonic_usec()?;
    gc.cycle_end_usec = gc.cycle_start_usec;
    gc.roots_cnt = 0;

    list::init_head(arena, gc_queue!(gc_off, mark_queue));
    list::init_head(arena, gc_queue!(gc_off, prev_sweep_queue));
    list::init_head(arena, gc_queue!(gc_off, sweep_queue));
    list::init_head(arena, gc_queue!(gc_off, garbage_queue));
    list::init_head(arena, gc_queue!(gc_off, remained_queue));

    gc.lock.init()?;
    gc.inited = 1;
    Ok(())
}

impl<'a> PoolRef<'a> {
    unsafe fn gc(&self) -> &Gc {
        self.arena.at(self.gc_off())
    }

    unsafe fn gc_mut(&self) -> &mut Gc {
        self.arena.at_mut(self.gc_off())
    }

    /// Acquire the collector lock.
    pub(crate) unsafe fn gc_lock(&self) -> Result<RobustGuard<'a>> {
        self.arena.at::<Gc>(self.gc_off()).lock.guard()
    }

    pub(crate) unsafe fn gc_round(&self) -> u64 {
        self.gc().round
    }

    #[inline]
    unsafe fn status_reachable(&self) -> u64 {
        self.gc().round + 1
    }

    #[inline]
    unsafe fn status_garbage(&self) -> u64 {
        self.gc().round + 2
    }

    unsafe fn head(&self, head_off: u64) -> &mut GcHead {
        // The gc head is the first field of the table header.
        self.arena.at_mut::<GcHead>(head_off)
    }

    // ----- mutator notifications (caller holds the collector lock) -------

    /// Queue a table for marking. Idempotent: already-reachable or
    /// already-queued heads are left alone.
    ///
    /// # Safety
    ///
    /// Caller holds the collector lock; `head_off` is a live table.
    pub(crate) unsafe fn push_to_mark(&self, head_off: u64) -> Result<()> {
        if head_off == 0 {
            return Err(Status::ArgInvalid("null gc head"));
        }
        let reachable = self.status_reachable();
        let head = self.head(head_off);
        if head.mark == reachable {
            return Ok(());
        }
        if head.mark_node.is_linked() {
            return Ok(());
        }
        list::insert_last(self.arena, gc_queue!(self.gc_off(), mark_queue), head_off);
        Ok(())
    }

    /// Queue a table as a sweep candidate. A head still sitting in the
    /// previous cycle's queue is moved, so the new cycle observes it
    /// fresh; a head already in the current queue stays put.
    ///
    /// # Safety
    ///
    /// Caller holds the collector lock; `head_off` is a live table.
    pub(crate) unsafe fn push_to_sweep(&self, head_off: u64) -> Result<()> {
        if head_off == 0 {
            return Err(Status::ArgInvalid("null gc head"));
        }
        let head = self.head(head_off);
        if head.sweep_node.is_linked() {
            list::remove(self.arena, head_off + SWEEP_NODE_OFF);
        }
        list::insert_last(
            self.arena,
            gc_queue!(self.gc_off(), sweep_queue),
            head_off + SWEEP_NODE_OFF,
        );
        Ok(())
    }

    // ----- root set -------------------------------------------------------

    /// Register a root table. `Existed` when already registered.
    ///
    /// # Safety
    ///
    /// `head_off` must be a live table of this pool.
    pub(crate) unsafe fn gc_add_root(&self, head_off: u64) -> Result<()> {
        if head_off == 0 {
            return Err(Status::ArgInvalid("null gc head"));
        }
        let _g = self.gc_lock()?;
        let gc = self.gc_mut();
        let mut cnt = gc.roots_cnt as usize;
        let mut idx = 0usize;

        match sorted::bsearch_right(&gc.roots[..cnt], &head_off, |a, b| a.cmp(b), &mut idx) {
            Ok(()) => return Err(Status::Existed),
            Err(Status::NotFound) => {}
            Err(e) => return Err(e),
        }
        sorted::insert_at(&mut gc.roots, &mut cnt, idx, head_off)?;
        gc.roots_cnt = cnt as u64;
        Ok(())
    }

    /// Unregister a root table. `NotFound` when absent.
    ///
    /// # Safety
    ///
    /// As [`gc_add_root`](Self::gc_add_root).
    pub(crate) unsafe fn gc_remove_root(&self, head_off: u64) -> Result<()> {
        let _g = self.gc_lock()?;
        let gc = self.gc_mut();
        let mut cnt = gc.roots_cnt as usize;
        let mut idx = 0usize;

        sorted::bsearch_left(&gc.roots[..cnt], &head_off, |a, b| a.cmp(b), &mut idx)?;
        sorted::remove_at(&mut gc.roots, &mut cnt, idx)?;
        gc.roots_cnt = cnt as u64;
        Ok(())
    }

    // ----- the cycle ------------------------------------------------------

    unsafe fn roots_to_mark_queue(&self) {
        let gc = self.gc();
        for i in 0..gc.roots_cnt as usize {
            let head_off = gc.roots[i];
            if !self.head(head_off).mark_node.is_linked() {
                list::insert_last(self.arena, gc_queue!(self.gc_off(), mark_queue), head_off);
            }
        }
    }

    /// Drain the mark queue within the step budget. `Ok` = budget
    /// exhausted with work left; `Empty` = queue drained.
    unsafe fn mark_reachable_tables(&self, marked_cnt: &mut i64) -> Result<()> {
        let reachable = self.status_reachable();

        while *marked_cnt < self.gc().mark_cnt_per_step {
            let Some(head_off) =
                list::pop_first(self.arena, gc_queue!(self.gc_off(), mark_queue))
            else {
                return Err(Status::Empty);
            };

            self.head(head_off).mark = reachable;
            let tid = TableId(head_off);

            self.foreach_values(tid, &mut |tag, bytes| {
                if !Tag::from_u8(tag)?.is_table() {
                    return Ok(());
                }
                let child_off = table_off_from_value(bytes)?;
                let child = self.head(child_off);
                if child.mark == reachable || child.mark_node.is_linked() {
                    return Ok(());
                }
                list::insert_last(
                    self.arena,
                    gc_queue!(self.gc_off(), mark_queue),
                    child_off,
                );
                Ok(())
            })?;

            *marked_cnt += 1 + self.element_cnt(tid);
        }

        Ok(())
    }

    /// Drain one sweep queue within the step budget, condemning unknown
    /// heads and cascading over their children. `Ok` = budget exhausted;
    /// `Empty` = queue drained.
    unsafe fn mark_garbage_tables(&self, is_prev: bool, marked_cnt: &mut i64) -> Result<()> {
        let reachable = self.status_reachable();
        let garbage = self.status_garbage();
        let queue = if is_prev {
            gc_queue!(self.gc_off(), prev_sweep_queue)
        } else {
            gc_queue!(self.gc_off(), sweep_queue)
        };

        while *marked_cnt < self.gc().mark_cnt_per_step {
            let Some(node_off) = list::pop_first(self.arena, queue) else {
                return Err(Status::Empty);
            };
            let head_off = node_off - SWEEP_NODE_OFF;
            let mark = self.head(head_off).mark;

            if mark == garbage {
                // A condemned table belongs to the garbage queue only.
                return Err(Status::StateInvalid("garbage head in a sweep queue"));
            } else if mark == reachable {
                // Proven live this cycle. Current-cycle candidates get
                // re-examined next cycle; previous-cycle ones are done.
                if !is_prev {
                    list::insert_last(
                        self.arena,
                        gc_queue!(self.gc_off(), remained_queue),
                        node_off,
                    );
                }
            } else {
                let tid = TableId(head_off);
                self.head(head_off).mark = garbage;
                list::insert_last(
                    self.arena,
                    gc_queue!(self.gc_off(), garbage_queue),
                    node_off,
                );

                self.foreach_values(tid, &mut |tag, bytes| {
                    if !Tag::from_u8(tag)?.is_table() {
                        return Ok(());
                    }
                    let child_off = table_off_from_value(bytes)?;
                    let child = self.head(child_off);
                    if child.mark == reachable
                        || child.mark == garbage
                        || child.sweep_node.is_linked()
                    {
                        return Ok(());
                    }
                    list::insert_last(self.arena, queue, child_off + SWEEP_NODE_OFF);
                    Ok(())
                })?;

                *marked_cnt += self.element_cnt(tid);
            }

            *marked_cnt += 1;
        }

        Ok(())
    }

    /// One bounded mark step across the three sub-queues, recalibrating
    /// the budget from observed cost per unit.
    unsafe fn mark_tables(&self) -> Result<()> {
        let mut marked_cnt = 0i64;
        let start = monotonic_usec()?;

        // Sub-steps run in order; each only hands over once it drains.
        let mut ret = self.mark_reachable_tables(&mut marked_cnt);
        if ret == Err(Status::Empty) {
            ret = self.mark_garbage_tables(true, &mut marked_cnt);
        }
        if ret == Err(Status::Empty) {
            ret = self.mark_garbage_tables(false, &mut marked_cnt);
        }
        match &ret {
            Ok(()) | Err(Status::Empty) => {}
            Err(_) => return ret,
        }

        let end = monotonic_usec()?;
        if marked_cnt > 0 {
            let per_unit = ((end - start) as f32 / marked_cnt as f32).max(0.01);
            let gc = self.gc_mut();
            gc.mark_cnt_per_step = ((gc.step_usec as f32 / per_unit) as i64).max(1);
            log::debug!(
                "gc mark step: {} units in {} usec, next budget {}",
                marked_cnt,
                end - start,
                gc.mark_cnt_per_step
            );
        }

        ret
    }

    /// One bounded free step over the garbage queue.
    unsafe fn free_tables(&self) -> Result<()> {
        let mut freed_cnt = 0i64;
        let start = monotonic_usec()?;
        let mut ret = Ok(());

        while freed_cnt < self.gc().free_cnt_per_step {
            let Some(node_off) =
                list::pop_first(self.arena, gc_queue!(self.gc_off(), garbage_queue))
            else {
                ret = Err(Status::Empty);
                break;
            };
            let head_off = node_off - SWEEP_NODE_OFF;
            let tid = TableId(head_off);

            let elems = self.element_cnt(tid);
            self.remove_all_for_gc(tid)?;
            self.table_release(tid)?;

            freed_cnt += 1 + elems;
        }

        let end = monotonic_usec()?;
        if freed_cnt > 0 {
            let per_unit = ((end - start) as f32 / freed_cnt as f32).max(0.1);
            let gc = self.gc_mut();
            gc.free_cnt_per_step = ((gc.step_usec as f32 / per_unit) as i64).max(1);
            log::debug!(
                "gc free step: {} units in {} usec, next budget {}",
                freed_cnt,
                end - start,
                gc.free_cnt_per_step
            );
        }

        ret
    }

    unsafe fn element_cnt(&self, tid: TableId) -> i64 {
        self.arena
            .at::<TableHeader>(tid.off())
            .element_cnt
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// One collector step.
    ///
    /// Returns `NoGcData` when there is nothing to collect; otherwise does
    /// up to one budget's worth of marking or freeing and returns. Ending
    /// a cycle joins the remained queue onto the previous-sweep queue and
    /// advances the round by 4.
    ///
    /// # Safety
    ///
    /// The pool must be initialised.
    pub(crate) unsafe fn gc_run(&self) -> Result<()> {
        let _g = self.gc_lock()?;
        let gc_off = self.gc_off();

        if self.gc().begin == 0 {
            if list::is_empty(self.arena, gc_queue!(gc_off, sweep_queue))
                && list::is_empty(self.arena, gc_queue!(gc_off, prev_sweep_queue))
            {
                return Err(Status::NoGcData);
            }
            self.gc_mut().cycle_start_usec = monotonic_usec()?;
            self.roots_to_mark_queue();
            self.gc_mut().begin = 1;
            log::debug!("gc cycle started at round {}", self.gc().round);
        }

        match self.mark_tables() {
            Err(Status::Empty) => {}
            other => return other,
        }

        match self.free_tables() {
            Err(Status::Empty) => {}
            other => return other,
        }

        // Cycle complete: reachable leftovers become next cycle's
        // previous-sweep candidates.
        list::join(
            self.arena,
            gc_queue!(gc_off, prev_sweep_queue),
            gc_queue!(gc_off, remained_queue),
        );

        let end = monotonic_usec()?;
        let gc = self.gc_mut();
        gc.cycle_end_usec = end;
        gc.round += 4;
        gc.begin = 0;
        log::debug!(
            "gc cycle finished: round now {}, {} usec",
            gc.round,
            gc.cycle_end_usec - gc.cycle_start_usec
        );
        Ok(())
    }

    /// Drain the collector completely, then verify every queue is empty.
    ///
    /// # Safety
    ///
    /// The pool must be initialised; no concurrent mutators.
    pub(crate) unsafe fn gc_destroy(&self) -> Result<()> {
        loop {
            match self.gc_run() {
                Ok(()) => {}
                Err(Status::NoGcData) => break,
                Err(e) => return Err(e),
            }
        }

        let gc_off = self.gc_off();
        if !list::is_empty(self.arena, gc_queue!(gc_off, mark_queue))
            || !list::is_empty(self.arena, gc_queue!(gc_off, prev_sweep_queue))
            || !list::is_empty(self.arena, gc_queue!(gc_off, sweep_queue))
            || !list::is_empty(self.arena, gc_queue!(gc_off, garbage_queue))
            || !list::is_empty(self.arena, gc_queue!(gc_off, remained_queue))
        {
            return Err(Status::StateInvalid("collector queue not drained"));
        }

        let gc = self.gc_mut();
        gc.lock.destroy()?;
        gc.inited = 0;
        Ok(())
    }

    /// Snapshot of collector internals for observability.
    ///
    /// # Safety
    ///
    /// The pool must be initialised.
    pub(crate) unsafe fn gc_diagnostics(&self) -> Result<IndexMap<String, String>> {
        let _g = self.gc_lock()?;
        let gc_off = self.gc_off();
        let gc = self.gc();

        let mut map = IndexMap::new();
        map.insert("round".to_string(), gc.round.to_string());
        map.insert("begin".to_string(), gc.begin.to_string());
        map.insert("roots".to_string(), gc.roots_cnt.to_string());
        map.insert(
            "mark_cnt_per_step".to_string(),
            gc.mark_cnt_per_step.to_string(),
        );
        map.insert(
            "free_cnt_per_step".to_string(),
            gc.free_cnt_per_step.to_string(),
        );
        for (name, off) in [
            ("mark_queue", gc_queue!(gc_off, mark_queue)),
            ("prev_sweep_queue", gc_queue!(gc_off, prev_sweep_queue)),
            ("sweep_queue", gc_queue!(gc_off, sweep_queue)),
            ("garbage_queue", gc_queue!(gc_off, garbage_queue)),
            ("remained_queue", gc_queue!(gc_off, remained_queue)),
        ] {
            map.insert(name.to_string(), list::len(self.arena, off).to_string());
        }
        Ok(map)
    }
}
