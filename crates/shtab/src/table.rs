//! Tables: ordered maps of tagged keys to tagged values.
//!
//! A table is a shared-memory object: a red-black tree of entries, an
//! element count, a version counter for iterator invalidation, a robust
//! mutex, and a collector head. Entries copy both key and value payloads
//! into one slab allocation; the tree orders entries by tag-major key
//! bytes.
//!
//! Mutations speak to the collector: inserting a table-typed value pushes
//! the child onto the mark queue, removing one pushes it onto the sweep
//! queue, always under the collector lock taken *before* the table lock
//! (see the lock order on [`crate::Store`]).

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrd};

use shtab_util::status::{Result, Status};

use crate::gc::{Gc, GcHead};
use crate::intrusive::rbtree::Tree;
use crate::intrusive::{RbNode, RbRoot};
use crate::mem::slab::SlabPool;
use crate::mem::Arena;
use crate::sync::{RobustGuard, RobustMutex};
use crate::types::{cmp_tagged, IterSide, TValue, TableId, Tag};

/// Shared-memory table object. The collector head must stay the first
/// field: queue nodes are resolved back to the owning table by offset.
#[repr(C)]
pub struct TableHeader {
    pub gc_head: GcHead,
    pub elements: RbRoot,
    pub element_cnt: AtomicI64,
    /// Bumped by every structural mutation; iterators snapshot it.
    pub version: AtomicU64,
    pub inited: u32,
    _pad: u32,
    pub lock: RobustMutex,
}

// Queue nodes are mapped back to tables by offset arithmetic.
static_assertions::const_assert_eq!(std::mem::offset_of!(TableHeader, gc_head), 0);

/// One entry: tree link, tag/length header, then the copied key and value
/// bytes.
#[repr(C)]
pub struct Element {
    pub rbnode: RbNode,
    pub key_tag: u8,
    pub val_tag: u8,
    _pad: [u8; 2],
    pub key_len: u32,
    pub val_len: u32,
    _pad2: u32,
    // key bytes, then value bytes
}

const ELEM_HDR: u64 = std::mem::size_of::<Element>() as u64;

/// The table pool: the slab allocator plus the collector plus counters.
/// Embedded in the shared header.
#[repr(C)]
pub struct TablePool {
    pub inited: u32,
    /// 1 = the host drives [`crate::Store::gc_run`]; 0 = mutation paths
    /// trigger collection opportunistically.
    pub run_gc_periodical: u32,
    pub table_cnt: AtomicI64,
    pub gc: Gc,
    pub slab: SlabPool,
}

/// Borrowed view of the pool: arena plus the pool's offset. Table and
/// collector operations hang off this.
#[derive(Clone, Copy)]
pub(crate) struct PoolRef<'a> {
    pub arena: &'a Arena,
    pub off: u64,
}

impl<'a> PoolRef<'a> {
    pub fn new(arena: &'a Arena, off: u64) -> Self {
        Self { arena, off }
    }

    #[inline]
    pub fn slab_off(&self) -> u64 {
        self.off + std::mem::offset_of!(TablePool, slab) as u64
    }

    #[inline]
    pub fn gc_off(&self) -> u64 {
        self.off + std::mem::offset_of!(TablePool, gc) as u64
    }

    /// # Safety
    ///
    /// The pool must be initialised (or being initialised by the caller).
    pub unsafe fn pool(&self) -> &TablePool {
        self.arena.at(self.off)
    }

    unsafe fn header(&self, tid: TableId) -> &'a TableHeader {
        self.arena.at(tid.off())
    }

    unsafe fn header_mut(&self, tid: TableId) -> &'a mut TableHeader {
        self.arena.at_mut(tid.off())
    }

    unsafe fn check_table(&self, tid: TableId) -> Result<()> {
        if tid.off() == 0 || !self.arena.contains(tid.off(), std::mem::size_of::<TableHeader>())
        {
            return Err(Status::ArgInvalid("bad table handle"));
        }
        if self.header(tid).inited == 0 {
            return Err(Status::Uninited);
        }
        Ok(())
    }

    /// Initialise the non-slab part of the pool.
    ///
    /// # Safety
    ///
    /// `self.off` must address a `TablePool` whose slab member has already
    /// been initialised.
    pub unsafe fn pool_init(&self, run_gc_periodical: bool, gc_step_usec: i64) -> Result<()> {
        let pool = self.arena.at_mut::<TablePool>(self.off);
        if pool.inited != 0 {
            return Err(Status::InitTwice);
        }
        crate::gc::gc_init(self.arena, self.gc_off(), gc_step_usec)?;
        pool.run_gc_periodical = run_gc_periodical as u32;
        pool.table_cnt.store(0, AtomicOrd::Relaxed);
        pool.inited = 1;
        Ok(())
    }

    /// Tear the pool down; drains the collector first.
    ///
    /// # Safety
    ///
    /// No table of this pool may be referenced afterwards.
    pub unsafe fn pool_destroy(&self) -> Result<()> {
        let pool = self.arena.at_mut::<TablePool>(self.off);
        if pool.inited == 0 {
            return Err(Status::Uninited);
        }
        self.gc_destroy()?;
        pool.table_cnt.store(0, AtomicOrd::Relaxed);
        pool.inited = 0;
        Ok(())
    }

    // ----- table lifecycle ------------------------------------------------

    /// Allocate and initialise an empty table.
    ///
    /// # Safety
    ///
    /// The pool must be initialised.
    pub unsafe fn table_new(&self) -> Result<TableId> {
        let off = SlabPool::alloc(
            self.arena,
            self.slab_off(),
            std::mem::size_of::<TableHeader>(),
        )?;

        let header = self.arena.at_mut::<TableHeader>(off);
        // Slab memory is recycled without zeroing.
        *header = std::mem::zeroed();
        header.gc_head.mark = self.gc_round();
        if let Err(e) = header.lock.init() {
            let _ = SlabPool::free(self.arena, self.slab_off(), off);
            return Err(e);
        }
        header.inited = 1;

        self.pool().table_cnt.fetch_add(1, AtomicOrd::Relaxed);
        Ok(TableId(off))
    }

    /// Release an empty table. The caller must have detached it from the
    /// collector's queues and the root set.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool with no remaining
    /// references.
    pub unsafe fn table_release(&self, tid: TableId) -> Result<()> {
        self.check_table(tid)?;
        let header = self.header_mut(tid);
        if header.element_cnt.load(AtomicOrd::Relaxed) != 0 {
            return Err(Status::NotEmpty);
        }
        if header.gc_head.mark_node.is_linked() || header.gc_head.sweep_node.is_linked() {
            return Err(Status::StateInvalid("release of a queued table"));
        }
        header.lock.destroy()?;
        header.inited = 0;

        self.pool().table_cnt.fetch_sub(1, AtomicOrd::Relaxed);
        SlabPool::free(self.arena, self.slab_off(), tid.off())
    }

    // ----- entries --------------------------------------------------------

    unsafe fn new_element(
        &self,
        key_tag: u8,
        key: &[u8],
        val_tag: u8,
        val: &[u8],
    ) -> Result<u64> {
        let size = ELEM_HDR as usize + key.len() + val.len();
        let off = SlabPool::alloc(self.arena, self.slab_off(), size)?;

        let elem = self.arena.at_mut::<Element>(off);
        elem.rbnode = std::mem::zeroed();
        elem.key_tag = key_tag;
        elem.val_tag = val_tag;
        elem.key_len = key.len() as u32;
        elem.val_len = val.len() as u32;

        self.arena
            .bytes_mut(off + ELEM_HDR, key.len())
            .copy_from_slice(key);
        self.arena
            .bytes_mut(off + ELEM_HDR + key.len() as u64, val.len())
            .copy_from_slice(val);
        Ok(off)
    }

    unsafe fn release_element(&self, elem_off: u64) -> Result<()> {
        SlabPool::free(self.arena, self.slab_off(), elem_off)
    }

    pub(crate) unsafe fn elem_key(&self, elem_off: u64) -> (u8, &'a [u8]) {
        let elem = self.arena.at::<Element>(elem_off);
        (
            elem.key_tag,
            self.arena.bytes(elem_off + ELEM_HDR, elem.key_len as usize),
        )
    }

    pub(crate) unsafe fn elem_val(&self, elem_off: u64) -> (u8, &'a [u8]) {
        let elem = self.arena.at::<Element>(elem_off);
        (
            elem.val_tag,
            self.arena.bytes(
                elem_off + ELEM_HDR + elem.key_len as u64,
                elem.val_len as usize,
            ),
        )
    }

    unsafe fn elements_tree(&self, tid: TableId) -> Tree<'a> {
        Tree::new(
            self.arena,
            tid.off() + std::mem::offset_of!(TableHeader, elements) as u64,
        )
    }

    unsafe fn cmp_elems(&self, a: u64, b: u64) -> Ordering {
        let (at, ab) = self.elem_key(a);
        let (bt, bb) = self.elem_key(b);
        cmp_tagged(at, ab, bt, bb)
    }

    unsafe fn probe_key(&self, tag: u8, key: &[u8], node: u64) -> Ordering {
        let (nt, nb) = self.elem_key(node);
        cmp_tagged(tag, key, nt, nb)
    }

    pub(crate) unsafe fn lock_table(&self, tid: TableId) -> Result<RobustGuard<'a>> {
        self.header(tid).lock.guard()
    }

    unsafe fn bump_version(&self, tid: TableId) {
        self.header(tid).version.fetch_add(1, AtomicOrd::Relaxed);
    }

    // ----- mutation -------------------------------------------------------

    unsafe fn insert_element(&self, tid: TableId, elem: u64) -> Result<()> {
        let _t = self.lock_table(tid)?;
        let tree = self.elements_tree(tid);
        tree.insert(elem, &mut |a, b| self.cmp_elems(a, b))?;
        self.header(tid).element_cnt.fetch_add(1, AtomicOrd::Relaxed);
        self.bump_version(tid);
        Ok(())
    }

    /// Insert; fails with `Existed` when the key is present. A table-typed
    /// value is announced to the collector's mark queue.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn add_key_value(&self, tid: TableId, key: &TValue, value: &TValue) -> Result<()> {
        self.check_table(tid)?;
        if key.is_nil() || key.bytes().is_empty() {
            return Err(Status::ArgInvalid("nil key"));
        }
        if value.is_nil() {
            return Err(Status::ArgInvalid("nil value"));
        }

        let elem = self.new_element(
            key.tag() as u8,
            key.bytes(),
            value.tag() as u8,
            value.bytes(),
        )?;

        let ret = if value.tag().is_table() {
            match self.gc_lock() {
                Ok(_gc) => self
                    .insert_element(tid, elem)
                    .and_then(|()| self.push_to_mark(value.table_id()?.off())),
                Err(e) => Err(e),
            }
        } else {
            self.insert_element(tid, elem)
        };

        if let Err(e) = ret {
            let _ = self.release_element(elem);
            return Err(e);
        }
        self.run_gc_if_needed(tid)
    }

    /// As [`add_key_value`](Self::add_key_value), with the collector lock
    /// already held by the caller. The ABI uses this to pin exported
    /// references atomically with the copy that created them; the
    /// opportunistic collector trigger is skipped since the collector
    /// lock is taken.
    ///
    /// # Safety
    ///
    /// Caller holds the collector lock; `tid` must be a live table.
    pub(crate) unsafe fn add_key_value_gc_locked(
        &self,
        tid: TableId,
        key: &TValue,
        value: &TValue,
    ) -> Result<()> {
        self.check_table(tid)?;
        if key.is_nil() || key.bytes().is_empty() {
            return Err(Status::ArgInvalid("nil key"));
        }

        let elem = self.new_element(
            key.tag() as u8,
            key.bytes(),
            value.tag() as u8,
            value.bytes(),
        )?;
        if let Err(e) = self.insert_element(tid, elem) {
            let _ = self.release_element(elem);
            return Err(e);
        }
        if value.tag().is_table() {
            self.push_to_mark(value.table_id()?.off())?;
        }
        Ok(())
    }

    /// Upsert. Replacing an entry whose old value was a table sends the
    /// old child to the sweep queue; a new table-typed value goes to the
    /// mark queue.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn set_key_value(&self, tid: TableId, key: &TValue, value: &TValue) -> Result<()> {
        self.check_table(tid)?;
        if key.is_nil() || key.bytes().is_empty() {
            return Err(Status::ArgInvalid("nil key"));
        }
        if value.is_nil() {
            return Err(Status::ArgInvalid("nil value"));
        }

        let elem = self.new_element(
            key.tag() as u8,
            key.bytes(),
            value.tag() as u8,
            value.bytes(),
        )?;

        let gc = match self.gc_lock() {
            Ok(g) => g,
            Err(e) => {
                let _ = self.release_element(elem);
                return Err(e);
            }
        };

        let replaced = {
            let t = match self.lock_table(tid) {
                Ok(g) => g,
                Err(e) => {
                    drop(gc);
                    let _ = self.release_element(elem);
                    return Err(e);
                }
            };
            let tree = self.elements_tree(tid);
            let found =
                tree.search_eq(&mut |n| self.probe_key(key.tag() as u8, key.bytes(), n));
            let replaced = match found {
                Some(old) => {
                    tree.replace(old, elem);
                    Some(old)
                }
                None => {
                    if let Err(e) = tree.insert(elem, &mut |a, b| self.cmp_elems(a, b)) {
                        drop(t);
                        drop(gc);
                        let _ = self.release_element(elem);
                        return Err(e);
                    }
                    self.header(tid).element_cnt.fetch_add(1, AtomicOrd::Relaxed);
                    None
                }
            };
            self.bump_version(tid);
            replaced
        };

        // The new entry is linked from here on; failures no longer own it.
        if value.tag().is_table() {
            self.push_to_mark(value.table_id()?.off())?;
        }
        if let Some(old) = replaced {
            let (vt, vb) = self.elem_val(old);
            if Tag::from_u8(vt)?.is_table() {
                self.push_to_sweep(table_off_from_value(vb)?)?;
            }
            self.release_element(old)?;
        }
        drop(gc);

        self.run_gc_if_needed(tid)
    }

    /// Remove a key; the removed table-typed value is announced to the
    /// sweep queue.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn remove_key(&self, tid: TableId, key: &TValue) -> Result<()> {
        self.remove_key_inner(tid, key, None)
    }

    /// Remove a key only when the stored value equals `expected`
    /// (tag and bytes); otherwise `NotEqual` and the entry stays.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn remove_key_if_value(
        &self,
        tid: TableId,
        key: &TValue,
        expected: &TValue,
    ) -> Result<()> {
        self.remove_key_inner(tid, key, Some(expected))
    }

    unsafe fn remove_key_inner(
        &self,
        tid: TableId,
        key: &TValue,
        expected: Option<&TValue>,
    ) -> Result<()> {
        self.check_table(tid)?;
        if key.is_nil() || key.bytes().is_empty() {
            return Err(Status::ArgInvalid("nil key"));
        }

        let removed = {
            let _gc = self.gc_lock()?;
            let removed = {
                let _t = self.lock_table(tid)?;
                let tree = self.elements_tree(tid);
                let found = tree
                    .search_eq(&mut |n| self.probe_key(key.tag() as u8, key.bytes(), n))
                    .ok_or(Status::NotFound)?;

                if let Some(exp) = expected {
                    let (vt, vb) = self.elem_val(found);
                    if vt != exp.tag() as u8 || vb != exp.bytes() {
                        return Err(Status::NotEqual);
                    }
                }

                tree.delete(found);
                self.header(tid).element_cnt.fetch_sub(1, AtomicOrd::Relaxed);
                self.bump_version(tid);
                found
            };

            let (vt, vb) = self.elem_val(removed);
            if Tag::from_u8(vt)?.is_table() {
                self.push_to_sweep(table_off_from_value(vb)?)?;
            }
            removed
        };

        self.release_element(removed)?;
        self.run_gc_if_needed(tid)
    }

    /// Remove every entry, announcing removed children to the sweep queue.
    /// Atomic with respect to the collector: the whole drain happens under
    /// one collector-lock hold.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn remove_all(&self, tid: TableId) -> Result<()> {
        self.check_table(tid)?;
        {
            let _gc = self.gc_lock()?;
            let _t = self.lock_table(tid)?;
            self.drain_elements(tid, true)?;
        }
        self.run_gc_if_needed(tid)
    }

    /// Remove every entry without collector notifications. Only the
    /// collector's free phase uses this; it already holds the collector
    /// lock and is about to release the table itself.
    ///
    /// # Safety
    ///
    /// Caller must hold the collector lock.
    pub unsafe fn remove_all_for_gc(&self, tid: TableId) -> Result<()> {
        self.check_table(tid)?;
        let _t = self.lock_table(tid)?;
        self.drain_elements(tid, false)
    }

    unsafe fn drain_elements(&self, tid: TableId, notify: bool) -> Result<()> {
        let tree = self.elements_tree(tid);
        while let Some(n) = tree.left_most() {
            tree.delete(n);
            self.header(tid).element_cnt.fetch_sub(1, AtomicOrd::Relaxed);
            self.bump_version(tid);

            if notify {
                let (vt, vb) = self.elem_val(n);
                if Tag::from_u8(vt)?.is_table() {
                    self.push_to_sweep(table_off_from_value(vb)?)?;
                }
            }
            self.release_element(n)?;
        }
        Ok(())
    }

    // ----- lookup and iteration ------------------------------------------

    /// Copy out the value stored under `key`. Takes the table lock for the
    /// duration of the copy.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table of this pool.
    pub unsafe fn get_value(&self, tid: TableId, key: &TValue) -> Result<TValue> {
        self.check_table(tid)?;
        let _t = self.lock_table(tid)?;
        self.get_value_nolock(tid, key)
    }

    /// As [`get_value`](Self::get_value), with the table lock already held
    /// by the caller.
    ///
    /// # Safety
    ///
    /// Caller holds `tid`'s lock.
    pub unsafe fn get_value_nolock(&self, tid: TableId, key: &TValue) -> Result<TValue> {
        let tree = self.elements_tree(tid);
        let found = tree
            .search_eq(&mut |n| self.probe_key(key.tag() as u8, key.bytes(), n))
            .ok_or(Status::NotFound)?;
        let (vt, vb) = self.elem_val(found);
        Ok(TValue::from_raw(Tag::from_u8(vt)?, vb))
    }

    /// Position an iterator. `init_key == None` starts at the smallest
    /// key; otherwise `side` selects the starting entry relative to the
    /// key. An empty starting position yields `NotFound` from the first
    /// [`iter_next_nolock`](Self::iter_next_nolock).
    ///
    /// # Safety
    ///
    /// Caller holds `tid`'s lock.
    pub unsafe fn iter_init_nolock(
        &self,
        tid: TableId,
        init_key: Option<&TValue>,
        side: IterSide,
    ) -> Result<TableIter> {
        self.check_table(tid)?;
        let tree = self.elements_tree(tid);

        let start = match init_key {
            None => tree.left_most(),
            Some(key) => {
                let mut probe =
                    |n: u64| self.probe_key(key.tag() as u8, key.bytes(), n);
                match side {
                    IterSide::Eq => Some(tree.search_eq(&mut probe).ok_or(Status::NotFound)?),
                    IterSide::LeftEq => tree.search_le(&mut probe),
                    IterSide::RightEq => tree.search_ge(&mut probe),
                }
            }
        };

        Ok(TableIter {
            table: tid,
            next_elem: start.unwrap_or(0),
            version: self.header(tid).version.load(AtomicOrd::Relaxed),
        })
    }

    /// Yield the iterator's current entry and advance. `NotFound` marks
    /// the end; `TableModified` reports structural mutation since init.
    ///
    /// # Safety
    ///
    /// Caller holds the table lock of `iter.table`.
    pub unsafe fn iter_next_nolock(&self, iter: &mut TableIter) -> Result<(TValue, TValue)> {
        self.check_table(iter.table)?;
        if self.header(iter.table).version.load(AtomicOrd::Relaxed) != iter.version {
            return Err(Status::TableModified);
        }
        if iter.next_elem == 0 {
            return Err(Status::NotFound);
        }

        let cur = iter.next_elem;
        let (kt, kb) = self.elem_key(cur);
        let (vt, vb) = self.elem_val(cur);
        let key = TValue::from_raw(Tag::from_u8(kt)?, kb);
        let val = TValue::from_raw(Tag::from_u8(vt)?, vb);

        iter.next_elem = self.elements_tree(iter.table).next(cur).unwrap_or(0);
        Ok((key, val))
    }

    /// Walk every value in key order, under the table lock. The collector
    /// uses this to discover child tables.
    ///
    /// # Safety
    ///
    /// `tid` must be a live table; respects the lock order when the caller
    /// holds the collector lock.
    pub unsafe fn foreach_values(
        &self,
        tid: TableId,
        f: &mut dyn FnMut(u8, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.check_table(tid)?;
        let _t = self.lock_table(tid)?;
        let tree = self.elements_tree(tid);
        let mut cur = tree.left_most();
        while let Some(n) = cur {
            let (vt, vb) = self.elem_val(n);
            f(vt, vb)?;
            cur = tree.next(n);
        }
        Ok(())
    }

    // ----- collector trigger ---------------------------------------------

    /// Opportunistic collection on mutation paths: skipped entirely in
    /// periodic mode, and roughly half the time otherwise, selected by a
    /// Fibonacci hash of the table handle.
    unsafe fn run_gc_if_needed(&self, tid: TableId) -> Result<()> {
        if self.pool().run_gc_periodical == 1 {
            return Ok(());
        }
        if tid.off().wrapping_mul(11400714819323198485) > 1u64 << 63 {
            return Ok(());
        }
        match self.gc_run() {
            Ok(()) | Err(Status::NoGcData) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Decode the table offset stored in a table-typed value payload.
pub(crate) fn table_off_from_value(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Status::StateInvalid("table value payload length"))?;
    Ok(u64::from_le_bytes(arr))
}

/// Iterator state over one table. Valid only while the table keeps the
/// version observed at init.
#[derive(Debug, Clone)]
pub struct TableIter {
    pub(crate) table: TableId,
    next_elem: u64,
    version: u64,
}
