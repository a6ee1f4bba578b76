//! Client ABI: tagged-value entry points on [`Store`].
//!
//! Values cross the boundary as owned [`TValue`] copies. Table-typed
//! copies are *references*: each one is pinned in the calling process's
//! proot under a key derived from the copy's buffer address, so the
//! collector cannot reclaim the target while the copy is alive, and
//! [`Store::free_value`] releases the pin together with the copy.
//!
//! Pinning happens under the collector lock taken before the target's
//! table lock, so a reference can never be observed by a collection cycle
//! between the copy and the pin.

use shtab_util::status::{Result, Status};

use crate::store::Store;
use crate::table::TableIter;
use crate::types::{IterSide, TValue, TableId, Tag};

/// Iterator over one table, as exported to clients. Holds a pinned
/// reference to its target; release it with [`Store::free_iter`].
pub struct StoreIter {
    table: TValue,
    iter: TableIter,
}

impl Store {
    /// Create a table and return a pinned reference to it.
    pub fn new_table(&self) -> Result<TValue> {
        let proot = self.proot()?;
        let pool = self.pool();

        // SAFETY: pool validated by the store.
        unsafe {
            let tid = pool.table_new()?;
            let value = TValue::from_table(tid);
            let key = TValue::from_u64(value.ref_key());
            if let Err(e) = pool.add_key_value(proot, &key, &value) {
                let _ = pool.table_release(tid);
                return Err(e);
            }
            Ok(value)
        }
    }

    /// A pinned reference to the process-global root table.
    pub fn root(&self) -> Result<TValue> {
        let g_root = self.g_root()?;
        self.pin_copy(g_root)
    }

    /// Release a value obtained from this store. For table references the
    /// pin in the caller's proot is removed, making the target eligible
    /// for collection once unreachable.
    pub fn free_value(&self, value: &mut TValue) -> Result<()> {
        if value.tag().is_table() {
            let proot = self.proot()?;
            let key = TValue::from_u64(value.ref_key());
            // SAFETY: pool validated by the store.
            unsafe { self.pool().remove_key(proot, &key)? };
        }
        value.clear();
        Ok(())
    }

    /// Insert `key -> value`; `Existed` when the key is present.
    pub fn add(&self, table: &TValue, key: &TValue, value: &TValue) -> Result<()> {
        let tid = self.target(table, key)?;
        // SAFETY: pool validated by the store.
        unsafe { self.pool().add_key_value(tid, key, value) }
    }

    /// Upsert `key -> value`.
    pub fn set(&self, table: &TValue, key: &TValue, value: &TValue) -> Result<()> {
        let tid = self.target(table, key)?;
        // SAFETY: pool validated by the store.
        unsafe { self.pool().set_key_value(tid, key, value) }
    }

    /// Copy out the value stored under `key`; table-typed results come
    /// back pinned.
    pub fn get(&self, table: &TValue, key: &TValue) -> Result<TValue> {
        let tid = self.target(table, key)?;
        let proot = self.proot()?;
        let pool = self.pool();

        // SAFETY: pool validated by the store; lock order collector →
        // target table → proot.
        unsafe {
            let _gc = pool.gc_lock()?;
            let value = pool.get_value(tid, key)?;
            if value.tag().is_table() {
                let pin_key = TValue::from_u64(value.ref_key());
                pool.add_key_value_gc_locked(proot, &pin_key, &value)?;
            }
            Ok(value)
        }
    }

    /// Remove `key`; a removed table-typed value becomes a sweep
    /// candidate.
    pub fn remove_key(&self, table: &TValue, key: &TValue) -> Result<()> {
        let tid = self.target(table, key)?;
        // SAFETY: pool validated by the store.
        unsafe { self.pool().remove_key(tid, key) }
    }

    /// Remove `key` only when the stored value equals `expected`.
    pub fn remove_key_if_value(
        &self,
        table: &TValue,
        key: &TValue,
        expected: &TValue,
    ) -> Result<()> {
        let tid = self.target(table, key)?;
        // SAFETY: pool validated by the store.
        unsafe { self.pool().remove_key_if_value(tid, key, expected) }
    }

    /// Start iterating `table` from `init_key` (or its smallest key). The
    /// iterator pins the table until [`free_iter`](Store::free_iter).
    pub fn iter_init(
        &self,
        table: &TValue,
        init_key: Option<&TValue>,
        side: IterSide,
    ) -> Result<StoreIter> {
        let tid = table.table_id()?;
        let proot = self.proot()?;
        let pool = self.pool();

        // SAFETY: pool validated by the store; lock order collector →
        // target table, pin after the target lock is released.
        unsafe {
            let _gc = pool.gc_lock()?;
            let iter = {
                let _t = pool.lock_table(tid)?;
                pool.iter_init_nolock(tid, init_key, side)?
            };
            let table = TValue::from_table(tid);
            let key = TValue::from_u64(table.ref_key());
            pool.add_key_value_gc_locked(proot, &key, &table)?;
            Ok(StoreIter { table, iter })
        }
    }

    /// Yield the next entry as fresh copies. `NotFound` marks the end;
    /// `TableModified` reports structural mutation since init.
    pub fn next(&self, iter: &mut StoreIter) -> Result<(TValue, TValue)> {
        let pool = self.pool();
        let proot = self.proot()?;

        // SAFETY: pool validated by the store; lock order collector →
        // target table, pin after the target lock is released.
        unsafe {
            let _gc = pool.gc_lock()?;
            let (key, value) = {
                let _t = pool.lock_table(iter.iter.table)?;
                pool.iter_next_nolock(&mut iter.iter)?
            };
            if value.tag().is_table() {
                let pin_key = TValue::from_u64(value.ref_key());
                pool.add_key_value_gc_locked(proot, &pin_key, &value)?;
            }
            Ok((key, value))
        }
    }

    /// Release an iterator and its pin on the target table.
    pub fn free_iter(&self, mut iter: StoreIter) -> Result<()> {
        self.free_value(&mut iter.table)
    }

    /// Iterate under the table lock, calling `visitor` with copies of each
    /// entry. A visitor returning `IterStop` ends the walk successfully.
    pub fn foreach<F>(
        &self,
        table: &TValue,
        init_key: Option<&TValue>,
        side: IterSide,
        mut visitor: F,
    ) -> Result<()>
    where
        F: FnMut(&TValue, &TValue) -> Result<()>,
    {
        let tid = table.table_id()?;
        let pool = self.pool();

        // SAFETY: pool validated by the store; the table lock is held for
        // the whole walk.
        unsafe {
            let _t = pool.lock_table(tid)?;
            let mut iter = pool.iter_init_nolock(tid, init_key, side)?;
            loop {
                match pool.iter_next_nolock(&mut iter) {
                    Ok((key, value)) => match visitor(&key, &value) {
                        Ok(()) => {}
                        Err(Status::IterStop) => return Ok(()),
                        Err(e) => return Err(e),
                    },
                    Err(Status::NotFound) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn target(&self, table: &TValue, key: &TValue) -> Result<TableId> {
        if key.tag() == Tag::Table {
            return Err(Status::ArgInvalid("table-typed keys are not supported"));
        }
        table.table_id()
    }

    /// Build a pinned table reference for `tid`.
    fn pin_copy(&self, tid: TableId) -> Result<TValue> {
        let proot = self.proot()?;
        let pool = self.pool();

        // SAFETY: pool validated by the store.
        unsafe {
            let _gc = pool.gc_lock()?;
            let value = TValue::from_table(tid);
            let key = TValue::from_u64(value.ref_key());
            pool.add_key_value_gc_locked(proot, &key, &value)?;
            Ok(value)
        }
    }
}
