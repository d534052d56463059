// src/sync.rs

//! Cross-process mutual exclusion over shared anonymous memory.
//!
//! The streamer control connection is shared by every caller in the process,
//! including helpers forked after the session is set up. A plain in-process
//! mutex would not cover those, so the lock word lives in a
//! `MAP_SHARED | MAP_ANONYMOUS` page: any process forked after
//! [`ShmMutex::new`] shares the same futex word. The lock itself is the
//! classic three-state futex mutex (unlocked / locked / contended), waking a
//! waiter only when one may exist.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{Result, TransportError};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A mutex whose lock word lives in fork-shared anonymous memory.
#[derive(Debug)]
pub struct ShmMutex {
    state: NonNull<AtomicU32>,
}

// The lock word sits in shared memory and is only touched through atomics.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Maps the shared lock word. Must be called before forking any process
    /// that is meant to share the lock.
    pub fn new() -> Result<Self> {
        let len = NonZeroUsize::new(std::mem::size_of::<AtomicU32>())
            .ok_or_else(|| TransportError::lock("zero-sized lock word"))?;

        // SAFETY: anonymous mapping with no fixed address; the kernel picks a
        // fresh page that we own exclusively until Drop.
        let page = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| TransportError::lock(format!("failed to map shared lock page: {e}")))?;

        let state = page.cast::<AtomicU32>();
        // SAFETY: the mapping is fresh, suitably aligned, and exclusively
        // ours until this constructor returns.
        unsafe { state.as_ptr().write(AtomicU32::new(UNLOCKED)) };

        Ok(Self { state })
    }

    fn state(&self) -> &AtomicU32 {
        // SAFETY: the mapping lives until Drop, and AtomicU32 allows shared
        // access from any process mapping the page.
        unsafe { self.state.as_ref() }
    }

    /// Acquires the lock, blocking in the kernel under contention.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let state = self.state();
        if state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Mark contended so the holder knows to wake us, then sleep
            // until the word changes.
            while state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                futex_wait(state, CONTENDED);
            }
        }
        ShmMutexGuard { mutex: self }
    }

    fn unlock(&self) {
        if self.state().swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(self.state(), 1);
        }
    }
}

impl Drop for ShmMutex {
    fn drop(&mut self) {
        // SAFETY: the pointer came from mmap_anonymous with this length and
        // no guard can outlive the mutex.
        unsafe {
            let _ = munmap(self.state.cast(), std::mem::size_of::<AtomicU32>());
        }
    }
}

/// RAII guard; releases the lock on drop, including on error unwinds.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

fn futex_wait(state: &AtomicU32, expected: u32) {
    // A spurious wakeup or EAGAIN just re-runs the caller's acquire loop.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

fn futex_wake(state: &AtomicU32, waiters: u32) {
    unsafe {
        libc::syscall(libc::SYS_futex, state.as_ptr(), libc::FUTEX_WAKE, waiters);
    }
}
