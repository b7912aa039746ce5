//! Spin primitives and thread identity for use inside the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a spinlock whose word holds the owning thread id, and a `SpinMutex<T>`
//! wrapper. Contended paths back off with the architecture pause hint.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Architecture-appropriate pause between CAS retries (PAUSE / YIELD).
#[inline]
pub fn wait_spin() {
    core::hint::spin_loop();
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        /// Identity of the calling thread.
        ///
        /// The address of a thread-local slot: stable for the lifetime of the
        /// thread, unique across live threads, never zero.
        #[inline]
        pub fn thread_id() -> usize {
            #[thread_local]
            static SLOT: u8 = 0;
            core::ptr::addr_of!(SLOT) as usize
        }
    } else if #[cfg(feature = "std")] {
        /// Identity of the calling thread.
        ///
        /// Drawn from a process-wide counter on first use; starts at 1 so
        /// that 0 keeps meaning "no owner".
        pub fn thread_id() -> usize {
            use core::cell::Cell;

            static COUNTER: AtomicUsize = AtomicUsize::new(1);
            std::thread_local! {
                static TID: Cell<usize> = const { Cell::new(0) };
            }
            TID.try_with(|tid| {
                let id = tid.get();
                if id != 0 {
                    return id;
                }
                let id = COUNTER.fetch_add(1, Ordering::Relaxed);
                tid.set(id);
                id
            })
            // TLS already destroyed: the thread no longer owns any page, so
            // any stable non-zero value keeps frees on the cross-thread path.
            .unwrap_or(usize::MAX - 1)
        }
    } else {
        /// Identity of the calling thread.
        ///
        /// Without TLS there is no per-thread identity; all allocation goes
        /// through the shared fallback heap, whose pages carry a sentinel
        /// owner so every free takes the cross-thread path.
        #[inline]
        pub fn thread_id() -> usize {
            0
        }
    }
}

/// A spinlock whose word holds the owner's thread id (0 when unlocked).
pub struct SpinLock {
    owner: AtomicUsize,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn lock_token() -> usize {
        let id = thread_id();
        if id != 0 { id } else { 1 }
    }

    #[inline]
    pub fn lock(&self) {
        let token = Self::lock_token();
        if self
            .owner
            .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow(token);
    }

    #[cold]
    fn lock_slow(&self, token: usize) {
        loop {
            // Spin while held (read-only, does not invalidate the cache line)
            while self.owner.load(Ordering::Relaxed) != 0 {
                wait_spin();
            }
            if self
                .owner
                .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.owner
            .compare_exchange(0, Self::lock_token(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}
