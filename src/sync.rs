//! Spinlock and exception-guard primitives.
//!
//! The hypervisor runs single-core, single-hart, cooperatively: guest
//! execution is fully suspended whenever hypervisor code runs. A spinlock is
//! still useful to give shared singletons (the root page table, the per-device
//! rolling sync buffers) an interior-mutability API without `unsafe` leaking
//! into every caller.

use core::cell::{Cell, UnsafeCell};
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock mutex.
pub struct SpinLock<T: ?Sized> {
    is_locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the spinlock provides exclusive access to `data` while locked.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around the given data.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Locks the mutex. The mutex is automatically unlocked when the returned
    /// `MutexGuard` is dropped.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        MutexGuard(self, Cell::new(true))
    }

    /// Unlocks the mutex.
    ///
    /// # Safety
    /// Must only be called by the destructor of the `MutexGuard` that locked this mutex.
    #[inline]
    unsafe fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release);
    }
}

/// RAII guard for a locked [`SpinLock`].
pub struct MutexGuard<'locked, T>(&'locked SpinLock<T>, Cell<bool>);

impl<T> MutexGuard<'_, T> {
    const fn get_pointer(&self) -> NonNull<T> {
        // SAFETY: pointers to `data` are nonnull.
        unsafe { NonNull::new_unchecked(self.0.data.get()) }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        assert!(self.1.get());
        // SAFETY: holding the guard implies exclusive access.
        unsafe { self.get_pointer().as_ref() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        assert!(self.1.get());
        // SAFETY: holding the guard implies exclusive access.
        unsafe { self.get_pointer().as_mut() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        if self.1.get() {
            // SAFETY: this guard is the one that locked the spinlock.
            unsafe { self.0.unlock() };
        }
    }
}

/// Disposition of an exception hit while an [`ExcGuard`] is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcAction {
    /// Unwind out of the guarded region entirely (used by MEMREAD's checksum pass).
    Return,
    /// Step over the faulting instruction and continue (used by MEMWRITE's end-probes).
    Skip,
}

/// Process-wide exception-guard state, read by the (out-of-scope) low-level
/// exception vector to decide how to handle a bus/page fault that occurs
/// while hypervisor code is touching guest-controlled memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExcState {
    Off,
    Armed(ExcAction),
}

/// Global exception-guard flag plus the observer-visible fault counter.
pub struct ExcGuard {
    state: Cell<ExcState>,
    count: Cell<u32>,
}

// SAFETY: single-core, cooperative hypervisor; never touched concurrently.
unsafe impl Sync for ExcGuard {}

impl ExcGuard {
    /// Creates a disarmed exception guard.
    pub const fn new() -> Self {
        Self {
            state: Cell::new(ExcState::Off),
            count: Cell::new(0),
        }
    }

    /// Arms the guard for the duration of `body`, restoring `Off` on every
    /// exit path (normal return, or a fault the vector resolves by jumping
    /// back here), and reports whether a fault occurred while armed.
    pub fn guarded<R>(&self, action: ExcAction, body: impl FnOnce() -> R) -> (R, bool) {
        let before = self.count.get();
        self.state.set(ExcState::Armed(action));
        let result = body();
        self.state.set(ExcState::Off);
        let faulted = self.count.get() != before;
        (result, faulted)
    }

    /// Called by the exception vector (out of scope) when a bus/page fault is
    /// taken while the guard is armed. Returns the action to take; the vector
    /// is responsible for actually unwinding or skipping.
    pub fn on_fault(&self) -> Option<ExcAction> {
        match self.state.get() {
            ExcState::Off => None,
            ExcState::Armed(action) => {
                self.count.set(self.count.get() + 1);
                self.state.set(ExcState::Off);
                Some(action)
            }
        }
    }

    /// Number of guarded faults observed so far.
    pub fn fault_count(&self) -> u32 {
        self.count.get()
    }
}

impl Default for ExcGuard {
    fn default() -> Self {
        Self::new()
    }
}
