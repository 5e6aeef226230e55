//! Locking that never allocates.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Spins before handing the CPU back to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    let mut spins = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          // The holder may have been preempted.
          std::thread::yield_now();
        }
      }
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Data guarded by a [`SpinLock`].
pub(crate) struct SpinMutex<T> {
  lock: SpinLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub(crate) const fn new(data: T) -> Self {
    Self {
      lock: SpinLock::new(),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
    self.lock.lock();
    SpinGuard { mutex: self }
  }

  /// Access without locking, through exclusive ownership.
  pub(crate) fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }
}

pub(crate) struct SpinGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    // Safety: Protected by `lock`
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    // Safety: Protected by `lock`
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.mutex.lock.unlock();
  }
}
