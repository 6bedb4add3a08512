//! Two-tier locking for the registry and per-service streaming state.
//!
//! - **Registry lock**: one per process, guards the service list, the
//!   lifecycle state and every control-plane field.
//! - **Stream lock**: one per service, guards the elementary stream table,
//!   the pad and the streaming status. Held by the data plane while it
//!   processes packets.
//!
//! The registry lock must never be taken while the same thread holds a
//! stream lock. Every stream guard bumps a thread-local depth counter and
//! the registry lock asserts it is zero, so a violation panics in debug
//! builds instead of deadlocking in production.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

thread_local! {
    static STREAM_LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Number of stream locks held by the current thread.
pub fn stream_lock_depth() -> usize {
    STREAM_LOCK_DEPTH.with(|d| d.get())
}

/// Process-wide registry lock.
#[derive(Debug, Default)]
pub struct RegistryLock<T> {
    inner: Mutex<T>,
}

/// Guard for [`RegistryLock`].
pub struct RegistryGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> RegistryLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the registry lock.
    ///
    /// Panics in debug builds when the calling thread holds a stream lock.
    pub fn lock(&self) -> RegistryGuard<'_, T> {
        debug_assert_eq!(
            stream_lock_depth(),
            0,
            "registry lock acquired while holding a stream lock"
        );
        RegistryGuard {
            guard: self.inner.lock(),
        }
    }
}

impl<T> Deref for RegistryGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RegistryGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Per-service stream lock.
#[derive(Debug, Default)]
pub struct StreamLock<T> {
    inner: Mutex<T>,
}

/// Guard for [`StreamLock`].
pub struct StreamGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> StreamLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> StreamGuard<'_, T> {
        let guard = self.inner.lock();
        STREAM_LOCK_DEPTH.with(|d| d.set(d.get() + 1));
        StreamGuard { guard }
    }
}

impl<T> StreamGuard<'_, T> {
    /// Wait on `cond` until notified or `deadline` passes. Returns true on
    /// timeout.
    pub fn wait_until(&mut self, cond: &Condvar, deadline: Instant) -> bool {
        cond.wait_until(&mut self.guard, deadline).timed_out()
    }
}

impl<T> Deref for StreamGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StreamGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for StreamGuard<'_, T> {
    fn drop(&mut self) {
        STREAM_LOCK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_depth_follows_guards() {
        let a = StreamLock::new(1u32);
        let b = StreamLock::new(2u32);
        assert_eq!(stream_lock_depth(), 0);
        {
            let _ga = a.lock();
            let _gb = b.lock();
            assert_eq!(stream_lock_depth(), 2);
        }
        assert_eq!(stream_lock_depth(), 0);

        let registry = RegistryLock::new(());
        let _g = registry.lock();
    }

    #[test]
    #[should_panic(expected = "registry lock acquired while holding a stream lock")]
    fn test_registry_after_stream_panics() {
        let registry = RegistryLock::new(());
        let stream = StreamLock::new(());
        let _s = stream.lock();
        let _r = registry.lock();
    }

    #[test]
    fn test_stream_after_registry_is_allowed() {
        let registry = RegistryLock::new(0u32);
        let stream = StreamLock::new(0u32);
        let mut r = registry.lock();
        let mut s = stream.lock();
        *r += 1;
        *s += 1;
    }

    #[test]
    fn test_wait_until_times_out() {
        let stream = StreamLock::new(false);
        let cond = Condvar::new();
        let mut g = stream.lock();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(g.wait_until(&cond, deadline));
        assert!(!*g);
    }
}
