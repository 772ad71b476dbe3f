//! Execution Token (GIL) Management
//!
//! The embedded interpreter is single-threaded: at most one thread may run
//! interpreter code at a time, and its object graph is not re-entrant
//! across argument marshalling, the call itself, or result marshalling.
//!
//! [`Gil`] owns the interpreter state behind a `parking_lot::Mutex`.
//! Holding a [`GilGuard`] is the only way to reach that state, and
//! dropping the guard releases the token on every exit path.
//!
//! A thread that already holds the token and asks for it again gets
//! [`BridgeError::TokenReentry`] instead of deadlocking.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{BridgeError, BridgeResult};

/// Counter for token acquisitions across all sessions (for debugging)
static GIL_ACQUIRE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Source of per-token ids
static NEXT_GIL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Ids of the tokens held by this thread
    static HELD: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Exclusive-execution token guarding interpreter state `T`.
pub struct Gil<T> {
    id: u64,
    inner: Mutex<T>,
}

impl<T> Gil<T> {
    /// Wrap interpreter state in a new token
    pub fn new(state: T) -> Self {
        Self {
            id: NEXT_GIL_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(state),
        }
    }

    /// Acquire the token, blocking until it is free.
    pub fn acquire(&self) -> BridgeResult<GilGuard<'_, T>> {
        self.check_reentry()?;
        let guard = self.inner.lock();
        Ok(self.enter(guard))
    }

    /// Acquire the token, giving up after `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> BridgeResult<GilGuard<'_, T>> {
        self.check_reentry()?;
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(self.enter(guard)),
            None => Err(BridgeError::TokenUnavailable { waited: timeout }),
        }
    }

    /// Check if the current thread holds this token
    pub fn is_held_by_current_thread(&self) -> bool {
        HELD.with(|held| held.borrow().contains(&self.id))
    }

    /// Consume the token and return the state
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    fn check_reentry(&self) -> BridgeResult<()> {
        if self.is_held_by_current_thread() {
            return Err(BridgeError::TokenReentry);
        }
        Ok(())
    }

    fn enter<'a>(&'a self, guard: MutexGuard<'a, T>) -> GilGuard<'a, T> {
        HELD.with(|held| held.borrow_mut().push(self.id));
        GIL_ACQUIRE_COUNT.fetch_add(1, Ordering::Relaxed);
        GilGuard {
            id: self.id,
            guard,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Gil<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gil")
            .field("id", &self.id)
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

/// RAII holder of the execution token.
///
/// Not `Send`: the token must be released by the thread that took it.
pub struct GilGuard<'a, T> {
    id: u64,
    guard: MutexGuard<'a, T>,
    _marker: PhantomData<*mut ()>,
}

impl<T> Deref for GilGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GilGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GilGuard<'_, T> {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.id) {
                held.remove(pos);
            }
        });
    }
}

/// Get statistics about token usage (for debugging).
pub fn gil_stats() -> GilStats {
    GilStats {
        total_acquires: GIL_ACQUIRE_COUNT.load(Ordering::Relaxed),
        held_by_current_thread: HELD.with(|held| held.borrow().len()),
    }
}

/// Token usage statistics.
#[derive(Debug, Clone)]
pub struct GilStats {
    /// Total number of acquisitions in this process
    pub total_acquires: u64,
    /// Number of tokens the current thread holds right now
    pub held_by_current_thread: usize,
}

impl fmt::Display for GilStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GIL Stats: acquires={}, held={}",
            self.total_acquires, self.held_by_current_thread
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_guard_releases_on_drop() {
        let gil = Gil::new(0u32);
        {
            let mut guard = gil.acquire().unwrap();
            *guard += 1;
            assert!(gil.is_held_by_current_thread());
        }
        assert!(!gil.is_held_by_current_thread());
        assert_eq!(*gil.acquire().unwrap(), 1);
    }

    #[test]
    fn test_reentry_is_an_error() {
        let gil = Gil::new(());
        let _outer = gil.acquire().unwrap();
        assert!(matches!(gil.acquire(), Err(BridgeError::TokenReentry)));
        assert!(matches!(
            gil.try_acquire_for(Duration::from_millis(1)),
            Err(BridgeError::TokenReentry)
        ));
    }

    #[test]
    fn test_distinct_tokens_nest() {
        let a = Gil::new(());
        let b = Gil::new(());
        let _ga = a.acquire().unwrap();
        let _gb = b.acquire().unwrap();
        assert_eq!(gil_stats().held_by_current_thread, 2);
    }

    #[test]
    fn test_released_on_error_path() {
        fn failing(gil: &Gil<u32>) -> BridgeResult<()> {
            let _guard = gil.acquire()?;
            Err(BridgeError::marshalling("boom"))
        }

        let gil = Gil::new(0);
        assert!(failing(&gil).is_err());
        assert!(!gil.is_held_by_current_thread());
        assert!(gil.try_acquire_for(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_try_acquire_times_out_while_held_elsewhere() {
        let gil = Arc::new(Gil::new(()));
        let guard = gil.acquire().unwrap();

        let other = Arc::clone(&gil);
        let result = std::thread::spawn(move || {
            other
                .try_acquire_for(Duration::from_millis(20))
                .map(|_| ())
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(BridgeError::TokenUnavailable { .. })));
        drop(guard);
    }

    #[test]
    fn test_holders_never_overlap() {
        let gil = Arc::new(Gil::new(()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gil = Arc::clone(&gil);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let _guard = gil.acquire().unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gil_stats_counts_acquires() {
        let gil = Gil::new(());
        let before = gil_stats().total_acquires;
        drop(gil.acquire().unwrap());
        assert!(gil_stats().total_acquires > before);
    }
}
