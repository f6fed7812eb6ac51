//! Per-thread re-entrancy detection.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A process-unique, non-zero identifier of the calling thread.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Detects a thread re-entering an operation it is already running.
///
/// Patching a method can make the runtime compile it, which reports the compilation back to the
/// detour that is still being applied. The guard lets that notification recognise itself and
/// bail out instead of deadlocking.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    owner: AtomicU64,
}

/// Marks the owning thread as inside a [`ReentrancyGuard`] until dropped.
#[derive(Debug)]
pub struct ReentrancyScope<'a> {
    guard: &'a ReentrancyGuard,
}

impl ReentrancyGuard {
    /// Creates an unowned guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if the calling thread is inside the guard.
    #[must_use]
    pub fn is_entered(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }

    /// Enters the guard, or returns `None` if the calling thread is already inside.
    ///
    /// Other threads inside the guard are waited out.
    pub fn enter(&self) -> Option<ReentrancyScope<'_>> {
        let me = current_thread_id();
        loop {
            match self
                .owner
                .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(ReentrancyScope { guard: self }),
                Err(owner) if owner == me => return None,
                Err(_) => std::thread::yield_now(),
            }
        }
    }
}

impl Drop for ReentrancyScope<'_> {
    fn drop(&mut self) {
        self.guard.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn nested_entry_is_refused() {
        let guard = ReentrancyGuard::new();
        assert!(!guard.is_entered());

        let scope = guard.enter();
        assert!(scope.is_some());
        assert!(guard.is_entered());
        assert!(guard.enter().is_none());

        drop(scope);
        assert!(!guard.is_entered());
        assert!(guard.enter().is_some());
    }

    #[test]
    fn other_threads_wait() {
        let guard = Arc::new(ReentrancyGuard::new());
        let scope = guard.enter();

        let remote = guard.clone();
        let handle = std::thread::spawn(move || {
            assert!(!remote.is_entered());
            remote.enter().is_some()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(scope);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn thread_ids_are_distinct() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
    }
}
