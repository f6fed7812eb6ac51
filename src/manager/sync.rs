//! Coordination between calls through a hook chain and updates to it.
//!
//! Every call through a managed hook is counted. An update marks the chain as being rebuilt,
//! then waits for every call that is not its own to leave; new calls wait for the update to
//! finish. A thread already inside the chain may keep calling into it, otherwise a hook that
//! calls its original while an update is pending would deadlock against that update.

use std::{
    cell::RefCell,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use rustc_hash::FxHashMap;

use crate::{detour::current_thread_id, Error, Result};

static NEXT_SYNC_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Calls the current thread has open, per chain.
    static CALL_DEPTH: RefCell<FxHashMap<usize, usize>> = RefCell::new(FxHashMap::default());
}

/// Spins until `done` holds, yielding the time slice after `yield_after` busy spins.
pub(crate) fn spin_until(yield_after: u32, mut done: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !done() {
        if spins < yield_after {
            std::hint::spin_loop();
            spins += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// Call accounting of one hook chain.
#[derive(Debug)]
pub struct DetourSyncInfo {
    id: usize,
    active_calls: AtomicUsize,
    updating_thread: AtomicU64,
    spin_yield_after: u32,
}

impl DetourSyncInfo {
    /// Creates the accounting for a chain; waits busy-spin `spin_yield_after` times before
    /// yielding.
    #[must_use]
    pub fn new(spin_yield_after: u32) -> Self {
        DetourSyncInfo {
            id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
            active_calls: AtomicUsize::new(0),
            updating_thread: AtomicU64::new(0),
            spin_yield_after,
        }
    }

    /// Calls currently inside the chain, across all threads.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    /// `true` while an update is in progress.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.updating_thread.load(Ordering::SeqCst) != 0
    }

    /// Calls the current thread has open in this chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        CALL_DEPTH.with(|depth| depth.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn adjust_depth(&self, entering: bool) {
        CALL_DEPTH.with(|depth| {
            let mut depth = depth.borrow_mut();
            if entering {
                *depth.entry(self.id).or_insert(0) += 1;
            } else if let Some(count) = depth.get_mut(&self.id) {
                *count -= 1;
                if *count == 0 {
                    depth.remove(&self.id);
                }
            }
        });
    }

    /// Registers a call into the chain, waiting out an update started by another thread.
    ///
    /// # Errors
    /// Returns [`Error::ChainUpdateReentry`] if the calling thread is the one updating the
    /// chain and is not already inside it.
    pub fn enter(&self) -> Result<CallGuard<'_>> {
        let me = current_thread_id();
        loop {
            self.active_calls.fetch_add(1, Ordering::SeqCst);
            let updating = self.updating_thread.load(Ordering::SeqCst);
            if updating == 0 || (updating != me && self.depth() > 0) {
                self.adjust_depth(true);
                return Ok(CallGuard { sync: self });
            }

            self.active_calls.fetch_sub(1, Ordering::SeqCst);
            if updating == me {
                return Err(Error::ChainUpdateReentry);
            }
            spin_until(self.spin_yield_after, || !self.is_updating());
        }
    }

    /// Marks the chain as being updated and waits until only the calling thread's own calls
    /// remain inside it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the calling thread is already updating this chain.
    pub fn begin_update(&self) -> Result<ChainUpdateGuard<'_>> {
        let me = current_thread_id();
        loop {
            match self
                .updating_thread
                .compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(owner) if owner == me => {
                    return Err(Error::InvalidState(
                        "Chain update started while updating".to_string(),
                    ))
                }
                Err(_) => spin_until(self.spin_yield_after, || !self.is_updating()),
            }
        }

        let own = self.depth();
        spin_until(self.spin_yield_after, || {
            self.active_calls.load(Ordering::SeqCst) <= own
        });
        Ok(ChainUpdateGuard { sync: self })
    }
}

/// An open call through a chain; leaves it when dropped.
#[derive(Debug)]
#[must_use = "the call leaves the chain when the guard is dropped"]
pub struct CallGuard<'a> {
    sync: &'a DetourSyncInfo,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.sync.adjust_depth(false);
        self.sync.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An update in progress; new calls are let in again when dropped.
#[derive(Debug)]
#[must_use = "the update ends when the guard is dropped"]
pub struct ChainUpdateGuard<'a> {
    sync: &'a DetourSyncInfo,
}

impl Drop for ChainUpdateGuard<'_> {
    fn drop(&mut self) {
        self.sync.updating_thread.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn calls_are_counted() {
        let sync = DetourSyncInfo::new(4);
        assert_eq!(sync.active_calls(), 0);

        let outer = sync.enter().unwrap();
        let inner = sync.enter().unwrap();
        assert_eq!(sync.active_calls(), 2);
        assert_eq!(sync.depth(), 2);

        drop(inner);
        drop(outer);
        assert_eq!(sync.active_calls(), 0);
        assert_eq!(sync.depth(), 0);
    }

    #[test]
    fn updater_cannot_call_into_its_chain() {
        let sync = DetourSyncInfo::new(4);
        let update = sync.begin_update().unwrap();
        assert!(sync.is_updating());
        assert!(matches!(sync.enter(), Err(Error::ChainUpdateReentry)));
        assert!(matches!(sync.begin_update(), Err(Error::InvalidState(_))));
        assert_eq!(sync.active_calls(), 0);

        drop(update);
        assert!(!sync.is_updating());
        assert!(sync.enter().is_ok());
    }

    #[test]
    fn update_inside_a_call_does_not_wait_for_itself() {
        let sync = DetourSyncInfo::new(4);
        let call = sync.enter().unwrap();
        let update = sync.begin_update().unwrap();
        drop(update);
        drop(call);
        assert_eq!(sync.active_calls(), 0);
    }

    #[test]
    fn update_waits_for_calls() {
        let sync = Arc::new(DetourSyncInfo::new(0));
        let call = sync.enter().unwrap();

        let updated = Arc::new(AtomicBool::new(false));
        let handle = {
            let sync = sync.clone();
            let updated = updated.clone();
            thread::spawn(move || {
                let _update = sync.begin_update().unwrap();
                updated.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!updated.load(Ordering::SeqCst));

        // Calls from a thread already inside go through while the update waits
        let nested = sync.enter().unwrap();
        drop(nested);

        drop(call);
        handle.join().unwrap();
        assert!(updated.load(Ordering::SeqCst));
        assert!(!sync.is_updating());
    }

    #[test]
    fn calls_wait_for_update() {
        let sync = Arc::new(DetourSyncInfo::new(0));
        let update = sync.begin_update().unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let handle = {
            let sync = sync.clone();
            let called = called.clone();
            thread::spawn(move || {
                let _call = sync.enter().unwrap();
                called.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!called.load(Ordering::SeqCst));

        drop(update);
        handle.join().unwrap();
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(sync.active_calls(), 0);
    }
}
