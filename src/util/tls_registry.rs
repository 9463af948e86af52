use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::type_alias::TinyTid;

/// Upper bound on tiny thread ids handed out within one process.
pub(crate) const MAX_TINY_TIDS: usize = 256;

thread_local! {
    /// The calling thread's tiny thread id, if registered.
    static TINY_TID: Cell<Option<TinyTid>> = const { Cell::new(None) };
}

/// Hands out dense tiny thread ids to participating threads.
///
/// Ids are assigned exactly once per thread, are stable for the thread's
/// lifetime, and are never reused within a process.
pub(crate) struct TlsRegistry {
    /// The next tiny thread id to assign.
    next_tid: AtomicUsize,
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self {
            next_tid: AtomicUsize::new(0),
        }
    }

    /// Register the calling thread and assign it a tiny thread id.
    ///
    /// # Panics
    ///
    /// Panic if the calling thread is already registered, or if the process
    /// has exhausted [`MAX_TINY_TIDS`] ids.
    pub fn init(&self) {
        TINY_TID.with(|cell| {
            assert!(
                cell.get().is_none(),
                "thread already has a tiny thread id ({})",
                cell.get().unwrap()
            );
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            assert!(tid < MAX_TINY_TIDS, "tiny thread ids exhausted");
            cell.set(Some(tid));
        });
    }

    /// Register the calling thread if it does not have a tiny thread id yet.
    pub fn ensure_init(&self) {
        if TINY_TID.with(|cell| cell.get().is_none()) {
            self.init();
        }
    }

    /// Return the calling thread's tiny thread id.
    ///
    /// # Panics
    ///
    /// Panic if the calling thread never called [`TlsRegistry::init`].
    pub fn tid(&self) -> TinyTid {
        TINY_TID.with(|cell| cell.get()).expect("thread has no tiny thread id; call init first")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc};
    use std::thread;

    use super::*;

    #[test]
    fn dense_unique_tids() {
        const THREADS: usize = 16;

        let registry = Arc::new(TlsRegistry::new());
        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    registry.init();
                    tx.send(registry.tid()).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut tids: Vec<_> = rx.try_iter().collect();
        tids.sort_unstable();
        assert_eq!(tids, (0..THREADS).collect::<Vec<_>>());
    }

    #[test]
    fn double_init_panics() {
        let registry = TlsRegistry::new();
        thread::spawn(move || {
            registry.init();
            registry.init();
        })
        .join()
        .unwrap_err();
    }

    #[test]
    fn tid_before_init_panics() {
        let registry = TlsRegistry::new();
        thread::spawn(move || {
            let _ = registry.tid();
        })
        .join()
        .unwrap_err();
    }

    #[test]
    fn ensure_init_is_idempotent() {
        let registry = TlsRegistry::new();
        thread::spawn(move || {
            registry.ensure_init();
            let tid = registry.tid();
            registry.ensure_init();
            assert_eq!(registry.tid(), tid);
        })
        .join()
        .unwrap();
    }
}
