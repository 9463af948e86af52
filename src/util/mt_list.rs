use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::utils::CachePadded;

/// Multi-producer, single-consumer batch list with a coarse lock.
///
/// Producers `push` one item at a time; the single consumer takes the lock,
/// drains everything pushed so far, and releases. The size counter lives
/// outside the lock so idle consumers (event loops, background workers) can
/// probe it without contending.
pub(crate) struct MtList<T> {
    /// Item count, readable without the lock.
    size: CachePadded<AtomicUsize>,

    /// The items, value-owned until drained.
    list: Mutex<Vec<T>>,
}

impl<T> MtList<T> {
    pub fn new() -> Self {
        Self {
            size: CachePadded::new(AtomicUsize::new(0)),
            list: Mutex::new(Vec::new()),
        }
    }

    /// Append an item. Blocks briefly if the consumer holds the lock.
    pub fn push(&self, item: T) {
        let mut list = self.list.lock().unwrap();
        list.push(item);
        self.size.fetch_add(1, Ordering::Release);
    }

    /// Read the size without taking the lock.
    ///
    /// May be stale, but is monotonic with respect to completed pushes: once
    /// a push has returned, a later probe sees at least that item counted.
    #[inline]
    pub fn size_relaxed(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Enter the consumer critical section.
    pub fn lock(&self) -> MtListGuard<'_, T> {
        MtListGuard {
            list: self.list.lock().unwrap(),
            size: &self.size,
        }
    }
}

/// Consumer critical section over an [`MtList`].
///
/// Within the section the consumer observes exactly the items pushed before
/// the lock was acquired. Dropping the guard unlocks.
pub(crate) struct MtListGuard<'l, T> {
    list: MutexGuard<'l, Vec<T>>,
    size: &'l AtomicUsize,
}

impl<T> MtListGuard<'_, T> {
    /// Take every item, resetting the size to zero.
    pub fn take(&mut self) -> Vec<T> {
        self.size.store(0, Ordering::Release);
        mem::take(&mut self.list)
    }

    /// Drop every item, resetting the size to zero.
    pub fn clear(&mut self) {
        self.size.store(0, Ordering::Release);
        self.list.clear();
    }
}

impl<T> Deref for MtListGuard<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.list
    }
}

impl<T> DerefMut for MtListGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.list
    }
}
