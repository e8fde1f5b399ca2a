//! The set of currently healthy handles, with round-robin and random selection.

use crate::handle::same_handles;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Ordered, concurrency-safe list of live handles.
///
/// The membership is only ever swapped wholesale through [`LiveSet::replace`].
/// The cursor lives outside the lock so that [`LiveSet::next`] can advance it
/// on the shared path; every read normalizes it modulo the current length.
pub struct LiveSet<H> {
    members: RwLock<Vec<Arc<H>>>,
    cursor: AtomicUsize,
}

impl<H> LiveSet<H> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Create a set with initial members.
    pub fn with_members(members: Vec<Arc<H>>) -> Self {
        Self {
            members: RwLock::new(members),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// The handle at the cursor, without advancing it.
    pub fn current(&self) -> Option<Arc<H>> {
        let members = self.members.read();
        if members.is_empty() {
            return None;
        }
        let idx = self.cursor.load(Ordering::Acquire) % members.len();
        Some(members[idx].clone())
    }

    /// Advance the cursor and return the handle it lands on.
    pub fn next(&self) -> Option<Arc<H>> {
        let members = self.members.read();
        let len = members.len();
        if len == 0 {
            return None;
        }
        let prev = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);
        Some(members[(prev + 1) % len].clone())
    }

    /// A uniformly chosen member. Does not touch the cursor.
    pub fn random(&self) -> Option<Arc<H>> {
        let members = self.members.read();
        if members.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..members.len());
        Some(members[idx].clone())
    }

    /// Swap in a new membership.
    ///
    /// Returns `false` without taking the write lock when `members` holds the
    /// same handles, by identity and in the same order, as the current set.
    /// Comparison and swap happen under one lock acquisition. The cursor is
    /// left as is.
    pub fn replace(&self, members: Vec<Arc<H>>) -> bool {
        let current = self.members.upgradable_read();
        if same_handles(&current, &members) {
            return false;
        }
        *RwLockUpgradableReadGuard::upgrade(current) = members;
        true
    }

    /// Copy of the current membership.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.members.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}

impl<H> Default for LiveSet<H> {
    fn default() -> Self {
        Self::new()
    }
}
