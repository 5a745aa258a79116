//! Store-facing traits and the thread-safe adapter.

use std::sync::{Arc, Mutex};

use crate::core::{ParsedRev, RevError, StoreError};
use crate::proto::ChangeEntry;

/// What the pull pipeline needs from the local document store: the
/// missing-revision lookup used by the rev finder, and the transactional
/// insertion path used by the inserter.
pub trait PullStore: Send {
    /// For each announced change, whether the local store is missing it and
    /// the puller should request the revision. The result has the same
    /// length as `changes`.
    fn missing_revs(&mut self, changes: &[ChangeEntry]) -> Result<Vec<bool>, StoreError>;

    fn begin_insert(&mut self) -> Result<(), StoreError>;

    fn insert_revision(&mut self, rev: &ParsedRev) -> Result<(), RevError>;

    fn commit_insert(&mut self) -> Result<(), StoreError>;
}

/// Clonable adapter so the rev-finder and inserter threads share one store.
#[derive(Debug)]
pub struct SharedPullStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> SharedPullStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn from_arc(inner: Arc<Mutex<S>>) -> Self {
        Self { inner }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, S> {
        self.inner.lock().expect("pull store lock poisoned")
    }
}

impl<S> Clone for SharedPullStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PullStore> PullStore for SharedPullStore<S> {
    fn missing_revs(&mut self, changes: &[ChangeEntry]) -> Result<Vec<bool>, StoreError> {
        self.lock().missing_revs(changes)
    }

    fn begin_insert(&mut self) -> Result<(), StoreError> {
        self.lock().begin_insert()
    }

    fn insert_revision(&mut self, rev: &ParsedRev) -> Result<(), RevError> {
        self.lock().insert_revision(rev)
    }

    fn commit_insert(&mut self) -> Result<(), StoreError> {
        self.lock().commit_insert()
    }
}
