//! Generation-batched returning channel for finished workers.

use std::sync::{Arc, Mutex};

/// Finished workers from many threads funnel through one queue; the consumer
/// drains a whole generation per mailbox hop instead of one item per hop.
///
/// `push` reports the generation number exactly when a drain needs to be
/// scheduled; items pushed before that drain runs join the same generation.
#[derive(Debug)]
pub struct RevBatcher<T> {
    inner: Arc<Mutex<State<T>>>,
}

#[derive(Debug)]
struct State<T> {
    items: Vec<T>,
    generation: u64,
    scheduled: bool,
}

impl<T> RevBatcher<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                items: Vec::new(),
                generation: 0,
                scheduled: false,
            })),
        }
    }

    /// Appends an item. Returns `Some(generation)` when the caller must
    /// schedule a drain for that generation.
    pub fn push(&self, item: T) -> Option<u64> {
        let mut state = self.lock();
        state.items.push(item);
        if state.scheduled {
            None
        } else {
            state.scheduled = true;
            Some(state.generation)
        }
    }

    /// Takes every item of `generation`. A stale generation yields nothing.
    pub fn pop(&self, generation: u64) -> Vec<T> {
        let mut state = self.lock();
        if state.generation != generation {
            return Vec::new();
        }
        state.generation += 1;
        state.scheduled = false;
        std::mem::take(&mut state.items)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.inner.lock().expect("rev batcher lock poisoned")
    }
}

impl<T> Clone for RevBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RevBatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_drain_is_scheduled_per_generation() {
        let batcher = RevBatcher::new();
        assert_eq!(batcher.push(1), Some(0));
        assert_eq!(batcher.push(2), None);
        assert_eq!(batcher.push(3), None);

        assert_eq!(batcher.pop(0), vec![1, 2, 3]);

        assert_eq!(batcher.push(4), Some(1));
        assert_eq!(batcher.pop(1), vec![4]);
    }

    #[test]
    fn stale_generations_drain_nothing() {
        let batcher = RevBatcher::new();
        batcher.push("a");
        assert_eq!(batcher.pop(0), vec!["a"]);
        assert!(batcher.pop(0).is_empty());
    }

    #[test]
    fn pushes_race_into_the_scheduled_generation() {
        let batcher = RevBatcher::new();
        let generation = batcher.push(1).unwrap();
        batcher.push(2);
        assert_eq!(batcher.pop(generation), vec![1, 2]);
    }
}
