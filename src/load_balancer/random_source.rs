//! Injectable randomness.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

/// Source of uniform indices.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `0..upper`. `upper` is never zero.
    fn next_index(&self, upper: usize) -> usize;
}

/// Thread-local RNG from `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_index(&self, upper: usize) -> usize {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Replays a fixed sequence, cycling when exhausted. Values are reduced
/// modulo `upper`.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<usize>,
    pending: Mutex<VecDeque<usize>>,
}

impl SequenceRandom {
    pub fn new(values: impl IntoIterator<Item = usize>) -> Self {
        let values: Vec<usize> = values.into_iter().collect();
        Self {
            pending: Mutex::new(values.iter().copied().collect()),
            values,
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_index(&self, upper: usize) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() {
            pending.extend(self.values.iter().copied());
        }
        pending.pop_front().unwrap_or(0) % upper
    }
}
