use crate::error::{Result, TrainError};
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A generated sample together with the source image it was produced from.
#[derive(Clone, Debug)]
pub struct ReplaySample<B: Backend> {
    pub input: Tensor<B, 4>,
    pub output: Tensor<B, 4>,
}

impl<B: Backend> ReplaySample<B> {
    pub fn batch_size(&self) -> usize {
        self.input.dims()[0]
    }
}

/// Bounded history of generator outputs mixed into the discriminator's fake stream.
///
/// Until the buffer is full every candidate is stored and returned as is.
/// Afterwards a candidate is swapped for a uniformly chosen stored entry with
/// probability `swap_probability`, otherwise it passes through untouched.
#[derive(Debug)]
pub struct ReplayBuffer<T> {
    entries: Vec<T>,
    capacity: usize,
    swap_probability: f64,
    rng: StdRng,
}

impl<T> ReplayBuffer<T> {
    pub fn new(capacity: usize, swap_probability: f64, seed: u64) -> Result<Self> {
        if !(0.0..=1.0).contains(&swap_probability) {
            return Err(TrainError::Configuration(format!(
                "replay swap probability must be in [0, 1], got {swap_probability}"
            )));
        }
        Ok(Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            swap_probability,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }
}

impl<T: Clone> ReplayBuffer<T> {
    /// Query a single candidate, returning either it or a stored entry.
    pub fn query(&mut self, candidate: T) -> T {
        if self.capacity == 0 {
            return candidate;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(candidate.clone());
            return candidate;
        }
        if self.rng.gen_bool(self.swap_probability) {
            let idx = self.rng.gen_range(0..self.entries.len());
            std::mem::replace(&mut self.entries[idx], candidate)
        } else {
            candidate
        }
    }
}

impl<B: Backend> ReplayBuffer<ReplaySample<B>> {
    /// Query every item of a batch independently and reassemble the mixed batch.
    pub fn query_batch(&mut self, candidate: ReplaySample<B>) -> ReplaySample<B> {
        if self.capacity == 0 {
            return candidate;
        }

        let batch_size = candidate.batch_size();
        let mut inputs = Vec::with_capacity(batch_size);
        let mut outputs = Vec::with_capacity(batch_size);
        for idx in 0..batch_size {
            let item = ReplaySample {
                input: candidate.input.clone().slice_dim(0, idx..idx + 1),
                output: candidate.output.clone().slice_dim(0, idx..idx + 1),
            };
            let chosen = self.query(item);
            inputs.push(chosen.input);
            outputs.push(chosen.output);
        }

        ReplaySample {
            input: Tensor::cat(inputs, 0),
            output: Tensor::cat(outputs, 0),
        }
    }
}
