//! Fixed-capacity rolling window for throughput and latency statistics.
//!
//! The window keeps the most recent `capacity` samples and evicts the oldest
//! on overflow, so statistics always describe the recent past only.

use std::collections::vec_deque::Iter;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A fixed-capacity window that evicts its oldest sample when full.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    /// # Panics
    /// Panics if capacity is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RollingWindow capacity must be greater than 0");
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> Iter<'_, T> {
        self.samples.iter()
    }

    pub fn newest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.samples.front()
    }
}

impl RollingWindow<Duration> {
    /// Mean of the samples, or `None` when the window is empty.
    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }
}

impl RollingWindow<Instant> {
    /// Events per second across the window, from the span between the oldest
    /// and newest timestamps. `None` until two events with distinct times have
    /// been seen.
    pub fn rate_per_second(&self) -> Option<f64> {
        let (first, last) = (self.oldest()?, self.newest()?);
        let span = last.duration_since(*first).as_secs_f64();
        if self.samples.len() < 2 || span <= 0.0 {
            return None;
        }
        Some((self.samples.len() - 1) as f64 / span)
    }
}

impl<T> Default for RollingWindow<T> {
    /// A window of 100 samples.
    fn default() -> Self {
        Self::new(100)
    }
}
