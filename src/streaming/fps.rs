//! Sliding-window production rate

use std::collections::VecDeque;

use parking_lot::Mutex;

pub const DEFAULT_WINDOW: usize = 30;

/// Keeps the last `capacity` production timestamps (seconds on any
/// monotonic origin) and derives the instantaneous rate from them.
pub struct FpsEstimator {
    window: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl FpsEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record one production timestamp, dropping the oldest when full
    pub fn record(&self, at_secs: f64) {
        let mut window = self.window.lock();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(at_secs);
    }

    /// `(count - 1) / (newest - oldest)`, or 0 with fewer than two samples
    pub fn rate(&self) -> f64 {
        let (count, oldest, newest) = {
            let window = self.window.lock();
            match (window.front(), window.back()) {
                (Some(&oldest), Some(&newest)) => (window.len(), oldest, newest),
                _ => return 0.0,
            }
        };

        let span = newest - oldest;
        if count < 2 || span <= 0.0 {
            return 0.0;
        }
        (count - 1) as f64 / span
    }

    pub fn len(&self) -> usize {
        self.window.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FpsEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
