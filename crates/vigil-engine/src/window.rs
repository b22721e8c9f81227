//! Fixed-capacity sliding window.

use std::collections::VecDeque;
use std::time::Duration;

/// Largest window the engine will keep for one (stream, rule) pair.
pub const MAX_WINDOW_CAPACITY: usize = 100_000;

/// FIFO ring buffer of the most recent entries for one (stream, rule) pair.
///
/// Eviction is strictly oldest-first and the length never exceeds the
/// capacity, including across [`TemporalWindow::resize`].
#[derive(Debug, Clone)]
pub struct TemporalWindow<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> TemporalWindow<T> {
    /// Create a window holding at most `capacity` entries (minimum 1).
    /// Storage grows as entries arrive.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Capacity for an analysis window sampled every `interval`:
    /// `ceil(window / interval)`, at least 1, clamped to [`MAX_WINDOW_CAPACITY`].
    pub fn capacity_for(window: Duration, interval: Duration) -> usize {
        Self::checked_capacity(window, interval).unwrap_or(MAX_WINDOW_CAPACITY)
    }

    /// Like [`capacity_for`](Self::capacity_for), but `None` when the window
    /// would exceed [`MAX_WINDOW_CAPACITY`].
    pub fn checked_capacity(window: Duration, interval: Duration) -> Option<usize> {
        if interval.is_zero() {
            return Some(1);
        }
        let ratio = window.as_secs_f64() / interval.as_secs_f64();
        // Guard against 300.0 / 2.0 landing on 150.00000000000003.
        let rounded = ratio.round();
        let capacity = if (ratio - rounded).abs() < 1e-9 {
            rounded
        } else {
            ratio.ceil()
        };
        (capacity.is_finite() && capacity <= MAX_WINDOW_CAPACITY as f64).then(|| (capacity as usize).max(1))
    }

    /// Append an entry, returning the evicted oldest entry if the window was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Change the capacity, evicting oldest entries if it shrinks.
    /// Returns the number of evicted entries.
    pub fn resize(&mut self, capacity: usize) -> usize {
        let capacity = capacity.max(1);
        self.capacity = capacity;
        let excess = self.entries.len().saturating_sub(capacity);
        self.entries.drain(..excess);
        excess
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Entries oldest-first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
