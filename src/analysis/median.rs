// Rolling median used to steady tuner readouts

use std::collections::VecDeque;

/// Fixed-capacity window returning the median of its contents
#[derive(Debug, Clone)]
pub struct RollingMedian<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy + PartialOrd> RollingMedian<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a value, evicting the oldest when full, and return the median
    ///
    /// With an even count the upper middle value is returned.
    pub fn push(&mut self, value: T) -> T {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);

        let mut sorted: Vec<T> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted[sorted.len() / 2]
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
