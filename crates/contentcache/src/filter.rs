use parking_lot::Mutex;
use probabilistic_collections::bloom::BloomFilter;

const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Approximate set of paths recently observed as nonexistent.
///
/// Advisory only: membership means "probably missing, probe the filesystem
/// first". False positives cost one extra stat call; false negatives are
/// impossible. There is no removal; the filter starts empty on every process
/// start.
pub struct NegativeFilter {
    inner: Mutex<BloomFilter<String>>,
    capacity: usize,
}

impl NegativeFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BloomFilter::new(capacity, FALSE_POSITIVE_RATE)),
            capacity,
        }
    }

    /// Record a path observed as missing.
    pub fn insert(&self, path: &str) {
        self.inner.lock().insert(&path.to_string());
    }

    /// True if the path was probably recorded as missing.
    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().contains(&path.to_string())
    }

    /// Discard all recorded paths.
    pub fn clear(&self) {
        *self.inner.lock() = BloomFilter::new(self.capacity, FALSE_POSITIVE_RATE);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
