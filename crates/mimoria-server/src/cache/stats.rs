use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic cache statistics (§3 "Stats").
#[derive(Default)]
pub struct Stats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub expired_keys: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn expired_keys(&self) -> u64 {
        self.expired_keys.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)` rounded to two decimals, `0` when the
    /// denominator is zero.
    pub fn hit_ratio(&self) -> f32 {
        let hits = self.hits() as f64;
        let misses = self.misses() as f64;
        let total = hits + misses;
        if total == 0.0 {
            return 0.0;
        }
        (((hits / total) * 100.0).round() / 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_is_zero_with_no_samples() {
        let s = Stats::new();
        assert_eq!(s.hit_ratio(), 0.0);
    }

    #[test]
    fn hit_ratio_rounds_to_two_decimals() {
        let s = Stats::new();
        for _ in 0..2 {
            s.record_hit();
        }
        s.record_miss();
        // 2/3 = 0.6666... -> 0.67
        assert_eq!(s.hit_ratio(), 0.67);
    }
}
