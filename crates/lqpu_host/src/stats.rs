//! Per-batch latency statistics.
//!
//! Each batch covers one band of rows: parameter update, submission,
//! completion and the copy out of the shared region. Tracks minimum,
//! maximum, average and a coarse distribution.

/// Width of one histogram bucket in nanoseconds (1 ms).
pub const BUCKET_NANOS: u64 = 1_000_000;

/// Number of histogram buckets. The last one collects everything slower.
pub const BUCKETS: usize = 20;

/// Accumulates batch latencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for BatchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStats {
    /// An empty tracker. `min` starts at `u64::MAX` so the first batch
    /// becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one batch that took `nanos` nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = ((nanos / BUCKET_NANOS) as usize).min(BUCKETS - 1);
        self.buckets[idx] += 1;
    }

    /// Average batch latency in nanoseconds, 0.0 before the first batch.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn print_report(&self) {
        println!("\nBatch Latency");
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }

        let avg_ns = self.avg();
        if avg_ns < 1_000_000.0 {
            println!("Min:   {:.2} us", self.min as f64 / 1000.0);
            println!("Avg:   {:.2} us", avg_ns / 1000.0);
            println!("Max:   {:.2} us", self.max as f64 / 1000.0);
        } else {
            println!("Min:   {:.2} ms", self.min as f64 / 1e6);
            println!("Avg:   {:.2} ms", avg_ns / 1e6);
            println!("Max:   {:.2} ms", self.max as f64 / 1e6);
        }

        println!("Distribution (1ms buckets):");
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let range_end = if i == BUCKETS - 1 { ">" } else { "" };
                println!("[{:3}-{:3}{} ms]: {}", i, i + 1, range_end, count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_extremes_and_average() {
        let mut stats = BatchStats::new();
        assert_eq!(stats.avg(), 0.0);
        for nanos in [3_000_000, 1_000_000, 2_000_000] {
            stats.update(nanos);
        }
        assert_eq!(stats.min, 1_000_000);
        assert_eq!(stats.max, 3_000_000);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg(), 2_000_000.0);
    }

    #[test]
    fn slow_batches_land_in_last_bucket() {
        let mut stats = BatchStats::new();
        stats.update(500);
        stats.update(5 * BUCKET_NANOS + 1);
        stats.update(u64::from(u32::MAX) * 1000);
        assert_eq!(stats.buckets[0], 1);
        assert_eq!(stats.buckets[5], 1);
        assert_eq!(stats.buckets[BUCKETS - 1], 1);
    }
}
