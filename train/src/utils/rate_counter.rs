use crate::common::*;

/// Accumulates batch and record counts and reports throughput at a fixed
/// interval.
#[derive(Debug)]
pub struct RateCounter {
    batches: f64,
    records: f64,
    instant: Instant,
    interval: Duration,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            batches: 0.0,
            records: 0.0,
            instant: Instant::now(),
            interval,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Counts one processed batch carrying `records` records.
    pub fn add(&mut self, records: usize) {
        self.batches += 1.0;
        self.records += records as f64;
    }

    /// Batches/s and records/s since the last report, at most once per
    /// interval. Reporting resets the counts.
    pub fn rates(&mut self) -> Option<(f64, f64)> {
        let elapsed = self.instant.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let rates = (self.batches / secs, self.records / secs);
        self.batches = 0.0;
        self.records = 0.0;
        self.instant = Instant::now();
        Some(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_rate_scales_with_batch_size() {
        let mut counter = RateCounter::new(Duration::from_millis(1));
        counter.add(8);
        counter.add(8);
        counter.add(8);
        std::thread::sleep(Duration::from_millis(5));

        let (batch_rate, record_rate) = counter.rates().unwrap();
        assert!(batch_rate > 0.0);
        assert!((record_rate / batch_rate - 8.0).abs() < 1e-9);
    }

    #[test]
    fn reporting_resets_the_counts() {
        let mut counter = RateCounter::new(Duration::from_millis(1));
        counter.add(4);
        std::thread::sleep(Duration::from_millis(5));
        counter.rates().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let (batch_rate, record_rate) = counter.rates().unwrap();
        assert_eq!(batch_rate, 0.0);
        assert_eq!(record_rate, 0.0);
    }

    #[test]
    fn no_report_before_the_interval_elapses() {
        let mut counter = RateCounter::new(Duration::from_secs(3600));
        counter.add(4);
        assert!(counter.rates().is_none());
    }
}
