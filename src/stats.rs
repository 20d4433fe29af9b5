use log::debug;

/// Averages integer samples over a fixed sample period. The average only becomes visible once
/// a full period has been collected, which keeps early noisy samples out of the numbers.
#[derive(Debug, Clone)]
pub(crate) struct RollingAverage {
    period: usize,
    sum: i64,
    sample_count: usize,
    average: Option<i32>,
}

impl RollingAverage {
    pub(crate) fn new(period: usize) -> Self {
        Self {
            period,
            sum: 0,
            sample_count: 0,
            average: None,
        }
    }

    pub(crate) fn add(&mut self, sample: i32) {
        self.sum += i64::from(sample);
        self.sample_count += 1;
        if self.sample_count >= self.period {
            self.average = Some((self.sum / self.sample_count as i64) as i32);
            self.sum = 0;
            self.sample_count = 0;
        }
    }

    pub(crate) fn average(&self) -> Option<i32> {
        self.average
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0;
        self.sample_count = 0;
        self.average = None;
    }
}

/// Counts events against a caller-supplied millisecond clock and turns them into a rate once
/// per period window.
#[derive(Debug, Clone)]
pub(crate) struct RatePerSecond {
    last_calculation_ms: u64,
    period_ms: u64,
    accumulated: u32,
    rate: f32,
}

impl RatePerSecond {
    pub(crate) fn new(now_ms: u64, period_ms: u64) -> Self {
        Self {
            last_calculation_ms: now_ms,
            period_ms,
            accumulated: 0,
            rate: 0.0,
        }
    }

    pub(crate) fn add(&mut self, count: u32) {
        self.accumulated += count;
    }

    pub(crate) fn update(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_calculation_ms);
        if elapsed < self.period_ms {
            return;
        }
        self.rate = self.accumulated as f32 * 1000.0 / elapsed as f32;
        self.accumulated = 0;
        self.last_calculation_ms = now_ms;
    }

    #[cfg(test)]
    pub(crate) fn rate(&self) -> f32 {
        self.rate
    }

    pub(crate) fn reinit(&mut self, now_ms: u64) {
        self.last_calculation_ms = now_ms;
        self.accumulated = 0;
        self.rate = 0.0;
    }

    pub(crate) fn debug_output(&self, name: &str, unit: &str) {
        debug!("{}: {:.1} {}", name, self.rate, unit);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod stats_tests {
    use super::*;

    #[test]
    fn test_rolling_average_needs_full_period() {
        let mut stat = RollingAverage::new(4);
        stat.add(10);
        stat.add(20);
        assert_eq!(stat.average(), None);
        stat.add(30);
        stat.add(40);
        assert_eq!(stat.average(), Some(25));
    }

    #[test]
    fn test_rolling_average_keeps_last_value_between_periods() {
        let mut stat = RollingAverage::new(2);
        stat.add(4);
        stat.add(8);
        assert_eq!(stat.average(), Some(6));
        stat.add(100);
        // still mid-period, last completed average remains
        assert_eq!(stat.average(), Some(6));
    }

    #[test]
    fn test_rate_per_second() {
        let mut stat = RatePerSecond::new(0, 1000);
        stat.add(30);
        stat.update(500);
        assert_eq!(stat.rate(), 0.0); // window not over yet
        stat.add(30);
        stat.update(1000);
        assert!((stat.rate() - 60.0).abs() < f32::EPSILON);
    }
}
