//! Sliding-window transfer rate

use std::collections::VecDeque;
use std::time::Instant;

/// Rate over the last `window` progress samples
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    window: usize,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, at: Instant, downloaded: u64) {
        self.samples.push_back((at, downloaded));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the window, 0 until two samples exist
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = last.0.saturating_duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (last.1.saturating_sub(first.1) as f64 / elapsed) as u64
    }

    /// Milliseconds left, `-1` when the total or the rate is unknown
    pub fn eta_ms(&self, downloaded: u64, total: i64) -> i64 {
        let rate = self.bytes_per_sec();
        match u64::try_from(total) {
            Ok(total) if rate > 0 => {
                let remaining = total.saturating_sub(downloaded);
                (remaining.saturating_mul(1000) / rate) as i64
            }
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(10);
        assert_eq!(meter.bytes_per_sec(), 0);

        meter.record(start, 0);
        meter.record(start + Duration::from_secs(1), 1000);
        meter.record(start + Duration::from_secs(2), 2000);
        assert_eq!(meter.bytes_per_sec(), 1000);
        assert_eq!(meter.eta_ms(2000, 5000), 3000);
        assert_eq!(meter.eta_ms(2000, -1), -1);
    }

    #[test]
    fn test_old_samples_fall_out() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(2);
        // A slow start no longer counts once the window moves on
        meter.record(start, 0);
        meter.record(start + Duration::from_secs(10), 100);
        meter.record(start + Duration::from_secs(11), 1100);
        assert_eq!(meter.bytes_per_sec(), 1000);
    }
}
