//! Adaptive connect timeouts derived from observed connect times.

use std::{collections::VecDeque, time::Duration};

use crate::conf::ConnectConf;

/// A sliding window over successful connect durations.
///
/// The timeout handed out is purely a function of the observed
/// distribution: two and a half times the 95th percentile, clamped to the
/// configured bounds. Peers that time out only bump a counter; their
/// (unknown) true connect time must not drag the percentile up.
pub(crate) struct ConnectTimes {
    conf: ConnectConf,
    samples: VecDeque<Duration>,
    timeout_count: u64,
}

impl ConnectTimes {
    pub fn new(conf: ConnectConf) -> Self {
        Self {
            samples: VecDeque::with_capacity(conf.sample_window),
            conf,
            timeout_count: 0,
        }
    }

    /// Records a successful connect's duration, evicting the oldest sample
    /// once the window is full.
    pub fn record_success(&mut self, duration: Duration) {
        if self.samples.len() == self.conf.sample_window {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    /// Records a timed out connect attempt.
    pub fn record_timeout(&mut self) {
        self.timeout_count += 1;
    }

    #[allow(dead_code)]
    pub fn timeout_count(&self) -> u64 {
        self.timeout_count
    }

    /// The timeout to apply to the next connect attempt.
    pub fn timeout(&self) -> Duration {
        if self.samples.len() < self.conf.min_sample_count {
            return self.conf.default_timeout;
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort();
        let p95_index = ((sorted.len() * 95) / 100).min(sorted.len() - 1);
        let p95_ms = sorted[p95_index].as_millis() as u64;

        let timeout = Duration::from_millis(p95_ms * 25 / 10);
        timeout.clamp(self.conf.min_timeout, self.conf.max_timeout)
    }
}
