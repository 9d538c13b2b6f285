//! Throughput accounting used for peer speed estimation and statistics.

/// Counts bytes (or any other unit) transferred in one second rounds and
/// keeps a smoothed per-second average across rounds.
///
/// The owner calls [`Counter::add`] as data flows and [`Counter::tick`] once
/// a second, which closes the current round and folds it into the running
/// average. The average is weighted towards recent rounds so that speed
/// changes show up quickly without the estimate jumping on a single burst.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counter {
    /// The total number of units recorded since creation.
    total: u64,
    /// The units recorded in the current (not yet closed) round.
    round: u64,
    /// The largest closed round so far.
    peak: u64,
    /// The smoothed per-second average across closed rounds.
    avg: f64,
}

/// The weight of history in the running average; a new round contributes
/// one part in `AVG_WINDOW`.
const AVG_WINDOW: f64 = 5.0;

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` units in the current round.
    pub fn add(&mut self, n: u64) {
        self.round += n;
        self.total += n;
    }

    /// Closes the current round, folding it into the running average, and
    /// returns the closed round's value.
    pub fn tick(&mut self) -> u64 {
        let round = self.round;
        self.avg = self.avg * ((AVG_WINDOW - 1.0) / AVG_WINDOW)
            + round as f64 / AVG_WINDOW;
        if round > self.peak {
            self.peak = round;
        }
        self.round = 0;
        round
    }

    /// The smoothed per-second rate.
    pub fn avg(&self) -> u64 {
        self.avg.round() as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    #[allow(dead_code)]
    pub fn peak(&self) -> u64 {
        self.peak
    }
}

/// The pair of counters every peer and torrent keeps for payload traffic.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounters {
    pub up: Counter,
    pub down: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.up.tick();
        self.down.tick();
    }
}
