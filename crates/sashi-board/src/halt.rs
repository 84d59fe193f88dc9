//! Ledger halt detection.
//!
//! Tracks the wall-clock time of the last ledger tick. When the gap
//! exceeds the halt timeout the ledger counts as halted and destructive
//! lease actions are suspended. Once ticks resume, a grace window
//! proportional to the observed halt keeps the flag up a while longer;
//! a fresh halt cancels any pending grace.

use std::time::Duration;

use tracing::{info, warn};

/// Halt detector state. Times are unix seconds.
#[derive(Debug)]
pub struct HaltDetector {
    halt_timeout: u64,
    /// Grace fraction of the observed halt duration.
    threshold: f64,
    last_tick: Option<u64>,
    halted: bool,
    /// The last tick before the halt; the halt is measured from here.
    halt_started: u64,
    grace_until: Option<u64>,
}

impl HaltDetector {
    /// Detector with the given timeout and grace fraction.
    #[must_use]
    pub fn new(halt_timeout: Duration, threshold: f64) -> Self {
        Self {
            halt_timeout: halt_timeout.as_secs(),
            threshold,
            last_tick: None,
            halted: false,
            halt_started: 0,
            grace_until: None,
        }
    }

    /// Record a ledger tick at `now`.
    ///
    /// If a halt is in progress this starts the grace window: the flag
    /// stays up for `threshold × elapsed_halt` more seconds.
    pub fn on_tick(&mut self, now: u64) {
        if self.halted && self.grace_until.is_none() {
            let elapsed = now.saturating_sub(self.halt_started);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let grace = (self.threshold * elapsed as f64) as u64;
            self.grace_until = Some(now + grace);
            info!(elapsed, grace, "ledger ticks resumed, grace scheduled");
        }
        self.last_tick = Some(now);
    }

    /// Re-evaluate the halted flag at `now` and return it.
    pub fn check(&mut self, now: u64) -> bool {
        let Some(last_tick) = self.last_tick else {
            return self.halted;
        };
        let gap = now.saturating_sub(last_tick);

        if !self.halted {
            if gap > self.halt_timeout {
                warn!(gap, "ledger halt detected");
                self.halted = true;
                self.halt_started = last_tick;
                self.grace_until = None;
            }
            return self.halted;
        }

        if gap > self.halt_timeout {
            // Halted again while the grace window was pending.
            if self.grace_until.take().is_some() {
                warn!(gap, "ledger halted again, grace cancelled");
            }
            return true;
        }

        if let Some(grace_until) = self.grace_until {
            if now >= grace_until {
                info!("ledger halt cleared");
                self.halted = false;
                self.grace_until = None;
            }
        }
        self.halted
    }

    /// Current flag without re-evaluating.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> HaltDetector {
        HaltDetector::new(Duration::from_secs(60), 0.25)
    }

    #[test]
    fn steady_ticks_never_halt() {
        let mut halt = detector();
        for t in 0..300 {
            halt.on_tick(t);
            assert!(!halt.check(t));
        }
    }

    #[test]
    fn halt_grace_and_clear_timeline() {
        // Ticks at t=0..=59 then silence.
        let mut halt = detector();
        for t in 0..60 {
            halt.on_tick(t);
        }
        assert!(!halt.check(100)); // gap 41, under timeout
        assert!(halt.check(120)); // gap 61, halted

        // Ticks resume at t=240: elapsed halt 181s, grace 45s.
        halt.on_tick(240);
        assert!(halt.check(241));
        assert!(halt.check(284));
        assert!(!halt.check(286));
    }

    #[test]
    fn renewed_halt_cancels_grace() {
        let mut halt = detector();
        halt.on_tick(0);
        assert!(halt.check(100)); // halted, started at 0

        halt.on_tick(200); // grace = 50s, until 250
        assert!(halt.check(210));
        // Silence again: at t=261 the gap (61) exceeds the timeout and
        // cancels the pending grace even though it has lapsed.
        assert!(halt.check(261));
        // Ticks resume; a new grace runs from here.
        halt.on_tick(300);
        assert!(halt.check(301));
        assert!(!halt.check(400));
    }

    #[test]
    fn no_ticks_yet_means_no_halt() {
        let mut halt = detector();
        assert!(!halt.check(1_000_000));
    }
}
