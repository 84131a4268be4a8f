//! Reuse-eligibility threshold for first-usage hot blocks.
//!
//! The threshold moves with the recent cost of garbage collection: every GC
//! victim's valid-chunk count enters a sliding window, and each reuse check
//! compares the cheapest GC candidate against the window mean. Enough
//! consecutive cheap candidates raise the threshold (GC is the better deal, so
//! keep more first-usage blocks around), enough expensive ones lower it.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::Tuning;

/// Candidate counts seen by a reuse check. `None` marks an empty heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Candidates {
    pub first_best: Option<u32>,
    pub first_len: u32,
    pub second_best: Option<u32>,
    pub cold_best: Option<u32>,
}

#[derive(Debug)]
pub struct AdaptiveThreshold {
    window: VecDeque<u32>,
    threshold: u32,
    n_step_ups: u32,
    n_step_downs: u32,
    step_up: u32,
    step_down: u32,
    max_step_ups: u32,
    max_step_downs: u32,
    ceiling: u32,
    floor: u32,
    factor_num: u32,
    factor_den: u32,
}

impl AdaptiveThreshold {
    pub fn new(tuning: &Tuning) -> Self {
        AdaptiveThreshold {
            window: std::iter::repeat(0).take(tuning.adaptive_window_size).collect(),
            threshold: tuning.hot_first_accumulated,
            n_step_ups: 0,
            n_step_downs: 0,
            step_up: tuning.init_step_up,
            step_down: tuning.init_step_down,
            max_step_ups: tuning.max_step_ups,
            max_step_downs: tuning.max_step_downs,
            ceiling: tuning.threshold_ceiling,
            floor: tuning.threshold_floor,
            factor_num: tuning.second_hot_factor_num,
            factor_den: tuning.second_hot_factor_den,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Newest entry first.
    pub fn window(&self) -> impl Iterator<Item = u32> + '_ {
        self.window.iter().copied()
    }

    pub fn mean(&self) -> f64 {
        let sum: u64 = self.window.iter().map(|v| u64::from(*v)).sum();
        sum as f64 / self.window.len() as f64
    }

    /// Record the valid-chunk count of a freshly selected GC victim.
    pub fn record(&mut self, valid: u32) {
        self.window.pop_back();
        self.window.push_front(valid);
    }

    /// Second-usage count scaled by the configured factor.
    pub fn scaled_second(&self, second: u32) -> u64 {
        u64::from(second) * u64::from(self.factor_num) / u64::from(self.factor_den)
    }

    /// Adaptive reuse check. Updates the hysteresis counters as a side effect.
    pub fn should_reuse(&mut self, c: Candidates) -> bool {
        if c.first_best == Some(0) {
            return true;
        }

        let cold = c.cold_best.unwrap_or(u32::MAX);
        let second = c.second_best.unwrap_or(u32::MAX);
        let valid_min = if u64::from(cold) < self.scaled_second(second) { cold } else { second };

        let mean = self.mean();
        let valid_min = f64::from(valid_min);
        if valid_min < mean {
            self.n_step_downs = 0;
            self.n_step_ups += 1;
            if self.n_step_ups >= self.max_step_ups {
                self.n_step_ups = 0;
                if self.threshold < self.ceiling {
                    self.threshold += self.step_up;
                    debug!(threshold = self.threshold, mean, "reuse threshold stepped up");
                }
            }
        } else if valid_min > mean {
            self.n_step_ups = 0;
            self.n_step_downs += 1;
            if self.n_step_downs >= self.max_step_downs {
                self.n_step_downs = 0;
                if self.threshold > self.floor {
                    self.threshold = self.threshold.saturating_sub(self.step_down);
                    debug!(threshold = self.threshold, mean, "reuse threshold stepped down");
                }
            }
        }

        c.first_len > self.threshold
    }
}

/// Greedy reuse check: no state, compares the candidates directly.
///
/// `accept_empty` lets a fully invalid first-usage block through regardless
/// of how many first-usage blocks exist.
pub fn greedy_should_reuse(c: Candidates, accept_empty: bool) -> bool {
    if accept_empty && c.first_best == Some(0) {
        return true;
    }
    match c.first_best {
        Some(first) if c.first_len > 1 => {
            let valid_min = c.cold_best.unwrap_or(u32::MAX).min(c.second_best.unwrap_or(u32::MAX));
            first < valid_min
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> Tuning {
        Tuning {
            hot_first_accumulated: 6,
            max_step_ups: 2,
            max_step_downs: 2,
            threshold_ceiling: 8,
            threshold_floor: 5,
            adaptive_window_size: 4,
            ..Tuning::default()
        }
    }

    #[test]
    fn window_slides() {
        let mut a = AdaptiveThreshold::new(&tuning());
        assert_eq!(a.mean(), 0.0);
        for v in [4, 8, 12, 16, 20] {
            a.record(v);
        }
        assert_eq!(a.window().collect::<Vec<_>>(), vec![20, 16, 12, 8]);
        assert_eq!(a.mean(), 14.0);
    }

    #[test]
    fn empty_first_usage_block_is_always_reused() {
        let mut a = AdaptiveThreshold::new(&tuning());
        let c = Candidates { first_best: Some(0), first_len: 1, ..Candidates::default() };
        assert!(a.should_reuse(c));
    }

    #[test]
    fn threshold_steps_up_to_ceiling() {
        let mut a = AdaptiveThreshold::new(&tuning());
        for _ in 0..4 {
            a.record(100);
        }
        let cheap = Candidates {
            first_best: Some(10),
            first_len: 7,
            second_best: Some(20),
            cold_best: Some(30),
        };

        assert!(a.should_reuse(cheap));
        assert_eq!(a.threshold(), 6);
        // Second consecutive cheap check raises it to 7: 7 blocks no longer suffice.
        assert!(!a.should_reuse(cheap));
        assert_eq!(a.threshold(), 7);
        for _ in 0..10 {
            a.should_reuse(cheap);
        }
        assert_eq!(a.threshold(), 8);
    }

    #[test]
    fn threshold_steps_down_to_floor() {
        let mut a = AdaptiveThreshold::new(&tuning());
        let costly = Candidates {
            first_best: Some(10),
            first_len: 5,
            second_best: Some(200),
            cold_best: None,
        };
        assert!(!a.should_reuse(costly));
        assert!(!a.should_reuse(costly));
        assert_eq!(a.threshold(), 5);
        assert!(!a.should_reuse(costly));
        assert!(!a.should_reuse(costly));
        assert_eq!(a.threshold(), 5);

        let costly = Candidates { first_len: 6, ..costly };
        assert!(a.should_reuse(costly));
    }

    #[test]
    fn alternating_checks_reset_the_counters() {
        let mut a = AdaptiveThreshold::new(&tuning());
        for _ in 0..4 {
            a.record(50);
        }
        let cheap = Candidates { first_best: Some(3), first_len: 1, second_best: Some(10), cold_best: None };
        let costly = Candidates { second_best: Some(90), ..cheap };
        for _ in 0..6 {
            a.should_reuse(cheap);
            a.should_reuse(costly);
        }
        assert_eq!(a.threshold(), 6);
    }

    #[test]
    fn greedy_compares_against_best_gc_candidate() {
        let c = Candidates { first_best: Some(5), first_len: 2, second_best: Some(9), cold_best: Some(6) };
        assert!(greedy_should_reuse(c, false));

        let c = Candidates { cold_best: Some(5), ..c };
        assert!(!greedy_should_reuse(c, false));

        let lonely = Candidates { first_best: Some(0), first_len: 1, ..Candidates::default() };
        assert!(!greedy_should_reuse(lonely, false));
        assert!(greedy_should_reuse(lonely, true));
    }
}
