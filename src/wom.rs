//! Opt-in failure injection for recycled-page programs.
//!
//! Reprogramming a low page only succeeds when the encoded bits can be
//! written over the old content. When enabled, a configurable share of
//! recycled flushes is declared failed and the staged chunks take the cold
//! log instead.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::WomFaultConfig;

pub struct WomFaults {
    rng: SmallRng,
    success_rate: f64,
}

impl WomFaults {
    pub fn new(config: WomFaultConfig) -> Self {
        WomFaults {
            rng: SmallRng::seed_from_u64(config.seed),
            success_rate: config.success_rate,
        }
    }

    /// Draw the outcome of the next recycled program.
    pub fn next_fails(&mut self) -> bool {
        self.rng.gen_range(0.0..100.0) >= self.success_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremes() {
        let mut never = WomFaults::new(WomFaultConfig { success_rate: 100.0, seed: 1 });
        let mut always = WomFaults::new(WomFaultConfig { success_rate: 0.0, seed: 1 });
        for _ in 0..1000 {
            assert!(!never.next_fails());
            assert!(always.next_fails());
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let config = WomFaultConfig { success_rate: 50.0, seed: 99 };
        let mut a = WomFaults::new(config);
        let mut b = WomFaults::new(config);
        let draws: Vec<bool> = (0..64).map(|_| a.next_fails()).collect();
        assert_eq!(draws, (0..64).map(|_| b.next_fails()).collect::<Vec<_>>());
        assert!(draws.iter().any(|f| *f) && draws.iter().any(|f| !*f));
    }
}
