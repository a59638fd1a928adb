//! Random-walk quote generator.

use rand::rngs::StdRng;
use rand::Rng;

/// Half of the bid/ask spread, relative to the mid.
const HALF_SPREAD: f64 = 0.001;

/// Starting mid for a few well-known endpoints.
fn opening_mid(endpoint: &str) -> f64 {
    match endpoint {
        "USDTRY" => 34.25,
        "EURUSD" => 1.08,
        "GBPUSD" => 1.27,
        "USDJPY" => 151.5,
        "USDCHF" => 0.88,
        _ => 1.0,
    }
}

/// Mid price of one endpoint moving by a bounded relative step per tick.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    mid: f64,
    volatility: f64,
}

impl RandomWalk {
    pub fn new(endpoint: &str, volatility: f64) -> Self {
        Self {
            mid: opening_mid(endpoint),
            volatility,
        }
    }

    pub fn mid(&self) -> f64 {
        self.mid
    }

    /// Advance one tick and return `(bid, ask)`.
    pub fn step(&mut self, rng: &mut StdRng) -> (f64, f64) {
        if self.volatility > 0.0 {
            let change = rng.gen_range(-self.volatility..=self.volatility);
            self.mid *= 1.0 + change;
        }
        (
            self.mid * (1.0 - HALF_SPREAD),
            self.mid * (1.0 + HALF_SPREAD),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_step_stays_within_volatility() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut walk = RandomWalk::new("USDTRY", 0.001);

        let mut previous = walk.mid();
        for _ in 0..1000 {
            let (bid, ask) = walk.step(&mut rng);
            assert!(bid < ask);
            assert!((walk.mid() / previous - 1.0).abs() <= 0.001 + 1e-12);
            previous = walk.mid();
        }
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut a = RandomWalk::new("EURUSD", 0.01);
        let mut b = RandomWalk::new("EURUSD", 0.01);
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);

        for _ in 0..10 {
            assert_eq!(a.step(&mut rng_a), b.step(&mut rng_b));
        }
    }

    #[test]
    fn test_zero_volatility_is_flat() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut walk = RandomWalk::new("UNKNOWN", 0.0);
        assert_eq!(walk.step(&mut rng), walk.step(&mut rng));
        assert_eq!(walk.mid(), 1.0);
    }
}
