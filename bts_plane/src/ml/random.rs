use std::{ops::Deref, sync::Arc, sync::Mutex};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

/// Serializable description of where randomness comes from.
///
/// `Default` draws from OS entropy and is different on every run, `Debug`
/// replays a fixed sequence for a given seed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RngStrategy {
    #[default]
    Default,

    Debug {
        seed: u32,
    },
}

impl RngStrategy {
    pub fn testable(seed: u32) -> Self {
        RngStrategy::Debug { seed }
    }

    pub fn from_seed(seed: Option<u32>) -> Self {
        match seed {
            Some(seed) => RngStrategy::Debug { seed },
            None => RngStrategy::Default,
        }
    }

    pub fn to_arc(&self) -> Arc<dyn RNG> {
        match self {
            RngStrategy::Default => Arc::new(EntropyRng::default()),
            RngStrategy::Debug { seed } => Arc::new(SeedableTestRng::new(*seed)),
        }
    }

    /// Returns `true` if the rng strategy is [`Debug`].
    ///
    /// [`Debug`]: RngStrategy::Debug
    #[must_use]
    pub fn is_debug(&self) -> bool {
        matches!(self, Self::Debug { .. })
    }
}

pub trait RNG: Send + Sync {
    fn rand(&self) -> NodeValue;
    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        let sampled = (self.rand() * (exclusive_max - min) as NodeValue) as usize + min;
        // rand() may return exactly 1.0 for the test rng
        sampled.min(exclusive_max.saturating_sub(1).max(min))
    }
}

pub struct EntropyRng(Mutex<StdRng>);

impl Default for EntropyRng {
    fn default() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }
}

impl RNG for EntropyRng {
    fn rand(&self) -> NodeValue {
        match self.0.lock() {
            Ok(mut rng) => rng.gen(),
            Err(poisoned) => poisoned.into_inner().gen(),
        }
    }
}

pub struct SeedableTestRng(Mutex<algo::mersenne_twister::MersenneTwister>);

impl SeedableTestRng {
    pub fn new(seed: u32) -> Self {
        Self(Mutex::new(algo::mersenne_twister::MersenneTwister::new(seed)))
    }
}

impl RNG for SeedableTestRng {
    fn rand(&self) -> NodeValue {
        let rand = match self.0.lock() {
            Ok(mut inner) => inner.rand(),
            Err(poisoned) => poisoned.into_inner().rand(),
        };
        (rand as f64 * algo::mersenne_twister::F64_MULTIPLIER) as NodeValue
    }
}

pub trait ShuffleRng {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>);
}

impl<T: Deref<Target = dyn RNG>> ShuffleRng for T {
    fn shuffle_vec<E>(&self, vec: &mut Vec<E>) {
        let len = vec.len();

        for i in 0..len {
            let j = self.rand_range(i, len);
            vec.swap(i, j);
        }
    }
}

pub fn rand_normal(mu: NodeValue, sigma: NodeValue, rng: &dyn RNG) -> NodeValue {
    use std::f64::consts::PI;
    // keep u1 away from zero so ln stays finite
    let u1 = rng.rand().max(NodeValue::EPSILON);
    let u2 = rng.rand();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI as NodeValue * u2).cos();
    mu + sigma * z0
}

mod algo {
    pub mod mersenne_twister {
        pub const F64_MULTIPLIER: f64 = 1.0 / u32::MAX as f64;

        pub struct MersenneTwister {
            state: [u32; 624],
            index: usize,
        }

        impl MersenneTwister {
            pub fn new(seed: u32) -> Self {
                let mut mt = Self {
                    state: [0; 624],
                    index: 624,
                };
                mt.state[0] = seed;
                for i in 1..624 {
                    let prev = mt.state[i - 1];
                    mt.state[i] = 0x6c078965_u32
                        .wrapping_mul(prev ^ (prev >> 30))
                        .wrapping_add(i as u32);
                }
                mt
            }

            pub fn rand(&mut self) -> u32 {
                if self.index >= 624 {
                    self.twist();
                }
                let mut y = self.state[self.index];
                y ^= y >> 11;
                y ^= (y << 7) & 0x9d2c_5680;
                y ^= (y << 15) & 0xefc6_0000;
                y ^= y >> 18;
                self.index += 1;
                y
            }

            fn twist(&mut self) {
                const MATRIX_A: u32 = 0x9908_b0df;
                const UPPER_MASK: u32 = 0x8000_0000;
                const LOWER_MASK: u32 = 0x7fff_ffff;
                for i in 0..624 {
                    let x = (self.state[i] & UPPER_MASK) + (self.state[(i + 1) % 624] & LOWER_MASK);
                    let mut x_a = x >> 1;
                    if x % 2 != 0 {
                        x_a ^= MATRIX_A;
                    }
                    self.state[i] = self.state[(i + 397) % 624] ^ x_a;
                }
                self.index = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_strategy_can_be_serialized_and_deserialized() {
        let src_rng = RngStrategy::testable(1234);
        let json = serde_json::to_string(&src_rng).unwrap();
        let rng_from_json: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(rng_from_json.is_debug());
        assert_eq!(rng_from_json, src_rng);

        let json = serde_json::to_string(&RngStrategy::Default).unwrap();
        let rng_from_json: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(!rng_from_json.is_debug());
    }

    #[test]
    fn seeded_rngs_replay_the_same_sequence() {
        let rng_1 = RngStrategy::testable(42).to_arc();
        let rng_2 = RngStrategy::testable(42).to_arc();

        let samples_1: Vec<_> = (0..16).map(|_| rng_1.rand_range(0, 1000)).collect();
        let samples_2: Vec<_> = (0..16).map(|_| rng_2.rand_range(0, 1000)).collect();
        assert_eq!(samples_1, samples_2);
    }

    #[test]
    fn seedable_test_rng_samples_uniformly() {
        let rng = SeedableTestRng::new(6);
        assert_rng(&rng);
    }

    #[test]
    fn entropy_rng_samples_uniformly() {
        let rng = EntropyRng::default();
        assert_rng(&rng);
    }

    #[test]
    fn shuffle_vec_is_a_permutation() {
        let rng = RngStrategy::testable(7).to_arc();
        let mut values: Vec<usize> = (0..50).collect();
        rng.shuffle_vec(&mut values);

        assert_ne!(values, (0..50).collect::<Vec<_>>());
        values.sort();
        assert_eq!(values, (0..50).collect::<Vec<_>>());
    }

    fn assert_rng(rng: &dyn RNG) {
        let mut buckets = vec![0; 13];
        let span = 1.0 / buckets.len() as NodeValue;

        let iters = 10_000;
        for _ in 0..iters {
            let rand = rng.rand();
            let bucket_idx = ((rand / span) as usize).min(buckets.len() - 1);
            buckets[bucket_idx] += 1;
        }

        let min_expected = iters / (buckets.len() + 1).max((buckets.len() as f64 * 0.1) as usize);
        for (i, bucket) in buckets.iter().enumerate() {
            assert!(
                *bucket > min_expected,
                "bucket[{i}] distribution is not even {:?}",
                buckets
            )
        }
    }
}
