//! The deterministic common coin.
//!
//! Every replica reseeds the coin with the same fixed seed when it acquires
//! a slot, so all replicas draw identical bit sequences for the same slot's
//! sequential phases. That shared randomness is what gives the binary
//! agreement its expected-constant-round termination regardless of message
//! timing. Replicas must run the same build for the streams to line up.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::Bit;

const COIN_SEED: u64 = 42;

pub struct CommonCoin {
    rng: StdRng,
}

impl CommonCoin {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(COIN_SEED),
        }
    }

    /// Restart the bit stream; called once per slot acquisition.
    pub fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(COIN_SEED);
    }

    pub fn flip(&mut self) -> Bit {
        if self.rng.gen_range(0..2u32) == 0 {
            Bit::Zero
        } else {
            Bit::One
        }
    }
}

impl Default for CommonCoin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_coins_flip_identical_sequences() {
        let mut a = CommonCoin::new();
        let mut b = CommonCoin::new();
        for _ in 0..64 {
            assert_eq!(a.flip(), b.flip());
        }
    }

    #[test]
    fn reseed_restarts_the_stream() {
        let mut coin = CommonCoin::new();
        let first: Vec<Bit> = (0..16).map(|_| coin.flip()).collect();
        coin.reseed();
        let second: Vec<Bit> = (0..16).map(|_| coin.flip()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn coin_is_not_constant() {
        let mut coin = CommonCoin::new();
        let bits: Vec<Bit> = (0..64).map(|_| coin.flip()).collect();
        assert!(bits.contains(&Bit::Zero));
        assert!(bits.contains(&Bit::One));
    }
}
