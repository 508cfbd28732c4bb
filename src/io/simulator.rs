//! Simulated reader for demos and tests without hardware
//!
//! Every cycle independently keeps each tag of a fixed pool with a high
//! probability, so tags flicker between active and missing without any
//! network I/O.

use crate::domain::types::TagId;
use crate::io::reader::{ReaderError, ReaderLink};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of synthetic tags in the pool
pub const SIMULATED_POOL_SIZE: u16 = 14;

/// Chance that a pool tag shows up in any given cycle
pub const RETENTION_PROBABILITY: f64 = 0.9;

/// `E20010000001` .. `E2001000000E`
pub fn simulated_pool() -> Vec<TagId> {
    (1..=SIMULATED_POOL_SIZE).map(|i| TagId(format!("E2001000{i:04X}"))).collect()
}

pub struct SimulatedReader {
    pool: Vec<TagId>,
    retention: f64,
    rng: StdRng,
}

impl SimulatedReader {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic sequence for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self { pool: simulated_pool(), retention: RETENTION_PROBABILITY, rng }
    }

    pub fn pool(&self) -> &[TagId] {
        &self.pool
    }

    /// Draw one cycle
    pub fn sample(&mut self) -> Vec<TagId> {
        let retention = self.retention;
        let rng = &mut self.rng;
        self.pool.iter().filter(|_| rng.gen_bool(retention)).cloned().collect()
    }
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReaderLink for SimulatedReader {
    async fn connect(&mut self) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<Vec<TagId>, ReaderError> {
        Ok(self.sample())
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}
