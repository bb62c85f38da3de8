use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::{Error, Result};

/// Largest offset added to a base port.
pub const MAX_OFFSET: u16 = 2000;

/// Draws before giving up on a single allocation.
pub const MAX_DRAWS: u32 = 10_000;

/// One random draw, kept so a run's port choices can be audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDraw {
    pub owner: String,
    pub base: u16,
    pub port: u16,
    pub accepted: bool,
}

struct Inner {
    used: BTreeSet<u16>,
    rng: StdRng,
    draws: Vec<PortDraw>,
}

/// Deployment-wide set of host ports. No two allocations ever return the
/// same port.
///
/// Ports are drawn by rejection sampling from `base + 1..=base + 2000`, so
/// instance counts need not be known up front. All allocation goes through
/// one lock; the draw sequence is a pure function of the seed and the order
/// of calls.
pub struct PortRegistry {
    seed: u64,
    inner: Mutex<Inner>,
}

impl PortRegistry {
    pub fn new(seed: u64) -> Self {
        info!(seed, "port registry seeded");
        Self {
            seed,
            inner: Mutex::new(Inner {
                used: BTreeSet::new(),
                rng: StdRng::seed_from_u64(seed),
                draws: Vec::new(),
            }),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Mark a fixed port as taken, e.g. one published by an infra service.
    pub fn reserve(&self, port: u16) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.used.insert(port)
    }

    /// Draw a free port above `base` for `owner`.
    pub fn allocate(&self, base: u16, owner: &str) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        for _ in 0..MAX_DRAWS {
            let offset = inner.rng.random_range(1..=MAX_OFFSET);
            let Some(port) = base.checked_add(offset) else {
                continue;
            };

            let accepted = inner.used.insert(port);
            debug!(owner, base, port, accepted, "port draw");
            inner.draws.push(PortDraw {
                owner: owner.to_string(),
                base,
                port,
                accepted,
            });

            if accepted {
                return Ok(port);
            }
        }

        Err(Error::PortExhaustion {
            owner: owner.to_string(),
            base,
            draws: MAX_DRAWS,
        })
    }

    pub fn is_used(&self, port: u16) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.used.contains(&port)
    }

    /// Every taken port, ascending.
    pub fn allocated(&self) -> Vec<u16> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.used.iter().copied().collect()
    }

    /// The full draw log, rejected draws included.
    pub fn draws(&self) -> Vec<PortDraw> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.draws.clone()
    }
}
