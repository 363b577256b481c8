use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::HostError;

/// Identifier of one load cycle of script sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// The generation before any script has loaded
    pub const INITIAL: Generation = Generation(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Shared view of the current generation
///
/// Clones observe the same counter. Only the reload controller advances it.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Generation {
        Generation(self.current.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }

    /// Begin a new generation. Everything tagged with an older one is stale
    /// from this point on.
    pub(crate) fn advance(&self) -> Result<Generation, HostError> {
        let next = self
            .current
            .load(Ordering::SeqCst)
            .checked_add(1)
            .ok_or(HostError::GenerationExhausted)?;
        self.current.store(next, Ordering::SeqCst);
        Ok(Generation(next))
    }

    #[cfg(test)]
    pub(crate) fn starting_at(value: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(value)),
        }
    }
}
