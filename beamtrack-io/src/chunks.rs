//! Memory-budgeted chunk sizing for the reconstruction map phase.

use crate::Result;
use beamtrack_core::{DeviceFit, EventHits, Hit};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Working copies held per hit while a chunk is reconstructed
/// (candidate hits, fitted device entries, merge buffers).
const WORKING_COPIES: usize = 3;

/// How the chunk size is derived from available memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSizing {
    /// Fraction of available memory shared by all in-flight chunks.
    pub memory_fraction: f64,
    /// Explicit memory budget in bytes (overrides `memory_fraction`).
    pub memory_budget_bytes: Option<usize>,
    /// Smallest chunk handed out.
    pub min_chunk: usize,
    /// Largest chunk handed out.
    pub max_chunk: usize,
}

impl Default for ChunkSizing {
    fn default() -> Self {
        Self {
            memory_fraction: 0.25,
            memory_budget_bytes: None,
            min_chunk: 100,
            max_chunk: 100_000,
        }
    }
}

impl ChunkSizing {
    /// Set memory fraction used for the budget.
    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    /// Set an explicit memory budget in bytes.
    #[must_use]
    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    /// Resolve the memory budget in bytes.
    ///
    /// # Errors
    /// Returns an error if the memory fraction is invalid or system memory cannot be queried.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_budget_bytes(&self) -> Result<usize> {
        if let Some(bytes) = self.memory_budget_bytes {
            return Ok(bytes);
        }
        if !(0.0 < self.memory_fraction && self.memory_fraction <= 1.0) {
            return Err(beamtrack_core::Error::ConfigError(format!(
                "memory_fraction must be in (0.0, 1.0], got {}",
                self.memory_fraction
            ))
            .into());
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(beamtrack_core::Error::ConfigError(
                "available system memory reported as 0".to_string(),
            )
            .into());
        }
        let budget = (available as f64 * self.memory_fraction).floor() as u64;
        Ok(usize::try_from(budget).unwrap_or(usize::MAX))
    }

    /// Events per chunk so that `workers` chunks in flight fit the budget.
    ///
    /// # Errors
    /// Returns an error if the budget cannot be resolved or the chunk bounds
    /// are inverted.
    pub fn chunk_size(&self, events: &[EventHits], workers: usize) -> Result<usize> {
        if self.min_chunk == 0 || self.min_chunk > self.max_chunk {
            return Err(beamtrack_core::Error::ConfigError(format!(
                "invalid chunk bounds [{}, {}]",
                self.min_chunk, self.max_chunk
            ))
            .into());
        }
        let budget = self.resolve_budget_bytes()?;
        let per_event = bytes_per_event(events);
        let size = (budget / (workers.max(1) * per_event)).clamp(self.min_chunk, self.max_chunk);
        log::debug!(
            "chunk size {size} ({per_event} bytes per event, budget {budget} bytes, {workers} workers)"
        );
        Ok(size)
    }
}

/// Estimated working-set bytes of one event during reconstruction.
fn bytes_per_event(events: &[EventHits]) -> usize {
    let (hits, devices) = events.iter().fold((0usize, 0usize), |(h, d), e| {
        (h + e.total_hits(), d.max(e.device_count()))
    });
    let mean_hits = hits.div_ceil(events.len().max(1)).max(1);
    let per_hit = WORKING_COPIES * (std::mem::size_of::<Hit>() + std::mem::size_of::<DeviceFit>());
    std::mem::size_of::<EventHits>()
        + devices * std::mem::size_of::<Vec<Hit>>()
        + mean_hits * per_hit
}
