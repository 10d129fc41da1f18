//! Run configuration file.

use crate::chunks::ChunkSizing;
use crate::Result;
use beamtrack_algorithms::{
    AlignmentConfig, CorrelationConfig, FinderConfig, FitConfig, PrealignmentConfig,
    ProcessingConfig,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Every stage configuration of a run, as stored in a JSON file.
///
/// Missing sections and fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Correlation stage.
    pub correlation: CorrelationConfig,
    /// Prealignment stage.
    pub prealignment: PrealignmentConfig,
    /// Track finding.
    pub finder: FinderConfig,
    /// Track fitting.
    pub fit: FitConfig,
    /// Map-phase processing.
    pub processing: ProcessingConfig,
    /// Alignment loop.
    pub alignment: AlignmentConfig,
    /// Derive the chunk size from a memory budget instead of `processing.chunk_size`.
    pub chunking: Option<ChunkSizing>,
}

impl RunConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or a section is invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first section error.
    pub fn validate(&self) -> Result<()> {
        self.correlation.validate()?;
        self.prealignment.validate()?;
        self.finder.validate()?;
        self.fit.validate()?;
        self.processing.validate()?;
        self.alignment.validate()?;
        Ok(())
    }
}
