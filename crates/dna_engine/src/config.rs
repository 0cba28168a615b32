//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for keys/ and db/ subdirectories.
    pub data_dir: PathBuf,
    /// Worker pool size.
    pub workers: usize,
    /// Deadline for DHT reads and writes (listens are unbounded).
    pub dht_timeout: Duration,
    /// Enable the in-memory diagnostic ring buffer.
    pub debug_ring: bool,
}

impl EngineConfig {
    /// Platform-appropriate default data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dna-messenger")
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Self::default() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            workers: 4,
            dht_timeout: Duration::from_secs(30),
            debug_ring: false,
        }
    }
}
