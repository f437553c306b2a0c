//! Engine configuration, constructed programmatically by the embedder
//! (spec §6: "No CLI, environment variables, or daemonization semantics").

use std::path::PathBuf;

/// Where the database lives. `Memory` is used by tests and by the
/// in-process proptest suite.
#[derive(Clone, Debug)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub database: DatabaseLocation,
    /// Directory external parts are staged in before commit (spec §4.5).
    pub staging_dir: PathBuf,
    /// Parts at or above this size (bytes) are stored `External` rather
    /// than inline in the database row.
    pub external_part_threshold: i64,
    /// Child operations per intermediate commit during large sync jobs
    /// (spec §4.2, §4.7).
    pub sync_batch_size: usize,
    /// Item Sync batch size (spec §4.8: "production default ≈ 100").
    pub item_sync_batch_size: usize,
    /// Connection pool size for the storage backend.
    pub max_pool_size: usize,
    /// Default cache-policy check interval when a collection doesn't
    /// override it.
    pub default_check_interval_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            staging_dir: PathBuf::from("./staging"),
            external_part_threshold: 64 * 1024,
            sync_batch_size: 100,
            item_sync_batch_size: 100,
            max_pool_size: 10,
            default_check_interval_minutes: -1,
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }
}
