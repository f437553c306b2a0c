//! Part Streamer and External Part Storage (spec §4.5).
//!
//! Decides Internal vs External storage by size threshold, writes staging
//! files for External parts and registers their commit-time rename with
//! the open [`Transaction`], and validates Foreign part paths.

use std::path::{Path, PathBuf};

use pim_api::ItemId;
use pim_core::{Part, PartStorage};
use tokio::io::AsyncWriteExt;

use crate::errors::{EngineError, Result};
use crate::transaction::Transaction;

const SHARD_FACTOR: i64 = 16;

fn shard_dir(root: &Path, item_id: ItemId) -> PathBuf {
    root.join(format!("{:02x}", item_id.get().rem_euclid(SHARD_FACTOR)))
}

fn part_file_name(item_id: ItemId, revision: i64, part_name: &str) -> String {
    let sanitized = part_name.replace(['/', '\\'], "_");
    format!("{}_r{}_{}", item_id.get(), revision, sanitized)
}

pub struct PartStreamer {
    staging_dir: PathBuf,
    permanent_dir: PathBuf,
    internal_threshold: i64,
}

pub struct StoredPart {
    pub storage: PartStorage,
    pub data: Option<Vec<u8>>,
    pub external_ref: Option<String>,
}

impl PartStreamer {
    pub fn new(base_dir: impl Into<PathBuf>, internal_threshold: i64) -> Self {
        let base = base_dir.into();
        Self {
            staging_dir: base.join("staging"),
            permanent_dir: base.join("parts"),
            internal_threshold,
        }
    }

    /// Writes `bytes` either inline (Internal) or to a staging file
    /// (External), registering the commit-time rename on `tx` for the
    /// latter. Returns the row the caller should persist via
    /// `storage::repo::upsert_part`.
    pub async fn store(
        &self,
        tx: &mut Transaction,
        item_id: ItemId,
        revision: i64,
        part_name: &str,
        bytes: &[u8],
    ) -> Result<StoredPart> {
        if (bytes.len() as i64) <= self.internal_threshold {
            return Ok(StoredPart {
                storage: PartStorage::Internal,
                data: Some(bytes.to_vec()),
                external_ref: None,
            });
        }

        let file_name = part_file_name(item_id, revision, part_name);
        let staging_shard = shard_dir(&self.staging_dir, item_id);
        let permanent_shard = shard_dir(&self.permanent_dir, item_id);
        tokio::fs::create_dir_all(&staging_shard).await?;

        let staging_path = staging_shard.join(format!("{file_name}.staging"));
        let permanent_path = permanent_shard.join(&file_name);

        let mut file = tokio::fs::File::create(&staging_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        tx.stage_part_write(staging_path, permanent_path.clone());

        Ok(StoredPart {
            storage: PartStorage::External,
            data: None,
            external_ref: Some(permanent_path.to_string_lossy().into_owned()),
        })
    }

    /// Queues the on-disk files of any `External` parts in `parts` for
    /// removal at commit time (spec §4.5's two-phase protocol, applied to
    /// deletion rather than write). `Internal` parts have no file;
    /// `Foreign` parts point at caller-owned storage this engine never
    /// removes.
    pub fn delete_parts(&self, tx: &mut Transaction, parts: &[Part]) {
        for part in parts {
            if part.storage == PartStorage::External {
                if let Some(path) = &part.external_ref {
                    tx.stage_part_delete(PathBuf::from(path));
                }
            }
        }
    }

    /// Registers a Foreign part: the caller supplies the path, the
    /// streamer only verifies it is readable. Foreign files are never
    /// staged, renamed, or deleted by this engine.
    pub async fn foreign(&self, path: &str) -> Result<StoredPart> {
        tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::RetrievalFailed {
                reason: format!("foreign part {path} unreadable: {e}"),
            })?;
        Ok(StoredPart {
            storage: PartStorage::Foreign,
            data: None,
            external_ref: Some(path.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_chosen_as_internal() {
        let streamer = PartStreamer::new("/tmp/pim-test-parts", 1024);
        assert_eq!(streamer.internal_threshold, 1024);
    }

    #[test]
    fn part_file_name_sanitizes_separators() {
        assert_eq!(part_file_name(ItemId(7), 2, "PLD:A/B"), "7_r2_PLD:A_B");
    }
}
