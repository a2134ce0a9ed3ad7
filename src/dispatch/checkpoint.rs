//! Dispatch progress checkpoints, so an interrupted campaign can resume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Position of a dispatch within its recipient list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCursor {
    pub campaign_id: String,
    pub user_id: String,
    /// Index of the first recipient not yet processed
    pub next_index: usize,
    pub sent_count: u64,
    pub failed_count: u64,
    pub total_recipients: u64,
    pub updated_at: DateTime<Utc>,
}

/// Storage for dispatch cursors, keyed by campaign.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, campaign_id: &str) -> Result<Option<DispatchCursor>>;
    async fn save(&self, cursor: &DispatchCursor) -> Result<()>;
    async fn clear(&self, campaign_id: &str) -> Result<()>;
}

/// Cursors held in memory; survives cancellation but not a restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    cursors: RwLock<HashMap<String, DispatchCursor>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, campaign_id: &str) -> Result<Option<DispatchCursor>> {
        Ok(self.cursors.read().get(campaign_id).cloned())
    }

    async fn save(&self, cursor: &DispatchCursor) -> Result<()> {
        self.cursors
            .write()
            .insert(cursor.campaign_id.clone(), cursor.clone());
        Ok(())
    }

    async fn clear(&self, campaign_id: &str) -> Result<()> {
        self.cursors.write().remove(campaign_id);
        Ok(())
    }
}

/// One JSON file per campaign under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Use `dir` for checkpoints, creating it if needed.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// File holding the cursor for `campaign_id`.
    ///
    /// The id is hex encoded so any campaign id maps to a plain file name
    /// inside the checkpoint directory.
    pub(crate) fn path_for(&self, campaign_id: &str) -> PathBuf {
        let encoded: String = campaign_id
            .bytes()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.dir.join(format!("campaign-{}.json", encoded))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, campaign_id: &str) -> Result<Option<DispatchCursor>> {
        let path = self.path_for(campaign_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, cursor: &DispatchCursor) -> Result<()> {
        let path = self.path_for(&cursor.campaign_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(cursor)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), next_index = cursor.next_index, "Checkpoint saved");
        Ok(())
    }

    async fn clear(&self, campaign_id: &str) -> Result<()> {
        let path = self.path_for(campaign_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
