//! Atomic on-disk retry/backoff state, written via a write-to-temp-then-rename
//! pattern so a crash mid-write never leaves a half-written state file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write state file: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to rename temp file into place: {0}")]
    Rename(#[source] std::io::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TracerouteStateDoc {
    #[serde(rename = "lastSentAt")]
    pub last_sent_at: HashMap<String, i64>,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: HashMap<String, u32>,
    #[serde(rename = "backoffUntil")]
    pub backoff_until: HashMap<String, i64>,
    #[serde(rename = "savedAt")]
    pub saved_at: i64,
}

pub struct TraceroutePersistence {
    path: PathBuf,
}

impl TraceroutePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the state document, tolerating a missing or corrupt file by
    /// returning an empty document. Entries whose `backoffUntil` has
    /// elapsed are purged, along with their `consecutiveFailures` entry
    /// (an expired backoff means the node starts fresh).
    pub async fn load(&self, now_unix: i64) -> TracerouteStateDoc {
        let mut doc = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str::<TracerouteStateDoc>(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, path = %self.path.display(), "corrupt traceroute state file, starting fresh");
                    TracerouteStateDoc::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TracerouteStateDoc::default(),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to read traceroute state file, starting fresh");
                TracerouteStateDoc::default()
            }
        };

        let expired: Vec<String> = doc
            .backoff_until
            .iter()
            .filter(|(_, until)| **until <= now_unix)
            .map(|(node, _)| node.clone())
            .collect();
        for node in expired {
            doc.backoff_until.remove(&node);
            doc.consecutive_failures.remove(&node);
        }

        doc
    }

    /// Atomic write: serialize, write to a sibling temp file, then rename
    /// into place so readers never observe a partial file.
    pub async fn save(&self, doc: &TracerouteStateDoc) -> Result<(), PersistenceError> {
        let content = serde_json::to_string_pretty(doc).map_err(PersistenceError::Serialize)?;
        let temp_path = temp_path_for(&self.path);
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(PersistenceError::Write)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(PersistenceError::Rename)?;
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_returns_empty_doc() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = TraceroutePersistence::new(dir.path().join("state.json"));
        let doc = persistence.load(1000).await;
        assert!(doc.last_sent_at.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_returns_empty_doc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let persistence = TraceroutePersistence::new(path);
        let doc = persistence.load(1000).await;
        assert!(doc.last_sent_at.is_empty());
    }

    #[tokio::test]
    async fn round_trip_preserves_unexpired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = TraceroutePersistence::new(dir.path().join("state.json"));
        let mut doc = TracerouteStateDoc::default();
        doc.last_sent_at.insert("!abcd1234".into(), 500);
        doc.backoff_until.insert("!abcd1234".into(), 5000);
        doc.consecutive_failures.insert("!abcd1234".into(), 2);
        doc.saved_at = 500;

        persistence.save(&doc).await.unwrap();
        let loaded = persistence.load(1000).await;
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn load_purges_expired_backoff_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut doc = TracerouteStateDoc::default();
        doc.backoff_until.insert("!n".into(), 1000);
        doc.consecutive_failures.insert("!n".into(), 5);
        tokio::fs::write(&path, serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();

        let persistence = TraceroutePersistence::new(path.clone());
        let loaded = persistence.load(2000).await;
        assert!(loaded.backoff_until.is_empty());
        assert!(loaded.consecutive_failures.is_empty());

        // Saved file afterwards reflects the purge once the caller re-saves.
        persistence.save(&loaded).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!content.contains("\"!n\""));
    }
}
