//! Dead-letter store backed by `sled`
//!
//! Each queue gets its own tree. Keys are prefixed with the dead-lettering
//! timestamp so iteration is chronological, which also drives TTL cleanup and
//! the per-queue cap.
//!
//! Configuration options supported:
//! - `ttl_seconds`: optional time-to-live for entries (older entries are
//!   purged on every store and load)
//! - `max_per_queue`: optional cap; when exceeded the oldest entries go first.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::warn;
use uuid::Uuid;

use crate::utils::error::StoreError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub message_id: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: i64,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_per_queue: Option<usize>,
}

fn tree_name(queue: &str) -> String {
    format!("dlq:{queue}")
}

impl DeadLetterStore {
    /// Open or create a sled database at `path` with the given retention policy.
    pub fn open(
        path: &str,
        ttl_seconds: Option<i64>,
        max_per_queue: Option<usize>,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_per_queue,
        })
    }

    /// Store a dead letter in its queue's tree, then enforce the TTL and the
    /// cap.
    pub fn store(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(letter)?;
        let tree = self.db.open_tree(tree_name(&letter.queue))?;

        let key = format!("{:020}_{}", letter.dead_lettered_at, Uuid::new_v4());
        tree.insert(key.as_bytes(), serialized)?;
        self.purge_expired(&tree)?;

        if let Some(max) = self.max_per_queue {
            let total = tree.len();
            if total > max {
                let excess = total - max;
                let keys_to_delete: Vec<_> = tree
                    .iter()
                    .take(excess)
                    .filter_map(|entry| entry.ok().map(|(k, _)| k))
                    .collect();

                for key in keys_to_delete {
                    if let Err(e) = tree.remove(key) {
                        warn!(queue = %letter.queue, error = %e, "failed to evict old dead letter");
                    }
                }
            }
        }

        Ok(())
    }

    /// Load dead letters for a queue, oldest first, honoring the TTL.
    pub fn load(&self, queue: &str) -> Result<Vec<DeadLetter>, StoreError> {
        let tree = self.db.open_tree(tree_name(queue))?;
        self.purge_expired(&tree)?;

        Ok(tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect())
    }

    pub fn count(&self, queue: &str) -> Result<usize, StoreError> {
        let tree = self.db.open_tree(tree_name(queue))?;
        self.purge_expired(&tree)?;
        Ok(tree.len())
    }

    /// Entries currently on disk for `queue`, expired or not.
    pub fn stored_len(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.db.open_tree(tree_name(queue))?.len())
    }

    fn purge_expired(&self, tree: &Tree) -> Result<(), StoreError> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry_time = Utc::now().timestamp_millis() - ttl * 1000;

        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key_bytes, _)| {
                let key_str = std::str::from_utf8(&key_bytes).ok()?;
                let (ts_str, _) = key_str.split_once('_')?;
                let ts = ts_str.parse::<i64>().ok()?;
                (ts < expiry_time).then_some(key_bytes)
            })
            .collect();

        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_per_queue", &self.max_per_queue)
            .finish()
    }
}
