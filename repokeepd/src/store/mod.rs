pub mod db;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{Record, RecordKind};

/// Current key generation of a profile, stored apart from the profile's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMeta {
    pub key_id: String,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// Simple keyed get/list/put/delete over records. The service makes no
/// assumption about the engine behind it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, kind: RecordKind, name: &str) -> Result<Option<Record>>;

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>>;

    async fn put(&self, kind: RecordKind, name: &str, data: serde_json::Value) -> Result<Record>;

    /// Returns true if a record existed and was removed.
    async fn delete(&self, kind: RecordKind, name: &str) -> Result<bool>;

    async fn key_meta(&self, profile: &str) -> Result<Option<KeyMeta>>;

    /// Mint the next key generation for `profile` atomically.
    async fn rotate_key(&self, profile: &str) -> Result<KeyMeta>;
}
