use std::path::Path;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use sha2::{Digest, Sha256};
use shared::types::{Record, RecordKind};
use crate::store::KeyMeta;

pub struct RecordDb {
    conn: Connection,
}

impl RecordDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                kind       TEXT NOT NULL,
                name       TEXT NOT NULL,
                data       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, name)
            );

            CREATE TABLE IF NOT EXISTS profile_keys (
                profile    TEXT PRIMARY KEY,
                key_id     TEXT NOT NULL,
                generation INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or replace a record's data. `created_at` survives updates.
    pub fn put(&self, kind: RecordKind, name: &str, data: &serde_json::Value) -> Result<Record> {
        let now = Utc::now().to_rfc3339();
        let data_json = serde_json::to_string(data).context("Failed to serialize record data")?;

        self.conn
            .execute(
                r#"
                INSERT INTO records (kind, name, data, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(kind, name) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
                params![kind.as_str(), name, data_json, now],
            )
            .context("Failed to upsert record")?;

        self.get(kind, name)?
            .context("Record vanished right after upsert")
    }

    pub fn get(&self, kind: RecordKind, name: &str) -> Result<Option<Record>> {
        self.conn
            .query_row(
                "SELECT kind, name, data, created_at, updated_at
                 FROM records WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query record")
    }

    /// All records of one kind, ordered by name
    pub fn list(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT kind, name, data, created_at, updated_at
                 FROM records WHERE kind = ?1 ORDER BY name"
            )
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map([kind.as_str()], Self::row_to_record)
            .context("Failed to query records")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect records")?;

        Ok(records)
    }

    /// Returns true if a record was deleted. A deleted profile takes its key with it.
    pub fn delete(&self, kind: RecordKind, name: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction().context("Failed to begin transaction")?;

        let count = tx
            .execute(
                "DELETE FROM records WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
            )
            .context("Failed to delete record")?;
        if kind == RecordKind::Profile {
            tx.execute("DELETE FROM profile_keys WHERE profile = ?1", params![name])
                .context("Failed to delete profile key")?;
        }

        tx.commit().context("Failed to commit delete")?;
        Ok(count > 0)
    }

    pub fn key_meta(&self, profile: &str) -> Result<Option<KeyMeta>> {
        self.conn
            .query_row(
                "SELECT key_id, generation, created_at FROM profile_keys WHERE profile = ?1",
                params![profile],
                Self::row_to_key,
            )
            .optional()
            .context("Failed to query profile key")
    }

    /// Mint the next key generation for an existing profile in one transaction.
    /// Key state lives outside the record data, so client updates never touch it.
    pub fn rotate_key(&self, profile: &str) -> Result<KeyMeta> {
        let tx = self.conn.unchecked_transaction().context("Failed to begin transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM records WHERE kind = ?1 AND name = ?2",
                params![RecordKind::Profile.as_str(), profile],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to query profile")?
            .is_some();
        if !exists {
            bail!("Profile {} not found", profile);
        }

        let previous: Option<i64> = tx
            .query_row(
                "SELECT generation FROM profile_keys WHERE profile = ?1",
                params![profile],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query profile key")?;
        let generation = previous.map_or(1, |g| g.saturating_add(1));

        let now = Utc::now();
        let meta = KeyMeta {
            key_id: mint_key_id(profile, generation, now),
            generation: u64::try_from(generation).context("Key generation out of range")?,
            created_at: now,
        };

        tx.execute(
            r#"
            INSERT INTO profile_keys (profile, key_id, generation, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(profile) DO UPDATE SET
                key_id = excluded.key_id,
                generation = excluded.generation,
                created_at = excluded.created_at
            "#,
            params![profile, meta.key_id, generation, now.to_rfc3339()],
        )
        .context("Failed to store profile key")?;

        tx.commit().context("Failed to commit key rotation")?;
        Ok(meta)
    }

    fn row_to_key(row: &rusqlite::Row) -> Result<KeyMeta, rusqlite::Error> {
        let generation: i64 = row.get(1)?;
        let created_str: String = row.get(2)?;

        Ok(KeyMeta {
            key_id: row.get(0)?,
            generation: u64::try_from(generation).map_err(|e| conversion_error(1, Box::new(e)))?,
            created_at: parse_timestamp(2, &created_str)?,
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<Record, rusqlite::Error> {
        let kind_str: String = row.get(0)?;
        let data_json: String = row.get(2)?;
        let created_str: String = row.get(3)?;
        let updated_str: String = row.get(4)?;

        let kind = kind_str
            .parse::<RecordKind>()
            .map_err(|e| conversion_error(0, e.into()))?;

        let data = serde_json::from_str(&data_json)
            .map_err(|e| conversion_error(2, Box::new(e)))?;

        Ok(Record {
            kind,
            name: row.get(1)?,
            data,
            created_at: parse_timestamp(3, &created_str)?,
            updated_at: parse_timestamp(4, &updated_str)?,
        })
    }
}

fn mint_key_id(profile: &str, generation: i64, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(profile.as_bytes());
    hasher.update(generation.to_be_bytes());
    hasher.update(at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_timestamp(col: usize, s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(col, Box::new(e)))
}

fn conversion_error(col: usize, e: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, e)
}
