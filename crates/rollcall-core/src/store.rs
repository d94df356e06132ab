//! SQLite persistence for enrolled identities.
//!
//! Layout:
//! - `meta(key, value)` holds `schema_version`
//! - `identities(id, name, enrolled_at, updated_at)`
//! - `samples(identity_id, position, size, pixels)`; one canonical crop per row
//!
//! Reads name every column they use, so databases written by a newer schema
//! with extra columns still load.

use crate::types::DescriptorInput;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("cannot create store directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid schema version: {0}")]
    Schema(String),
    #[error("invalid timestamp for identity {id}: {value}")]
    Timestamp { id: String, value: String },
}

/// One identity as persisted: metadata plus its samples in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIdentity {
    pub id: String,
    pub name: String,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub samples: Vec<DescriptorInput>,
}

pub struct GalleryStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl GalleryStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self { conn, path: Some(path.to_path_buf()) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self { conn: Connection::open_in_memory()?, path: None };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS identities (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                enrolled_at TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS samples (
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                position    INTEGER NOT NULL,
                size        INTEGER NOT NULL,
                pixels      BLOB NOT NULL,
                PRIMARY KEY (identity_id, position)
            );",
        )?;

        match self.schema_version()? {
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                tracing::warn!(
                    found = v,
                    supported = SCHEMA_VERSION,
                    "gallery store written by a newer version; reading known columns only"
                );
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Recorded schema version, `None` for a fresh database.
    pub fn schema_version(&self) -> Result<Option<u32>, StoreError> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| r.get(0))
            .optional()?;
        value
            .map(|v| {
                let parsed = v.trim().parse::<u32>();
                parsed.map_err(|_| StoreError::Schema(v))
            })
            .transpose()
    }

    /// Load every identity. Samples whose size is not `canonical_size` are
    /// skipped with a warning; identities left without samples are dropped.
    pub fn load_all(&self, canonical_size: u32) -> Result<Vec<StoredIdentity>, StoreError> {
        let mut identity_stmt = self
            .conn
            .prepare("SELECT id, name, enrolled_at, updated_at FROM identities ORDER BY enrolled_at, id")?;
        let rows = identity_stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sample_stmt = self
            .conn
            .prepare("SELECT size, pixels FROM samples WHERE identity_id = ?1 ORDER BY position")?;

        let mut identities = Vec::with_capacity(rows.len());
        for (id, name, enrolled_at, updated_at) in rows {
            let (enrolled_at, updated_at) =
                match (parse_timestamp(&id, &enrolled_at), parse_timestamp(&id, &updated_at)) {
                    (Ok(enrolled_at), Ok(updated_at)) => (enrolled_at, updated_at),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!(id = %id, error = %e, "skipping identity with unreadable timestamp");
                        continue;
                    }
                };

            let stored = sample_stmt
                .query_map(params![id], |r| Ok((r.get::<_, u32>(0)?, r.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut samples = Vec::with_capacity(stored.len());
            for (size, pixels) in stored {
                if size != canonical_size {
                    tracing::warn!(id = %id, size, expected = canonical_size, "skipping sample with mismatched size");
                    continue;
                }
                match DescriptorInput::new(pixels, size) {
                    Some(input) => samples.push(input),
                    None => tracing::warn!(id = %id, "skipping truncated sample"),
                }
            }

            if samples.is_empty() {
                tracing::warn!(id = %id, "identity has no usable samples; ignoring");
                continue;
            }

            identities.push(StoredIdentity {
                enrolled_at,
                updated_at,
                id,
                name,
                samples,
            });
        }

        Ok(identities)
    }

    /// Replace one identity and all of its samples in a single transaction.
    pub fn save_identity(&mut self, identity: &StoredIdentity) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (id, name, enrolled_at, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
            params![
                identity.id,
                identity.name,
                identity.enrolled_at.to_rfc3339(),
                identity.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute("DELETE FROM samples WHERE identity_id = ?1", params![identity.id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO samples (identity_id, position, size, pixels) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, sample) in identity.samples.iter().enumerate() {
                insert.execute(params![identity.id, position as i64, sample.size, sample.pixels])?;
            }
        }
        tx.commit()?;

        tracing::debug!(id = %identity.id, samples = identity.samples.len(), "identity persisted");
        Ok(())
    }

    /// Remove an identity; returns whether it existed.
    pub fn delete_identity(&mut self, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM samples WHERE identity_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp { id: id.to_string(), value: value.to_string() })
}
