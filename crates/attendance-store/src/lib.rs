//! SQLite gallery of enrolled identities and the attendance log.
//!
//! Every operation checks a connection out of an `r2d2` pool and hands it
//! back when the guard drops. Each pooled connection enforces foreign keys,
//! so attendance can only reference enrolled identities.

mod schema;

use attendance_core::{
    AttendanceEvent, AttendanceRecord, Embedding, EmployeeSummary, Gallery, Identity, IdentityId,
    StorageError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ffi, params};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use schema::SCHEMA_VERSION;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("identity {id} has a corrupt embedding: {len} bytes, expected {expected}")]
    CorruptEmbedding {
        id: IdentityId,
        len: usize,
        expected: usize,
    },
    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownIdentity(id) => StorageError::UnknownIdentity(id),
            StoreError::DimensionMismatch { expected, actual } => {
                StorageError::DimensionMismatch { expected, actual }
            }
            other => StorageError::Backend(Box::new(other)),
        }
    }
}

/// Row totals reported by `attendance status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub identities: i64,
    pub events: i64,
}

/// SQLite-backed [`Gallery`].
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct SqliteGallery {
    pool: Pool<SqliteConnectionManager>,
    dimension: usize,
}

impl SqliteGallery {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Tables are not touched until [`init`](Self::init) runs.
    pub fn open<P: AsRef<Path>>(path: P, dimension: usize, pool_size: u32) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        tracing::debug!(path = %path.display(), dimension, pool_size, "store: pool opened");
        Ok(Self { pool, dimension })
    }

    /// Create the tables and switch the journal to WAL. Idempotent.
    pub fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        schema::migrate(&conn)?;

        tracing::info!(journal_mode = %mode, "store: initialized");
        Ok(())
    }

    /// Embedding length every stored identity must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Enrolled employees, by id, without their embeddings.
    pub fn list_employees(&self) -> Result<Vec<EmployeeSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM identities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(EmployeeSummary {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let conn = self.conn()?;
        let (identities, events) = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM identities), (SELECT COUNT(*) FROM attendance)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreCounts { identities, events })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn insert_identity(&self, name: &str, embedding: &Embedding) -> Result<IdentityId, StoreError> {
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities (name, embedding) VALUES (?1, ?2)",
            params![name, embedding.to_le_bytes()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn load_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, embedding FROM identities ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, IdentityId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, blob)| {
                let embedding = Embedding::from_le_bytes(&blob, self.dimension).ok_or(
                    StoreError::CorruptEmbedding {
                        id,
                        len: blob.len(),
                        expected: self.dimension * 4,
                    },
                )?;
                Ok(Identity {
                    id,
                    name,
                    embedding,
                })
            })
            .collect()
    }

    fn insert_event(&self, identity_id: IdentityId) -> Result<AttendanceEvent, StoreError> {
        // Stored text and returned instant must agree, so round-trip the
        // millisecond rendering.
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let timestamp = parse_timestamp(&stamp)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO attendance (identity_id, timestamp) VALUES (?1, ?2)",
            params![identity_id, stamp],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                StoreError::UnknownIdentity(identity_id)
            }
            other => StoreError::Sqlite(other),
        })?;

        Ok(AttendanceEvent {
            id: conn.last_insert_rowid(),
            identity_id,
            timestamp,
        })
    }

    fn events_by_name(&self, name: &str) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.timestamp FROM attendance a
             JOIN identities i ON i.id = a.identity_id
             WHERE i.name = ?1
             ORDER BY a.timestamp DESC, a.id DESC",
        )?;
        let stamps = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        stamps.iter().map(|s| parse_timestamp(s)).collect()
    }

    fn events_by_id(&self, identity_id: IdentityId) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, i.name, a.timestamp FROM attendance a
             JOIN identities i ON i.id = a.identity_id
             WHERE a.identity_id = ?1
             ORDER BY a.timestamp DESC, a.id DESC",
        )?;
        let rows = stmt
            .query_map(params![identity_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_id, name, stamp)| {
                Ok(AttendanceRecord {
                    event_id,
                    name,
                    timestamp: parse_timestamp(&stamp)?,
                })
            })
            .collect()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}

fn surface<T>(operation: &'static str, result: Result<T, StoreError>) -> Result<T, StorageError> {
    result.map_err(|e| {
        tracing::warn!(operation, error = %e, "store: operation failed");
        e.into()
    })
}

impl Gallery for SqliteGallery {
    fn add_identity(&self, name: &str, embedding: &Embedding) -> Result<IdentityId, StorageError> {
        surface("add_identity", self.insert_identity(name, embedding))
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StorageError> {
        surface("list_identities", self.load_identities())
    }

    fn record_attendance(&self, identity_id: IdentityId) -> Result<AttendanceEvent, StorageError> {
        surface("record_attendance", self.insert_event(identity_id))
    }

    fn get_events_by_name(&self, name: &str) -> Result<Vec<DateTime<Utc>>, StorageError> {
        surface("get_events_by_name", self.events_by_name(name))
    }

    fn get_events_by_id(&self, identity_id: IdentityId) -> Result<Vec<AttendanceRecord>, StorageError> {
        surface("get_events_by_id", self.events_by_id(identity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_accepts_sql_default_format() {
        let t = parse_timestamp("2024-03-01T08:15:30.250Z").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 250);
        assert_eq!(
            t.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-03-01T08:15:30.250Z"
        );
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, StoreError::Timestamp { ref value, .. } if value == "yesterday"));
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            StorageError::from(StoreError::UnknownIdentity(7)),
            StorageError::UnknownIdentity(7)
        ));
        assert!(matches!(
            StorageError::from(StoreError::DimensionMismatch {
                expected: 512,
                actual: 3
            }),
            StorageError::DimensionMismatch {
                expected: 512,
                actual: 3
            }
        ));
        let backend = StorageError::from(StoreError::CorruptEmbedding {
            id: 1,
            len: 5,
            expected: 8,
        });
        assert!(backend.to_string().contains("corrupt embedding"));
    }
}
