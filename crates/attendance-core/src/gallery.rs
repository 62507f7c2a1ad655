//! Storage seam for identities and attendance events.

use crate::types::{AttendanceEvent, AttendanceRecord, Embedding, Identity, IdentityId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Persistent gallery of enrolled identities plus the attendance log.
///
/// Implementations own all persisted state; callers only ever see
/// snapshots.
pub trait Gallery {
    /// Append a new identity and return its store-assigned id.
    fn add_identity(&self, name: &str, embedding: &Embedding) -> Result<IdentityId, StorageError>;

    /// Every enrolled identity. Order is stable but carries no meaning.
    fn list_identities(&self) -> Result<Vec<Identity>, StorageError>;

    /// Append an attendance event stamped with the current instant.
    ///
    /// Fails with [`StorageError::UnknownIdentity`] if `identity_id` is not
    /// enrolled.
    fn record_attendance(&self, identity_id: IdentityId) -> Result<AttendanceEvent, StorageError>;

    /// Attendance timestamps for every identity called `name`, most recent first.
    fn get_events_by_name(&self, name: &str) -> Result<Vec<DateTime<Utc>>, StorageError>;

    /// Attendance records of one identity, most recent first.
    fn get_events_by_id(&self, identity_id: IdentityId) -> Result<Vec<AttendanceRecord>, StorageError>;
}
