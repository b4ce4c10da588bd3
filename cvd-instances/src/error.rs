//! Error types for the instances crate.

use std::path::PathBuf;
use std::time::Duration;

use cvd_core::{CoreError, InstanceState};

/// Errors raised by the database, the lock manager and launcher control.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InstancesError {
    /// A record failed validation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Another group already uses this name.
    #[error("a group named \"{name}\" already exists")]
    DuplicateGroupName { name: String },

    /// Another group already uses this home directory.
    #[error("home directory {} is already used by group \"{owner}\"", home.display())]
    DuplicateHome { home: PathBuf, owner: String },

    /// Another group already owns this instance id.
    #[error("instance id {id} is already used by group \"{owner}\"")]
    DuplicateId { id: u32, owner: String },

    /// A lookup matched nothing.
    #[error("no {what} matches {query}")]
    NotFound { what: &'static str, query: String },

    /// A lookup that must match exactly once matched several records.
    #[error("{count} {what}s match {query}, expected exactly one")]
    Ambiguous { what: &'static str, query: String, count: usize },

    /// A query that cannot be answered as asked.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The database file could not be parsed or failed validation.
    #[error("instance database {} is corrupt: {reason}", path.display())]
    CorruptDb { path: PathBuf, reason: String },

    /// Reading or writing the database file failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Another process holds the lock of this instance id.
    #[error("instance id {id} is locked by another process")]
    LockBusy { id: u32 },

    /// No instance id in the allocatable range could be locked.
    #[error("no free instance id left to allocate")]
    NoFreeInstanceId,

    /// A lock file could not be created, locked or removed.
    #[error("lock file {}: {source}", path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking operation did not complete in time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// A group with running instances cannot be removed.
    #[error("group \"{group}\" still has active instances")]
    GroupActive { group: String },

    /// An action that needs a running device was aimed at an idle one.
    #[error("device {device} is {state}, not RUNNING")]
    NotRunning { device: String, state: InstanceState },

    /// A host tool or the launcher monitor reported a failure.
    #[error("launcher failed: {0}")]
    LauncherFailed(String),

    /// The operation was interrupted by the user.
    #[error("operation cancelled")]
    Cancelled,
}

impl InstancesError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}
