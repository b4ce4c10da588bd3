//! Error types for the cvd driver, and their mapping to exit codes.

use std::fmt;

use cvd_core::CoreError;
use cvd_instances::InstancesError;

/// Classification of every failure the driver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    BadRequest,
    BadSelector,
    BadName,
    BadInstanceName,
    BadGroup,
    BadInstances,
    BadHostArtifacts,
    BadTransition,
    NotFound,
    AmbiguousSelection,
    NoGroup,
    NoHandler,
    AmbiguousHandler,
    DuplicateGroupName,
    DuplicateHome,
    DuplicateId,
    LockBusy,
    LockIo,
    Timeout,
    CorruptDb,
    IoError,
    Cancelled,
    LauncherFailed,
}

impl ErrorKind {
    /// Upper-case name printed in front of failure messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::BadSelector => "BAD_SELECTOR",
            Self::BadName => "BAD_NAME",
            Self::BadInstanceName => "BAD_INSTANCE_NAME",
            Self::BadGroup => "BAD_GROUP",
            Self::BadInstances => "BAD_INSTANCES",
            Self::BadHostArtifacts => "BAD_HOST_ARTIFACTS",
            Self::BadTransition => "BAD_TRANSITION",
            Self::NotFound => "NOT_FOUND",
            Self::AmbiguousSelection => "AMBIGUOUS_SELECTION",
            Self::NoGroup => "NO_GROUP",
            Self::NoHandler => "NO_HANDLER",
            Self::AmbiguousHandler => "AMBIGUOUS_HANDLER",
            Self::DuplicateGroupName => "DUPLICATE_GROUP_NAME",
            Self::DuplicateHome => "DUPLICATE_HOME",
            Self::DuplicateId => "DUPLICATE_ID",
            Self::LockBusy => "LOCK_BUSY",
            Self::LockIo => "LOCK_IO",
            Self::Timeout => "TIMEOUT",
            Self::CorruptDb => "CORRUPT_DB",
            Self::IoError => "IO_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::LauncherFailed => "LAUNCHER_FAILED",
        }
    }

    /// Whether the failure was caused by the invocation itself rather than by
    /// the host's state.
    #[must_use]
    pub const fn is_usage_error(self) -> bool {
        matches!(
            self,
            Self::BadRequest
                | Self::BadSelector
                | Self::BadName
                | Self::BadInstanceName
                | Self::BadGroup
                | Self::BadInstances
                | Self::BadHostArtifacts
                | Self::NotFound
                | Self::AmbiguousSelection
                | Self::NoGroup
                | Self::NoHandler
                | Self::AmbiguousHandler
        )
    }

    /// Process exit code: 2 for usage and selection errors, 3 for storage and
    /// lock errors, 1 for everything else.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        if self.is_usage_error() {
            return 2;
        }
        match self {
            Self::CorruptDb | Self::IoError | Self::LockBusy | Self::LockIo | Self::Timeout => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the dispatcher, the sequencer and the handlers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CvdError {
    /// An error propagated from the database, lock or launcher layer.
    #[error(transparent)]
    Instances(#[from] InstancesError),

    /// The invocation is malformed.
    #[error("{0}")]
    BadRequest(String),

    /// A selector flag is unknown or has a bad value.
    #[error("{0}")]
    BadSelector(String),

    /// A selected instance name does not exist in the chosen group.
    #[error("group \"{group}\" has no instance named \"{name}\"")]
    BadInstanceName { group: String, name: String },

    /// The selection needs a group but the database is empty.
    #[error("no instance group exists")]
    NoGroup,

    /// The selection matches more than one candidate.
    #[error("{0}")]
    AmbiguousSelection(String),

    /// No registered handler claims the request.
    #[error("no handler for \"{subcommand}\"")]
    NoHandler { subcommand: String },

    /// More than one registered handler claims the request.
    #[error("{count} handlers claim \"{subcommand}\"")]
    AmbiguousHandler { subcommand: String, count: usize },

    /// Writing command output failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The user interrupted the command sequence.
    #[error("interrupted")]
    Cancelled,

    /// A failure with the message of the handler that raised it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CvdError>,
    },
}

impl From<CoreError> for CvdError {
    fn from(e: CoreError) -> Self {
        Self::Instances(InstancesError::Core(e))
    }
}

impl CvdError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// Prefix the message while keeping the kind.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context { context: context.into(), source: Box::new(self) }
    }

    /// The taxonomy kind of this failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Instances(e) => instances_kind(e),
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::BadSelector(_) => ErrorKind::BadSelector,
            Self::BadInstanceName { .. } => ErrorKind::BadInstanceName,
            Self::NoGroup => ErrorKind::NoGroup,
            Self::AmbiguousSelection(_) => ErrorKind::AmbiguousSelection,
            Self::NoHandler { .. } => ErrorKind::NoHandler,
            Self::AmbiguousHandler { .. } => ErrorKind::AmbiguousHandler,
            Self::Io { .. } => ErrorKind::IoError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

fn instances_kind(e: &InstancesError) -> ErrorKind {
    match e {
        InstancesError::Core(core) => match core {
            CoreError::InvalidName { .. } => ErrorKind::BadName,
            CoreError::InvalidGroup { .. } => ErrorKind::BadGroup,
            CoreError::InvalidInstances { .. } => ErrorKind::BadInstances,
            CoreError::MissingHostArtifacts { .. } => ErrorKind::BadHostArtifacts,
            CoreError::InvalidTransition { .. } => ErrorKind::BadTransition,
            CoreError::UnknownInstance { .. } => ErrorKind::NotFound,
            _ => ErrorKind::BadRequest,
        },
        InstancesError::DuplicateGroupName { .. } => ErrorKind::DuplicateGroupName,
        InstancesError::DuplicateHome { .. } => ErrorKind::DuplicateHome,
        InstancesError::DuplicateId { .. } => ErrorKind::DuplicateId,
        InstancesError::NotFound { .. } => ErrorKind::NotFound,
        InstancesError::Ambiguous { .. } => ErrorKind::AmbiguousSelection,
        InstancesError::InvalidQuery(_) => ErrorKind::BadRequest,
        InstancesError::CorruptDb { .. } => ErrorKind::CorruptDb,
        InstancesError::LockBusy { .. } | InstancesError::NoFreeInstanceId => ErrorKind::LockBusy,
        InstancesError::LockIo { .. } => ErrorKind::LockIo,
        InstancesError::Timeout { .. } => ErrorKind::Timeout,
        InstancesError::GroupActive { .. } | InstancesError::NotRunning { .. } => ErrorKind::BadTransition,
        InstancesError::LauncherFailed(_) => ErrorKind::LauncherFailed,
        InstancesError::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::IoError,
    }
}
