use std::path::PathBuf;

use crate::state::InstanceState;

/// Errors produced by the `cvd-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A group, instance or device name failed validation.
    #[error("invalid {what} name \"{name}\"")]
    InvalidName { what: &'static str, name: String },

    /// A group-level field failed validation.
    #[error("invalid group \"{group}\": {reason}")]
    InvalidGroup { group: String, reason: String },

    /// The instance list of a group is empty or has duplicate ids or names.
    #[error("invalid instances in group \"{group}\": {reason}")]
    InvalidInstances { group: String, reason: String },

    /// The host artifacts directory does not contain `bin/launch_cvd`.
    #[error("host artifacts directory {} does not contain bin/launch_cvd", path.display())]
    MissingHostArtifacts { path: PathBuf },

    /// A lifecycle transition that the state machine does not allow.
    #[error("instance {id} cannot move from {from} to {to}")]
    InvalidTransition { id: u32, from: InstanceState, to: InstanceState },

    /// No instance with the given id exists in the group.
    #[error("group \"{group}\" has no instance with id {id}")]
    UnknownInstance { group: String, id: u32 },
}
