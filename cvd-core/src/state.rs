use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single instance.
///
/// ```text
/// UNSPECIFIED -> PREPARING
/// PREPARING   -> PREPARE_FAILED | STARTING | CANCELLED
/// STARTING    -> RUNNING | BOOT_FAILED | CANCELLED
/// RUNNING     -> STOPPING | UNREACHABLE
/// UNREACHABLE -> RUNNING | STOPPING
/// STOPPING    -> STOPPED
/// STOPPED     -> PREPARING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum InstanceState {
    /// Registered in the database, never prepared.
    #[default]
    Unspecified,
    /// Disk images are being assembled.
    Preparing,
    /// Image assembly failed.
    PrepareFailed,
    /// The launcher is booting the device.
    Starting,
    /// Boot completed.
    Running,
    /// The device did not finish booting.
    BootFailed,
    /// A stop request is in flight.
    Stopping,
    /// The device is down.
    Stopped,
    /// The launcher monitor stopped answering.
    Unreachable,
    /// The user interrupted preparation or boot.
    Cancelled,
}

impl InstanceState {
    /// Every state, in declaration order.
    pub const ALL: [InstanceState; 10] = [
        Self::Unspecified,
        Self::Preparing,
        Self::PrepareFailed,
        Self::Starting,
        Self::Running,
        Self::BootFailed,
        Self::Stopping,
        Self::Stopped,
        Self::Unreachable,
        Self::Cancelled,
    ];

    /// Whether an instance in this state owns host resources and must hold
    /// its per-id lock.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Starting | Self::Stopping | Self::Preparing | Self::Unreachable
        )
    }

    /// Whether the state machine allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: InstanceState) -> bool {
        matches!(
            (self, to),
            (Self::Unspecified | Self::Stopped, Self::Preparing)
                | (Self::Preparing, Self::PrepareFailed | Self::Starting | Self::Cancelled)
                | (Self::Starting, Self::Running | Self::BootFailed | Self::Cancelled)
                | (Self::Running, Self::Stopping | Self::Unreachable)
                | (Self::Unreachable, Self::Running | Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }

    /// The canonical upper-case name, as persisted in the database file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Preparing => "PREPARING",
            Self::PrepareFailed => "PREPARE_FAILED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::BootFailed => "BOOT_FAILED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Unreachable => "UNREACHABLE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instance state \"{0}\"")]
pub struct ParseStateError(pub String);

impl FromStr for InstanceState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError(s.to_owned()))
    }
}
