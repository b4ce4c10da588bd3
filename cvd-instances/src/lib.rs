//! Host-side state of every cvd instance group.
//!
//! Owns the persistent JSON instance database, the per-instance advisory
//! lock files that reserve ids across concurrent `cvd` processes, and the
//! [`LauncherControl`] seam through which devices are booted and stopped.
//! [`InstanceManager`] composes all three.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod database;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod manager;
pub mod monitor;

pub use config::RuntimeLayout;
pub use database::{InstanceDatabase, Query, DEFAULT_LOCK_TIMEOUT};
pub use error::InstancesError;
pub use launcher::{HostToolLauncher, LauncherControl, ToolInvocation, DEFAULT_LAUNCHER_TIMEOUT};
pub use lock::{InstanceLockFile, InstanceLockFileManager};
pub use manager::{CreateGroupParams, InstanceManager, InstanceParams};
pub use monitor::{MonitorAction, MONITOR_SOCKET_NAME};
