//! Core records for the cvd instance database.
//!
//! Defines the value types every other layer works with: name validators,
//! [`Instance`], [`Group`] with its validating [`GroupBuilder`], and the
//! [`InstanceState`] lifecycle machine. Nothing here touches the database
//! file or the per-instance locks.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod group;
pub mod instance;
pub mod name;
pub mod state;

pub use error::CoreError;
pub use group::{Group, GroupBuilder, LAUNCH_CVD_RELATIVE_PATH};
pub use instance::{Instance, BASE_ADB_PORT, BASE_INSTANCE_ID, MAX_INSTANCES};
pub use name::{
    break_device_name, check_group_name, check_instance_name, gen_default_group_name,
    gen_internal_group_name, is_valid_device_name, is_valid_group_name, is_valid_instance_name,
    local_device_name, DeviceName, DEFAULT_GROUP_NAME, INTERNAL_GROUP_NAME,
};
pub use state::{InstanceState, ParseStateError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_cover_the_configured_range() {
        let last = BASE_INSTANCE_ID + MAX_INSTANCES - 1;
        let ins = match Instance::new(last, "last") {
            Ok(i) => i,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(ins.adb_port(), BASE_ADB_PORT + MAX_INSTANCES - 1);
    }

    #[test]
    fn core_error_messages_name_the_offender() {
        let err = CoreError::InvalidTransition {
            id: 3,
            from: InstanceState::Stopped,
            to: InstanceState::Running,
        };
        assert_eq!(err.to_string(), "instance 3 cannot move from STOPPED to RUNNING");

        let err = CoreError::InvalidName { what: "group", name: "1x".to_owned() };
        assert_eq!(err.to_string(), "invalid group name \"1x\"");
    }
}
