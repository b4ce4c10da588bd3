use crate::error::CoreError;
use crate::name::{check_instance_name, local_device_name};
use crate::state::InstanceState;

/// Smallest id an instance may carry.
pub const BASE_INSTANCE_ID: u32 = 1;

/// Number of instance ids available on one host.
pub const MAX_INSTANCES: u32 = 128;

/// Host adb port of the instance with id [`BASE_INSTANCE_ID`].
pub const BASE_ADB_PORT: u32 = 6520;

/// One virtual device inside a group.
///
/// An instance never exists on its own: it is created by
/// [`GroupBuilder`](crate::GroupBuilder) and mutated through its owning
/// [`Group`](crate::Group), which keeps names unique.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Instance {
    id: u32,
    name: String,
    state: InstanceState,
}

impl Instance {
    /// Create an instance in [`InstanceState::Unspecified`].
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if `name` is not a valid instance name.
    pub fn new(id: u32, name: impl Into<String>) -> Result<Self, CoreError> {
        Self::with_state(id, name, InstanceState::Unspecified)
    }

    /// Create an instance in an arbitrary state, as when reloading a database.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if `name` is not a valid instance name.
    pub fn with_state(
        id: u32,
        name: impl Into<String>,
        state: InstanceState,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        check_instance_name(&name)?;
        Ok(Self { id, name, state })
    }

    /// Database-wide unique id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Group-unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Whether the instance currently owns host resources.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Host port forwarded to the device's adb daemon.
    #[must_use]
    pub fn adb_port(&self) -> u32 {
        BASE_ADB_PORT + self.id.saturating_sub(BASE_INSTANCE_ID)
    }

    /// `<group>-<instance>` name of this device.
    #[must_use]
    pub fn device_name(&self, group_name: &str) -> String {
        local_device_name(group_name, &self.name)
    }

    /// Rename the instance. Uniqueness inside the group is checked by the group.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if `name` is not a valid instance name.
    pub(crate) fn set_name(&mut self, name: impl Into<String>) -> Result<(), CoreError> {
        let name = name.into();
        check_instance_name(&name)?;
        self.name = name;
        Ok(())
    }

    /// Move to `to` if the lifecycle allows it.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTransition`] for any transition not listed
    /// on [`InstanceState`].
    pub fn set_state(&mut self, to: InstanceState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition { id: self.id, from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}
