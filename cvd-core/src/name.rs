//! Name validators and device-name composition.
//!
//! Group names match `[A-Za-z_][A-Za-z0-9_]*`. Instance names match
//! `[A-Za-z0-9_]([A-Za-z0-9_-]*[A-Za-z0-9_])?`. A device name is
//! `<group>-<instance>`; since group names never contain `-`, the first `-`
//! is always the split point.

use std::fmt;

use crate::error::CoreError;

/// Group name used when the user creates a group without naming it.
pub const DEFAULT_GROUP_NAME: &str = "cvd";

/// Prefix reserved for groups that `cvd` creates on its own behalf.
pub const INTERNAL_GROUP_NAME: &str = "cvd_internal";

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Returns `true` if `name` is a valid per-instance name.
#[must_use]
pub fn is_valid_instance_name(name: &str) -> bool {
    let (Some(first), Some(last)) = (name.chars().next(), name.chars().last()) else {
        return false;
    };
    is_word_char(first) && is_word_char(last) && name.chars().all(|c| is_word_char(c) || c == '-')
}

/// Returns `true` if `name` is a valid group name.
#[must_use]
pub fn is_valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => chars.all(is_word_char),
        _ => false,
    }
}

/// Returns `true` if `name` splits into a valid group and instance name.
#[must_use]
pub fn is_valid_device_name(name: &str) -> bool {
    break_device_name(name).is_ok()
}

/// A device name split into its group and instance halves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceName {
    /// Owning group name.
    pub group: String,
    /// Per-instance name inside the group.
    pub instance: String,
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.instance)
    }
}

/// Split `<group>-<instance>` into its halves.
///
/// # Errors
/// Returns [`CoreError::InvalidName`] if there is no separator or either half
/// fails its validator.
pub fn break_device_name(name: &str) -> Result<DeviceName, CoreError> {
    let invalid = || CoreError::InvalidName { what: "device", name: name.to_owned() };
    let (group, instance) = name.split_once('-').ok_or_else(invalid)?;
    if !is_valid_group_name(group) || !is_valid_instance_name(instance) {
        return Err(invalid());
    }
    Ok(DeviceName { group: group.to_owned(), instance: instance.to_owned() })
}

/// Compose a device name from its group and instance halves.
#[must_use]
pub fn local_device_name(group: &str, instance: &str) -> String {
    format!("{group}-{instance}")
}

/// Name given to an anonymous group created by the user.
#[must_use]
pub fn gen_default_group_name() -> String {
    DEFAULT_GROUP_NAME.to_owned()
}

/// Name given to a group created internally by `cvd` itself.
#[must_use]
pub fn gen_internal_group_name() -> String {
    INTERNAL_GROUP_NAME.to_owned()
}

/// Validate a group name.
///
/// # Errors
/// Returns [`CoreError::InvalidName`] if `name` is not a valid group name.
pub fn check_group_name(name: &str) -> Result<(), CoreError> {
    if is_valid_group_name(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidName { what: "group", name: name.to_owned() })
    }
}

/// Validate a per-instance name.
///
/// # Errors
/// Returns [`CoreError::InvalidName`] if `name` is not a valid instance name.
pub fn check_instance_name(name: &str) -> Result<(), CoreError> {
    if is_valid_instance_name(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidName { what: "instance", name: name.to_owned() })
    }
}
