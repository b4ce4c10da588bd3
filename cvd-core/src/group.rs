use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::instance::{Instance, BASE_INSTANCE_ID};
use crate::name::is_valid_group_name;
use crate::state::InstanceState;

/// Path of the launcher binary, relative to the host artifacts directory.
pub const LAUNCH_CVD_RELATIVE_PATH: &str = "bin/launch_cvd";

/// A named set of instances sharing one home directory and one set of host
/// artifacts.
///
/// Instances are owned by their group. Callers that need an instance together
/// with its group receive both values side by side, and updates always replace
/// the whole group.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Group {
    name: String,
    home_directory: PathBuf,
    host_artifacts_path: PathBuf,
    product_out_path: Option<PathBuf>,
    build_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    instances: Vec<Instance>,
}

impl Group {
    /// Start building a group named `name`.
    pub fn builder(name: impl Into<String>) -> GroupBuilder {
        GroupBuilder::new(name)
    }

    /// Group name, unique across the database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `HOME` directory of every process launched for this group.
    #[must_use]
    pub fn home_directory(&self) -> &Path {
        &self.home_directory
    }

    /// Directory holding `bin/launch_cvd` and the other host tools.
    #[must_use]
    pub fn host_artifacts_path(&self) -> &Path {
        &self.host_artifacts_path
    }

    /// Directory holding the guest images, if one was given.
    #[must_use]
    pub fn product_out_path(&self) -> Option<&Path> {
        self.product_out_path.as_deref()
    }

    /// Build the artifacts were fetched from, if known.
    #[must_use]
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    /// When the group last moved from idle to starting.
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Instances in insertion order.
    #[must_use]
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Ids of every instance, in insertion order.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances.iter().map(Instance::id).collect()
    }

    /// Look up an instance by its per-group name.
    #[must_use]
    pub fn find_instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name() == name)
    }

    /// Look up an instance by id.
    #[must_use]
    pub fn instance_by_id(&self, id: u32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id() == id)
    }

    /// Whether any instance is in an active state.
    #[must_use]
    pub fn has_active_instances(&self) -> bool {
        self.instances.iter().any(Instance::is_active)
    }

    /// Root of everything the launcher writes under the group's home.
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        self.home_directory.join("cuttlefish")
    }

    /// Runtime directory of one instance.
    #[must_use]
    pub fn instance_dir(&self, id: u32) -> PathBuf {
        self.base_dir().join("instances").join(format!("cvd-{id}"))
    }

    /// Path of a host tool inside the artifacts directory.
    #[must_use]
    pub fn host_tool(&self, bin: &str) -> PathBuf {
        self.host_artifacts_path.join("bin").join(bin)
    }

    /// Record the build the artifacts came from.
    pub fn set_build_id(&mut self, build_id: Option<String>) {
        self.build_id = build_id;
    }

    /// Transition one instance.
    ///
    /// Moving the first instance of a group that is not yet booting to
    /// [`InstanceState::Starting`] stamps the group's start time.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownInstance`] if `id` is not in the group, or
    /// [`CoreError::InvalidTransition`] if the state machine forbids the move.
    pub fn set_instance_state(&mut self, id: u32, to: InstanceState) -> Result<(), CoreError> {
        let was_idle = !self
            .instances
            .iter()
            .any(|i| i.id() != id && i.is_active() && i.state() != InstanceState::Preparing);
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or_else(|| CoreError::UnknownInstance { group: self.name.clone(), id })?;
        instance.set_state(to)?;
        if to == InstanceState::Starting && was_idle {
            self.start_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Transition every instance whose current state allows moving to `to`.
    ///
    /// Returns the ids that moved. Instances for which the move is not allowed
    /// are left untouched.
    ///
    /// # Errors
    /// Whatever [`set_instance_state`](Self::set_instance_state) reports for a
    /// movable instance.
    pub fn set_state_all(&mut self, to: InstanceState) -> Result<Vec<u32>, CoreError> {
        let movable: Vec<u32> = self
            .instances
            .iter()
            .filter(|i| i.state().can_transition_to(to))
            .map(Instance::id)
            .collect();
        for id in &movable {
            self.set_instance_state(*id, to)?;
        }
        Ok(movable)
    }

    /// Rename one instance, keeping names unique inside the group.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownInstance`] if `id` is not in the group,
    /// [`CoreError::InvalidName`] for a malformed name, or
    /// [`CoreError::InvalidInstances`] if another instance already uses it.
    pub fn rename_instance(&mut self, id: u32, name: &str) -> Result<(), CoreError> {
        if self.instances.iter().any(|i| i.id() != id && i.name() == name) {
            return Err(CoreError::InvalidInstances {
                group: self.name.clone(),
                reason: format!("instance name \"{name}\" is already taken"),
            });
        }
        let group = self.name.clone();
        self.instances
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or(CoreError::UnknownInstance { group, id })?
            .set_name(name)
    }

    /// Re-run every check [`GroupBuilder::build`] performs.
    ///
    /// # Errors
    /// See [`GroupBuilder::build`].
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_fields(
            &self.name,
            &self.home_directory,
            &self.host_artifacts_path,
            self.product_out_path.as_deref(),
        )?;
        check_host_artifacts(&self.host_artifacts_path)?;
        validate_instances(&self.name, &self.instances)
    }
}

/// Collects the fields of a [`Group`] and validates them in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct GroupBuilder {
    name: String,
    home_directory: Option<PathBuf>,
    host_artifacts_path: Option<PathBuf>,
    product_out_path: Option<PathBuf>,
    build_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    instances: Vec<(u32, String, InstanceState)>,
}

impl GroupBuilder {
    /// Start building a group named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Set the group's `HOME` directory.
    pub fn home_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.home_directory = Some(path.into());
        self
    }

    /// Set the host artifacts directory.
    pub fn host_artifacts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_artifacts_path = Some(path.into());
        self
    }

    /// Set the product out directory. An empty path means none.
    pub fn product_out_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.product_out_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    /// Set the build id.
    pub fn build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    /// Set the start time, as when reloading a database.
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Append an instance in [`InstanceState::Unspecified`].
    pub fn instance(self, id: u32, name: impl Into<String>) -> Self {
        self.instance_with_state(id, name, InstanceState::Unspecified)
    }

    /// Append an instance in an arbitrary state.
    pub fn instance_with_state(
        mut self,
        id: u32,
        name: impl Into<String>,
        state: InstanceState,
    ) -> Self {
        self.instances.push((id, name.into(), state));
        self
    }

    /// Validate and emit the group.
    ///
    /// # Errors
    /// - [`CoreError::InvalidGroup`] for a malformed group name or a missing
    ///   or relative directory.
    /// - [`CoreError::InvalidName`] for a malformed instance name.
    /// - [`CoreError::InvalidInstances`] for an empty list, an id below
    ///   [`BASE_INSTANCE_ID`], or a duplicate id or name.
    /// - [`CoreError::MissingHostArtifacts`] if `bin/launch_cvd` is absent.
    pub fn build(self) -> Result<Group, CoreError> {
        self.finish(true)
    }

    /// Like [`build`](Self::build), but without probing the host artifacts
    /// directory. Used when reloading groups that were validated when added.
    ///
    /// # Errors
    /// Same as [`build`](Self::build) minus
    /// [`CoreError::MissingHostArtifacts`].
    pub fn restore(self) -> Result<Group, CoreError> {
        self.finish(false)
    }

    fn finish(self, check_artifacts: bool) -> Result<Group, CoreError> {
        let invalid_group = |reason: &str| CoreError::InvalidGroup {
            group: self.name.clone(),
            reason: reason.to_owned(),
        };
        let home_directory = self
            .home_directory
            .clone()
            .ok_or_else(|| invalid_group("home directory is not set"))?;
        let host_artifacts_path = self
            .host_artifacts_path
            .clone()
            .ok_or_else(|| invalid_group("host artifacts path is not set"))?;
        validate_fields(
            &self.name,
            &home_directory,
            &host_artifacts_path,
            self.product_out_path.as_deref(),
        )?;
        if check_artifacts {
            check_host_artifacts(&host_artifacts_path)?;
        }

        let instances = self
            .instances
            .into_iter()
            .map(|(id, name, state)| Instance::with_state(id, name, state))
            .collect::<Result<Vec<_>, _>>()?;
        validate_instances(&self.name, &instances)?;

        Ok(Group {
            name: self.name,
            home_directory,
            host_artifacts_path,
            product_out_path: self.product_out_path,
            build_id: self.build_id,
            start_time: self.start_time,
            instances,
        })
    }
}

fn validate_fields(
    name: &str,
    home: &Path,
    host_artifacts: &Path,
    product_out: Option<&Path>,
) -> Result<(), CoreError> {
    let invalid_group = |reason: String| CoreError::InvalidGroup { group: name.to_owned(), reason };
    if !is_valid_group_name(name) {
        return Err(invalid_group(format!("\"{name}\" is not a valid group name")));
    }
    if !home.is_absolute() {
        return Err(invalid_group(format!("home directory {} is not absolute", home.display())));
    }
    if !host_artifacts.is_absolute() {
        return Err(invalid_group(format!(
            "host artifacts path {} is not absolute",
            host_artifacts.display()
        )));
    }
    if let Some(product) = product_out {
        if !product.is_absolute() {
            return Err(invalid_group(format!(
                "product out path {} is not absolute",
                product.display()
            )));
        }
    }
    Ok(())
}

fn check_host_artifacts(host_artifacts: &Path) -> Result<(), CoreError> {
    if host_artifacts.join(LAUNCH_CVD_RELATIVE_PATH).is_file() {
        Ok(())
    } else {
        Err(CoreError::MissingHostArtifacts { path: host_artifacts.to_owned() })
    }
}

fn validate_instances(group: &str, instances: &[Instance]) -> Result<(), CoreError> {
    let invalid = |reason: String| CoreError::InvalidInstances { group: group.to_owned(), reason };
    if instances.is_empty() {
        return Err(invalid("a group needs at least one instance".to_owned()));
    }
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for instance in instances {
        if instance.id() < BASE_INSTANCE_ID {
            return Err(invalid(format!("instance id {} is reserved", instance.id())));
        }
        if !ids.insert(instance.id()) {
            return Err(invalid(format!("duplicate instance id {}", instance.id())));
        }
        if !names.insert(instance.name()) {
            return Err(invalid(format!("duplicate instance name \"{}\"", instance.name())));
        }
    }
    Ok(())
}
