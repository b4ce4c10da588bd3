//! The instance manager ties the database, the lock files and the launcher
//! together. Every group-level operation a handler performs goes through it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cvd_core::{CoreError, Group, Instance, InstanceState};
use tracing::{info, warn};

use crate::config::RuntimeLayout;
use crate::database::{InstanceDatabase, Query};
use crate::launcher::{LauncherControl, ToolInvocation};
use crate::lock::{InstanceLockFile, InstanceLockFileManager};
use crate::monitor::MonitorAction;
use crate::InstancesError;

/// One requested instance of a new group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct InstanceParams {
    /// Fixed id; allocated when `None`.
    pub id: Option<u32>,
    /// Per-group name; the id's decimal form when `None`.
    pub name: Option<String>,
}

impl InstanceParams {
    /// An instance with an explicit id and/or name.
    #[must_use]
    pub fn new(id: Option<u32>, name: Option<String>) -> Self {
        Self { id, name }
    }
}

/// Everything needed to register a new group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CreateGroupParams {
    /// Group name; a unique `cvd_<n>` when `None`.
    pub group_name: Option<String>,
    /// Home directory; under the runtime directory when `None`.
    pub home: Option<PathBuf>,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: Option<PathBuf>,
    pub build_id: Option<String>,
    pub instances: Vec<InstanceParams>,
}

impl CreateGroupParams {
    /// A group of `instances` using the artifacts at `host_artifacts_path`.
    #[must_use]
    pub fn new(host_artifacts_path: impl Into<PathBuf>, instances: Vec<InstanceParams>) -> Self {
        Self { host_artifacts_path: host_artifacts_path.into(), instances, ..Self::default() }
    }
}

/// Group-level operations over the shared database and lock directory.
pub struct InstanceManager {
    layout: RuntimeLayout,
    database: InstanceDatabase,
    locks: InstanceLockFileManager,
    launcher: Box<dyn LauncherControl>,
    held: Mutex<BTreeMap<u32, InstanceLockFile>>,
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("layout", &self.layout)
            .field("database", &self.database)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl InstanceManager {
    /// Assemble a manager from its parts.
    #[must_use]
    pub fn new(
        layout: RuntimeLayout,
        database: InstanceDatabase,
        locks: InstanceLockFileManager,
        launcher: Box<dyn LauncherControl>,
    ) -> Self {
        Self { layout, database, locks, launcher, held: Mutex::new(BTreeMap::new()) }
    }

    /// A manager persisting under `layout`'s runtime directory.
    #[must_use]
    pub fn from_layout(layout: RuntimeLayout, lock_timeout: Duration, launcher: Box<dyn LauncherControl>) -> Self {
        let database = InstanceDatabase::open(layout.database_path(), lock_timeout);
        let locks = InstanceLockFileManager::new(layout.lock_dir());
        Self::new(layout, database, locks, launcher)
    }

    #[must_use]
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    #[must_use]
    pub fn database(&self) -> &InstanceDatabase {
        &self.database
    }

    #[must_use]
    pub fn locks(&self) -> &InstanceLockFileManager {
        &self.locks
    }

    #[must_use]
    pub fn launcher(&self) -> &dyn LauncherControl {
        self.launcher.as_ref()
    }

    /// Ids whose lock this manager currently holds.
    #[must_use]
    pub fn held_lock_ids(&self) -> Vec<u32> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }

    /// Lock every id in `ids` not already held. On failure nothing new is kept.
    fn hold(&self, ids: &[u32]) -> Result<(), InstancesError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let missing: Vec<u32> = ids.iter().copied().filter(|id| !held.contains_key(id)).collect();
        for lock in self.locks.acquire_all(&missing)? {
            held.insert(lock.id(), lock);
        }
        Ok(())
    }

    fn release(&self, ids: &[u32]) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            held.remove(id);
        }
    }

    /// Reserve ids: explicit ones first, then the smallest free ids that are
    /// neither recorded in the database nor locked elsewhere.
    fn allocate_ids(&self, instances: &[InstanceParams]) -> Result<Vec<u32>, InstancesError> {
        let mut requested = BTreeSet::new();
        for id in instances.iter().filter_map(|i| i.id) {
            if !requested.insert(id) {
                return Err(CoreError::InvalidInstances {
                    group: String::new(),
                    reason: format!("requested instance id {id} is repeated"),
                }
                .into());
            }
        }
        let explicit: Vec<u32> = requested.iter().copied().collect();
        self.hold(&explicit)?;

        let mut excluded = match self.database.used_instance_ids() {
            Ok(used) => used,
            Err(e) => {
                self.release(&explicit);
                return Err(e);
            }
        };
        excluded.extend(self.held_lock_ids());
        let mut ids = Vec::with_capacity(instances.len());
        let mut fresh = Vec::new();
        for instance in instances {
            let id = match instance.id {
                Some(id) => id,
                None => match self.locks.acquire_unused(&excluded) {
                    Ok(lock) => {
                        let id = lock.id();
                        excluded.insert(id);
                        self.held.lock().unwrap_or_else(PoisonError::into_inner).insert(id, lock);
                        fresh.push(id);
                        id
                    }
                    Err(e) => {
                        self.release(&explicit);
                        self.release(&fresh);
                        return Err(e);
                    }
                },
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Allocate ids, build the group, create its home directory and register
    /// it. The ids stay locked by this manager.
    ///
    /// # Errors
    /// Lock, validation, uniqueness and storage errors. On failure every id
    /// locked for this call is released.
    pub fn create_group(&self, mut params: CreateGroupParams) -> Result<Group, InstancesError> {
        let name = match params.group_name.take() {
            Some(name) => name,
            None => self.database.unique_group_name()?,
        };
        let ids = self.allocate_ids(&params.instances)?;
        let result = self.register_group(&name, &ids, params);
        if result.is_err() {
            self.release(&ids);
        }
        result
    }

    fn register_group(&self, name: &str, ids: &[u32], params: CreateGroupParams) -> Result<Group, InstancesError> {
        let home = params.home.unwrap_or_else(|| self.layout.default_group_home(name));
        let mut builder = Group::builder(name)
            .home_directory(&home)
            .host_artifacts_path(params.host_artifacts_path);
        if let Some(product) = params.product_out_path {
            builder = builder.product_out_path(product);
        }
        if let Some(build_id) = params.build_id {
            builder = builder.build_id(build_id);
        }
        for (id, instance) in ids.iter().zip(params.instances) {
            builder = builder.instance(*id, instance.name.unwrap_or_else(|| id.to_string()));
        }
        let group = builder.build()?;
        fs::create_dir_all(&home).map_err(|e| InstancesError::io(format!("creating {}", home.display()), e))?;
        self.database.add_instance_group(group)
    }

    /// Look a group up by name.
    ///
    /// # Errors
    /// [`InstancesError::NotFound`] if it does not exist.
    pub fn group(&self, name: &str) -> Result<Group, InstancesError> {
        self.database.find_group(&Query::by_group_name(name))
    }

    fn transition_all(&self, name: &str, to: InstanceState) -> Result<Group, InstancesError> {
        let group = self.database.update_group_with(name, |group| {
            group.set_state_all(to)?;
            Ok(())
        })?;
        info!(group = %name, state = %to, "instances transitioned");
        Ok(group)
    }

    /// Prepare and boot every instance of a group.
    ///
    /// `cancel` is checked before the launcher runs; when set, the instances
    /// end up CANCELLED and [`InstancesError::Cancelled`] is returned.
    ///
    /// # Errors
    /// [`InstancesError::Core`] if some instance cannot be prepared from its
    /// current state, lock errors, or [`InstancesError::LauncherFailed`] (the
    /// instances then end up BOOT_FAILED).
    pub fn start_group(&self, name: &str, cancel: &AtomicBool) -> Result<Group, InstancesError> {
        let group = self.group(name)?;
        if let Some(blocked) = group.instances().iter().find(|i| !i.state().can_transition_to(InstanceState::Preparing)) {
            return Err(CoreError::InvalidTransition {
                id: blocked.id(),
                from: blocked.state(),
                to: InstanceState::Preparing,
            }
            .into());
        }
        self.hold(&group.instance_ids())?;
        self.transition_all(name, InstanceState::Preparing)?;
        if cancel.load(Ordering::SeqCst) {
            self.transition_all(name, InstanceState::Cancelled)?;
            return Err(InstancesError::Cancelled);
        }
        let starting = self.transition_all(name, InstanceState::Starting)?;
        match self.launcher.launch(&starting) {
            Ok(()) => self.transition_all(name, InstanceState::Running),
            Err(e) => {
                warn!(group = %name, error = %e, "devices failed to boot");
                self.transition_all(name, InstanceState::BootFailed)?;
                Err(e)
            }
        }
    }

    /// Stop every instance of a group and release its locks.
    ///
    /// Instances left PREPARING or STARTING by an interrupted `cvd` are
    /// marked CANCELLED; running ones go through STOPPING to STOPPED.
    ///
    /// # Errors
    /// Lock errors, or [`InstancesError::LauncherFailed`] if the stop tool
    /// fails. The instances then stay STOPPING, which is active, so their
    /// locks stay held; calling `stop_group` again retries the stop.
    pub fn stop_group(&self, name: &str) -> Result<Group, InstancesError> {
        let group = self.group(name)?;
        let ids = group.instance_ids();
        self.hold(&ids)?;
        self.transition_all(name, InstanceState::Cancelled)?;
        let stopping = self.transition_all(name, InstanceState::Stopping)?;
        let stopped = if stopping.instances().iter().any(|i| i.state() == InstanceState::Stopping) {
            if let Err(e) = self.launcher.stop(&stopping) {
                warn!(group = %name, error = %e, "devices failed to stop");
                return Err(e);
            }
            self.transition_all(name, InstanceState::Stopped)?
        } else {
            stopping
        };
        self.release(&ids);
        Ok(stopped)
    }

    /// Unregister an idle group. Returns whether it existed.
    ///
    /// # Errors
    /// [`InstancesError::GroupActive`] if any instance is active.
    pub fn remove_group(&self, name: &str) -> Result<bool, InstancesError> {
        let group = match self.group(name) {
            Ok(group) => group,
            Err(InstancesError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if group.has_active_instances() {
            return Err(InstancesError::GroupActive { group: name.to_owned() });
        }
        let ids = group.instance_ids();
        self.release(&ids);
        for id in ids {
            if let Err(e) = self.locks.remove_lock_file(id) {
                warn!(instance_id = id, error = %e, "failed to remove instance lock file");
            }
        }
        self.database.remove_instance_group(name)
    }

    /// Stop every active group (best effort), remove their lock files and
    /// empty the database. Returns the groups that were registered.
    ///
    /// # Errors
    /// Lock or I/O errors on the database file.
    pub fn clear(&self) -> Result<Vec<Group>, InstancesError> {
        let groups = self.database.clear()?;
        for group in &groups {
            if group.has_active_instances() {
                if let Err(e) = self.launcher.stop(group) {
                    warn!(group = %group.name(), error = %e, "failed to stop group while clearing");
                }
            }
            let ids = group.instance_ids();
            self.release(&ids);
            for id in ids {
                if let Err(e) = self.locks.remove_lock_file(id) {
                    warn!(instance_id = id, error = %e, "failed to remove instance lock file");
                }
            }
        }
        Ok(groups)
    }

    /// [`clear`](Self::clear), then remove every lock file, including ones no
    /// group records.
    ///
    /// # Errors
    /// See [`clear`](Self::clear).
    pub fn reset(&self) -> Result<Vec<Group>, InstancesError> {
        let groups = self.clear()?;
        let removed = self.locks.remove_all()?;
        info!(lock_files = removed, "removed all instance lock files");
        Ok(groups)
    }

    /// Send a launcher monitor action to one running instance.
    ///
    /// # Errors
    /// [`InstancesError::NotRunning`] unless the instance is RUNNING,
    /// otherwise the launcher's error.
    pub fn send_action(&self, group: &Group, instance: &Instance, action: MonitorAction) -> Result<(), InstancesError> {
        if instance.state() != InstanceState::Running {
            return Err(InstancesError::NotRunning {
                device: instance.device_name(group.name()),
                state: instance.state(),
            });
        }
        self.launcher.send_action(group, instance, action)
    }

    /// Run `bin/<tool>` from a group's host artifacts with the group's `HOME`.
    ///
    /// # Errors
    /// [`InstancesError::LauncherFailed`] if the tool fails.
    pub fn run_group_tool(&self, group: &Group, tool: &str, args: &[String]) -> Result<(), InstancesError> {
        self.launcher.run_tool(&ToolInvocation::for_group(group, tool).args(args.iter().cloned()))
    }
}
