//! Persistent instance database.
//!
//! Groups live in one JSON file. Every operation opens the file, takes an
//! advisory `flock` on it (shared for reads, exclusive for writes), parses the
//! whole table, and for mutations rewrites the file in place before the lock
//! is released. Concurrent `cvd` processes therefore observe each `add`,
//! `update` or `remove` atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cvd_core::{Group, Instance, InstanceState, DEFAULT_GROUP_NAME};
use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::InstancesError;

/// How long a database operation waits for the file lock by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Filter over groups and instances.
///
/// Every populated field must match. A group matches `instance_names` when
/// it contains all of them; an instance matches when its name is one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Query {
    pub group_name: Option<String>,
    pub instance_names: Vec<String>,
    pub instance_id: Option<u32>,
    pub home: Option<PathBuf>,
}

impl Query {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match the group with this name.
    #[must_use]
    pub fn by_group_name(name: impl Into<String>) -> Self {
        Self { group_name: Some(name.into()), ..Self::default() }
    }

    /// Match the group owning this instance id.
    #[must_use]
    pub fn by_instance_id(id: u32) -> Self {
        Self { instance_id: Some(id), ..Self::default() }
    }

    /// Match the group with this home directory.
    #[must_use]
    pub fn by_home(home: impl Into<PathBuf>) -> Self {
        Self { home: Some(home.into()), ..Self::default() }
    }

    /// Also require the given instance names.
    #[must_use]
    pub fn with_instance_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instance_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Also require the given group name.
    #[must_use]
    pub fn with_group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = Some(name.into());
        self
    }

    /// Whether no field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group_name.is_none()
            && self.instance_names.is_empty()
            && self.instance_id.is_none()
            && self.home.is_none()
    }

    fn matches_group(&self, group: &Group) -> bool {
        self.group_name.as_deref().map_or(true, |n| n == group.name())
            && self.home.as_deref().map_or(true, |h| h == group.home_directory())
            && self.instance_id.map_or(true, |id| group.instance_by_id(id).is_some())
            && self.instance_names.iter().all(|n| group.find_instance(n).is_some())
    }

    fn matches_instance(&self, instance: &Instance) -> bool {
        self.instance_id.map_or(true, |id| id == instance.id())
            && (self.instance_names.is_empty()
                || self.instance_names.iter().any(|n| n == instance.name()))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        let mut fields = Vec::new();
        if let Some(name) = &self.group_name {
            fields.push(format!("group_name={name}"));
        }
        if !self.instance_names.is_empty() {
            fields.push(format!("instance_names={}", self.instance_names.join(",")));
        }
        if let Some(id) = self.instance_id {
            fields.push(format!("instance_id={id}"));
        }
        if let Some(home) = &self.home {
            fields.push(format!("home={}", home.display()));
        }
        write!(f, "{{{}}}", fields.join(" "))
    }
}

/// The in-memory image of the database file with its lookup indexes.
#[derive(Debug, Clone, Default)]
struct GroupTable {
    groups: IndexMap<String, Group>,
    by_home: HashMap<PathBuf, String>,
    by_instance_id: BTreeMap<u32, String>,
}

impl GroupTable {
    fn from_groups(groups: impl IntoIterator<Item = Group>) -> Result<Self, InstancesError> {
        let mut table = Self::default();
        for group in groups {
            table.insert(group)?;
        }
        Ok(table)
    }

    /// Reject `group` if it collides with any group other than `replacing`.
    fn check_unique(&self, group: &Group, replacing: Option<&str>) -> Result<(), InstancesError> {
        let other = |owner: &String| replacing != Some(owner.as_str());
        if replacing.is_none() && self.groups.contains_key(group.name()) {
            return Err(InstancesError::DuplicateGroupName { name: group.name().to_owned() });
        }
        if let Some(owner) = self.by_home.get(group.home_directory()).filter(|o| other(o)) {
            return Err(InstancesError::DuplicateHome {
                home: group.home_directory().to_owned(),
                owner: owner.clone(),
            });
        }
        for id in group.instance_ids() {
            if let Some(owner) = self.by_instance_id.get(&id).filter(|o| other(o)) {
                return Err(InstancesError::DuplicateId { id, owner: owner.clone() });
            }
        }
        Ok(())
    }

    fn index(&mut self, group: &Group) {
        self.by_home.insert(group.home_directory().to_owned(), group.name().to_owned());
        for id in group.instance_ids() {
            self.by_instance_id.insert(id, group.name().to_owned());
        }
    }

    fn unindex(&mut self, group: &Group) {
        self.by_home.remove(group.home_directory());
        for id in group.instance_ids() {
            self.by_instance_id.remove(&id);
        }
    }

    fn insert(&mut self, group: Group) -> Result<(), InstancesError> {
        self.check_unique(&group, None)?;
        self.index(&group);
        self.groups.insert(group.name().to_owned(), group);
        Ok(())
    }

    fn replace(&mut self, group: Group) -> Result<(), InstancesError> {
        if !self.groups.contains_key(group.name()) {
            return Err(InstancesError::NotFound {
                what: "group",
                query: Query::by_group_name(group.name()).to_string(),
            });
        }
        self.check_unique(&group, Some(group.name()))?;
        if let Some(old) = self.groups.get(group.name()).cloned() {
            self.unindex(&old);
        }
        self.index(&group);
        self.groups.insert(group.name().to_owned(), group);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Option<Group> {
        let group = self.groups.shift_remove(name)?;
        self.unindex(&group);
        Some(group)
    }

    fn find_groups(&self, query: &Query) -> Vec<Group> {
        // Narrow through the indexes before scanning.
        if let Some(name) = &query.group_name {
            return self.groups.get(name).filter(|g| query.matches_group(g)).cloned().into_iter().collect();
        }
        if let Some(owner) = query.instance_id.map(|id| self.by_instance_id.get(&id)) {
            return owner
                .and_then(|name| self.groups.get(name))
                .filter(|g| query.matches_group(g))
                .cloned()
                .into_iter()
                .collect();
        }
        if let Some(owner) = query.home.as_ref().map(|h| self.by_home.get(h)) {
            return owner
                .and_then(|name| self.groups.get(name))
                .filter(|g| query.matches_group(g))
                .cloned()
                .into_iter()
                .collect();
        }
        self.groups.values().filter(|g| query.matches_group(g)).cloned().collect()
    }

    fn find_instances(&self, query: &Query) -> Vec<(Instance, Group)> {
        self.find_groups(query)
            .into_iter()
            .flat_map(|group| {
                group
                    .instances()
                    .iter()
                    .filter(|i| query.matches_instance(i))
                    .cloned()
                    .map(|i| (i, group.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn unique_group_name(&self) -> String {
        (1u32..)
            .map(|n| format!("{DEFAULT_GROUP_NAME}_{n}"))
            .find(|name| !self.groups.contains_key(name))
            .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_owned())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseFile {
    #[serde(rename = "Groups", default)]
    groups: Vec<GroupRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    name: String,
    home_directory: PathBuf,
    host_artifacts_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    product_out_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceRecord {
    id: u32,
    name: String,
    #[serde(default)]
    state: InstanceState,
}

impl From<&Group> for GroupRecord {
    fn from(group: &Group) -> Self {
        Self {
            name: group.name().to_owned(),
            home_directory: group.home_directory().to_owned(),
            host_artifacts_path: group.host_artifacts_path().to_owned(),
            product_out_path: group.product_out_path().map(Path::to_owned),
            build_id: group.build_id().map(str::to_owned),
            start_time: group.start_time().map(|t| t.to_rfc3339()),
            instances: group
                .instances()
                .iter()
                .map(|i| InstanceRecord { id: i.id(), name: i.name().to_owned(), state: i.state() })
                .collect(),
        }
    }
}

impl GroupRecord {
    fn into_group(self) -> Result<Group, String> {
        let mut builder = Group::builder(self.name)
            .home_directory(self.home_directory)
            .host_artifacts_path(self.host_artifacts_path);
        if let Some(product) = self.product_out_path {
            builder = builder.product_out_path(product);
        }
        if let Some(build_id) = self.build_id {
            builder = builder.build_id(build_id);
        }
        if let Some(start_time) = self.start_time {
            let parsed = DateTime::parse_from_rfc3339(&start_time)
                .map_err(|e| format!("bad start_time \"{start_time}\": {e}"))?;
            builder = builder.start_time(parsed.with_timezone(&Utc));
        }
        for instance in self.instances {
            builder = builder.instance_with_state(instance.id, instance.name, instance.state);
        }
        builder.restore().map_err(|e| e.to_string())
    }
}

fn encode(table: &GroupTable) -> Result<Vec<u8>, InstancesError> {
    let file = DatabaseFile { groups: table.groups.values().map(GroupRecord::from).collect() };
    let mut bytes = serde_json::to_vec_pretty(&file)
        .map_err(|e| InstancesError::io("serializing instance database", e.into()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<GroupTable, InstancesError> {
    let corrupt = |reason: String| InstancesError::CorruptDb { path: path.to_owned(), reason };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(GroupTable::default());
    }
    let file: DatabaseFile = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    let groups = file
        .groups
        .into_iter()
        .map(GroupRecord::into_group)
        .collect::<Result<Vec<_>, _>>()
        .map_err(corrupt)?;
    GroupTable::from_groups(groups).map_err(|e| corrupt(e.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Take an advisory lock on `file`, retrying until `timeout` elapses.
fn lock_with_timeout(
    file: &File,
    mode: LockMode,
    path: &Path,
    timeout: Duration,
) -> Result<(), InstancesError> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match attempt {
            Ok(()) => {
                debug!(path = %path.display(), ?mode, "locked instance database");
                return Ok(());
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if Instant::now() >= deadline {
                    return Err(InstancesError::Timeout {
                        what: format!("lock on {}", path.display()),
                        after: timeout,
                    });
                }
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(InstancesError::io(format!("locking {}", path.display()), e));
            }
        }
    }
}

fn read_all(file: &mut File, path: &Path) -> Result<Vec<u8>, InstancesError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
        .map_err(|e| InstancesError::io(format!("reading {}", path.display()), e))?;
    Ok(bytes)
}

fn overwrite(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Replace `previous` with `contents` through `rewrite`. A failed rewrite is
/// followed by a rewrite of `previous` so readers never see a partial table.
fn commit(
    path: &Path,
    previous: &[u8],
    contents: &[u8],
    mut rewrite: impl FnMut(&[u8]) -> io::Result<()>,
) -> Result<(), InstancesError> {
    if contents == previous {
        return Ok(());
    }
    if let Err(e) = rewrite(contents) {
        if let Err(restore) = rewrite(previous) {
            warn!(path = %path.display(), error = %restore, "failed to restore instance database");
        }
        return Err(InstancesError::io(format!("writing {}", path.display()), e));
    }
    Ok(())
}

#[derive(Debug)]
struct FileStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    fn read<T>(&self, op: impl FnOnce(&GroupTable) -> Result<T, InstancesError>) -> Result<T, InstancesError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return op(&GroupTable::default()),
            Err(e) => return Err(InstancesError::io(format!("opening {}", self.path.display()), e)),
        };
        lock_with_timeout(&file, LockMode::Shared, &self.path, self.lock_timeout)?;
        let table = decode(&self.path, &read_all(&mut file, &self.path)?)?;
        op(&table)
    }

    fn open_exclusive(&self) -> Result<File, InstancesError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| InstancesError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| InstancesError::io(format!("opening {}", self.path.display()), e))?;
        lock_with_timeout(&file, LockMode::Exclusive, &self.path, self.lock_timeout)?;
        Ok(file)
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&mut GroupTable) -> Result<T, InstancesError>,
    ) -> Result<T, InstancesError> {
        let mut file = self.open_exclusive()?;
        let previous = read_all(&mut file, &self.path)?;
        let mut table = decode(&self.path, &previous)?;
        let out = op(&mut table)?;
        let contents = encode(&table)?;
        commit(&self.path, &previous, &contents, |bytes| overwrite(&mut file, bytes))?;
        Ok(out)
    }

    /// Empty the file in place under the exclusive lock. The file is never
    /// unlinked: another process may already hold an open handle to it.
    fn clear(&self) -> Result<Vec<Group>, InstancesError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut file = self.open_exclusive()?;
        let previous = read_all(&mut file, &self.path)?;
        let groups = match decode(&self.path, &previous) {
            Ok(table) => table.groups.into_values().collect(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable instance database");
                Vec::new()
            }
        };
        let empty = encode(&GroupTable::default())?;
        commit(&self.path, &previous, &empty, |bytes| overwrite(&mut file, bytes))?;
        Ok(groups)
    }
}

#[derive(Debug)]
enum Store {
    Memory(Mutex<GroupTable>),
    File(FileStore),
}

/// Every group known on this host, with cross-group uniqueness enforced.
///
/// Results are value copies; mutating one never affects the database until
/// it is passed back through [`update_instance_group`](Self::update_instance_group).
#[derive(Debug)]
pub struct InstanceDatabase {
    store: Store,
}

impl InstanceDatabase {
    /// A database that lives only as long as this value.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { store: Store::Memory(Mutex::new(GroupTable::default())) }
    }

    /// A database persisted at `path`. The file is created on first write.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self { store: Store::File(FileStore { path: path.into(), lock_timeout }) }
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.store {
            Store::Memory(_) => None,
            Store::File(store) => Some(&store.path),
        }
    }

    fn read<T>(&self, op: impl FnOnce(&GroupTable) -> Result<T, InstancesError>) -> Result<T, InstancesError> {
        match &self.store {
            Store::Memory(table) => op(&table.lock().unwrap_or_else(PoisonError::into_inner)),
            Store::File(store) => store.read(op),
        }
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&mut GroupTable) -> Result<T, InstancesError>,
    ) -> Result<T, InstancesError> {
        match &self.store {
            Store::Memory(table) => {
                let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
                let mut staged = table.clone();
                let out = op(&mut staged)?;
                *table = staged;
                Ok(out)
            }
            Store::File(store) => store.write(op),
        }
    }

    /// Register a new group.
    ///
    /// # Errors
    /// - [`InstancesError::Core`] if the group fails validation.
    /// - [`InstancesError::DuplicateGroupName`], [`InstancesError::DuplicateHome`]
    ///   or [`InstancesError::DuplicateId`] on a collision.
    /// - Storage errors from the database file.
    pub fn add_instance_group(&self, group: Group) -> Result<Group, InstancesError> {
        group.validate()?;
        self.write(|table| {
            table.insert(group.clone())?;
            Ok(())
        })?;
        info!(group = %group.name(), home = %group.home_directory().display(), ids = ?group.instance_ids(), "added instance group");
        Ok(group)
    }

    /// Replace the group with the same name.
    ///
    /// # Errors
    /// [`InstancesError::NotFound`] if no such group exists, otherwise the
    /// same taxonomy as [`add_instance_group`](Self::add_instance_group).
    pub fn update_instance_group(&self, group: Group) -> Result<(), InstancesError> {
        self.write(|table| table.replace(group.clone()))?;
        info!(group = %group.name(), "updated instance group");
        Ok(())
    }

    /// Read-modify-write one group under a single exclusive lock.
    ///
    /// # Errors
    /// [`InstancesError::NotFound`] if no such group exists, any error `edit`
    /// returns, or a uniqueness error if the edited group collides.
    pub fn update_group_with(
        &self,
        name: &str,
        edit: impl FnOnce(&mut Group) -> Result<(), InstancesError>,
    ) -> Result<Group, InstancesError> {
        self.write(|table| {
            let mut group = table.groups.get(name).cloned().ok_or_else(|| InstancesError::NotFound {
                what: "group",
                query: Query::by_group_name(name).to_string(),
            })?;
            edit(&mut group)?;
            table.replace(group.clone())?;
            Ok(group)
        })
    }

    /// Remove a group. Returns whether it was present.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn remove_instance_group(&self, name: &str) -> Result<bool, InstancesError> {
        let removed = self.write(|table| Ok(table.remove(name).is_some()))?;
        if removed {
            info!(group = %name, "removed instance group");
        }
        Ok(removed)
    }

    /// Drop every group, leaving an empty table in the database file.
    /// Returns what was removed.
    ///
    /// An unreadable file is emptied as well.
    ///
    /// # Errors
    /// Lock or I/O errors on the database file.
    pub fn clear(&self) -> Result<Vec<Group>, InstancesError> {
        let groups = match &self.store {
            Store::Memory(table) => {
                let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *table).groups.into_values().collect()
            }
            Store::File(store) => store.clear()?,
        };
        info!(count = groups.len(), "cleared instance database");
        Ok(groups)
    }

    /// Whether there are no groups.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn is_empty(&self) -> Result<bool, InstancesError> {
        self.read(|table| Ok(table.groups.is_empty()))
    }

    /// Every group, in insertion order.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn instance_groups(&self) -> Result<Vec<Group>, InstancesError> {
        self.read(|table| Ok(table.groups.values().cloned().collect()))
    }

    /// Every group matching `query`, in insertion order.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn find_groups(&self, query: &Query) -> Result<Vec<Group>, InstancesError> {
        self.read(|table| Ok(table.find_groups(query)))
    }

    /// The one group matching `query`.
    ///
    /// # Errors
    /// [`InstancesError::NotFound`] or [`InstancesError::Ambiguous`] unless
    /// exactly one group matches.
    pub fn find_group(&self, query: &Query) -> Result<Group, InstancesError> {
        let mut groups = self.find_groups(query)?;
        match groups.len() {
            1 => Ok(groups.remove(0)),
            0 => Err(InstancesError::NotFound { what: "group", query: query.to_string() }),
            count => Err(InstancesError::Ambiguous { what: "group", query: query.to_string(), count }),
        }
    }

    /// Every matching instance paired with its group.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn find_instances(&self, query: &Query) -> Result<Vec<(Instance, Group)>, InstancesError> {
        self.read(|table| Ok(table.find_instances(query)))
    }

    /// The one instance matching `query`, paired with its group.
    ///
    /// # Errors
    /// [`InstancesError::InvalidQuery`] for more than one instance name,
    /// otherwise [`InstancesError::NotFound`] or [`InstancesError::Ambiguous`]
    /// unless exactly one instance matches.
    pub fn find_instance_with_group(&self, query: &Query) -> Result<(Instance, Group), InstancesError> {
        if query.instance_names.len() > 1 {
            return Err(InstancesError::InvalidQuery(format!(
                "cannot find a single instance among {} names",
                query.instance_names.len()
            )));
        }
        let mut found = self.find_instances(query)?;
        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err(InstancesError::NotFound { what: "instance", query: query.to_string() }),
            count => Err(InstancesError::Ambiguous { what: "instance", query: query.to_string(), count }),
        }
    }

    /// Every instance id recorded in the database.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn used_instance_ids(&self) -> Result<BTreeSet<u32>, InstancesError> {
        self.read(|table| Ok(table.by_instance_id.keys().copied().collect()))
    }

    /// The first `cvd_<n>` name not taken by any group.
    ///
    /// # Errors
    /// Storage errors from the database file.
    pub fn unique_group_name(&self) -> Result<String, InstancesError> {
        self.read(|table| Ok(table.unique_group_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts() -> tempfile::TempDir {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let bin = dir.path().join("bin");
        if let Err(e) = fs::create_dir_all(&bin).and_then(|()| fs::write(bin.join("launch_cvd"), b"")) {
            panic!("failed to populate host artifacts: {e}");
        }
        dir
    }

    fn group(host: &Path, name: &str, home: &str, instances: &[(u32, &str)]) -> Group {
        let builder = instances.iter().fold(
            Group::builder(name).home_directory(home).host_artifacts_path(host),
            |b, (id, n)| b.instance(*id, *n),
        );
        match builder.build() {
            Ok(g) => g,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn query_display_lists_populated_fields() {
        assert_eq!(Query::all().to_string(), "{}");
        let query = Query::by_instance_id(3).with_group_name("g").with_instance_names(["a", "b"]);
        assert_eq!(query.to_string(), "{group_name=g instance_names=a,b instance_id=3}");
    }

    #[test]
    fn group_matches_only_when_it_has_every_instance_name() {
        let host = artifacts();
        let db = InstanceDatabase::in_memory();
        let g = group(host.path(), "g", "/w/g", &[(1, "a"), (2, "b")]);
        if let Err(e) = db.add_instance_group(g) {
            panic!("add failed: {e}");
        }
        let both = Query::all().with_instance_names(["a", "b"]);
        let missing = Query::all().with_instance_names(["a", "z"]);
        assert_eq!(db.find_groups(&both).map(|g| g.len()).ok(), Some(1));
        assert_eq!(db.find_groups(&missing).map(|g| g.len()).ok(), Some(0));
        assert!(matches!(
            db.find_instance_with_group(&both),
            Err(InstancesError::InvalidQuery(_))
        ));
    }

    #[test]
    fn failed_memory_write_leaves_table_untouched() {
        let host = artifacts();
        let db = InstanceDatabase::in_memory();
        if let Err(e) = db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])) {
            panic!("add failed: {e}");
        }
        let result = db.update_group_with("a", |_| Err(InstancesError::Cancelled));
        assert!(matches!(result, Err(InstancesError::Cancelled)));
        let groups = match db.instance_groups() {
            Ok(g) => g,
            Err(e) => panic!("read failed: {e}"),
        };
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn unique_group_name_skips_taken_names() {
        let host = artifacts();
        let db = InstanceDatabase::in_memory();
        assert_eq!(db.unique_group_name().ok().as_deref(), Some("cvd_1"));
        if let Err(e) = db.add_instance_group(group(host.path(), "cvd_1", "/w/1", &[(1, "a")])) {
            panic!("add failed: {e}");
        }
        assert_eq!(db.unique_group_name().ok().as_deref(), Some("cvd_2"));
    }

    #[test]
    fn update_rejects_home_of_another_group() {
        let host = artifacts();
        let db = InstanceDatabase::in_memory();
        for g in [
            group(host.path(), "a", "/w/a", &[(1, "x")]),
            group(host.path(), "b", "/w/b", &[(2, "y")]),
        ] {
            if let Err(e) = db.add_instance_group(g) {
                panic!("add failed: {e}");
            }
        }
        let moved = group(host.path(), "b", "/w/a", &[(2, "y")]);
        assert!(matches!(
            db.update_instance_group(moved),
            Err(InstancesError::DuplicateHome { owner, .. }) if owner == "a"
        ));
        let unknown = group(host.path(), "c", "/w/c", &[(3, "z")]);
        assert!(matches!(db.update_instance_group(unknown), Err(InstancesError::NotFound { .. })));
    }

    #[test]
    fn update_may_keep_own_ids_and_home() {
        let host = artifacts();
        let db = InstanceDatabase::in_memory();
        if let Err(e) = db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])) {
            panic!("add failed: {e}");
        }
        let updated = db.update_group_with("a", |g| {
            g.set_instance_state(1, InstanceState::Preparing)?;
            Ok(())
        });
        assert!(updated.is_ok());
        let found = match db.find_instance_with_group(&Query::by_instance_id(1)) {
            Ok(f) => f,
            Err(e) => panic!("lookup failed: {e}"),
        };
        assert_eq!(found.0.state(), InstanceState::Preparing);
    }

    #[test]
    fn corrupt_file_is_reported_and_preserved() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let path = dir.path().join("instance_database.json");
        if let Err(e) = fs::write(&path, b"{not json") {
            panic!("write failed: {e}");
        }
        let db = InstanceDatabase::open(&path, Duration::from_secs(1));
        assert!(matches!(db.instance_groups(), Err(InstancesError::CorruptDb { .. })));
        assert!(matches!(db.remove_instance_group("x"), Err(InstancesError::CorruptDb { .. })));
        assert_eq!(fs::read(&path).ok().as_deref(), Some(&b"{not json"[..]));
    }

    #[test]
    fn invalid_group_in_file_is_corrupt() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let path = dir.path().join("db.json");
        let json = r#"{"Groups":[{"name":"0bad","home_directory":"/w","host_artifacts_path":"/h","instances":[{"id":1,"name":"a"}]}]}"#;
        if let Err(e) = fs::write(&path, json) {
            panic!("write failed: {e}");
        }
        let db = InstanceDatabase::open(&path, Duration::from_secs(1));
        assert!(matches!(db.is_empty(), Err(InstancesError::CorruptDb { .. })));
    }

    #[test]
    fn clear_empties_file_even_when_corrupt() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let path = dir.path().join("db.json");
        if let Err(e) = fs::write(&path, b"garbage") {
            panic!("write failed: {e}");
        }
        let db = InstanceDatabase::open(&path, Duration::from_secs(1));
        assert!(matches!(db.clear(), Ok(groups) if groups.is_empty()));
        assert!(path.exists());
        assert_eq!(db.is_empty().ok(), Some(true));
        // A second clear sees the empty table and succeeds.
        assert!(matches!(db.clear(), Ok(groups) if groups.is_empty()));
    }

    #[test]
    fn failed_rewrite_restores_previous_bytes() {
        let previous = b"{\"Groups\":[]}\n".to_vec();
        let contents = b"{\"Groups\":[{\"name\":\"g\"}]}\n".to_vec();
        let mut disk = previous.clone();
        let mut attempts = 0;
        let result = commit(Path::new("db.json"), &previous, &contents, |bytes| {
            attempts += 1;
            disk.clear();
            if attempts == 1 {
                disk.extend_from_slice(&bytes[..bytes.len() / 2]);
                return Err(io::Error::other("no space left on device"));
            }
            disk.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(result, Err(InstancesError::Io { .. })));
        assert_eq!(attempts, 2);
        assert_eq!(disk, previous);
    }

    #[test]
    fn unchanged_contents_are_not_rewritten() {
        let bytes = b"{}".to_vec();
        let result = commit(Path::new("db.json"), &bytes, &bytes, |_| {
            Err(io::Error::other("must not be called"))
        });
        assert!(result.is_ok());
    }

    #[test]
    fn failed_write_to_file_leaves_it_intact() {
        let host = artifacts();
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let path = dir.path().join("db.json");
        let db = InstanceDatabase::open(&path, Duration::from_secs(1));
        if let Err(e) = db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])) {
            panic!("add failed: {e}");
        }
        let before = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => panic!("read failed: {e}"),
        };
        // A read-only handle makes every rewrite fail, the restore included.
        let mut read_only = match File::open(&path) {
            Ok(f) => f,
            Err(e) => panic!("open failed: {e}"),
        };
        let result = commit(&path, &before, b"{}", |bytes| overwrite(&mut read_only, bytes));
        assert!(matches!(result, Err(InstancesError::Io { .. })));
        assert_eq!(fs::read(&path).ok(), Some(before));
        assert_eq!(db.instance_groups().map(|g| g.len()).ok(), Some(1));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let db = InstanceDatabase::open(dir.path().join("nested/db.json"), Duration::from_secs(1));
        assert_eq!(db.is_empty().ok(), Some(true));
        assert_eq!(db.remove_instance_group("g").ok(), Some(false));
    }

    #[test]
    fn exclusive_lock_held_elsewhere_times_out() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let path = dir.path().join("db.json");
        let holder = match File::create(&path) {
            Ok(f) => f,
            Err(e) => panic!("create failed: {e}"),
        };
        if let Err(e) = FileExt::lock_exclusive(&holder) {
            panic!("lock failed: {e}");
        }
        let db = InstanceDatabase::open(&path, Duration::from_millis(60));
        assert!(matches!(db.is_empty(), Err(InstancesError::Timeout { .. })));
    }
}
