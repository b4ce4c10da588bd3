//! Selector flags (`-group_name`, `-instance_name`) and their evaluation
//! against the instance database.
//!
//! Resolution order:
//! 1. The group: named by `-group_name`, otherwise the only group in the
//!    database. With several groups and `-instance_name` given, the groups
//!    that contain every listed name are considered instead.
//! 2. The instances: every name listed by `-instance_name` must exist in
//!    the chosen group.
//! 3. Otherwise the handler's [`SelectionScope`] decides.
//!
//! `-instance_name` also accepts device names (`<group>-<instance>`) sharing
//! one registered group, and `CUTTLEFISH_INSTANCE=<n>` stands in for
//! `-instance_name cvd-<n>` when no selector flag is given.

use cvd_core::{
    break_device_name, gen_default_group_name, is_valid_group_name, is_valid_instance_name, local_device_name, DeviceName,
    Group, Instance,
};
use cvd_instances::{InstanceDatabase, InstancesError, Query};
use tracing::debug;

use crate::error::CvdError;
use crate::request::CommandRequest;

pub const GROUP_NAME_FLAG: &str = "group_name";
pub const INSTANCE_NAME_FLAG: &str = "instance_name";

/// Environment variable naming an instance of the default group.
pub const CUTTLEFISH_INSTANCE_ENV: &str = "CUTTLEFISH_INSTANCE";

/// Parsed selector flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SelectorOptions {
    pub group_name: Option<String>,
    /// Names in the order given; never empty when present.
    pub instance_names: Option<Vec<String>>,
}

/// Strip leading dashes and split `flag=value`. `None` if `arg` is not a
/// selector flag.
fn selector_flag(arg: &str) -> Option<(&str, Option<&str>)> {
    let body = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))?;
    let (name, value) = match body.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (body, None),
    };
    [GROUP_NAME_FLAG, INSTANCE_NAME_FLAG].contains(&name).then_some((name, value))
}

/// Split leading selector flags (with their values) off `args`. Scanning
/// stops at the first argument that is not a selector flag.
#[must_use]
pub fn split_selector_args(args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut i = 0;
    while let Some(arg) = args.get(i) {
        match selector_flag(arg) {
            Some((_, Some(_))) => i += 1,
            Some((_, None)) => i = (i + 2).min(args.len()),
            None => break,
        }
    }
    (args[..i].to_vec(), args[i..].to_vec())
}

impl SelectorOptions {
    /// Parse a selector argument list.
    ///
    /// # Errors
    /// [`CvdError::BadSelector`] for unknown or repeated flags, missing or
    /// empty values, and names that are neither valid group, instance nor
    /// device names.
    pub fn parse(args: &[String]) -> Result<Self, CvdError> {
        let mut options = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let Some((flag, inline)) = selector_flag(arg) else {
                return Err(CvdError::BadSelector(format!("unknown selector flag \"{arg}\"")));
            };
            let value = match inline {
                Some(value) => value,
                None => iter
                    .next()
                    .map(String::as_str)
                    .ok_or_else(|| CvdError::BadSelector(format!("-{flag} needs a value")))?,
            };
            if flag == GROUP_NAME_FLAG {
                if options.group_name.is_some() {
                    return Err(CvdError::BadSelector("-group_name given more than once".to_owned()));
                }
                if !is_valid_group_name(value) {
                    return Err(CvdError::BadSelector(format!("invalid group name \"{value}\"")));
                }
                options.group_name = Some(value.to_owned());
            } else {
                if options.instance_names.is_some() {
                    return Err(CvdError::BadSelector("-instance_name given more than once".to_owned()));
                }
                options.instance_names = Some(parse_instance_names(value)?);
            }
        }
        Ok(options)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group_name.is_none() && self.instance_names.is_none()
    }

    /// Render back to `-flag value` arguments.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(group) = &self.group_name {
            args.extend([format!("-{GROUP_NAME_FLAG}"), group.clone()]);
        }
        if let Some(names) = &self.instance_names {
            args.extend([format!("-{INSTANCE_NAME_FLAG}"), names.join(",")]);
        }
        args
    }
}

fn parse_instance_names(value: &str) -> Result<Vec<String>, CvdError> {
    let mut names: Vec<String> = Vec::new();
    for name in value.split(',') {
        if !is_valid_instance_name(name) {
            return Err(CvdError::BadSelector(format!("invalid instance name \"{name}\" in \"{value}\"")));
        }
        if names.iter().any(|n| n == name) {
            return Err(CvdError::BadSelector(format!("instance name \"{name}\" listed twice")));
        }
        names.push(name.to_owned());
    }
    Ok(names)
}

/// How many instances a handler acts on when no instance is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionScope {
    /// Every instance of the group.
    GroupWide,
    /// Exactly one instance; the group must have only one.
    SingleInstance,
}

/// A resolved group and the selected instances, copied out of the database.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub group: Group,
    pub instances: Vec<Instance>,
}

/// Selector flags after environment defaults and device-name expansion.
struct Effective {
    group_name: Option<String>,
    instance_names: Option<Vec<String>>,
}

fn effective_selectors(db: &InstanceDatabase, request: &CommandRequest) -> Result<Effective, CvdError> {
    let selectors = request.selectors();
    let mut instance_names = selectors.instance_names.clone();
    if selectors.is_empty() {
        if let Some(id) = request.env_var(CUTTLEFISH_INSTANCE_ENV).and_then(|v| v.trim().parse::<u32>().ok()) {
            debug!(instance = id, "selecting from {CUTTLEFISH_INSTANCE_ENV}");
            instance_names = Some(vec![local_device_name(&gen_default_group_name(), &id.to_string())]);
        }
    }
    if selectors.group_name.is_none() {
        if let Some(devices) = instance_names.as_deref().and_then(device_names) {
            let group = devices[0].group.clone();
            if !db.find_groups(&Query::by_group_name(&group))?.is_empty() {
                return Ok(Effective {
                    group_name: Some(group),
                    instance_names: Some(devices.into_iter().map(|d| d.instance).collect()),
                });
            }
        }
    }
    Ok(Effective { group_name: selectors.group_name.clone(), instance_names })
}

/// `Some` if every name is a device name and all share one group.
fn device_names(names: &[String]) -> Option<Vec<DeviceName>> {
    let devices: Vec<DeviceName> = names.iter().map(|n| break_device_name(n).ok()).collect::<Option<_>>()?;
    let first = devices.first()?;
    devices.iter().all(|d| d.group == first.group).then_some(devices)
}

fn resolve_group(db: &InstanceDatabase, selectors: &Effective) -> Result<Group, CvdError> {
    if let Some(name) = &selectors.group_name {
        return Ok(db.find_group(&Query::by_group_name(name))?);
    }
    let groups = db.instance_groups()?;
    let candidates = match (groups.len(), &selectors.instance_names) {
        (0, _) => return Err(CvdError::NoGroup),
        (1, _) | (_, None) => groups,
        (_, Some(names)) => db.find_groups(&Query::all().with_instance_names(names.iter().cloned()))?,
    };
    let query = Query::all().with_instance_names(selectors.instance_names.iter().flatten().cloned());
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.len()) {
        (Some(group), 0) => Ok(group),
        (Some(_), more) => Err(CvdError::AmbiguousSelection(format!(
            "{} groups match {query}; choose one with -group_name",
            more + 1
        ))),
        (None, _) => Err(InstancesError::NotFound { what: "group", query: query.to_string() }.into()),
    }
}

/// Resolve only the group a request refers to.
///
/// # Errors
/// [`CvdError::NoGroup`] on an empty database,
/// [`CvdError::AmbiguousSelection`] if several groups qualify, or the
/// database's `NotFound` for an unknown group name.
pub fn select_group(db: &InstanceDatabase, request: &CommandRequest) -> Result<Group, CvdError> {
    let selectors = effective_selectors(db, request)?;
    resolve_group(db, &selectors)
}

/// Resolve the group and instances a request refers to.
///
/// # Errors
/// Everything [`select_group`] reports, plus
/// [`CvdError::BadInstanceName`] for a name missing from the group and
/// [`CvdError::AmbiguousSelection`] when a single instance is needed but
/// several qualify.
pub fn select(db: &InstanceDatabase, request: &CommandRequest, scope: SelectionScope) -> Result<Selection, CvdError> {
    let selectors = effective_selectors(db, request)?;
    let group = resolve_group(db, &selectors)?;
    let instances: Vec<Instance> = match &selectors.instance_names {
        Some(names) => names
            .iter()
            .map(|name| {
                group.find_instance(name).cloned().ok_or_else(|| CvdError::BadInstanceName {
                    group: group.name().to_owned(),
                    name: name.clone(),
                })
            })
            .collect::<Result<_, _>>()?,
        None => group.instances().to_vec(),
    };
    if scope == SelectionScope::SingleInstance && instances.len() != 1 {
        return Err(CvdError::AmbiguousSelection(format!(
            "group \"{}\" has {} candidate instances; choose one with -instance_name",
            group.name(),
            instances.len()
        )));
    }
    debug!(
        group = %group.name(),
        instances = ?instances.iter().map(Instance::name).collect::<Vec<_>>(),
        "selection resolved"
    );
    Ok(Selection { group, instances })
}
