//! Read-only reporting: `cvd status` and `cvd fleet`.

use std::path::PathBuf;
use std::sync::Arc;

use cvd_core::{Group, Instance};
use cvd_instances::InstanceManager;
use serde::Serialize;

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;
use crate::selector::{select, SelectionScope};

use super::expect_no_args;

#[derive(Debug, Serialize)]
pub(crate) struct InstanceStatus {
    group: String,
    instance_name: String,
    device_name: String,
    id: u32,
    state: String,
    adb_port: u32,
    instance_dir: PathBuf,
}

impl InstanceStatus {
    pub(crate) fn new(group: &Group, instance: &Instance) -> Self {
        Self {
            group: group.name().to_owned(),
            instance_name: instance.name().to_owned(),
            device_name: instance.device_name(group.name()),
            id: instance.id(),
            state: instance.state().to_string(),
            adb_port: instance.adb_port(),
            instance_dir: group.instance_dir(instance.id()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GroupStatus {
    group_name: String,
    home_directory: PathBuf,
    host_artifacts_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_out_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    instances: Vec<InstanceStatus>,
}

impl GroupStatus {
    pub(crate) fn new(group: &Group) -> Self {
        Self {
            group_name: group.name().to_owned(),
            home_directory: group.home_directory().to_owned(),
            host_artifacts_path: group.host_artifacts_path().to_owned(),
            product_out_path: group.product_out_path().map(ToOwned::to_owned),
            build_id: group.build_id().map(ToOwned::to_owned),
            start_time: group.start_time().map(|t| t.to_rfc3339()),
            instances: group.instances().iter().map(|i| InstanceStatus::new(group, i)).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Fleet {
    groups: Vec<GroupStatus>,
}

/// Pretty JSON followed by a newline.
pub(crate) fn print_json(ctx: &mut HandlerContext<'_>, value: &impl Serialize) -> Result<(), CvdError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CvdError::io("encoding status", std::io::Error::other(e)))?;
    ctx.println(&text)
}

/// `cvd status`: one JSON object per selected instance.
pub struct StatusHandler {
    manager: Arc<InstanceManager>,
}

impl StatusHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for StatusHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["status", "cvd_status"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let db = self.manager.database();
        if request.selectors().is_empty() && db.is_empty()? {
            return print_json(ctx, &Vec::<InstanceStatus>::new());
        }
        let selection = select(db, request, SelectionScope::GroupWide)?;
        let statuses: Vec<InstanceStatus> =
            selection.instances.iter().map(|i| InstanceStatus::new(&selection.group, i)).collect();
        print_json(ctx, &statuses)
    }

    fn summary_help(&self) -> String {
        "Report the state of the selected instances".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd status [-group_name NAME] [-instance_name NAME[,NAME...]]\n\n\
         Prints a JSON array with one object per selected instance: its group,\n\
         name, id, lifecycle state, adb port and runtime directory. Without\n\
         selectors the only group is reported; an empty host prints [].\n"
            .to_owned()
    }
}

/// `cvd fleet`: every group and its instances.
pub struct FleetHandler {
    manager: Arc<InstanceManager>,
}

impl FleetHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for FleetHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["fleet"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let groups = self.manager.database().instance_groups()?;
        print_json(ctx, &Fleet { groups: groups.iter().map(GroupStatus::new).collect() })
    }

    fn summary_help(&self) -> String {
        "List every instance group on this host".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd fleet\n\nPrints {\"groups\": [...]} with every registered group and the status of its instances.\n"
            .to_owned()
    }
}
