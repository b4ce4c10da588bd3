//! Group lifecycle handlers: start, stop, remove, clear and reset.

use std::sync::Arc;

use cvd_instances::InstanceManager;
use tracing::info;

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;
use crate::selector::{select, select_group, SelectionScope, GROUP_NAME_FLAG};

use super::{bad_request, expect_no_args, nested_request};

/// Fail unless the selection covers the whole group.
fn select_whole_group(manager: &InstanceManager, request: &CommandRequest) -> Result<String, CvdError> {
    let selection = select(manager.database(), request, SelectionScope::GroupWide)?;
    if selection.instances.len() != selection.group.instances().len() {
        return Err(bad_request(format!(
            "cvd {} acts on whole groups; drop -instance_name or select group \"{}\"",
            request.subcommand().unwrap_or_default(),
            selection.group.name()
        )));
    }
    Ok(selection.group.name().to_owned())
}

pub struct StartHandler {
    manager: Arc<InstanceManager>,
}

impl StartHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for StartHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["start"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let name = select_whole_group(&self.manager, request)?;
        let group = self.manager.start_group(&name, ctx.sequencer.cancel_flag())?;
        info!(group = %group.name(), "group started");
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Boot every instance of a group".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd start [-group_name NAME]\n\n\
         Locks the group's instance ids, moves its instances through PREPARING\n\
         and STARTING, and launches them. Instances end RUNNING, or BOOT_FAILED\n\
         if the launcher fails.\n"
            .to_owned()
    }
}

pub struct StopHandler {
    manager: Arc<InstanceManager>,
}

impl StopHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for StopHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["stop"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let name = select_whole_group(&self.manager, request)?;
        self.manager.stop_group(&name)?;
        info!(group = %name, "group stopped");
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Stop every instance of a group".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd stop [-group_name NAME]\n\n\
         Stops the group's devices and releases their instance locks. Instances\n\
         interrupted while preparing or starting are marked CANCELLED.\n"
            .to_owned()
    }
}

pub struct RemoveHandler {
    manager: Arc<InstanceManager>,
}

impl RemoveHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for RemoveHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["remove", "rm"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let group = select_group(self.manager.database(), request)?;
        if group.has_active_instances() {
            let stop = nested_request(request, ["stop"], vec![format!("-{GROUP_NAME_FLAG}"), group.name().to_owned()])?;
            ctx.execute(std::slice::from_ref(&stop))?;
        }
        if self.manager.remove_group(group.name())? {
            info!(group = %group.name(), "group removed");
        }
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Stop a group and forget it".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd remove [-group_name NAME]\n\n\
         Stops the group first if any instance is active, then deletes its\n\
         instance lock files and its database record. The home directory is\n\
         left in place.\n"
            .to_owned()
    }
}

pub struct ClearHandler {
    manager: Arc<InstanceManager>,
}

impl ClearHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for ClearHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["clear"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let groups = self.manager.clear()?;
        info!(groups = groups.len(), "instance database cleared");
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Stop every group and empty the instance database".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd clear\n\nStops every active group (best effort), removes their lock files and deletes the instance database.\n"
            .to_owned()
    }
}

pub struct ResetHandler {
    manager: Arc<InstanceManager>,
}

impl ResetHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for ResetHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["reset"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        let groups = self.manager.reset()?;
        info!(groups = groups.len(), "host state reset");
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Clear the database and remove every instance lock file".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd reset\n\nLike cvd clear, and also deletes lock files no group records, such as those left by a crashed cvd.\n"
            .to_owned()
    }
}
