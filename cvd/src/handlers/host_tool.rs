//! Handlers that delegate to a host tool binary: fetch, display, env,
//! bugreport and snapshot.

use std::sync::Arc;

use cvd_instances::{InstanceManager, ToolInvocation};

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;
use crate::selector::{select, select_group, SelectionScope};

use super::{bad_request, host_out_from_env};

/// Runs `bin/<tool>` with the subcommand's arguments passed through.
pub struct HostToolHandler {
    manager: Arc<InstanceManager>,
    command: &'static str,
    tool: &'static str,
    summary: &'static str,
    /// Run from the selected group's artifacts instead of `$ANDROID_HOST_OUT`.
    group_bound: bool,
}

impl HostToolHandler {
    #[must_use]
    pub fn fetch(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            command: "fetch",
            tool: "fetch_cvd",
            summary: "Download device images and host tools",
            group_bound: false,
        }
    }

    #[must_use]
    pub fn display(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            command: "display",
            tool: "cvd_internal_display",
            summary: "Add, list or remove displays of a running device",
            group_bound: true,
        }
    }

    #[must_use]
    pub fn env(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            command: "env",
            tool: "cvd_internal_env",
            summary: "Query or change the virtual environment of a device",
            group_bound: true,
        }
    }

    #[must_use]
    pub fn bugreport(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            command: "bugreport",
            tool: "cvd_host_bugreport",
            summary: "Collect host logs of a group into a zip file",
            group_bound: true,
        }
    }
}

impl CommandHandler for HostToolHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec![self.command]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let args = request.subcommand_args();
        if self.group_bound {
            let group = select_group(self.manager.database(), request)?;
            self.manager.run_group_tool(&group, self.tool, args)?;
            return Ok(());
        }
        let host = host_out_from_env(request)
            .ok_or_else(|| bad_request(format!("cvd {} needs ANDROID_HOST_OUT to locate {}", self.command, self.tool)))?;
        let mut invocation = ToolInvocation::new(host.join("bin").join(self.tool)).args(args.iter().cloned());
        if let Some(home) = request.env_var("HOME") {
            invocation = invocation.env("HOME", home);
        }
        self.manager.launcher().run_tool(&invocation)?;
        Ok(())
    }

    fn summary_help(&self) -> String {
        self.summary.to_owned()
    }

    /// The tool prints its own help.
    fn should_intercept_help(&self) -> bool {
        false
    }

    fn detailed_help(&self, _: &[String]) -> String {
        format!("usage: cvd {} [selectors] [args...]\n\nRuns {} with the given arguments.\n", self.command, self.tool)
    }
}

const SNAPSHOT_TOOL: &str = "snapshot_util_cvd";

/// `cvd suspend|resume|snapshot_take`, also spelled `cvd snapshot <verb>`.
pub struct SnapshotHandler {
    manager: Arc<InstanceManager>,
}

impl SnapshotHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

fn snapshot_subcmd(verb: &str) -> Option<&'static str> {
    match verb {
        "suspend" => Some("suspend"),
        "resume" => Some("resume"),
        "take" | "snapshot_take" => Some("snapshot_take"),
        _ => None,
    }
}

impl CommandHandler for SnapshotHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["snapshot", "suspend", "resume", "snapshot_take"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let (verb, rest) = match (request.subcommand(), request.subcommand_args()) {
            (Some("snapshot"), [verb, rest @ ..]) => (verb.as_str(), rest),
            (Some("snapshot"), []) => return Err(bad_request("usage: cvd snapshot <suspend|resume|take>")),
            (sub, rest) => (sub.unwrap_or_default(), rest),
        };
        let subcmd = snapshot_subcmd(verb).ok_or_else(|| bad_request(format!("unknown snapshot verb \"{verb}\"")))?;
        let selection = select(self.manager.database(), request, SelectionScope::GroupWide)?;
        let ids: Vec<String> = selection.instances.iter().map(|i| i.id().to_string()).collect();
        let mut args = vec![format!("--subcmd={subcmd}"), format!("--instance_nums={}", ids.join(","))];
        args.extend(rest.iter().cloned());
        self.manager.run_group_tool(&selection.group, SNAPSHOT_TOOL, &args)?;
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Suspend, resume or snapshot the devices of a group".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd suspend|resume|snapshot_take [selectors] [--snapshot_path DIR]\n\
         \x20      cvd snapshot <suspend|resume|take> [selectors] [args...]\n\n\
         Runs snapshot_util_cvd for the selected instances.\n"
            .to_owned()
    }
}
