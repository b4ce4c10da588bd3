//! Control of the processes that actually run a group's devices.
//!
//! Booting, stopping and talking to a device happen outside this crate, in
//! the host tools shipped with the group's artifacts. [`LauncherControl`] is
//! the seam: [`HostToolLauncher`] drives the real tools, tests substitute a
//! recording fake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use cvd_core::{Group, Instance};
use tokio::process::Command;

use crate::monitor::{self, MonitorAction, MONITOR_SOCKET_NAME};
use crate::InstancesError;

/// Default time allowed for the launcher monitor to answer.
pub const DEFAULT_LAUNCHER_TIMEOUT: Duration = Duration::from_secs(30);

/// One run of an external host tool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ToolInvocation {
    /// Binary to execute.
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Variables added to the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ToolInvocation {
    /// Run `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), env: BTreeMap::new() }
    }

    /// Run `bin/<tool>` from the group's host artifacts with `HOME` pointed at
    /// the group's home directory.
    #[must_use]
    pub fn for_group(group: &Group, tool: &str) -> Self {
        Self::new(group.host_tool(tool))
            .env("HOME", group.home_directory().display().to_string())
            .env("ANDROID_HOST_OUT", group.host_artifacts_path().display().to_string())
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn display_name(&self) -> String {
        self.program
            .file_name()
            .map_or_else(|| self.program.display().to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// Everything the instance manager and handlers need from the device side.
pub trait LauncherControl: Send + Sync {
    /// Boot every instance of `group`, returning once they are up.
    ///
    /// # Errors
    /// [`InstancesError::LauncherFailed`] if the devices do not boot.
    fn launch(&self, group: &Group) -> Result<(), InstancesError>;

    /// Shut every instance of `group` down.
    ///
    /// # Errors
    /// [`InstancesError::LauncherFailed`] if the stop tool fails.
    fn stop(&self, group: &Group) -> Result<(), InstancesError>;

    /// Ask one instance's launcher monitor to perform `action`.
    ///
    /// # Errors
    /// [`InstancesError::LauncherFailed`] on a non-zero exit code or timeout.
    fn send_action(&self, group: &Group, instance: &Instance, action: MonitorAction) -> Result<(), InstancesError>;

    /// Run an arbitrary host tool with inherited standard streams.
    ///
    /// # Errors
    /// [`InstancesError::LauncherFailed`] if the tool cannot start or exits
    /// unsuccessfully.
    fn run_tool(&self, invocation: &ToolInvocation) -> Result<(), InstancesError>;
}

/// [`LauncherControl`] backed by `launch_cvd`, `stop_cvd` and the launcher
/// monitor socket.
#[derive(Debug, Clone)]
pub struct HostToolLauncher {
    monitor_timeout: Duration,
}

impl HostToolLauncher {
    /// Wait at most `monitor_timeout` for launcher monitor replies.
    #[must_use]
    pub fn new(monitor_timeout: Duration) -> Self {
        Self { monitor_timeout }
    }
}

impl Default for HostToolLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCHER_TIMEOUT)
    }
}

impl LauncherControl for HostToolLauncher {
    fn launch(&self, group: &Group) -> Result<(), InstancesError> {
        let ids = group.instance_ids();
        let instance_nums = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let mut invocation = ToolInvocation::for_group(group, "launch_cvd").args([
            "--daemon".to_owned(),
            format!("--num_instances={}", ids.len()),
            format!("--instance_nums={instance_nums}"),
        ]);
        if let Some(product) = group.product_out_path() {
            invocation = invocation
                .args([format!("--system_image_dir={}", product.display())])
                .env("ANDROID_PRODUCT_OUT", product.display().to_string());
        }
        tracing::info!(group = %group.name(), instance_nums = %instance_nums, "launching devices");
        self.run_tool(&invocation)
    }

    fn stop(&self, group: &Group) -> Result<(), InstancesError> {
        tracing::info!(group = %group.name(), "stopping devices");
        self.run_tool(&ToolInvocation::for_group(group, "stop_cvd"))
    }

    fn send_action(&self, group: &Group, instance: &Instance, action: MonitorAction) -> Result<(), InstancesError> {
        let socket = group.instance_dir(instance.id()).join(MONITOR_SOCKET_NAME);
        tracing::info!(
            group = %group.name(),
            instance = %instance.name(),
            action = action.as_str(),
            "sending launcher monitor action"
        );
        monitor::send_action(&socket, action, self.monitor_timeout)
    }

    fn run_tool(&self, invocation: &ToolInvocation) -> Result<(), InstancesError> {
        let name = invocation.display_name();
        tracing::debug!(program = %invocation.program.display(), args = ?invocation.args, "running host tool");
        let status = monitor::runtime()?.block_on(async {
            Command::new(&invocation.program)
                .args(&invocation.args)
                .envs(&invocation.env)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .status()
                .await
        });
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(InstancesError::LauncherFailed(format!("{name} exited with {status}"))),
            Err(e) => Err(InstancesError::LauncherFailed(format!("failed to run {name}: {e}"))),
        }
    }
}
