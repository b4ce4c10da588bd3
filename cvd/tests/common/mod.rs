//! Shared fixtures: a runtime directory, host artifacts with
//! `bin/launch_cvd`, and a launcher that records calls instead of booting.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cvd::handlers::request_handlers;
use cvd::{CommandRequest, CommandSequencer, HandlerRegistry};
use cvd_core::{Group, Instance};
use cvd_instances::{
    CreateGroupParams, InstanceManager, InstanceParams, InstancesError, LauncherControl, MonitorAction,
    RuntimeLayout, ToolInvocation,
};

#[derive(Debug, Default)]
pub struct RecordingLauncher {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingLauncher {
    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl LauncherControl for RecordingLauncher {
    fn launch(&self, group: &Group) -> Result<(), InstancesError> {
        self.record(format!("launch {}", group.name()));
        Ok(())
    }

    fn stop(&self, group: &Group) -> Result<(), InstancesError> {
        self.record(format!("stop {}", group.name()));
        Ok(())
    }

    fn send_action(&self, group: &Group, instance: &Instance, action: MonitorAction) -> Result<(), InstancesError> {
        self.record(format!("{} {}", action.as_str(), instance.device_name(group.name())));
        Ok(())
    }

    fn run_tool(&self, invocation: &ToolInvocation) -> Result<(), InstancesError> {
        let name = invocation.program.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.record(format!("run {name} {}", invocation.args.join(" ")));
        Ok(())
    }
}

pub struct Host {
    pub runtime: tempfile::TempDir,
    pub artifacts: tempfile::TempDir,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub manager: Arc<InstanceManager>,
}

impl Host {
    pub fn new() -> Self {
        let runtime = tempfile::tempdir().expect("runtime dir");
        let artifacts = tempfile::tempdir().expect("artifacts dir");
        fs::create_dir_all(artifacts.path().join("bin")).expect("create bin");
        fs::write(artifacts.path().join("bin/launch_cvd"), b"").expect("write launch_cvd");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let launcher = RecordingLauncher { calls: Arc::clone(&calls) };
        let manager = Arc::new(InstanceManager::from_layout(
            RuntimeLayout::new(runtime.path()),
            Duration::from_secs(1),
            Box::new(launcher),
        ));
        Self { runtime, artifacts, calls, manager }
    }

    pub fn artifacts_path(&self) -> &Path {
        self.artifacts.path()
    }

    /// Register a group without starting it.
    pub fn add_group(&self, name: &str, instances: &[(u32, &str)]) -> Group {
        let params = instances
            .iter()
            .map(|(id, n)| InstanceParams::new(Some(*id), Some((*n).to_owned())))
            .collect();
        let mut params = CreateGroupParams::new(self.artifacts.path(), params);
        params.group_name = Some(name.to_owned());
        self.manager.create_group(params).expect("create group")
    }

    /// A sequencer over every built-in handler.
    pub fn sequencer(&self) -> CommandSequencer {
        CommandSequencer::new(HandlerRegistry::new(request_handlers(&self.manager)), BTreeMap::new())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

/// Build a `cvd <args>` request with selector args and env.
pub fn request(args: &[&str], selectors: &[&str], env: &[(&str, &str)]) -> CommandRequest {
    env.iter()
        .fold(
            CommandRequest::builder()
                .add_arguments(["cvd"])
                .add_arguments(args.iter().copied())
                .add_selector_arguments(selectors.iter().copied()),
            |b, (k, v)| b.add_env_var(*k, *v),
        )
        .build()
        .expect("build request")
}

/// Run `request` through `sequencer`, returning (result, stdout, stderr).
pub fn run(
    sequencer: &CommandSequencer,
    request: &CommandRequest,
) -> (Result<(), cvd::CvdError>, String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let result = sequencer.dispatch(request, &mut out, &mut err);
    (
        result,
        String::from_utf8(out).expect("utf-8 stdout"),
        String::from_utf8(err).expect("utf-8 stderr"),
    )
}
