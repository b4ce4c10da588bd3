//! Launcher monitor actions: power control and screen recording.

use std::sync::Arc;

use cvd_instances::{InstanceManager, MonitorAction};
use tracing::info;

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;
use crate::selector::{select, SelectionScope};

use super::bad_request;

/// `cvd restart|powerwash|powerbtn`, also spelled `cvd power <action>`.
pub struct PowerHandler {
    manager: Arc<InstanceManager>,
}

impl PowerHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

fn power_action(name: &str) -> Option<MonitorAction> {
    match name {
        "restart" => Some(MonitorAction::Restart),
        "powerwash" => Some(MonitorAction::Powerwash),
        "powerbtn" => Some(MonitorAction::Powerbtn),
        _ => None,
    }
}

impl CommandHandler for PowerHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["power", "restart", "powerwash", "powerbtn"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let (name, rest) = match (request.subcommand(), request.subcommand_args()) {
            (Some("power"), [action, rest @ ..]) => (action.as_str(), rest),
            (Some("power"), []) => return Err(bad_request("usage: cvd power <restart|powerwash|powerbtn>")),
            (sub, rest) => (sub.unwrap_or_default(), rest),
        };
        let action = power_action(name).ok_or_else(|| bad_request(format!("unknown power action \"{name}\"")))?;
        if let Some(extra) = rest.first() {
            return Err(bad_request(format!("unexpected argument \"{extra}\"")));
        }
        let selection = select(self.manager.database(), request, SelectionScope::SingleInstance)?;
        for instance in &selection.instances {
            self.manager.send_action(&selection.group, instance, action)?;
            info!(device = %instance.device_name(selection.group.name()), action = action.as_str(), "action sent");
        }
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Restart, powerwash or press the power button of one device".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd restart|powerwash|powerbtn [-group_name NAME] [-instance_name NAME]\n\
         \x20      cvd power <restart|powerwash|powerbtn> [selectors]\n\n\
         Sends the action to the launcher monitor of one RUNNING instance.\n"
            .to_owned()
    }
}

/// `cvd screen_recording start|stop` on every selected instance.
pub struct ScreenRecordingHandler {
    manager: Arc<InstanceManager>,
}

impl ScreenRecordingHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

impl CommandHandler for ScreenRecordingHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["screen_recording"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let action = match request.subcommand_args() {
            [verb] if verb == "start" => MonitorAction::StartScreenRecording,
            [verb] if verb == "stop" => MonitorAction::StopScreenRecording,
            _ => return Err(bad_request("usage: cvd screen_recording <start|stop>")),
        };
        let selection = select(self.manager.database(), request, SelectionScope::GroupWide)?;
        for instance in &selection.instances {
            self.manager.send_action(&selection.group, instance, action)?;
        }
        info!(group = %selection.group.name(), action = action.as_str(), devices = selection.instances.len(), "screen recording toggled");
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Start or stop recording the screens of the selected devices".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd screen_recording <start|stop> [-group_name NAME] [-instance_name NAME[,NAME...]]\n".to_owned()
    }
}
