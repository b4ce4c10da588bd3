//! Client for the per-instance launcher monitor socket.
//!
//! The monitor listens on `<instance_dir>/launcher_monitor.sock`. A request is
//! one JSON line naming an action; the reply is one line holding a numeric
//! exit code, where `0` means success.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::InstancesError;

/// Socket file name inside an instance directory.
pub const MONITOR_SOCKET_NAME: &str = "launcher_monitor.sock";

/// Actions the launcher monitor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MonitorAction {
    Restart,
    Powerwash,
    Powerbtn,
    StartScreenRecording,
    StopScreenRecording,
}

impl MonitorAction {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Powerwash => "powerwash",
            Self::Powerbtn => "powerbtn",
            Self::StartScreenRecording => "start_screen_recording",
            Self::StopScreenRecording => "stop_screen_recording",
        }
    }
}

#[derive(Serialize)]
struct MonitorRequest {
    action: MonitorAction,
}

/// Build the single-threaded runtime blocking calls into tokio run on.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, InstancesError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| InstancesError::io("starting I/O runtime", e))
}

/// Send `action` to the monitor at `socket` and wait for its exit code.
///
/// # Errors
/// [`InstancesError::LauncherFailed`] if the socket cannot be reached, the
/// reply is not a number, the exit code is non-zero, or no reply arrives
/// within `timeout`.
pub fn send_action(socket: &Path, action: MonitorAction, timeout: Duration) -> Result<(), InstancesError> {
    tracing::debug!(socket = %socket.display(), action = action.as_str(), "sending launcher monitor action");
    let code = runtime()?
        .block_on(async { tokio::time::timeout(timeout, exchange(socket, action)).await })
        .map_err(|_| {
            InstancesError::LauncherFailed(format!(
                "{} did not answer {} within {timeout:?}",
                socket.display(),
                action.as_str()
            ))
        })??;
    if code != 0 {
        return Err(InstancesError::LauncherFailed(format!(
            "{} returned exit code {code}",
            action.as_str()
        )));
    }
    Ok(())
}

async fn exchange(socket: &Path, action: MonitorAction) -> Result<i32, InstancesError> {
    let failed = |what: &str, e: &dyn std::fmt::Display| {
        InstancesError::LauncherFailed(format!("{what} {}: {e}", socket.display()))
    };
    let stream = UnixStream::connect(socket).await.map_err(|e| failed("connect to", &e))?;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_string(&MonitorRequest { action }).map_err(|e| failed("encode request for", &e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.map_err(|e| failed("write to", &e))?;
    writer.flush().await.map_err(|e| failed("flush", &e))?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await.map_err(|e| failed("read from", &e))?;
    reply
        .trim()
        .parse::<i32>()
        .map_err(|e| failed(&format!("unexpected reply {:?} from", reply.trim()), &e))
}
