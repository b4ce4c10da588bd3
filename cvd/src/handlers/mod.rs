//! Built-in sub-command handlers and the flag parsing they share.

mod acloud;
mod config;
mod create;
mod host_tool;
mod lifecycle;
mod misc;
mod power;
mod status;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cvd_instances::InstanceManager;

pub use acloud::{translate_acloud, AcloudHandler, TryAcloudHandler};
pub use config::{LintHandler, LoadConfigsHandler};
pub use create::CreateHandler;
pub use host_tool::{HostToolHandler, SnapshotHandler};
pub use lifecycle::{ClearHandler, RemoveHandler, ResetHandler, StartHandler, StopHandler};
pub use misc::{HelpHandler, LoginHandler, NoopHandler, VersionHandler};
pub use power::{PowerHandler, ScreenRecordingHandler};
pub use status::{FleetHandler, StatusHandler};

use crate::error::CvdError;
use crate::registry::CommandHandler;
use crate::request::CommandRequest;

pub const ANDROID_HOST_OUT: &str = "ANDROID_HOST_OUT";
pub const ANDROID_SOONG_HOST_OUT: &str = "ANDROID_SOONG_HOST_OUT";
pub const ANDROID_PRODUCT_OUT: &str = "ANDROID_PRODUCT_OUT";

/// Every built-in handler, in registration order.
#[must_use]
pub fn request_handlers(manager: &Arc<InstanceManager>) -> Vec<Box<dyn CommandHandler>> {
    let m = || Arc::clone(manager);
    vec![
        Box::new(AcloudHandler),
        Box::new(CreateHandler::new(m())),
        Box::new(HostToolHandler::display(m())),
        Box::new(HostToolHandler::env(m())),
        Box::new(HostToolHandler::fetch(m())),
        Box::new(FleetHandler::new(m())),
        Box::new(ClearHandler::new(m())),
        Box::new(HostToolHandler::bugreport(m())),
        Box::new(StopHandler::new(m())),
        Box::new(HelpHandler),
        Box::new(LintHandler),
        Box::new(LoadConfigsHandler),
        Box::new(LoginHandler),
        Box::new(PowerHandler::new(m())),
        Box::new(RemoveHandler::new(m())),
        Box::new(ResetHandler::new(m())),
        Box::new(SnapshotHandler::new(m())),
        Box::new(StartHandler::new(m())),
        Box::new(StatusHandler::new(m())),
        Box::new(TryAcloudHandler),
        Box::new(VersionHandler),
        Box::new(NoopHandler),
        Box::new(ScreenRecordingHandler::new(m())),
    ]
}

/// Sub-command flags in gflags style: `-name=value`, `--name value`,
/// `--name`/`--noname` for booleans. `--` ends flag parsing.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    values: BTreeMap<&'static str, String>,
    bools: BTreeMap<&'static str, bool>,
    pub positional: Vec<String>,
}

impl Flags {
    /// Parse `args` against the known value and boolean flag names.
    pub fn parse(args: &[String], value_flags: &[&'static str], bool_flags: &[&'static str]) -> Result<Self, CvdError> {
        let mut flags = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "--" {
                flags.positional.extend(iter.cloned());
                break;
            }
            let Some(body) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')).filter(|b| !b.is_empty()) else {
                flags.positional.push(arg.clone());
                continue;
            };
            let (name, inline) = match body.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (body, None),
            };
            if let Some(&flag) = value_flags.iter().find(|f| **f == name) {
                let value = match inline {
                    Some(value) => value.to_owned(),
                    None => iter.next().cloned().ok_or_else(|| bad_request(format!("--{flag} needs a value")))?,
                };
                flags.values.insert(flag, value);
            } else if let Some(&flag) = bool_flags.iter().find(|f| **f == name) {
                let value = match inline {
                    None | Some("true") => true,
                    Some("false") => false,
                    Some(other) => return Err(bad_request(format!("--{flag} expects true or false, got \"{other}\""))),
                };
                flags.bools.insert(flag, value);
            } else if let Some(&flag) = name.strip_prefix("no").and_then(|n| bool_flags.iter().find(|f| **f == n)) {
                if inline.is_some() {
                    return Err(bad_request(format!("--no{flag} takes no value")));
                }
                flags.bools.insert(flag, false);
            } else {
                return Err(bad_request(format!("unknown flag \"{arg}\"")));
            }
        }
        Ok(flags)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.bools.get(name).copied()
    }

    pub fn u32(&self, name: &str) -> Result<Option<u32>, CvdError> {
        self.value(name)
            .map(|v| v.parse::<u32>().map_err(|e| bad_request(format!("--{name}=\"{v}\": {e}"))))
            .transpose()
    }

    /// Comma separated list; empty when the flag is absent.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.value(name)
            .filter(|v| !v.is_empty())
            .map(|v| v.split(',').map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn bad_request(message: impl Into<String>) -> CvdError {
    CvdError::BadRequest(message.into())
}

/// Fail when a handler that takes no arguments got some.
pub(crate) fn expect_no_args(request: &CommandRequest) -> Result<(), CvdError> {
    match request.subcommand_args() {
        [] => Ok(()),
        args => Err(bad_request(format!(
            "cvd {} takes no arguments, got \"{}\"",
            request.subcommand().unwrap_or_default(),
            args.join(" ")
        ))),
    }
}

/// Host artifacts directory from the request environment.
pub(crate) fn host_out_from_env(request: &CommandRequest) -> Option<PathBuf> {
    [ANDROID_HOST_OUT, ANDROID_SOONG_HOST_OUT]
        .into_iter()
        .find_map(|key| request.env_var(key).filter(|v| !v.is_empty()))
        .map(PathBuf::from)
}

/// Make `path` absolute against the current directory.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf, CvdError> {
    std::path::absolute(path).map_err(|e| CvdError::io(format!("resolving {}", path.display()), e))
}

/// Build a nested `cvd <args...>` request carrying `parent`'s environment.
pub(crate) fn nested_request<I, S>(parent: &CommandRequest, args: I, selectors: Vec<String>) -> Result<CommandRequest, CvdError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandRequest::builder()
        .add_arguments([crate::request::PROGRAM_NAME.to_owned()])
        .add_arguments(args)
        .add_selector_arguments(selectors)
        .set_env(parent.env().clone())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    fn parse(args: &[&str]) -> Flags {
        match Flags::parse(&strings(args), &["host_path", "num_instances"], &["start"]) {
            Ok(f) => f,
            Err(e) => panic!("parse {args:?} failed: {e}"),
        }
    }

    #[test]
    fn accepts_single_and_double_dash_forms() {
        let flags = parse(&["-host_path=/h", "--num_instances", "2", "pos"]);
        assert_eq!(flags.value("host_path"), Some("/h"));
        assert_eq!(flags.u32("num_instances").ok().flatten(), Some(2));
        assert_eq!(flags.positional, strings(&["pos"]));
    }

    #[test]
    fn boolean_flags_support_negation() {
        assert_eq!(parse(&["--start"]).flag("start"), Some(true));
        assert_eq!(parse(&["--nostart"]).flag("start"), Some(false));
        assert_eq!(parse(&["-start=false"]).flag("start"), Some(false));
        assert_eq!(parse(&[]).flag("start"), None);
    }

    #[test]
    fn double_dash_ends_flags() {
        let flags = parse(&["--", "--start", "x"]);
        assert_eq!(flags.flag("start"), None);
        assert_eq!(flags.positional, strings(&["--start", "x"]));
    }

    #[test]
    fn unknown_and_incomplete_flags_are_bad_requests() {
        for args in [&["--bogus"][..], &["--host_path"], &["--start=maybe"], &["--nostart=1"]] {
            let result = Flags::parse(&strings(args), &["host_path"], &["start"]);
            assert!(matches!(result, Err(CvdError::BadRequest(_))), "{args:?} was accepted");
        }
    }

    #[test]
    fn list_splits_on_commas() {
        let flags = match Flags::parse(&strings(&["--host_path=a,b"]), &["host_path"], &[]) {
            Ok(f) => f,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert_eq!(flags.list("host_path"), strings(&["a", "b"]));
        assert!(flags.list("missing").is_empty());
    }
}
