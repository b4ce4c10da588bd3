//! Turns a process invocation into a request, runs it, and renders failures.

use std::collections::BTreeMap;
use std::io::Write;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::CvdError;
use crate::request::{CommandRequest, PROGRAM_NAME};
use crate::selector::split_selector_args;
use crate::sequencer::CommandSequencer;

/// Log level used when neither `-verbosity` nor `RUST_LOG` is given.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Options consumed by the driver before the subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOptions {
    /// Tracing directive derived from `-verbosity`.
    pub log_level: Option<&'static str>,
    pub help: bool,
}

/// Map a `-verbosity` severity onto a tracing level.
///
/// # Errors
/// [`CvdError::BadRequest`] for an unknown severity.
pub fn verbosity_level(severity: &str) -> Result<&'static str, CvdError> {
    match severity.to_ascii_uppercase().as_str() {
        "VERBOSE" => Ok("trace"),
        "DEBUG" => Ok("debug"),
        "INFO" => Ok("info"),
        "WARNING" => Ok("warn"),
        "ERROR" | "FATAL" => Ok("error"),
        _ => Err(CvdError::BadRequest(format!(
            "unknown verbosity \"{severity}\"; expected VERBOSE, DEBUG, INFO, WARNING, ERROR or FATAL"
        ))),
    }
}

/// Parse `argv` (program name first) into driver options and the request.
///
/// # Errors
/// [`CvdError::BadRequest`] for a bad `-verbosity`, or the selector parser's
/// [`CvdError::BadSelector`].
pub fn parse_invocation(
    argv: &[String],
    env: BTreeMap<String, String>,
) -> Result<(DriverOptions, CommandRequest), CvdError> {
    let mut options = DriverOptions::default();
    let mut rest = argv.get(1..).unwrap_or_default().iter();
    let mut subcommand = None;
    while let Some(arg) = rest.next() {
        let body = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'));
        match body.map(|b| b.split_once('=').unwrap_or((b, ""))) {
            Some(("help", "")) => options.help = true,
            Some(("verbosity", "")) => {
                let level = rest
                    .next()
                    .ok_or_else(|| CvdError::BadRequest("-verbosity needs a value".to_owned()))?;
                options.log_level = Some(verbosity_level(level)?);
            }
            Some(("verbosity", level)) => options.log_level = Some(verbosity_level(level)?),
            _ => {
                subcommand = Some(arg.clone());
                break;
            }
        }
    }
    let remaining: Vec<String> = rest.cloned().collect();

    let builder = CommandRequest::builder().add_arguments([PROGRAM_NAME.to_owned()]).set_env(env);
    let builder = match subcommand {
        Some(sub) if !options.help => {
            let (selectors, args) = split_selector_args(&remaining);
            builder.add_arguments([sub]).add_selector_arguments(selectors).add_arguments(args)
        }
        Some(sub) => builder.add_arguments(["help".to_owned(), sub]).add_arguments(remaining),
        None => builder.add_arguments(["help".to_owned()]),
    };
    Ok((options, builder.build()?))
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(DEFAULT_LOG_LEVEL)));
    // A second call (tests) keeps the first subscriber.
    let _ = fmt()
        .without_time()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One-line rendering of a failure, with a usage pointer for invocation
/// errors. Always ends in a newline.
#[must_use]
pub fn render_error(error: &CvdError, subcommand: Option<&str>) -> String {
    let kind = error.kind();
    let mut text = format!("cvd: {kind}: {error}\n");
    if kind.is_usage_error() {
        match subcommand {
            Some(sub) if sub != "help" => text.push_str(&format!("Run \"cvd help {sub}\" for usage.\n")),
            _ => text.push_str("Run \"cvd help\" for usage.\n"),
        }
    }
    text
}

/// Run one invocation and return the process exit code.
pub fn run(sequencer: &CommandSequencer, request: &CommandRequest, out: &mut dyn Write, err: &mut dyn Write) -> i32 {
    match sequencer.dispatch(request, out, err) {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            let _ = err.write_all(render_error(&e, request.subcommand()).as_bytes());
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("/usr/bin/cvd").chain(args.iter().copied()).map(str::to_owned).collect()
    }

    fn parse(args: &[&str]) -> (DriverOptions, CommandRequest) {
        match parse_invocation(&argv(args), BTreeMap::new()) {
            Ok(parsed) => parsed,
            Err(e) => panic!("parse {args:?} failed: {e}"),
        }
    }

    #[test]
    fn driver_options_precede_subcommand() {
        let (options, request) = parse(&["-verbosity=DEBUG", "stop", "-group_name", "g", "--wait"]);
        assert_eq!(options.log_level, Some("debug"));
        assert_eq!(request.subcommand(), Some("stop"));
        assert_eq!(request.selectors().group_name.as_deref(), Some("g"));
        assert_eq!(request.subcommand_args(), ["--wait".to_owned()]);
    }

    #[test]
    fn verbosity_accepts_separate_value_and_any_case() {
        let (options, _) = parse(&["--verbosity", "warning", "status"]);
        assert_eq!(options.log_level, Some("warn"));
        assert!(parse_invocation(&argv(&["-verbosity=LOUD", "status"]), BTreeMap::new()).is_err());
    }

    #[test]
    fn help_and_empty_invocations_become_help_requests() {
        let (options, request) = parse(&["--help", "start"]);
        assert!(options.help);
        assert_eq!(request.subcommand(), Some("help"));
        assert_eq!(request.subcommand_args(), ["start".to_owned()]);

        let (_, empty) = parse(&[]);
        assert_eq!(empty.subcommand(), Some("help"));
    }

    #[test]
    fn rendered_usage_errors_point_at_help() {
        let text = render_error(&CvdError::BadSelector("bad".to_owned()), Some("stop"));
        assert_eq!(text, "cvd: BAD_SELECTOR: bad\nRun \"cvd help stop\" for usage.\n");
        let other = CvdError::from(cvd_instances::InstancesError::LauncherFailed("x".to_owned()));
        assert_eq!(other.kind(), ErrorKind::LauncherFailed);
        assert_eq!(render_error(&other, Some("start")), "cvd: LAUNCHER_FAILED: launcher failed: x\n");
    }
}
