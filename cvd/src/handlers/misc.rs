//! Handlers that never touch the database: help, version, noop, login.

use std::fmt::Write as _;
use std::io::Write as _;

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;

use super::{bad_request, expect_no_args};

pub struct HelpHandler;

impl HelpHandler {
    fn summary(ctx: &HandlerContext<'_>) -> String {
        let mut text = String::from(
            "usage: cvd [-verbosity=LEVEL] <command> [-group_name NAME] [-instance_name NAME[,NAME...]] [args...]\n\n\
             Commands:\n",
        );
        let rows: Vec<(String, String)> = ctx
            .sequencer
            .registry()
            .handlers()
            .map(|h| (h.cmd_list().join(", "), h.summary_help()))
            .collect();
        let width = rows.iter().map(|(cmds, _)| cmds.len()).max().unwrap_or(0);
        for (cmds, summary) in rows {
            let _ = writeln!(text, "  {cmds:<width$}  {summary}");
        }
        text.push_str("\nRun \"cvd help <command>\" for details on one command.\n");
        text
    }
}

impl CommandHandler for HelpHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["help"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let text = match request.subcommand_args() {
            [] => Self::summary(ctx),
            [topic, rest @ ..] => {
                let topic_request = CommandRequest::builder().add_arguments([topic.clone()]).build()?;
                ctx.sequencer.registry().resolve(&topic_request)?.detailed_help(rest)
            }
        };
        ctx.out.write_all(text.as_bytes()).map_err(|e| CvdError::io("writing help", e))
    }

    fn summary_help(&self) -> String {
        "Describe the available commands".to_owned()
    }

    fn should_intercept_help(&self) -> bool {
        false
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd help [command]\n\nWithout a command, lists every command. With one, prints its detailed help.\n"
            .to_owned()
    }
}

pub struct VersionHandler;

impl CommandHandler for VersionHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["version"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        expect_no_args(request)?;
        ctx.println(&format!("cvd {}", env!("CARGO_PKG_VERSION")))
    }

    fn summary_help(&self) -> String {
        "Print the cvd version".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd version\n".to_owned()
    }
}

pub struct NoopHandler;

impl CommandHandler for NoopHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["noop"]
    }

    fn handle(&self, _request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        Ok(())
    }

    fn summary_help(&self) -> String {
        "Do nothing".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd noop\n".to_owned()
    }
}

pub struct LoginHandler;

impl CommandHandler for LoginHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["login"]
    }

    fn handle(&self, _request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        Err(bad_request("cvd login is not supported on this host"))
    }

    fn summary_help(&self) -> String {
        "Authenticate with the build server (unsupported)".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd login\n\nNot supported; fetch with credentials passed to cvd fetch instead.\n".to_owned()
    }
}
