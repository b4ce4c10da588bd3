//! Runs requests through the handler registry in order, echoing each one as
//! a reproducible shell command.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::CvdError;
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::request::CommandRequest;

const BANNER: &str = "****************************************";

/// Quote `value` for a POSIX shell when it holds anything outside
/// `[A-Za-z0-9_.,/-]`.
#[must_use]
pub fn shell_escape(value: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_.,/-".contains(c);
    if !value.is_empty() && value.chars().all(safe) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(format!("'{}'", value.replace('\'', "\\'")))
}

/// The echo of `request`: a banner line, then the command in backticks.
/// Environment entries already present in `process_env` with the same value
/// are left out.
#[must_use]
pub fn format_command(request: &CommandRequest, process_env: &BTreeMap<String, String>) -> String {
    let mut line = format!("{BANNER}\nExecuting `");
    for (key, value) in request.env() {
        if process_env.get(key) != Some(value) {
            line.push_str(&shell_escape(&format!("{key}={value}")));
            line.push(' ');
        }
    }
    let words = request
        .command_prefix()
        .iter()
        .chain(request.selector_args())
        .chain(request.subcommand_args());
    for word in words {
        line.push_str(&shell_escape(word));
        line.push(' ');
    }
    if line.ends_with(' ') {
        line.pop();
    }
    line.push_str("`\n");
    line
}

/// Sequential executor over a fixed [`HandlerRegistry`].
pub struct CommandSequencer {
    registry: HandlerRegistry,
    process_env: BTreeMap<String, String>,
    handler_stack: RefCell<Vec<String>>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for CommandSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSequencer")
            .field("registry", &self.registry)
            .field("handler_stack", &self.handler_stack)
            .finish_non_exhaustive()
    }
}

impl CommandSequencer {
    /// `process_env` is the environment echoes are compared against.
    #[must_use]
    pub fn new(registry: HandlerRegistry, process_env: BTreeMap<String, String>) -> Self {
        Self {
            registry,
            process_env,
            handler_stack: RefCell::new(Vec::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share `cancel` with a signal handler.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn process_env(&self) -> &BTreeMap<String, String> {
        &self.process_env
    }

    #[must_use]
    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    /// Subcommands currently executing, outermost first.
    #[must_use]
    pub fn handler_stack(&self) -> Vec<String> {
        self.handler_stack.borrow().clone()
    }

    /// Union of every registered handler's tokens.
    #[must_use]
    pub fn cmd_list(&self) -> Vec<&'static str> {
        self.registry.cmd_list()
    }

    /// Execute `requests` in order, stopping at the first failure.
    ///
    /// Each request is echoed to `report` before it runs; handler output goes
    /// to `out`. The cancellation flag is checked before every request.
    ///
    /// # Errors
    /// [`CvdError::Cancelled`] once the flag is set, the dispatcher's
    /// resolution errors, or the failing handler's error.
    pub fn execute(
        &self,
        requests: &[CommandRequest],
        out: &mut dyn Write,
        report: &mut dyn Write,
    ) -> Result<(), CvdError> {
        for request in requests {
            if self.cancel.load(Ordering::SeqCst) {
                info!("command sequence interrupted");
                return Err(CvdError::Cancelled);
            }
            report
                .write_all(format_command(request, &self.process_env).as_bytes())
                .map_err(|e| CvdError::io("writing command echo", e))?;
            self.dispatch(request, out, report)?;
        }
        Ok(())
    }

    /// [`execute`](Self::execute) for a single request.
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub fn execute_one(
        &self,
        request: &CommandRequest,
        out: &mut dyn Write,
        report: &mut dyn Write,
    ) -> Result<(), CvdError> {
        self.execute(std::slice::from_ref(request), out, report)
    }

    /// Resolve and run one request without echoing it. The driver uses this
    /// for the user's own invocation.
    ///
    /// # Errors
    /// The dispatcher's resolution errors or the handler's error, prefixed
    /// with the subcommand.
    pub fn dispatch(
        &self,
        request: &CommandRequest,
        out: &mut dyn Write,
        report: &mut dyn Write,
    ) -> Result<(), CvdError> {
        let handler = self.registry.resolve(request)?;
        let subcommand = request.subcommand().unwrap_or_default().to_owned();
        let wants_help = request.subcommand_args().iter().any(|a| a == "--help" || a == "-help");
        if wants_help && handler.should_intercept_help() {
            return out
                .write_all(handler.detailed_help(request.subcommand_args()).as_bytes())
                .map_err(|e| CvdError::io("writing help", e));
        }

        self.handler_stack.borrow_mut().push(subcommand.clone());
        debug!(subcommand = %subcommand, depth = self.handler_stack.borrow().len(), "dispatching");
        let mut ctx = HandlerContext { sequencer: self, out, err: report };
        let result = handler.handle(request, &mut ctx);
        self.handler_stack.borrow_mut().pop();

        result.map_err(|e| match e {
            CvdError::Cancelled | CvdError::Context { .. } => e,
            e => e.context(format!("cvd {subcommand}")),
        })
    }
}
