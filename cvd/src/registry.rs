//! The handler capability set and the registry that routes requests to
//! exactly one handler.

use std::io::Write;

use indexmap::IndexSet;

use crate::error::CvdError;
use crate::request::CommandRequest;
use crate::sequencer::CommandSequencer;

/// What a handler gets besides its request: the sequencer that invoked it
/// (for nested requests) and the caller's output streams.
pub struct HandlerContext<'a> {
    pub sequencer: &'a CommandSequencer,
    pub out: &'a mut dyn Write,
    pub err: &'a mut dyn Write,
}

impl HandlerContext<'_> {
    /// Run further requests through the same registry, echoing them to
    /// `err`.
    ///
    /// # Errors
    /// The first failing request's error.
    pub fn execute(&mut self, requests: &[CommandRequest]) -> Result<(), CvdError> {
        self.sequencer.execute(requests, &mut *self.out, &mut *self.err)
    }

    /// Write a line to the caller's stdout.
    ///
    /// # Errors
    /// [`CvdError::Io`] if the stream is closed.
    pub fn println(&mut self, line: &str) -> Result<(), CvdError> {
        writeln!(self.out, "{line}").map_err(|e| CvdError::io("writing command output", e))
    }
}

/// One sub-command implementation.
pub trait CommandHandler {
    /// Sub-command tokens this handler owns.
    fn cmd_list(&self) -> Vec<&'static str>;

    fn can_handle(&self, request: &CommandRequest) -> bool {
        request.subcommand().is_some_and(|sub| self.cmd_list().contains(&sub))
    }

    /// Execute the request.
    ///
    /// # Errors
    /// Any failure of the sub-command.
    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError>;

    /// One line for `cvd help`.
    fn summary_help(&self) -> String;

    /// Whether `--help` among the arguments prints
    /// [`detailed_help`](Self::detailed_help) instead of running.
    fn should_intercept_help(&self) -> bool {
        true
    }

    fn detailed_help(&self, args: &[String]) -> String;
}

/// Fixed table of handlers, read-only once built.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("commands", &self.cmd_list()).finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(handlers: Vec<Box<dyn CommandHandler>>) -> Self {
        Self { handlers }
    }

    pub fn register(&mut self, handler: Box<dyn CommandHandler>) {
        self.handlers.push(handler);
    }

    /// Registered handlers in registration order.
    pub fn handlers(&self) -> impl Iterator<Item = &dyn CommandHandler> {
        self.handlers.iter().map(|h| -> &dyn CommandHandler { &**h })
    }

    /// The one handler that claims `request`.
    ///
    /// # Errors
    /// [`CvdError::NoHandler`] if none does, [`CvdError::AmbiguousHandler`]
    /// if several do.
    pub fn resolve(&self, request: &CommandRequest) -> Result<&dyn CommandHandler, CvdError> {
        let subcommand = request.subcommand().unwrap_or_default().to_owned();
        let mut matching = self.handlers().filter(|h| h.can_handle(request));
        match (matching.next(), matching.count()) {
            (None, _) => Err(CvdError::NoHandler { subcommand }),
            (Some(handler), 0) => Ok(handler),
            (Some(_), more) => Err(CvdError::AmbiguousHandler { subcommand, count: more + 1 }),
        }
    }

    /// Union of every handler's tokens, first registration wins the order.
    #[must_use]
    pub fn cmd_list(&self) -> Vec<&'static str> {
        self.handlers().flat_map(|h| h.cmd_list()).collect::<IndexSet<_>>().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Fixed(Vec<&'static str>);

    impl CommandHandler for Fixed {
        fn cmd_list(&self) -> Vec<&'static str> {
            self.0.clone()
        }

        fn handle(&self, _: &CommandRequest, _: &mut HandlerContext<'_>) -> Result<(), CvdError> {
            Ok(())
        }

        fn summary_help(&self) -> String {
            String::new()
        }

        fn detailed_help(&self, _: &[String]) -> String {
            String::new()
        }
    }

    fn request(sub: &str) -> CommandRequest {
        match CommandRequest::builder().add_arguments(["cvd", sub]).build() {
            Ok(r) => r,
            Err(e) => panic!("build failed: {e}"),
        }
    }

    #[test]
    fn resolve_reports_missing_and_ambiguous_handlers() {
        let registry = HandlerRegistry::new(vec![Box::new(Fixed(vec!["a", "b"])), Box::new(Fixed(vec!["b"]))]);
        assert!(registry.resolve(&request("a")).is_ok());
        let none = registry.resolve(&request("zzz")).err().map(|e| e.kind());
        assert_eq!(none, Some(ErrorKind::NoHandler));
        let both = registry.resolve(&request("b")).err().map(|e| e.kind());
        assert_eq!(both, Some(ErrorKind::AmbiguousHandler));
    }

    #[test]
    fn cmd_list_is_deduplicated_union_in_registration_order() {
        let mut registry = HandlerRegistry::default();
        registry.register(Box::new(Fixed(vec!["start", "stop"])));
        registry.register(Box::new(Fixed(vec!["stop", "help"])));
        assert_eq!(registry.cmd_list(), vec!["start", "stop", "help"]);
    }
}
