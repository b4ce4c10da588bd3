//! Immutable command requests and their builder.

use std::collections::BTreeMap;

use crate::error::CvdError;
use crate::selector::SelectorOptions;

/// Program token that may precede the subcommand in `args`.
pub const PROGRAM_NAME: &str = "cvd";

/// One `cvd` invocation: arguments, environment and parsed selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    selector_args: Vec<String>,
    selectors: SelectorOptions,
}

impl CommandRequest {
    #[must_use]
    pub fn builder() -> CommandRequestBuilder {
        CommandRequestBuilder::default()
    }

    /// All arguments, including the program token when present.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Selector arguments exactly as given.
    #[must_use]
    pub fn selector_args(&self) -> &[String] {
        &self.selector_args
    }

    #[must_use]
    pub fn selectors(&self) -> &SelectorOptions {
        &self.selectors
    }

    fn subcommand_index(&self) -> usize {
        usize::from(self.args.first().is_some_and(|a| a == PROGRAM_NAME))
    }

    /// The subcommand token, skipping a leading `cvd`.
    #[must_use]
    pub fn subcommand(&self) -> Option<&str> {
        self.args.get(self.subcommand_index()).map(String::as_str)
    }

    /// Arguments after the subcommand.
    #[must_use]
    pub fn subcommand_args(&self) -> &[String] {
        self.args.get(self.subcommand_index() + 1..).unwrap_or(&[])
    }

    /// Arguments up to and including the subcommand.
    #[must_use]
    pub fn command_prefix(&self) -> &[String] {
        let end = (self.subcommand_index() + 1).min(self.args.len());
        &self.args[..end]
    }

    /// Value of an environment variable carried by this request.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

/// Accumulates arguments, selector arguments and environment entries.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct CommandRequestBuilder {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    selector_args: Vec<String>,
}

impl CommandRequestBuilder {
    pub fn add_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn add_selector_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selector_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the whole environment.
    pub fn set_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn add_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parse the selector arguments and freeze the request.
    ///
    /// # Errors
    /// [`CvdError::BadSelector`] for an unknown or malformed selector flag,
    /// [`CvdError::BadRequest`] for an empty argument list.
    pub fn build(self) -> Result<CommandRequest, CvdError> {
        if self.args.is_empty() {
            return Err(CvdError::BadRequest("a request needs at least one argument".to_owned()));
        }
        let selectors = SelectorOptions::parse(&self.selector_args)?;
        Ok(CommandRequest { args: self.args, env: self.env, selector_args: self.selector_args, selectors })
    }
}
