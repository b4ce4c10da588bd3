//! The `cvd` command-line driver.
//!
//! An invocation becomes a [`request::CommandRequest`], the
//! [`registry::HandlerRegistry`] routes it to exactly one handler, and the
//! [`sequencer::CommandSequencer`] runs any follow-up requests a handler
//! issues. Handlers find their targets through the [`selector`] flags and
//! act through [`cvd_instances::InstanceManager`].

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod driver;
pub mod env_spec;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod request;
pub mod selector;
pub mod sequencer;

pub use config::CvdConfig;
pub use error::{CvdError, ErrorKind};
pub use registry::{CommandHandler, HandlerContext, HandlerRegistry};
pub use request::{CommandRequest, CommandRequestBuilder};
pub use selector::{select, select_group, Selection, SelectionScope, SelectorOptions};
pub use sequencer::CommandSequencer;
