//! Command execution over a long-lived interactive tool process.
//!
//! The crate keeps one interactive tool process running, frames each
//! command's response with a sentinel token the tool echoes back on stderr,
//! and serializes callers so only one command is in flight at a time:
//! - [`Session`]: one running tool and the framing protocol
//! - [`Client`]: the public facade with synchronous, posted and detached execution
//! - [`Command`] and [`Batch`]: units of work and fail-fast sequences of them
//! - [`ErrorReporter`]: suppression-filtered reporting of failed batches

pub mod args;
pub mod availability;
pub mod batch;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod launcher;
pub mod mockup;
pub mod reporter;
pub mod session;
mod stream;

pub use args::Arguments;
pub use availability::ToolAvailability;
pub use batch::{Batch, CommandRunner, Progress};
pub use client::{Client, ClientBuilder, PostHandle};
pub use command::{Command, CommandListener, CommandRecord, Lifecycle, ToolCommand};
pub use config::{DEFAULT_SENTINEL, ToolConfig};
pub use error::{Error, Result};
pub use launcher::{Launcher, ProcessHandle, ProcessLauncher, SessionIo, launcher_for};
pub use mockup::MockupLauncher;
pub use reporter::{
    ErrorReport, ErrorReporter, ReportOutcome, ReportSink, Severity, SuppressionList, TracingSink,
};
pub use session::{Session, SessionOptions};
