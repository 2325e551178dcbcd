use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while preparing, running or reporting tool commands.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// The interactive tool process could not be started at all.
    ///
    /// Sticky for the lifetime of the owning [`crate::ToolAvailability`].
    #[error("{tool} is not available: {reason}")]
    #[diagnostic(
        code(cleartool::unavailable),
        help("check that the executable exists and can be started, or set CLEARTOOL_EXECUTABLE")
    )]
    ToolUnavailable { tool: String, reason: String },

    /// The tool's streams did not follow the sentinel framing.
    #[error("protocol violation: {0}")]
    #[diagnostic(code(cleartool::protocol))]
    Protocol(String),

    /// No stream progress within the idle window.
    #[error("no output from the tool for {0:?}")]
    #[diagnostic(code(cleartool::timeout))]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("command was cancelled")]
    #[diagnostic(code(cleartool::cancelled))]
    Cancelled,

    /// The command could not build its argument list.
    #[error("failed to prepare command: {0}")]
    #[diagnostic(code(cleartool::prepare))]
    Prepare(String),

    /// A command instance was executed a second time.
    #[error("command has already been executed")]
    #[diagnostic(
        code(cleartool::already_executed),
        help("commands are single-use, construct a new one")
    )]
    AlreadyExecuted,

    #[error("I/O error while talking to the tool: {0}")]
    #[diagnostic(code(cleartool::io))]
    Io(#[from] std::io::Error),

    /// The client's worker task is no longer running.
    #[error("client worker has stopped")]
    #[diagnostic(code(cleartool::worker_gone))]
    WorkerGone,

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(cleartool::config))]
    Config(String),
}

impl Error {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_tool_unavailable(&self) -> bool {
        matches!(self, Error::ToolUnavailable { .. })
    }

    /// Whether the session that produced this error must be torn down.
    ///
    /// Errors raised before any process interaction leave the session usable.
    pub fn invalidates_session(&self) -> bool {
        !matches!(
            self,
            Error::Prepare(_) | Error::AlreadyExecuted | Error::Config(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
