//! The unit of work executed against a tool session.
//!
//! A [`Command`] builds its argument list, classifies its own error-stream
//! lines and accumulates everything the tool printed for it in a
//! [`CommandRecord`]. Commands are single-use.

use crate::args::Arguments;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Observer of a command's lifecycle.
///
/// Callbacks run synchronously on the executing task, in stream order.
pub trait CommandListener: Send + Sync {
    fn on_started(&self, _command_line: &str) {}
    fn on_output(&self, _line: &str) {}
    fn on_error(&self, _line: &str, _is_error: bool) {}
    fn on_finished(&self, _failed: bool) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    NotStarted,
    Running,
    Finished,
}

/// Captured state of one command execution.
#[derive(Default)]
pub struct CommandRecord {
    lifecycle: Lifecycle,
    command_line: Option<String>,
    output: Vec<String>,
    errors: Vec<String>,
    failed: bool,
    error: Option<Error>,
    listeners: Vec<Arc<dyn CommandListener>>,
}

impl fmt::Debug for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecord")
            .field("lifecycle", &self.lifecycle)
            .field("command_line", &self.command_line)
            .field("output", &self.output)
            .field("errors", &self.errors)
            .field("failed", &self.failed)
            .field("error", &self.error)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CommandRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CommandListener>) {
        self.listeners.push(listener);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// The instruction line written to the tool, once prepared.
    pub fn command_line(&self) -> Option<&str> {
        self.command_line.as_deref()
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Every stderr line, including ones not classified as errors.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// The error raised by the surrounding machinery, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn start(&mut self, command_line: &str) -> Result<()> {
        if self.lifecycle != Lifecycle::NotStarted {
            tracing::error!(
                command = command_line,
                "command instance executed twice; commands are single-use"
            );
            return Err(Error::AlreadyExecuted);
        }
        self.lifecycle = Lifecycle::Running;
        self.command_line = Some(command_line.to_string());
        for listener in &self.listeners {
            listener.on_started(command_line);
        }
        Ok(())
    }

    pub fn push_output(&mut self, line: String) {
        for listener in &self.listeners {
            listener.on_output(&line);
        }
        self.output.push(line);
    }

    /// Record a stderr line. The failed flag is set on the first real error
    /// and never cleared.
    pub fn push_error(&mut self, line: String, is_error: bool) {
        for listener in &self.listeners {
            listener.on_error(&line, is_error);
        }
        if is_error {
            self.failed = true;
        }
        self.errors.push(line);
    }

    pub fn finish(&mut self) {
        if self.lifecycle == Lifecycle::Finished {
            return;
        }
        self.lifecycle = Lifecycle::Finished;
        for listener in &self.listeners {
            listener.on_finished(self.failed);
        }
    }

    /// Store an error raised around this command and mark it failed.
    /// The first stored error wins.
    pub fn fail_with(&mut self, error: Error) {
        self.failed = true;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// A unit of work run through a tool session.
///
/// Implementors provide [`Command::prepare`] and access to an embedded
/// [`CommandRecord`]; the lifecycle hooks have default implementations that
/// fill the record.
pub trait Command: Send {
    /// Write the instruction's arguments. Runs before any process interaction.
    fn prepare(&mut self, args: &mut Arguments) -> Result<()>;

    fn record(&self) -> &CommandRecord;

    fn record_mut(&mut self) -> &mut CommandRecord;

    /// Directory the tool changes into before running the instruction.
    fn working_dir(&self) -> Option<&Path> {
        None
    }

    /// Whether a stderr line signals failure. Tools print diagnostic chatter
    /// on stderr too; override to let it through.
    fn is_error_line(&self, _line: &str) -> bool {
        true
    }

    /// Write the instruction without waiting for any response.
    fn fire_and_forget(&self) -> bool {
        false
    }

    /// Override of the session's idle timeout for this command.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    fn on_started(&mut self, command_line: &str) -> Result<()> {
        self.record_mut().start(command_line)
    }

    fn on_output_line(&mut self, line: String) {
        self.record_mut().push_output(line);
    }

    fn on_error_line(&mut self, line: String) {
        let is_error = self.is_error_line(&line);
        self.record_mut().push_error(line, is_error);
    }

    fn on_finished(&mut self) {
        self.record_mut().finish();
    }

    fn has_failed(&self) -> bool {
        self.record().has_failed()
    }

    fn output(&self) -> &[String] {
        self.record().output()
    }

    /// Command line this command is expected to send, rendered without
    /// preparing it. `None` when it is only known after `prepare`.
    fn label(&self) -> Option<String> {
        None
    }

    /// Short human-readable label used in logs and reports.
    fn describe(&self) -> String {
        self.record()
            .command_line()
            .map(str::to_string)
            .or_else(|| self.label())
            .unwrap_or_else(|| "<not prepared>".to_string())
    }
}

/// A general-purpose command assembled from an argument list.
pub struct ToolCommand {
    args: Arguments,
    cwd: Option<PathBuf>,
    benign: Vec<Regex>,
    message: Option<(String, String, String)>,
    message_file: Option<NamedTempFile>,
    fire_and_forget: bool,
    idle_timeout: Option<Duration>,
    record: CommandRecord,
}

impl ToolCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Arguments::new();
        list.extend(args);
        Self::from_arguments(list)
    }

    pub fn from_arguments(args: Arguments) -> Self {
        Self {
            args,
            cwd: None,
            benign: Vec::new(),
            message: None,
            message_file: None,
            fire_and_forget: false,
            idle_timeout: None,
            record: CommandRecord::new(),
        }
    }

    /// A command whose whole instruction line is passed through untouched.
    pub fn verbatim(line: impl Into<String>) -> Self {
        let mut list = Arguments::new();
        list.push_verbatim(line);
        Self::from_arguments(list)
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg);
        self
    }

    pub fn verbatim_arg(mut self, fragment: impl Into<String>) -> Self {
        self.args.push_verbatim(fragment);
        self
    }

    /// Stderr lines matching `pattern` are diagnostics, not failures.
    pub fn benign_stderr(mut self, pattern: Regex) -> Self {
        self.benign.push(pattern);
        self
    }

    /// Attach a message, inline when it fits on one line or via a temp file.
    pub fn message(
        mut self,
        inline_flag: impl Into<String>,
        file_flag: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.message = Some((inline_flag.into(), file_flag.into(), text.into()));
        self
    }

    pub fn detached(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CommandListener>) -> Self {
        self.record.add_listener(listener);
        self
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("fire_and_forget", &self.fire_and_forget)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Command for ToolCommand {
    fn prepare(&mut self, args: &mut Arguments) -> Result<()> {
        *args = self.args.clone();
        if let Some((inline_flag, file_flag, text)) = &self.message {
            self.message_file = args.push_message(inline_flag, file_flag, text)?;
        }
        Ok(())
    }

    fn record(&self) -> &CommandRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut CommandRecord {
        &mut self.record
    }

    fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn is_error_line(&self, line: &str) -> bool {
        !self.benign.iter().any(|pattern| pattern.is_match(line))
    }

    fn fire_and_forget(&self) -> bool {
        self.fire_and_forget
    }

    fn label(&self) -> Option<String> {
        self.args.to_command_line().ok()
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }
}
