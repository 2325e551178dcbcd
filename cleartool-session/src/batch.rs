//! Fail-fast sequences of commands.

use crate::command::Command;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Runs a single command; implemented by the client on top of its session.
#[async_trait]
pub trait CommandRunner: Send {
    async fn run(&mut self, cmd: &mut dyn Command, cancel: &CancellationToken) -> Result<()>;
}

/// Snapshot of a batch's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    /// The command currently running, by its description.
    pub current: Option<String>,
    pub done: bool,
}

/// An ordered list of commands executed as one unit.
///
/// Execution stops at the first command that raises an error or reports
/// failure; the remaining commands are not started.
pub struct Batch {
    name: String,
    commands: Vec<Box<dyn Command>>,
    failed: Option<usize>,
}

impl Batch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            failed: None,
        }
    }

    pub fn single(command: impl Command + 'static) -> Self {
        Self::new("command").with(command)
    }

    pub fn with(mut self, command: impl Command + 'static) -> Self {
        self.commands.push(Box::new(command));
        self
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Box<dyn Command>] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Box<dyn Command>> {
        self.commands
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Position of the command that stopped the batch.
    pub fn failed_index(&self) -> Option<usize> {
        self.failed
    }

    pub fn failed_command(&self) -> Option<&dyn Command> {
        self.failed.map(|i| self.commands[i].as_ref())
    }

    /// The error stored on the failed command, if one was raised.
    pub fn error(&self) -> Option<&Error> {
        self.failed_command().and_then(|cmd| cmd.record().error())
    }

    pub fn was_cancelled(&self) -> bool {
        self.error().is_some_and(Error::is_cancellation)
    }

    /// Fail the batch before any command ran, e.g. when the worker is gone.
    pub(crate) fn fail_first(&mut self, error: Error) {
        if self.failed.is_some() {
            return;
        }
        if let Some(first) = self.commands.first_mut() {
            first.record_mut().fail_with(error);
            self.failed = Some(0);
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_failed(&mut self, index: usize) {
        self.failed = Some(index);
    }

    /// Execute the commands in order, stopping at the first failure.
    pub async fn run<R>(
        &mut self,
        runner: &mut R,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<Progress>>,
    ) where
        R: CommandRunner + ?Sized,
    {
        let total = self.commands.len();
        let report = |update: Progress| {
            if let Some(tx) = progress {
                tx.send_replace(update);
            }
        };
        report(Progress {
            total,
            ..Default::default()
        });

        for (index, cmd) in self.commands.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                tracing::debug!(batch = %self.name, "cancelled before command {}", index + 1);
                cmd.record_mut().fail_with(Error::Cancelled);
                self.failed = Some(index);
                break;
            }

            let current = cmd.label().unwrap_or_else(|| self.name.clone());
            report(Progress {
                total,
                completed: index,
                current: Some(current),
                done: false,
            });

            let outcome = runner.run(cmd.as_mut(), cancel).await;
            if let Err(e) = outcome {
                tracing::debug!(batch = %self.name, "command {} raised: {}", index + 1, e);
                cmd.record_mut().fail_with(e);
                self.failed = Some(index);
                break;
            }
            if cmd.has_failed() {
                tracing::debug!(batch = %self.name, "command {} reported failure", index + 1);
                self.failed = Some(index);
                break;
            }
        }

        let completed = match self.failed {
            Some(index) => index,
            None => total,
        };
        report(Progress {
            total,
            completed,
            current: None,
            done: true,
        });
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .field("failed", &self.failed)
            .finish()
    }
}
