//! Starting the interactive tool.
//!
//! A [`Launcher`] hands the session three text streams plus a handle to
//! whatever produces them. The real launcher spawns a process; the mockup
//! launcher runs a simulated tool inside the runtime.

use crate::config::ToolConfig;
use crate::mockup::MockupLauncher;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// The other end of a running tool.
pub enum ProcessHandle {
    Child(Child),
    /// An in-process stand-in, stopped by aborting the task.
    Task(JoinHandle<()>),
}

impl ProcessHandle {
    pub fn has_exited(&mut self) -> bool {
        match self {
            ProcessHandle::Child(child) => !matches!(child.try_wait(), Ok(None)),
            ProcessHandle::Task(task) => task.is_finished(),
        }
    }

    /// Wait up to `timeout` for the tool to exit on its own.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        match self {
            ProcessHandle::Child(child) => {
                matches!(tokio::time::timeout(timeout, child.wait()).await, Ok(Ok(_)))
            }
            ProcessHandle::Task(task) => {
                if task.is_finished() {
                    return true;
                }
                tokio::time::timeout(timeout, task).await.is_ok()
            }
        }
    }

    pub fn kill(&mut self) {
        match self {
            ProcessHandle::Child(child) => {
                if let Err(e) = child.start_kill() {
                    // Already reaped processes report InvalidInput.
                    if e.kind() != io::ErrorKind::InvalidInput {
                        tracing::debug!("failed to kill tool process: {}", e);
                    }
                }
            }
            ProcessHandle::Task(task) => task.abort(),
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            ProcessHandle::Child(child) => child.id(),
            ProcessHandle::Task(_) => None,
        }
    }
}

/// Streams and handle of a freshly started tool.
pub struct SessionIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub process: ProcessHandle,
}

/// Starts a tool instance. Must be called from within a tokio runtime.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> io::Result<SessionIo>;

    /// Name of the tool for diagnostics.
    fn tool_name(&self) -> String;
}

/// Spawns the configured executable with piped standard streams.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: String,
    args: Vec<String>,
    tool_name: String,
}

impl ProcessLauncher {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            tool_name: config.tool_name(),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> io::Result<SessionIo> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        tracing::debug!(
            pid = child.id(),
            "spawned {} {}",
            self.executable,
            self.args.join(" ")
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("failed to capture stderr"))?;

        Ok(SessionIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: ProcessHandle::Child(child),
        })
    }

    fn tool_name(&self) -> String {
        self.tool_name.clone()
    }
}

/// The launcher the configuration asks for: the mockup when a mockup root
/// is configured, the real executable otherwise.
pub fn launcher_for(config: &ToolConfig) -> Arc<dyn Launcher> {
    match &config.mockup_root {
        Some(root) => {
            tracing::debug!("using tool mockup rooted at {}", root.display());
            Arc::new(MockupLauncher::new(root.clone()))
        }
        None => Arc::new(ProcessLauncher::new(config)),
    }
}
