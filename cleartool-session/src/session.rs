//! Sentinel-framed call/response over an interactive tool's text streams.
//!
//! The tool has no response framing of its own. After every instruction the
//! session writes a sentinel token the tool does not understand; the tool
//! complains about it on stderr, and that complaint marks the end of the
//! previous instruction's output and errors:
//!
//! ```text
//! cd '<working dir>'            (optional)
//! <instruction>
//! <sentinel>
//! ```
//!
//! Everything read from stderr before the sentinel line belongs to the
//! instruction and is classified by [`Command::on_error_line`]; everything
//! read from stdout goes to [`Command::on_output_line`].

use crate::args::Arguments;
use crate::command::Command;
use crate::config::ToolConfig;
use crate::error::{Error, Result};
use crate::launcher::{Launcher, ProcessHandle, SessionIo};
use crate::stream::LineReader;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How a session is going to be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Discard after a single command.
    pub single_use: bool,
    /// Never wait for responses; every command is fire-and-forget.
    pub fire_and_forget: bool,
}

/// One running tool instance and its framing protocol.
pub struct Session {
    id: u64,
    config: Arc<ToolConfig>,
    options: SessionOptions,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stdout: LineReader,
    stderr: LineReader,
    process: ProcessHandle,
    commands_run: usize,
    closed: bool,
}

impl Session {
    /// Launch the tool and wait until it answers the readiness probe.
    pub async fn start(
        launcher: &dyn Launcher,
        config: Arc<ToolConfig>,
        options: SessionOptions,
    ) -> Result<Self> {
        let io = launcher.launch().map_err(|e| Error::ToolUnavailable {
            tool: launcher.tool_name(),
            reason: e.to_string(),
        })?;
        let mut session = Self::from_io(io, config, options);

        let startup_timeout = session.config.startup_timeout();
        match tokio::time::timeout(startup_timeout, session.handshake()).await {
            Ok(Ok(())) => {
                debug!(
                    session = session.id,
                    pid = session.process.id(),
                    "tool session ready"
                );
                Ok(session)
            }
            Ok(Err(e)) => {
                session.interrupt();
                Err(e)
            }
            Err(_) => {
                session.interrupt();
                Err(Error::Protocol(format!(
                    "tool did not answer the readiness probe within {startup_timeout:?}"
                )))
            }
        }
    }

    /// Wrap already-running streams without probing them.
    pub fn from_io(io: SessionIo, config: Arc<ToolConfig>, options: SessionOptions) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            options,
            stdin: Some(io.stdin),
            stdout: LineReader::new("stdout", io.stdout),
            stderr: LineReader::new("stderr", io.stderr),
            process: io.process,
            commands_run: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn is_single_use(&self) -> bool {
        self.options.single_use
    }

    /// Whether the session has been interrupted or quit.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn commands_run(&self) -> usize {
        self.commands_run
    }

    /// The first sentinel must come straight back as the first stderr line.
    async fn handshake(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        self.write_lines(&[config.sentinel.as_str()]).await?;
        let line = loop {
            if let Some(line) = self.stderr.next_line() {
                break line;
            }
            if self.stderr.fill().await? == 0 {
                return Err(Error::Protocol(
                    "stderr closed before the readiness probe was answered".into(),
                ));
            }
        };
        if !line.contains(&config.sentinel) {
            return Err(Error::Protocol(format!(
                "unexpected answer to the readiness probe: {line:?}"
            )));
        }
        Ok(())
    }

    /// Probe whether the tool still answers.
    ///
    /// Drains stray output, sends the sentinel and waits for it on stderr for
    /// at most the probe timeout.
    pub async fn is_valid(&mut self) -> bool {
        if self.closed || self.process.has_exited() {
            return false;
        }
        self.stdout.discard_ready();
        self.stderr.discard_ready();
        if self.stdout.is_eof() || self.stderr.is_eof() {
            return false;
        }

        let probe_timeout = self.config.probe_timeout();
        match tokio::time::timeout(probe_timeout, self.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(session = self.id, "liveness probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(
                    session = self.id,
                    "liveness probe not answered within {:?}", probe_timeout
                );
                false
            }
        }
    }

    async fn probe(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        self.write_lines(&[config.sentinel.as_str()]).await?;
        loop {
            while let Some(line) = self.stderr.next_line() {
                if line.contains(&config.sentinel) {
                    return Ok(());
                }
                trace!(session = self.id, "ignoring stale stderr line: {:?}", line);
            }
            if self.stderr.fill().await? == 0 {
                return Err(Error::Protocol("stderr closed".into()));
            }
        }
    }

    /// Run one command to completion.
    ///
    /// Cancelling `cancel` while the command is in flight tears the session
    /// down and fails the command with [`Error::Cancelled`]. Any error other
    /// than a preparation error leaves the session closed.
    #[instrument(skip_all, fields(session = self.id))]
    pub async fn execute(
        &mut self,
        cmd: &mut dyn Command,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Protocol("session is closed".into()));
        }

        let mut args = Arguments::new();
        cmd.prepare(&mut args)?;
        let command_line = args.to_command_line()?;
        cmd.on_started(&command_line)?;
        self.commands_run += 1;
        debug!("running: {}", command_line);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.exchange(cmd, &command_line) => result,
        };

        if let Err(e) = &result {
            debug!("command failed: {}", e);
            if e.invalidates_session() {
                self.interrupt();
            }
        }
        cmd.on_finished();
        result
    }

    async fn exchange(&mut self, cmd: &mut dyn Command, command_line: &str) -> Result<()> {
        // A previous instruction may have left bytes behind.
        self.stdout.discard_ready();
        self.stderr.discard_ready();

        let config = Arc::clone(&self.config);
        let mut lines = Vec::with_capacity(3);
        if let Some(dir) = cmd.working_dir() {
            let dir = dir.to_string_lossy();
            let escaped = shell_escape::escape(Cow::Borrowed(dir.as_ref())).into_owned();
            lines.push(format!("{} {}", config.cd_instruction, escaped));
        }
        lines.push(command_line.to_string());

        let fire_and_forget = self.options.fire_and_forget || cmd.fire_and_forget();
        if !fire_and_forget {
            lines.push(config.sentinel.clone());
        }
        self.write_lines(&lines).await?;
        if fire_and_forget {
            trace!("fire-and-forget instruction written");
            return Ok(());
        }

        let idle_timeout = cmd.idle_timeout().unwrap_or(config.idle_timeout());
        self.read_response(cmd, &config.sentinel, idle_timeout).await
    }

    async fn read_response(
        &mut self,
        cmd: &mut dyn Command,
        sentinel: &str,
        idle_timeout: std::time::Duration,
    ) -> Result<()> {
        let mut deadline = Instant::now() + idle_timeout;
        loop {
            while let Some(line) = self.stderr.next_line() {
                if line.contains(sentinel) {
                    trace!("response complete");
                    self.drain_trailing_output(cmd);
                    return Ok(());
                }
                trace!("stderr: {}", line);
                cmd.on_error_line(line);
            }
            while let Some(line) = self.stdout.next_line() {
                trace!("stdout: {}", line);
                cmd.on_output_line(line);
            }
            if self.stderr.is_eof() {
                return Err(Error::Protocol(
                    "stderr closed before the command completed".into(),
                ));
            }
            if self.stdout.is_eof() {
                return Err(Error::Protocol(
                    "stdout closed while a command was running".into(),
                ));
            }

            tokio::select! {
                biased;
                read = self.stderr.fill() => {
                    if read? > 0 {
                        deadline = Instant::now() + idle_timeout;
                    }
                }
                read = self.stdout.fill() => {
                    if read? > 0 {
                        deadline = Instant::now() + idle_timeout;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(idle_timeout));
                }
            }
        }
    }

    /// Output written concurrently with the sentinel may still be in flight.
    fn drain_trailing_output(&mut self, cmd: &mut dyn Command) {
        if let Err(e) = self.stdout.fill_ready() {
            debug!("error while draining trailing output: {}", e);
        }
        while let Some(line) = self.stdout.next_line() {
            cmd.on_output_line(line);
        }
        if let Some(rest) = self.stdout.take_partial() {
            cmd.on_output_line(rest);
        }
    }

    async fn write_lines<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Protocol("stdin is closed".into()))?;
        let mut payload = String::new();
        for line in lines {
            payload.push_str(line.as_ref());
            payload.push('\n');
        }
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Ask the tool to exit, give it a moment, then tear everything down.
    pub async fn quit(mut self) {
        if !self.closed {
            let quit = self.config.quit_instruction.clone();
            match self.write_lines(&[quit.as_str()]).await {
                Ok(()) => {
                    let quit_timeout = self.config.quit_timeout();
                    if !self.process.wait_exit(quit_timeout).await {
                        debug!(session = self.id, "tool did not exit within {:?}", quit_timeout);
                    }
                }
                Err(e) => debug!(session = self.id, "failed to send quit: {}", e),
            }
        }
        self.interrupt();
    }

    /// Close all streams and kill the tool without asking.
    pub fn interrupt(&mut self) {
        if self.closed {
            return;
        }
        debug!(session = self.id, "tearing down tool session");
        self.closed = true;
        self.stdin = None;
        self.stdout.close();
        self.stderr.close();
        self.process.kill();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ToolCommand;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    const SENTINEL: &str = "test_sentinel_91c2";

    fn config() -> Arc<ToolConfig> {
        Arc::new(ToolConfig {
            sentinel: SENTINEL.to_string(),
            idle_timeout_ms: 300,
            probe_timeout_ms: 300,
            ..Default::default()
        })
    }

    /// A scripted tool: `respond` maps each instruction line to the
    /// (stdout, stderr) lines written back. Unknown instructions are echoed
    /// on stderr the way the real tool reports them.
    fn scripted<F>(respond: F) -> SessionIo
    where
        F: Fn(&str) -> Option<(Vec<String>, Vec<String>)> + Send + 'static,
    {
        let (stdin, tool_stdin) = tokio::io::duplex(4096);
        let (mut tool_stdout, stdout) = tokio::io::duplex(4096);
        let (mut tool_stderr, stderr) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(tool_stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "quit" {
                    break;
                }
                if line == "hang" {
                    std::future::pending::<()>().await;
                }
                let (out, err) = respond(&line)
                    .unwrap_or_else(|| (vec![], vec![format!("tool: unknown command {line}")]));
                for l in out {
                    write_line(&mut tool_stdout, &l).await;
                }
                for l in err {
                    write_line(&mut tool_stderr, &l).await;
                }
            }
        });
        SessionIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: ProcessHandle::Task(task),
        }
    }

    async fn write_line(stream: &mut DuplexStream, line: &str) {
        let _ = stream.write_all(format!("{line}\n").as_bytes()).await;
    }

    struct ScriptLauncher<F>(F);

    impl<F> Launcher for ScriptLauncher<F>
    where
        F: Fn() -> SessionIo + Send + Sync,
    {
        fn launch(&self) -> std::io::Result<SessionIo> {
            Ok((self.0)())
        }

        fn tool_name(&self) -> String {
            "scripted".into()
        }
    }

    fn echo_tool() -> SessionIo {
        scripted(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["echo", rest @ ..] => Some((vec![rest.join(" ")], vec![])),
                ["fail", rest @ ..] => Some((vec![], vec![format!("Error: {}", rest.join(" "))])),
                ["warn", rest @ ..] => Some((
                    vec![],
                    vec![format!("Warning: {}", rest.join(" "))],
                )),
                ["cd", _] => Some((vec![], vec![])),
                ["pwd"] => Some((vec!["/vobs/main".into()], vec![])),
                _ => None,
            }
        })
    }

    async fn started(io: SessionIo) -> Session {
        let mut session = Session::from_io(io, config(), SessionOptions::default());
        session.handshake().await.expect("handshake");
        session
    }

    #[tokio::test]
    async fn test_echo_completes_without_failure() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["echo", "hi"]);
        session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cmd.output(), ["hi"]);
        assert!(!cmd.has_failed());
        assert!(cmd.record().errors().is_empty());
    }

    #[tokio::test]
    async fn test_error_line_fails_command() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["fail", "no", "such", "element"]);
        session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap();
        assert!(cmd.has_failed());
        assert_eq!(cmd.record().errors(), ["Error: no such element"]);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_benign_stderr_does_not_fail() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["warn", "stale", "view"])
            .benign_stderr(regex::Regex::new("^Warning:").unwrap());
        session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!cmd.has_failed());
        assert_eq!(cmd.record().errors(), ["Warning: stale view"]);
    }

    #[tokio::test]
    async fn test_working_dir_is_sent_first() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["pwd"]).in_dir("/vobs/main");
        session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cmd.output(), ["/vobs/main"]);
        assert!(!cmd.has_failed());
    }

    #[tokio::test]
    async fn test_session_is_reusable() {
        let mut session = started(echo_tool()).await;
        for word in ["one", "two", "three"] {
            let mut cmd = ToolCommand::new(["echo", word]);
            session
                .execute(&mut cmd, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(cmd.output(), [word]);
        }
        assert_eq!(session.commands_run(), 3);
        assert!(session.is_valid().await);
    }

    #[tokio::test]
    async fn test_second_execution_is_rejected() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["echo", "once"]);
        let cancel = CancellationToken::new();
        session.execute(&mut cmd, &cancel).await.unwrap();
        let err = session.execute(&mut cmd, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExecuted));
        assert_eq!(cmd.output(), ["once"]);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["hang"]);
        let start = std::time::Instant::now();
        let err = session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert!(session.is_closed());
        assert!(!session.is_valid().await);
    }

    #[tokio::test]
    async fn test_per_command_timeout_override() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["hang"]).with_idle_timeout(Duration::from_millis(50));
        let start = std::time::Instant::now();
        let err = session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_command() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["hang"]).with_idle_timeout(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = session.execute(&mut cmd, &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(session.is_closed());
        assert_eq!(cmd.record().lifecycle(), crate::command::Lifecycle::Finished);
    }

    #[tokio::test]
    async fn test_stderr_eof_is_protocol_error() {
        let mut session = started(echo_tool()).await;
        // The tool goes away between two instructions.
        session.process.kill();
        let mut cmd = ToolCommand::new(["echo", "late"]);
        let err = session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_) | Error::Io(_)), "{err:?}");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_handshake_rejects_unexpected_answer() {
        let launcher = ScriptLauncher(|| {
            scripted(|_| Some((vec![], vec!["welcome to the tool".into()])))
        });
        let err = Session::start(&launcher, config(), SessionOptions::default())
            .await
            .err()
            .expect("handshake should fail");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_start_reports_launch_failure_as_unavailable() {
        struct Broken;
        impl Launcher for Broken {
            fn launch(&self) -> std::io::Result<SessionIo> {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"))
            }
            fn tool_name(&self) -> String {
                "cleartool".into()
            }
        }
        let err = Session::start(&Broken, config(), SessionOptions::default())
            .await
            .err()
            .expect("launch should fail");
        assert!(err.is_tool_unavailable());
    }

    #[tokio::test]
    async fn test_prepare_error_keeps_session() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::verbatim("echo a\necho b");
        let err = session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Prepare(_)));
        assert_eq!(cmd.record().lifecycle(), crate::command::Lifecycle::NotStarted);
        assert!(!session.is_closed());
        assert!(session.is_valid().await);
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_immediately() {
        let mut session = started(echo_tool()).await;
        let mut cmd = ToolCommand::new(["hang"]).detached();
        tokio::time::timeout(
            Duration::from_secs(1),
            session.execute(&mut cmd, &CancellationToken::new()),
        )
        .await
        .expect("fire-and-forget must not wait")
        .unwrap();
        assert!(!cmd.has_failed());
        assert!(cmd.output().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_invalidates() {
        let mut session = started(echo_tool()).await;
        assert!(session.is_valid().await);
        session.interrupt();
        assert!(!session.is_valid().await);
        let mut cmd = ToolCommand::new(["echo", "x"]);
        assert!(session
            .execute(&mut cmd, &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_quit_stops_tool() {
        let session = Session::start(
            &ScriptLauncher(echo_tool),
            config(),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.quit())
            .await
            .expect("quit should be bounded");
    }
}
