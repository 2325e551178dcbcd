//! In-process stand-in for the interactive tool.
//!
//! Answers a handful of instructions against a directory tree and reports
//! everything else as unrecognized on stderr, echoing the instruction back.
//! That echo is what lets the sentinel protocol run unchanged against it.

use crate::launcher::{Launcher, ProcessHandle, SessionIo};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct MockupLauncher {
    root: PathBuf,
}

impl MockupLauncher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Launcher for MockupLauncher {
    fn launch(&self) -> io::Result<SessionIo> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mockup root {} is not a directory", self.root.display()),
            ));
        }
        let (stdin, tool_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (tool_stdout, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (tool_stderr, stderr) = tokio::io::duplex(PIPE_CAPACITY);

        let mut tool = MockupTool {
            root: self.root.clone(),
            cwd: self.root.clone(),
        };
        let task = tokio::spawn(async move {
            if let Err(e) = tool.serve(tool_stdin, tool_stdout, tool_stderr).await {
                tracing::debug!("mockup tool stopped: {}", e);
            }
        });

        Ok(SessionIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: ProcessHandle::Task(task),
        })
    }

    fn tool_name(&self) -> String {
        "cleartool-mockup".to_string()
    }
}

enum Reply {
    Out(Vec<String>),
    Err(String),
    Quit,
}

struct MockupTool {
    root: PathBuf,
    cwd: PathBuf,
}

impl MockupTool {
    async fn serve(
        &mut self,
        stdin: DuplexStream,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
    ) -> io::Result<()> {
        let mut lines = BufReader::new(stdin).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.answer(line) {
                Reply::Out(out) => write_lines(&mut stdout, &out).await?,
                Reply::Err(message) => write_lines(&mut stderr, &[message]).await?,
                Reply::Quit => break,
            }
        }
        Ok(())
    }

    fn answer(&mut self, line: &str) -> Reply {
        let words = split_words(line);
        let Some((name, args)) = words.split_first() else {
            return Reply::Out(Vec::new());
        };
        match name.as_str() {
            "quit" | "exit" => Reply::Quit,
            "pwd" => Reply::Out(vec![self.cwd.display().to_string()]),
            "echo" => Reply::Out(vec![args.join(" ")]),
            "cd" => match args.first().map(|dir| self.resolve(dir)) {
                Some(Some(dir)) if dir.is_dir() => {
                    self.cwd = dir;
                    Reply::Out(Vec::new())
                }
                _ => Reply::Err(format!(
                    "cleartool: Error: Unable to change directory to \"{}\".",
                    args.first().map(String::as_str).unwrap_or("")
                )),
            },
            "ls" => {
                let target = args.first().map(String::as_str).unwrap_or(".");
                match self.resolve(target).map(|path| list_dir(&path)) {
                    Some(Ok(entries)) => Reply::Out(entries),
                    _ => Reply::Err(format!(
                        "cleartool: Error: Pathname not found: \"{target}\"."
                    )),
                }
            }
            "cat" => {
                let target = args.first().map(String::as_str).unwrap_or("");
                match self.resolve(target).map(std::fs::read_to_string) {
                    Some(Ok(content)) => Reply::Out(content.lines().map(str::to_string).collect()),
                    _ => Reply::Err(format!(
                        "cleartool: Error: Unable to access \"{target}\"."
                    )),
                }
            }
            _ => Reply::Err(format!(
                "cleartool: Error: Unrecognized command: \"{line}\""
            )),
        }
    }

    /// Resolve `path` against the current directory without leaving the root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let candidate = Path::new(path);
        let mut resolved = if candidate.is_absolute() {
            PathBuf::new()
        } else {
            self.cwd.clone()
        };
        for component in candidate.components() {
            match component {
                Component::RootDir | Component::Prefix(_) => resolved = PathBuf::from("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(part) => resolved.push(part),
            }
        }
        resolved.starts_with(&self.root).then_some(resolved)
    }
}

fn list_dir(path: &Path) -> io::Result<Vec<String>> {
    let mut entries = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

async fn write_lines<W: AsyncWrite + Unpin>(writer: &mut W, lines: &[String]) -> io::Result<()> {
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await
}

/// Split an instruction line into words using POSIX single-quote and
/// backslash rules.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
