//! Turning failed batches into user-facing reports.
//!
//! The reporter is the only place that talks to the UI collaborator. It
//! assembles the failed command's messages, drops the ones matched by the
//! suppression list and hands the rest to a [`ReportSink`].

use crate::batch::Batch;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What the UI collaborator is asked to display. `messages` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub title: String,
    pub prompt: String,
    pub messages: Vec<String>,
    pub severity: Severity,
}

/// Displays error reports, e.g. in a dialog or on a terminal.
pub trait ReportSink: Send + Sync {
    fn show(&self, report: ErrorReport);
}

/// Default sink: logs reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn show(&self, report: ErrorReport) {
        let messages = report.messages.join("\n");
        match report.severity {
            Severity::Info => tracing::info!("{}: {}\n{}", report.title, report.prompt, messages),
            Severity::Warning => {
                tracing::warn!("{}: {}\n{}", report.title, report.prompt, messages)
            }
            Severity::Error => {
                tracing::error!("{}: {}\n{}", report.title, report.prompt, messages)
            }
        }
    }
}

/// Compiled suppression patterns.
#[derive(Debug, Clone, Default)]
pub struct SuppressionList {
    patterns: Vec<Regex>,
}

impl SuppressionList {
    /// Parse one pattern per line. Blank lines and `#` comments are skipped,
    /// invalid patterns are skipped with a warning.
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match Regex::new(line) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("ignoring invalid suppression pattern {:?}: {}", line, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_suppressed(&self, message: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(message))
    }

    /// Keep the messages no pattern matches, in order.
    pub fn filter(&self, messages: Vec<String>) -> Vec<String> {
        messages
            .into_iter()
            .filter(|m| !self.is_suppressed(m))
            .collect()
    }
}

/// What [`ErrorReporter::report_batch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The sink was called with this many messages.
    Shown(usize),
    /// Every message was matched by the suppression list.
    Suppressed,
    /// The failed command produced no non-blank message.
    Empty,
    /// The tool could not be started; logged, never shown.
    ToolUnavailable,
    /// The batch was cancelled by the caller.
    Cancelled,
    /// Nothing to report.
    NotFailed,
}

pub struct ErrorReporter {
    sink: Box<dyn ReportSink>,
    suppression_path: Mutex<Option<PathBuf>>,
    suppression: OnceCell<SuppressionList>,
    unavailable_logged: AtomicBool,
}

impl ErrorReporter {
    pub fn new(sink: Box<dyn ReportSink>, suppression_path: Option<PathBuf>) -> Self {
        Self {
            sink,
            suppression_path: Mutex::new(suppression_path),
            suppression: OnceCell::new(),
            unavailable_logged: AtomicBool::new(false),
        }
    }

    /// The configured suppression file, cleared after a failed load.
    pub fn suppression_path(&self) -> Option<PathBuf> {
        self.suppression_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The suppression list, loaded on first use.
    pub fn suppression(&self) -> &SuppressionList {
        self.suppression.get_or_init(|| {
            let mut path = self
                .suppression_path
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(file) = path.as_ref() else {
                return SuppressionList::default();
            };
            match SuppressionList::load(file) {
                Ok(list) => {
                    tracing::debug!(
                        "loaded {} suppression patterns from {}",
                        list.len(),
                        file.display()
                    );
                    list
                }
                Err(e) => {
                    tracing::debug!(
                        "suppression file {} unavailable, disabling suppression: {}",
                        file.display(),
                        e
                    );
                    *path = None;
                    SuppressionList::default()
                }
            }
        })
    }

    /// Report the failed command of `batch`, if any.
    pub fn report_batch(&self, batch: &Batch) -> ReportOutcome {
        let Some(failed) = batch.failed_command() else {
            return ReportOutcome::NotFailed;
        };
        let error = failed.record().error();

        if let Some(e) = error {
            if e.is_cancellation() {
                tracing::debug!("not reporting cancelled batch {}", batch.name());
                return ReportOutcome::Cancelled;
            }
            if e.is_tool_unavailable() {
                if !self.unavailable_logged.swap(true, Ordering::AcqRel) {
                    tracing::debug!("not reporting: {}", e);
                }
                return ReportOutcome::ToolUnavailable;
            }
        }

        let mut messages = Vec::with_capacity(failed.record().errors().len() + 1);
        if let Some(e) = error {
            messages.push(e.to_string());
        }
        messages.extend(failed.record().errors().iter().cloned());
        messages.retain(|m| !m.trim().is_empty());
        if messages.is_empty() {
            return ReportOutcome::Empty;
        }

        let messages = self.suppression().filter(messages);
        if messages.is_empty() {
            tracing::debug!("all messages of batch {} are suppressed", batch.name());
            return ReportOutcome::Suppressed;
        }

        let count = messages.len();
        self.sink.show(ErrorReport {
            title: format!("{} failed", batch.name()),
            prompt: format!("Command failed: {}", failed.describe()),
            messages,
            severity: Severity::Error,
        });
        ReportOutcome::Shown(count)
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("suppression_path", &self.suppression_path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, ToolCommand};
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct RecordingSink(Arc<Mutex<Vec<ErrorReport>>>);

    impl RecordingSink {
        fn reports(&self) -> Vec<ErrorReport> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ReportSink for RecordingSink {
        fn show(&self, report: ErrorReport) {
            self.0.lock().unwrap().push(report);
        }
    }

    fn failed_batch(error_lines: &[&str], error: Option<Error>) -> Batch {
        let mut cmd = ToolCommand::new(["checkout", "-nc", "foo.c"]);
        cmd.on_started("checkout -nc foo.c").unwrap();
        for line in error_lines {
            cmd.on_error_line(line.to_string());
        }
        if let Some(e) = error {
            cmd.record_mut().fail_with(e);
        }
        cmd.on_finished();
        let mut batch = Batch::new("checkout");
        batch.push(Box::new(cmd));
        batch.mark_failed(0);
        batch
    }

    fn reporter_with(patterns: Option<&str>) -> (ErrorReporter, RecordingSink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = patterns.map(|content| {
            let path = dir.path().join("suppress.txt");
            std::fs::write(&path, content).unwrap();
            path
        });
        let sink = RecordingSink::default();
        (ErrorReporter::new(Box::new(sink.clone()), path), sink, dir)
    }

    #[test]
    fn test_parse_skips_comments_and_invalid() {
        let list = SuppressionList::parse("# comment\n\n^ok$\n(unclosed\nstale view\n");
        assert_eq!(list.len(), 2);
        assert!(list.is_suppressed("ok"));
        assert!(list.is_suppressed("Warning: stale view detected"));
        assert!(!list.is_suppressed("ok then"));
    }

    #[test]
    fn test_all_suppressed_is_not_shown() {
        let (reporter, sink, _dir) = reporter_with(Some("^M$"));
        let batch = failed_batch(&["M"], None);
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Suppressed);
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_unsuppressed_messages_are_shown() {
        let (reporter, sink, _dir) = reporter_with(Some("^M$"));
        let batch = failed_batch(&["M", "N"], None);
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Shown(1));
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].messages, vec!["N".to_string()]);
        assert_eq!(reports[0].severity, Severity::Error);
        assert_eq!(reports[0].prompt, "Command failed: checkout -nc foo.c");
    }

    #[test]
    fn test_stored_error_comes_first() {
        let (reporter, sink, _dir) = reporter_with(None);
        let batch = failed_batch(
            &["cleartool: Error: locked"],
            Some(Error::Protocol("stdout closed".into())),
        );
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Shown(2));
        assert_eq!(
            sink.reports()[0].messages,
            vec![
                "protocol violation: stdout closed".to_string(),
                "cleartool: Error: locked".to_string(),
            ]
        );
    }

    #[test]
    fn test_blank_messages_are_not_shown() {
        let (reporter, sink, _dir) = reporter_with(None);
        let batch = failed_batch(&["", "   "], None);
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Empty);
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_tool_unavailable_is_never_shown() {
        let (reporter, sink, _dir) = reporter_with(None);
        let unavailable = || Error::ToolUnavailable {
            tool: "cleartool".into(),
            reason: "not found".into(),
        };
        for _ in 0..2 {
            let batch = failed_batch(&[], Some(unavailable()));
            assert_eq!(reporter.report_batch(&batch), ReportOutcome::ToolUnavailable);
        }
        assert!(reporter.unavailable_logged.load(Ordering::Acquire));
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_cancelled_is_not_shown() {
        let (reporter, sink, _dir) = reporter_with(None);
        let batch = failed_batch(&[], Some(Error::Cancelled));
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Cancelled);
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_not_failed() {
        let (reporter, _sink, _dir) = reporter_with(None);
        let batch = Batch::single(ToolCommand::new(["pwd"]));
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::NotFailed);
    }

    #[test]
    fn test_unreadable_file_disables_suppression() {
        let sink = RecordingSink::default();
        let reporter = ErrorReporter::new(
            Box::new(sink.clone()),
            Some(PathBuf::from("/nonexistent/suppress.txt")),
        );
        assert!(reporter.suppression().is_empty());
        assert_eq!(reporter.suppression_path(), None);

        let batch = failed_batch(&["M"], None);
        assert_eq!(reporter.report_batch(&batch), ReportOutcome::Shown(1));
    }
}
