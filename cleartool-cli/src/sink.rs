use cleartool_session::{ErrorReport, ReportSink, Severity};
use console::style;

/// Prints error reports to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalSink;

impl ReportSink for TerminalSink {
    fn show(&self, report: ErrorReport) {
        let title = match report.severity {
            Severity::Error => style(report.title).red().bold(),
            Severity::Warning => style(report.title).yellow().bold(),
            Severity::Info => style(report.title).bold(),
        };
        eprintln!("{title}");
        eprintln!("{}", style(report.prompt).dim());
        for message in report.messages {
            eprintln!("  {message}");
        }
    }
}
