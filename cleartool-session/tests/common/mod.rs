//! Shared test utilities for cleartool-session integration tests.
//!
//! The integration tests drive a real POSIX `sh` as the interactive tool:
//! `sh` reports the sentinel as an unknown command on stderr, which is the
//! behavior the framing protocol relies on.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use cleartool_session::{
    Client, ErrorReport, ReportSink, ToolAvailability, ToolConfig, DEFAULT_SENTINEL,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for a whole test, so a protocol bug fails instead of hanging.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Test context that manages a temp directory and client construction
pub struct TestContext {
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write `content` to a file in the temp directory
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Build a client with a private availability holder and a recording sink
    pub fn client(&self, config: ToolConfig) -> (Client, RecordingSink) {
        let sink = RecordingSink::default();
        let client = Client::builder(config)
            .availability(ToolAvailability::new())
            .report_sink(Box::new(sink.clone()))
            .build()
            .expect("Failed to build client");
        (client, sink)
    }
}

// ============================================================================
// Config Builders
// ============================================================================

/// `sh` as the interactive tool, with short timeouts
pub fn sh_config() -> ToolConfig {
    ToolConfig {
        executable: "sh".to_string(),
        args: Vec::new(),
        sentinel: DEFAULT_SENTINEL.to_string(),
        quit_instruction: "exit".to_string(),
        cd_instruction: "cd".to_string(),
        idle_timeout_ms: 5_000,
        probe_timeout_ms: 1_000,
        startup_timeout_ms: 5_000,
        quit_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// A tool executable that does not exist
pub fn missing_tool_config() -> ToolConfig {
    ToolConfig {
        executable: "/nonexistent/bin/cleartool".to_string(),
        ..sh_config()
    }
}

// ============================================================================
// Report sink
// ============================================================================

/// Collects every report shown
#[derive(Default, Clone)]
pub struct RecordingSink(Arc<Mutex<Vec<ErrorReport>>>);

impl RecordingSink {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.0.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingSink {
    fn show(&self, report: ErrorReport) {
        self.0.lock().unwrap().push(report);
    }
}
