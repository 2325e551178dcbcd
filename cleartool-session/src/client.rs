//! The public entry point: serialized command execution over one reusable
//! tool session.
//!
//! All synchronous and posted work goes through a single worker task, so at
//! most one command is ever in flight on the shared session. Detached
//! launches bypass the worker and use a disposable session of their own.

use crate::availability::ToolAvailability;
use crate::batch::{Batch, CommandRunner, Progress};
use crate::command::Command;
use crate::config::ToolConfig;
use crate::error::{Error, Result};
use crate::launcher::{Launcher, launcher_for};
use crate::reporter::{ErrorReporter, ReportOutcome, ReportSink, TracingSink};
use crate::session::{Session, SessionOptions};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    config: ToolConfig,
    launcher: Option<Arc<dyn Launcher>>,
    availability: Option<Arc<ToolAvailability>>,
    sink: Option<Box<dyn ReportSink>>,
}

impl ClientBuilder {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            launcher: None,
            availability: None,
            sink: None,
        }
    }

    /// Start sessions through `launcher` instead of the one the
    /// configuration selects.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use a private availability holder instead of the process-global one.
    pub fn availability(mut self, availability: Arc<ToolAvailability>) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn report_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let launcher = self.launcher.unwrap_or_else(|| launcher_for(&self.config));
        let reporter = ErrorReporter::new(
            self.sink.unwrap_or_else(|| Box::new(TracingSink)),
            self.config.suppression_file.clone(),
        );
        let shared = Arc::new(Shared {
            config: Arc::new(self.config),
            launcher,
            availability: self.availability.unwrap_or_else(ToolAvailability::global),
            reporter,
            session: tokio::sync::Mutex::new(None),
            sessions_started: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker(Arc::clone(&shared), rx));

        Ok(Client {
            shared,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

struct Shared {
    config: Arc<ToolConfig>,
    launcher: Arc<dyn Launcher>,
    availability: Arc<ToolAvailability>,
    reporter: ErrorReporter,
    /// The reusable session; only the worker and shutdown touch it.
    session: tokio::sync::Mutex<Option<Session>>,
    sessions_started: AtomicU64,
}

impl Shared {
    async fn start_session(&self, options: SessionOptions) -> Result<Session> {
        if self.availability.is_unavailable() {
            return Err(Error::ToolUnavailable {
                tool: self.launcher.tool_name(),
                reason: self.availability.reason().unwrap_or_default(),
            });
        }

        match Session::start(self.launcher.as_ref(), Arc::clone(&self.config), options).await {
            Ok(session) => {
                self.sessions_started.fetch_add(1, Ordering::Relaxed);
                Ok(session)
            }
            Err(e) => {
                if let Error::ToolUnavailable { reason, .. } = &e {
                    if self.availability.mark_unavailable(reason.clone()) {
                        warn!("{}; further attempts are skipped", e);
                    }
                }
                Err(e)
            }
        }
    }

    /// Return the reusable session, replacing it when it no longer answers.
    async fn ensure_session<'s>(&self, slot: &'s mut Option<Session>) -> Result<&'s mut Session> {
        let reusable = match slot.as_mut() {
            Some(session) if !session.is_single_use() => session.is_valid().await,
            _ => false,
        };
        if !reusable {
            if let Some(stale) = slot.take() {
                debug!(session = stale.id(), "replacing tool session");
            }
            let options = SessionOptions {
                single_use: self.config.single_use,
                fire_and_forget: false,
            };
            *slot = Some(self.start_session(options).await?);
        }
        match slot {
            Some(session) => Ok(session),
            None => Err(Error::Protocol("no tool session".into())),
        }
    }
}

/// Runs commands on the shared session.
struct SharedSessionRunner<'a> {
    shared: &'a Shared,
}

#[async_trait]
impl CommandRunner for SharedSessionRunner<'_> {
    async fn run(&mut self, cmd: &mut dyn Command, cancel: &CancellationToken) -> Result<()> {
        let mut slot = self.shared.session.lock().await;
        // Checking or starting a session can take up to the startup timeout.
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled while acquiring a tool session");
                return Err(Error::Cancelled);
            }
            session = self.shared.ensure_session(&mut slot) => session?,
        };
        let result = session.execute(cmd, cancel).await;

        // Fire-and-forget leaves no sentinel response behind to resync on.
        let discard = session.is_closed() || session.is_single_use() || cmd.fire_and_forget();
        if discard {
            if let Some(session) = slot.take() {
                debug!(session = session.id(), "discarding tool session");
                if !session.is_closed() {
                    session.quit().await;
                }
            }
        }
        result
    }
}

struct Job {
    batch: Batch,
    cancel: CancellationToken,
    progress: Option<watch::Sender<Progress>>,
    report: bool,
    reply: oneshot::Sender<Batch>,
}

async fn worker(shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Job {
            mut batch,
            cancel,
            progress,
            report,
            reply,
        } = job;
        debug!(batch = batch.name(), commands = batch.len(), "running batch");

        let mut runner = SharedSessionRunner { shared: &shared };
        batch.run(&mut runner, &cancel, progress.as_ref()).await;

        if report && batch.has_failed() {
            shared.reporter.report_batch(&batch);
        }
        if reply.send(batch).is_err() {
            debug!("batch result dropped by caller");
        }
    }
    debug!("client worker stopped");
}

/// Serialized, failure-aware access to the interactive tool.
pub struct Client {
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn builder(config: ToolConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ToolConfig {
        &self.shared.config
    }

    pub fn availability(&self) -> &Arc<ToolAvailability> {
        &self.shared.availability
    }

    /// Number of sessions this client has started successfully.
    pub fn sessions_started(&self) -> u64 {
        self.shared.sessions_started.load(Ordering::Relaxed)
    }

    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match jobs.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Run `batch` on the shared session and wait for it.
    ///
    /// Failures are recorded on the batch, not reported; see
    /// [`Client::report_failure`].
    pub async fn exec(&self, batch: Batch) -> Result<Batch> {
        let (reply, done) = oneshot::channel();
        let job = Job {
            batch,
            cancel: CancellationToken::new(),
            progress: None,
            report: false,
            reply,
        };
        self.submit(job).map_err(|_| Error::WorkerGone)?;
        done.await.map_err(|_| Error::WorkerGone)
    }

    /// Queue `batch` and return immediately.
    ///
    /// A failed batch that was not cancelled is reported before the handle
    /// resolves.
    pub fn post(&self, batch: Batch) -> PostHandle {
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(Progress {
            total: batch.len(),
            ..Default::default()
        });
        let (reply, done) = oneshot::channel();
        let job = Job {
            batch,
            cancel: cancel.clone(),
            progress: Some(progress_tx),
            report: true,
            reply,
        };
        if let Err(job) = self.submit(job) {
            let mut batch = job.batch;
            batch.fail_first(Error::WorkerGone);
            let _ = job.reply.send(batch);
        }
        PostHandle {
            cancel,
            progress: progress_rx,
            done,
        }
    }

    /// Run one command on a disposable fire-and-forget session, outside the
    /// worker queue. The session is torn down afterwards whatever happens.
    pub async fn exec_detached(&self, mut cmd: Box<dyn Command>) -> Box<dyn Command> {
        let options = SessionOptions {
            single_use: true,
            fire_and_forget: true,
        };
        match self.shared.start_session(options).await {
            Ok(mut session) => {
                if let Err(e) = session.execute(cmd.as_mut(), &CancellationToken::new()).await {
                    cmd.record_mut().fail_with(e);
                }
                session.quit().await;
            }
            Err(e) => cmd.record_mut().fail_with(e),
        }
        cmd
    }

    /// Report the failed command of `batch` to the configured sink.
    pub fn report_failure(&self, batch: &Batch) -> ReportOutcome {
        self.shared.reporter.report_batch(batch)
    }

    /// Stop accepting work, let queued work finish and quit the shared
    /// session.
    pub async fn shutdown(&self) {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(jobs);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                debug!("client worker ended abnormally: {}", e);
            }
        }

        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            session.quit().await;
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tool", &self.shared.launcher.tool_name())
            .field("sessions_started", &self.sessions_started())
            .finish_non_exhaustive()
    }
}

/// Handle to a posted batch.
#[derive(Debug)]
pub struct PostHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
    done: oneshot::Receiver<Batch>,
}

impl PostHandle {
    /// Skip the remaining commands and interrupt the one in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this batch when cancelled, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Wait for the batch to finish.
    pub async fn wait(self) -> Result<Batch> {
        self.done.await.map_err(|_| Error::WorkerGone)
    }
}
