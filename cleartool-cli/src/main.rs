mod cli;
mod log;
mod sink;

use clap::Parser;
use cleartool_session::{Batch, Client, ToolCommand, ToolConfig};
use cli::{Cli, Commands};
use miette::{IntoDiagnostic, Result, WrapErr};
use sink::TerminalSink;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let client = Client::builder(config)
        .report_sink(Box::new(TerminalSink))
        .build()?;

    let succeeded = match cli.command {
        Commands::Run { cwd, args } => {
            let mut cmd = ToolCommand::new(args);
            if let Some(cwd) = cwd {
                cmd = cmd.in_dir(cwd);
            }
            run_batch(&client, Batch::new("run").with(cmd)).await?
        }
        Commands::Batch { file } => {
            let batch = read_batch_file(&file)?;
            run_batch(&client, batch).await?
        }
        Commands::Shell => shell(&client).await?,
        Commands::Launch { args } => {
            let cmd = client
                .exec_detached(Box::new(ToolCommand::new(args).detached()))
                .await;
            match cmd.record().error() {
                Some(e) => {
                    eprintln!("{}", console::style(e).red());
                    false
                }
                None => true,
            }
        }
    };

    client.shutdown().await;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ToolConfig> {
    let config = match &cli.config {
        Some(path) => ToolConfig::load(path)?,
        None => ToolConfig::default(),
    };
    let mut config = config.with_overrides(|key| std::env::var(key).ok())?;

    if let Some(executable) = &cli.executable {
        config.executable = executable.clone();
    }
    if let Some(secs) = cli.idle_timeout {
        config.idle_timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(file) = &cli.suppression_file {
        config.suppression_file = Some(file.clone());
    }
    if let Some(root) = &cli.mockup_root {
        config.mockup_root = Some(root.clone());
    }
    config.validate()?;
    debug!(?config, "resolved tool configuration");
    Ok(config)
}

fn read_batch_file(path: &Path) -> Result<Batch> {
    let content = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read batch file {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string());

    let mut batch = Batch::new(name);
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        batch.push(Box::new(ToolCommand::verbatim(line)));
    }
    if batch.is_empty() {
        miette::bail!("{} contains no commands", path.display());
    }
    Ok(batch)
}

fn print_results(batch: &Batch) {
    for cmd in batch.commands() {
        for line in cmd.output() {
            println!("{line}");
        }
    }
}

/// Run `batch` synchronously, printing output and reporting a failure.
async fn run_batch(client: &Client, batch: Batch) -> Result<bool> {
    let batch = client.exec(batch).await?;
    print_results(&batch);
    if batch.has_failed() {
        client.report_failure(&batch);
        return Ok(false);
    }
    Ok(true)
}

/// Post each stdin line as its own batch. Ctrl-C cancels the batch in
/// flight; end of input ends the shell.
async fn shell(client: &Client) -> Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut all_succeeded = true;

    while let Some(line) = lines.next_line().await.into_diagnostic()? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let handle = client.post(Batch::new("shell").with(ToolCommand::verbatim(line)));
        let cancel = handle.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("received Ctrl-C, cancelling command");
                cancel.cancel();
            }
        });
        let batch = handle.wait().await;
        interrupt.abort();
        let batch = batch?;

        print_results(&batch);
        if batch.was_cancelled() {
            eprintln!("{}", console::style("cancelled").yellow());
        }
        all_succeeded &= !batch.has_failed();
    }
    Ok(all_succeeded)
}
