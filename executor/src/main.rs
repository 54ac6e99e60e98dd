use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser;
use sandrun_executor::{
    prelude::CancellationToken,
    runner::{image::prepare_images, ContainerEngine, DockerEngine},
    ExecutorConfig, SubmissionRequest,
};
use tracing_subscriber::EnvFilter;

mod opt;

static CTRL_C: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = opt::Opts::parse();

    // stdout is reserved for results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = ExecutorConfig::load(opt.opt.config.as_deref())?;

    match opt.cmd {
        opt::SubCmd::Run(cmd) => run(cfg, cmd).await,
        opt::SubCmd::Reap(cmd) => reap(cfg, cmd).await,
        opt::SubCmd::Languages => languages(cfg),
    }
}

fn connect() -> anyhow::Result<Arc<dyn ContainerEngine>> {
    let engine = DockerEngine::connect_with_local_defaults()
        .context("Failed to connect to the Docker daemon")?;
    Ok(Arc::new(engine))
}

async fn run(cfg: ExecutorConfig, cmd: opt::RunSubCmd) -> anyhow::Result<()> {
    let engine = connect()?;
    let executor = cfg.build_executor(engine.clone())?;

    if cfg.pull_images {
        let failed = prepare_images(&*engine, executor.registry()).await;
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "Some images are unavailable");
        }
    }

    let filename = cmd
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", cmd.file.display()))?
        .to_owned();
    let source = tokio::fs::read(&cmd.file)
        .await
        .with_context(|| format!("Failed to read {}", cmd.file.display()))?;
    let req = SubmissionRequest::new(cmd.language, filename, source, cmd.memory, cmd.time);

    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || handle_ctrl_c(&handle))
        .context("Failed to set termination handler")?;

    let res = executor.execute_with_cancel(req, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&res)?);
    Ok(())
}

async fn reap(cfg: ExecutorConfig, cmd: opt::ReapSubCmd) -> anyhow::Result<()> {
    let engine = connect()?;
    if !cmd.watch {
        let report = cfg.reaper(engine).sweep().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    cfg.validate()?;
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || handle_ctrl_c(&handle))
        .context("Failed to set termination handler")?;
    tracing::info!(interval_secs = cfg.reaper_interval_secs, "Reaping until interrupted");
    cfg.spawn_reaper(engine, cancel)
        .await
        .context("Reaper task failed")?;
    Ok(())
}

fn languages(cfg: ExecutorConfig) -> anyhow::Result<()> {
    let registry = cfg.registry()?;
    for profile in registry.profiles() {
        println!(
            "{:<12} {:<16} {:<6} {}",
            profile.id, profile.image, profile.extension, profile.command
        );
    }
    Ok(())
}

fn handle_ctrl_c(cancel: &CancellationToken) {
    if !CTRL_C.swap(true, Ordering::SeqCst) {
        tracing::warn!("Stopping and cleaning up... Press Ctrl-C again to force quit.");
        cancel.cancel();
    } else {
        tracing::error!("Force quit! The reaper will remove anything left behind.");
        exit(101);
    }
}
