mod constraints;
mod location;
mod module;
mod permission;
mod provider;
mod runner;
mod sample;
mod sampler;
mod scheduler;
mod sink;
#[cfg(feature = "web-api")]
mod status;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loc_core::cfg::{self, AppId, Config};
use loc_core::job::JobResult;
use loc_core::logx;
use loc_core::store::{open_fs, DefaultKv, JobStore};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::location::ProviderSource;
use crate::module::{Module, ModuleCtx};
use crate::permission::StaticGate;
use crate::provider::SimulatedProvider;
use crate::runner::Runner;
use crate::sampler::Sampling;
use crate::scheduler::Scheduler;
use crate::sink::{FixSink, KvFixSink, LogSink};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Background location sampler")]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Take one foreground sample and print the result
    Once {
        /// Log the fix instead of storing it
        #[arg(long)]
        dry_run: bool,
    },
    /// List persisted registrations
    Jobs,
    /// Remove a persisted registration
    Cancel { name: String },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => cfg::load_from(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    logx::init(logx::level_for(cli.verbose, &cfg.log_level));

    let data_dir = cfg.resolve_data_dir(&APP)?;
    let store = JobStore::new(open_fs(&data_dir)?);
    info!("{} boot data_dir={}", APP.application, data_dir.display());

    match cli.cmd {
        Command::Jobs => {
            let mut out = Vec::new();
            for spec in store.specs()? {
                let state = store.state(&spec.name)?;
                let last_fix = store.last_fix(&spec.name)?;
                out.push(json!({ "spec": spec, "state": state, "last_fix": last_fix }));
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { name } => {
            let existed = store.remove(&name)?;
            println!("{}", json!({ "job": name, "removed": existed }));
            Ok(ExitCode::SUCCESS)
        }
        Command::Once { dry_run } => runtime()?.block_on(once(&cfg, store, dry_run)),
        Command::Run => runtime()?.block_on(run(cfg, store)).map(|_| ExitCode::SUCCESS),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    let mut builder = tokio::runtime::Builder::new_current_thread();
    #[cfg(not(feature = "rt-single"))]
    let mut builder = {
        let mut b = tokio::runtime::Builder::new_multi_thread();
        b.worker_threads(num_cpus::get().clamp(1, 4));
        b
    };
    builder.enable_all().build().context("build tokio runtime")
}

fn runner(cfg: &Config, sink: Arc<dyn FixSink>) -> Arc<Runner> {
    let provider = Arc::new(SimulatedProvider::from_cfg(&cfg.source));
    let update_interval = Duration::from_secs(cfg.sampling.update_interval_secs);
    let source = ProviderSource::new(provider, update_interval);
    Arc::new(Runner::new(
        Arc::new(source),
        Arc::new(StaticGate::from_cfg(&cfg.permissions)),
        sink,
    ))
}

async fn once(cfg: &Config, store: JobStore<DefaultKv>, dry_run: bool) -> Result<ExitCode> {
    let sink: Arc<dyn FixSink> =
        if dry_run { Arc::new(LogSink) } else { Arc::new(KvFixSink::new(store)) };
    let runner = runner(cfg, sink);
    let name = cfg.sampling.once_spec().name;
    let result = runner.execute(&name, &cfg.sampling.action(false)).await;
    println!("{}", serde_json::to_string(&result)?);
    Ok(match result {
        JobResult::Success(_) => ExitCode::SUCCESS,
        _ => ExitCode::from(2),
    })
}

async fn run(cfg: Config, store: JobStore<DefaultKv>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        runner(&cfg, Arc::new(KvFixSink::new(store.clone()))),
        constraints::from_cfg(&cfg.device),
        cfg.backoff.policy(),
        store,
        shutdown_rx.clone(),
    );
    let ctx = ModuleCtx { scheduler, shutdown: shutdown_rx };

    let mut modules: Vec<Box<dyn Module>> = Vec::new();
    modules.push(Box::new(Sampling::new(cfg.sampling.clone())));
    #[cfg(feature = "web-api")]
    {
        let addr = cfg.status.listen.parse().context("parse [status] listen")?;
        modules.push(Box::new(status::StatusServer::new(addr)));
    }

    let mut handles = Vec::new();
    for m in modules {
        info!("starting module {}", m.name());
        handles.push((m.name(), m.spawn(ctx.clone())));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("module {name} failed: {e:#}"),
            Err(e) => warn!("module {name} panicked: {e}"),
        }
    }
    Ok(())
}
