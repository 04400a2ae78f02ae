use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use warden_core::{config::WardenConfig, ScheduleId};
use warden_reaper::{
    ProcessReaper, ProcessRegistry, ProcessSignature, ReaperSettings, SysinfoEnumerator,
};
use warden_scheduler::{
    ExecutionRunner, NewSchedule, ScheduleUpdate, SchedulerEvent, SchedulerService,
    SchedulerSettings, SqliteStore, SystemClock,
};

mod cli;
mod pidfile;
mod task;

use cli::{Cli, Commands, ScheduleAction, UpdateArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,warden_scheduler=info,warden_reaper=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > WARDEN_CONFIG env > ~/.warden/warden.toml
    let config_path = cli
        .config
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("WARDEN_CONFIG").ok());
    let config = WardenConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        WardenConfig::default()
    });

    let wiring = Wiring::build(&config)?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(wiring, &config).await,
        Commands::Schedule { action } => schedule(&wiring.service, action),
        Commands::Reap { dry_run } => {
            let report = if dry_run {
                wiring.reaper.dry_run()
            } else {
                // a one-shot registry is empty, so every managed process
                // would look orphaned while a daemon is using them
                pidfile::ensure_no_daemon(&wiring.pid_path)
                    .context("refusing to sweep; use `warden reap --dry-run` to inspect")?;
                wiring.reaper.sweep()
            };
            print_json(&report)
        }
    }
}

/// Subsystems shared by every subcommand.
struct Wiring {
    service: Arc<SchedulerService>,
    reaper: Arc<ProcessReaper>,
    events: mpsc::Receiver<SchedulerEvent>,
    pid_path: PathBuf,
}

impl Wiring {
    fn build(config: &WardenConfig) -> anyhow::Result<Self> {
        let db_path = expand_home(&config.database.path);
        ensure_parent_dir(&db_path)
            .with_context(|| format!("cannot create directory for {db_path}"))?;
        info!(path = %db_path, "opening SQLite database");
        let store = Arc::new(
            SqliteStore::open(&db_path).with_context(|| format!("cannot open database {db_path}"))?,
        );

        let registry = Arc::new(ProcessRegistry::new());
        let enumerator = Arc::new(SysinfoEnumerator::new(ProcessSignature::from(
            &config.reaper.signature,
        )));
        let reaper = Arc::new(ProcessReaper::new(
            Arc::clone(&registry),
            enumerator,
            ReaperSettings::from(&config.reaper),
        ));

        let router = task::router_from_config(&config.tasks, config.reaper.terminate_grace());
        let runner = ExecutionRunner::new(
            router,
            registry,
            Arc::new(SystemClock),
            config.runner.max_duration(),
        )
        .with_terminate_grace(config.reaper.terminate_grace());

        let (events_tx, events) = mpsc::channel(config.scheduler.event_buffer);
        let service = Arc::new(SchedulerService::new(
            store,
            runner,
            Arc::new(SystemClock),
            SchedulerSettings::from(&config.scheduler),
            Some(events_tx),
        ));

        Ok(Self {
            service,
            reaper,
            events,
            pid_path: pidfile::path_for(&db_path),
        })
    }
}

async fn run(wiring: Wiring, config: &WardenConfig) -> anyhow::Result<()> {
    let Wiring {
        service,
        reaper,
        events,
        pid_path,
    } = wiring;
    let pid_file = pidfile::PidFile::acquire(&pid_path)?;

    if config.tasks.is_empty() {
        warn!("no [tasks] configured; every execution will fail until a job type is mapped");
    }
    let report = service.recover()?;
    info!(registered = report.registered, "startup recovery complete");

    tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = {
        let service = Arc::clone(&service);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { service.run(rx).await })
    };
    let reaper_loop = if config.reaper.enabled {
        Some(tokio::spawn(
            Arc::clone(&reaper).run(config.reaper.interval(), shutdown_rx),
        ))
    } else {
        info!("process reaper disabled by config");
        None
    };

    info!(pid_file = %pid_file.path().display(), "warden running; waiting for shutdown signal");
    wait_for_signal().await?;
    info!("shutdown signal received");

    // stop dispatching before waiting on what is already running
    let _ = shutdown_tx.send(true);
    if let Err(e) = coordinator.await {
        error!("coordinator task failed: {e}");
    }
    if !service.shutdown().await {
        warn!("some executions did not finish; their history may be incomplete");
    }
    if let Some(handle) = reaper_loop {
        if let Err(e) = handle.await {
            error!("reaper task failed: {e}");
        }
    }
    if config.reaper.enabled {
        let report = reaper.force_cleanup_all().await;
        info!(killed = report.killed, "managed processes cleaned up");
    }
    info!("warden stopped");
    Ok(())
}

fn schedule(service: &SchedulerService, action: ScheduleAction) -> anyhow::Result<()> {
    match action {
        ScheduleAction::Add {
            subject,
            job_type,
            interval_hours,
            active_hours,
            disabled,
        } => {
            let id = service.add_schedule(NewSchedule {
                subject_id: subject,
                job_type,
                interval_hours,
                active_hours,
                enabled: !disabled,
            })?;
            print_json(&service.get_status(&id)?)
        }
        ScheduleAction::List => print_json(&service.list_schedules()?),
        ScheduleAction::Status { id } => print_json(&service.get_status(&ScheduleId::from(id))?),
        ScheduleAction::History { id, limit } => {
            print_json(&service.list_history(&ScheduleId::from(id), limit)?)
        }
        ScheduleAction::Update(args) => {
            let id = ScheduleId::from(args.id.clone());
            let update = update_from_args(args);
            if update.is_empty() {
                anyhow::bail!("nothing to update");
            }
            print_json(&service.update_schedule(&id, update)?)
        }
        ScheduleAction::Remove { id } => {
            let id = ScheduleId::from(id);
            let removed = service.remove_schedule(&id)?;
            print_json(&serde_json::json!({ "schedule_id": id, "removed": removed }))
        }
    }
}

fn update_from_args(args: UpdateArgs) -> ScheduleUpdate {
    let active_hours = if args.clear_active_hours {
        Some(None)
    } else {
        args.active_hours.map(Some)
    };
    let enabled = match (args.enable, args.disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    ScheduleUpdate {
        interval_hours: args.interval_hours,
        active_hours,
        enabled,
    }
}

/// Drain scheduler events into structured logs.
async fn log_events(mut events: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::Executed {
                schedule_id,
                trigger_type,
                success,
                items_processed,
                duration_ms,
                next_run,
                ..
            } => info!(
                %schedule_id,
                trigger = %trigger_type,
                success,
                items_processed,
                duration_ms,
                next_run = ?next_run,
                "execution recorded"
            ),
            SchedulerEvent::Missed {
                schedule_id,
                scheduled_for,
                late_by_secs,
            } => warn!(%schedule_id, %scheduled_for, late_by_secs, "missed fire coalesced"),
            SchedulerEvent::Escalated {
                schedule_id,
                consecutive_failures,
            } => error!(%schedule_id, consecutive_failures, "schedule reached failure threshold"),
            SchedulerEvent::RecordFailed { schedule_id, error } => {
                error!(%schedule_id, %error, "execution outcome not persisted")
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Ctrl-C handler")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("Ctrl-C handler")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}/{rest}")
        }
        None => path.to_string(),
    }
}

fn ensure_parent_dir(path: &str) -> warden_core::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
