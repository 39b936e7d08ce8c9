mod cli;
mod delegate;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_core::app::{PoolCommand, PoolControl, PoolSettings, Warden, WardenBuilder};
use warden_core::config::WardenConfig;
use warden_core::domain::{EntityType, TaskSpec, WorkerId, parse_priority};
use warden_core::ports::{ClaimFilter, EventQuery, TaskQuery};

use crate::cli::{BudgetAction, Cli, Commands, OutputFormat, WorkersAction};
use crate::delegate::CommandDelegate;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `warden=info` (`debug` with -v).
/// `WARDEN_LOG_JSON=1` switches to JSON lines.
fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "warden=debug" } else { "warden=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let json_logs = std::env::var("WARDEN_LOG_JSON").is_ok_and(|v| v == "1");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = WardenConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let out = cli.output;

    match cli.command {
        Commands::Enqueue {
            category,
            payload_ref,
            priority,
            phase,
            max_retries,
        } => {
            let warden = open(config, false)?;
            let mut spec = TaskSpec::new(category, payload_ref);
            if let Some(p) = priority {
                spec = spec.with_priority(parse_priority(&p)?);
            }
            if let Some(p) = phase {
                spec = spec.with_phase(p);
            }
            if let Some(n) = max_retries {
                spec = spec.with_max_retries(n);
            }
            let id = warden.enqueue(spec).await?;
            match out {
                OutputFormat::Json => print_json(&serde_json::json!({ "task_id": id }))?,
                OutputFormat::Text => println!("{id}"),
            }
            Ok(())
        }
        Commands::Status { task_id } => {
            let warden = open(config, false)?;
            let report = warden.status().task(task_id).await?;
            match out {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    let t = &report.task;
                    println!("{}  {}  phase={}  priority={}", t.id, t.status, t.phase, t.priority);
                    println!(
                        "  category={}  payload={}  retries={}/{}",
                        t.category, t.payload_ref, t.retry_count, t.max_retries
                    );
                    if let Some(owner) = &t.owner {
                        println!("  owner={owner}");
                    }
                    if let Some(err) = &t.last_error {
                        println!("  last_error={err}");
                    }
                    for g in &report.gate_results {
                        println!("  gate {} {} at {}", g.phase, g.verdict, g.evaluated_at);
                        for line in g.reason_lines() {
                            println!("    - {line}");
                        }
                    }
                    for e in &report.history {
                        println!(
                            "  #{:<6} {} {:<8} {}",
                            e.seq,
                            e.timestamp,
                            e.entity_type.as_str(),
                            e.transition
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::List {
            status,
            phase,
            category,
            owner,
            limit,
        } => {
            let warden = open(config, false)?;
            let tasks = warden
                .status()
                .list(&TaskQuery {
                    status,
                    phase,
                    owner: owner.map(WorkerId::new),
                    category,
                    limit,
                })
                .await?;
            match out {
                OutputFormat::Json => print_json(&tasks)?,
                OutputFormat::Text => {
                    for t in &tasks {
                        println!(
                            "{}  {:<11} {:<10} p={:<3} r={}/{}  {}",
                            t.id,
                            t.status.as_str(),
                            t.phase.as_str(),
                            t.priority,
                            t.retry_count,
                            t.max_retries,
                            t.category
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Events {
            task,
            since,
            until,
            limit,
        } => {
            let warden = open(config, false)?;
            let query = EventQuery {
                entity_type: task.map(|_| EntityType::Task),
                entity_id: task.map(|id| id.to_string()),
                since: since.as_deref().map(parse_time).transpose()?,
                until: until.as_deref().map(parse_time).transpose()?,
                limit: Some(limit),
                ..EventQuery::default()
            };
            let events = warden.status().history(&query).await?;
            match out {
                OutputFormat::Json => print_json(&events)?,
                OutputFormat::Text => {
                    for e in &events {
                        println!(
                            "#{:<6} {} {:<8} {} {}",
                            e.seq,
                            e.timestamp,
                            e.entity_type.as_str(),
                            e.entity_id,
                            e.transition
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Stats => {
            let warden = open(config, false)?;
            let report = warden.status().pool().await?;
            match out {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    let c = &report.counts;
                    println!(
                        "pending={} claimed={} in_progress={} stale={} completed={} failed={} boosted={}",
                        c.pending, c.claimed, c.in_progress, c.stale, c.completed, c.failed, c.boosted
                    );
                    for (phase, n) in &c.by_phase {
                        println!("  {phase}: {n}");
                    }
                    for w in &report.workers {
                        let current = w.current_task_id.map(|id| id.to_string()).unwrap_or_default();
                        println!("worker {} shard={} {} {current}", w.worker_id, w.shard_id, w.state);
                    }
                    if let Some(b) = &report.budget {
                        println!("budget {}/{} {}", b.consumed_units, b.limit_units, b.status);
                    }
                    for b in &report.breakers {
                        println!("breaker {} {} failures={}", b.key, b.state.as_str(), b.consecutive_failures);
                    }
                }
            }
            Ok(())
        }
        Commands::Priority { task_id, priority } => {
            let warden = open(config, false)?;
            let task = warden
                .store()
                .set_priority(task_id, parse_priority(&priority)?)
                .await?;
            match out {
                OutputFormat::Json => print_json(&task)?,
                OutputFormat::Text => println!("{}  priority={}", task.id, task.priority),
            }
            Ok(())
        }
        Commands::Boost => {
            let warden = open(config, false)?;
            let Some(policy) = warden.config().age_boost.policy() else {
                println!("age boost is disabled");
                return Ok(());
            };
            let boosted = warden.store().apply_age_boosts(&policy).await?;
            match out {
                OutputFormat::Json => print_json(&boosted)?,
                OutputFormat::Text => {
                    for t in &boosted {
                        println!("{}  priority={}  boosts={}", t.id, t.priority, t.boost_count);
                    }
                }
            }
            Ok(())
        }
        Commands::Budget { action } => {
            let warden = open(config, false)?;
            let ledger = match action {
                BudgetAction::Show => warden.budget().ledger().await?,
                BudgetAction::Reset => warden.budget().reset().await?,
            };
            match out {
                OutputFormat::Json => print_json(&ledger)?,
                OutputFormat::Text => println!(
                    "period {}: {}/{} {}",
                    ledger.period_id, ledger.consumed_units, ledger.limit_units, ledger.status
                ),
            }
            Ok(())
        }
        Commands::Workers {
            action:
                WorkersAction::Run {
                    count,
                    category,
                    phase,
                    with_watchdog,
                },
        } => {
            let mut settings = PoolSettings::from_config(&config.worker);
            if let Some(n) = count {
                settings.count = n.max(1);
            }
            let mut filter = ClaimFilter::any();
            for c in category {
                filter = filter.with_category(c);
            }
            for p in phase {
                filter = filter.with_phase(p);
            }
            let warden = open(config, true)?;
            run_workers(warden, settings.with_filter(filter), with_watchdog).await
        }
        Commands::Watchdog => {
            let warden = open(config, false)?;
            let control = warden.control().clone();
            tokio::spawn(forward_signals(control.clone()));

            let (tx, rx) = watch::channel(false);
            let mut commands = control.subscribe();
            tokio::spawn(async move {
                let _ = commands.wait_for(|c| *c == PoolCommand::Drain).await;
                let _ = tx.send(true);
            });
            warden.run_watchdogs(rx).await;
            info!("watchdog stopped");
            Ok(())
        }
    }
}

/// Build the app from config. Workers register one CommandDelegate per
/// `[delegates.<name>]` and require every routed delegate to exist.
fn open(config: WardenConfig, workers: bool) -> Result<Warden> {
    let mut builder = WardenBuilder::new(config.clone());
    if workers {
        for (name, d) in &config.delegates {
            let delegate = CommandDelegate::new(name, &d.command)
                .with_timeout(d.timeout_secs.map(Duration::from_secs));
            builder = builder.register_delegate(name, Arc::new(delegate))?;
        }
        builder = builder.require_delegates();
    }
    Ok(builder.build()?)
}

async fn run_workers(warden: Warden, settings: PoolSettings, with_watchdog: bool) -> Result<()> {
    let pool = warden.spawn_workers(settings);
    tokio::spawn(forward_signals(pool.control().clone()));

    let (tx, rx) = watch::channel(false);
    let watchdogs = async {
        if with_watchdog {
            warden.run_watchdogs(rx).await;
        }
    };
    let workers = async {
        pool.join().await;
        let _ = tx.send(true);
    };
    tokio::join!(watchdogs, workers);
    info!("all workers stopped");
    Ok(())
}

/// SIGUSR1 pauses, SIGUSR2 resumes, SIGTERM / Ctrl-C drains.
#[cfg(unix)]
async fn forward_signals(control: PoolControl) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut usr1), Ok(mut usr2), Ok(mut term)) = (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::warn!("could not install signal handlers, only Ctrl-C drains");
        let _ = tokio::signal::ctrl_c().await;
        control.drain();
        return;
    };
    loop {
        tokio::select! {
            _ = usr1.recv() => control.pause(),
            _ = usr2.recv() => control.resume(),
            _ = term.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    info!("shutdown requested, draining");
    control.drain();
}

#[cfg(not(unix))]
async fn forward_signals(control: PoolControl) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested, draining");
    control.drain();
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("`{s}` is not an RFC 3339 timestamp"))?
        .with_timezone(&Utc))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
