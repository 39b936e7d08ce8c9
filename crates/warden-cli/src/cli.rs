use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use warden_core::domain::{Phase, TaskId, TaskStatus};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Task queue coordination for a pool of delegate workers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the TOML config (defaults apply when the file is missing)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a task to the queue
    Enqueue {
        /// Routing category
        category: String,

        /// Opaque reference to the task payload
        payload_ref: String,

        /// Number or label (P0..P3, critical, high, medium, low)
        #[arg(long)]
        priority: Option<String>,

        /// Starting phase (default: brainstorm)
        #[arg(long)]
        phase: Option<Phase>,

        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Show one task with its history and gate results
    Status { task_id: TaskId },

    /// List tasks
    List {
        #[arg(long)]
        status: Option<TaskStatus>,

        #[arg(long)]
        phase: Option<Phase>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        owner: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the event log
    Events {
        /// Only events of this task
        #[arg(long)]
        task: Option<TaskId>,

        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<String>,

        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Queue, pool, budget and breaker summary
    Stats,

    /// Change the priority of a pending or stale task
    Priority {
        task_id: TaskId,

        /// Number or label (P0..P3, critical, high, medium, low)
        priority: String,
    },

    /// Apply the age-based priority boost now
    Boost,

    /// Budget ledger of the current period
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },

    /// Worker pool
    Workers {
        #[command(subcommand)]
        action: WorkersAction,
    },

    /// Run the staleness and budget watchdogs until interrupted
    Watchdog,
}

#[derive(Subcommand)]
pub enum BudgetAction {
    Show,
    /// Zero the consumed units and resume a pool the budget paused
    Reset,
}

#[derive(Subcommand)]
pub enum WorkersAction {
    /// Run workers until SIGTERM / Ctrl-C (SIGUSR1 pauses, SIGUSR2 resumes)
    Run {
        /// Overrides worker.count
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Only claim these categories
        #[arg(long)]
        category: Vec<String>,

        /// Only claim tasks in these phases
        #[arg(long)]
        phase: Vec<Phase>,

        /// Also run the watchdogs in this process
        #[arg(long)]
        with_watchdog: bool,
    },
}
