//! sweep - launch parameter sweeps over a pool of resource slots.
//!
//! Reads a multi-document YAML config, expands every choice block into
//! tasks, and runs them with one worker per slot. Finished commands are
//! recorded next to their outputs, so re-running the same sweep resumes it.

mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::{eyre, WrapErr};
use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use sweep_core::{build_tasks, DedupPolicy, RunContext, SweepConfig};
use sweep_exec::{Scheduler, SchedulerOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Launch a resumable parameter sweep.
#[derive(Parser, Debug)]
#[command(name = "sweep", version)]
#[command(about = "Run templated commands over a parameter grid on a pool of resource slots")]
struct Cli {
    /// Output root directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Sweep config file
    #[arg(short, long, default_value = "params.yaml")]
    yaml: PathBuf,

    /// Only run choice blocks with this `_title`
    #[arg(short, long)]
    title: Option<String>,

    /// Run only the first task, forced, with output tee'd to the terminal
    #[arg(short, long)]
    debug: bool,

    /// Print commands without running them or writing state
    #[arg(long)]
    dry_run: bool,

    /// Commands to run (overrides `_cmd` in every block)
    #[arg(short, long = "command", num_args = 1..)]
    commands: Option<Vec<String>>,

    /// Re-run commands that already finished
    #[arg(short, long)]
    force: bool,

    /// Resource slots (overrides `resource` in the config)
    #[arg(short, long = "resource", num_args = 1..)]
    resources: Option<Vec<String>>,

    /// Run a random subset of this many tasks per choice block
    #[arg(long)]
    sample: Option<usize>,

    /// Write every task directly into the output root
    #[arg(long)]
    no_subdir: bool,

    /// Repeat handling: output, merge or none
    #[arg(long, value_parser = parse_dedup)]
    dedup: Option<DedupPolicy>,

    /// Seconds to wait for a state file lock
    #[arg(long, default_value = "60")]
    lock_timeout: u64,

    /// Seed for --sample
    #[arg(long, env = "SWEEP_SEED")]
    seed: Option<u64>,
}

fn parse_dedup(s: &str) -> Result<DedupPolicy, String> {
    DedupPolicy::parse(&s.to_lowercase())
        .ok_or_else(|| format!("invalid dedup policy '{s}', expected: output, merge, none"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every dispatched task succeeded.
async fn run(cli: Cli) -> eyre::Result<bool> {
    let color = std::io::stdout().is_terminal();

    let mut config = SweepConfig::from_file(&cli.yaml)
        .wrap_err_with(|| format!("failed to load {}", cli.yaml.display()))?;
    if let Some(title) = &cli.title {
        config.select_title(title)?;
    }

    let resources = cli.resources.clone().unwrap_or_else(|| config.resources.clone());
    if resources.is_empty() {
        return Err(eyre!("no resource slots given"));
    }

    let mut ctx = RunContext::now(&cli.output);
    ctx.debug = cli.debug;
    ctx.no_subdir = cli.no_subdir;
    ctx.sample = cli.sample;
    ctx.dedup = cli.dedup.or(config.dedup).unwrap_or_default();
    ctx.command_filter = cli.commands.clone();
    ctx.seed = cli.seed;

    let set = build_tasks(&config, &ctx)?;
    if let Some(warning) = render::format_orphans(&set.orphans, color) {
        warn!(orphans = ?set.orphans, "unused parameters");
        println!("{warning}");
    }
    info!(
        tasks = set.tasks.len(),
        slots = resources.len(),
        dedup = ctx.dedup.as_str(),
        "tasks built"
    );

    if !cli.dry_run {
        backup_config(&cli.yaml, &cli.output, cli.title.as_deref())?;
    }

    let options = SchedulerOptions {
        force: cli.force || cli.debug,
        dry_run: cli.dry_run,
        resource_env: config.resource_env.clone(),
        lock_timeout: Duration::from_secs(cli.lock_timeout),
    };
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(resources, options)
        .with_events(tx)
        .with_cancel(cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, interrupt).await {
            eprintln!("Interrupted again; exiting");
            std::process::exit(130);
        }
    });

    // Dropping the scheduler closes the event channel.
    let schedule = async move { scheduler.run(set.tasks).await };
    let print = async {
        while let Some(event) = rx.recv().await {
            println!("{}", render::format_event(&event, color));
        }
    };
    let (summary, ()) = tokio::join!(schedule, print);
    let summary = summary?;

    println!();
    print!("{}", render::format_summary(&summary, color));
    Ok(summary.failed.is_empty())
}

/// Cancel on the first interrupt. Returns true once a second one arrives.
async fn watch_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    eprintln!("Interrupted; waiting for running commands to finish (Ctrl-C again to quit)");
    cancel.cancel();
    interrupt().await.is_ok()
}

/// Copy the config into the output root as `<name>[.<title>]`.
fn backup_config(yaml: &Path, output: &Path, title: Option<&str>) -> eyre::Result<PathBuf> {
    let name = yaml
        .file_name()
        .ok_or_else(|| eyre!("config path {} has no file name", yaml.display()))?;
    let mut name = name.to_os_string();
    if let Some(title) = title {
        name.push(format!(".{title}"));
    }
    std::fs::create_dir_all(output)
        .wrap_err_with(|| format!("failed to create {}", output.display()))?;
    let target = output.join(name);
    std::fs::copy(yaml, &target)
        .wrap_err_with(|| format!("failed to back up config to {}", target.display()))?;
    Ok(target)
}
