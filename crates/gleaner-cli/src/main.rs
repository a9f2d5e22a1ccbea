use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gleaner_core::app::{App, Command, CommandKind, SchedulerBuilder, TickLoop};
use gleaner_core::config::{GleanerConfig, load_config};
use gleaner_core::domain::{Category, PriorityTier, TaskId};
use gleaner_core::impls::{FixtureExecutor, HttpSink, JsonFileStore, RunnerLock};
use gleaner_core::ports::SystemClock;
use gleaner_core::queue::TaskOptions;

#[derive(Debug, Parser)]
#[command(name = "gleaner", about = "Keyword crawl scheduler", version)]
struct Cli {
    /// Extra TOML file layered over config/default.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the tick loop until Ctrl-C. Control commands are read from stdin
    /// as JSON lines, e.g. {"command":"getStatus"}.
    Run,
    /// Add keywords to the backlog.
    Enqueue {
        #[arg(required = true)]
        keywords: Vec<String>,
        /// Repeat for several categories; defaults to all.
        #[arg(long = "category")]
        categories: Vec<Category>,
        /// 0 = no limit.
        #[arg(long, default_value_t = 10)]
        max_pages: u32,
        #[arg(long, default_value = "NORMAL")]
        priority: PriorityTier,
        #[arg(long, default_value_t = 50.0)]
        value: f64,
        #[arg(long = "depends-on")]
        dependencies: Vec<TaskId>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    Status,
    Pause,
    Resume,
    /// Stop the persisted active Run; its Task goes back to pending.
    Stop,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_app(config: &GleanerConfig) -> anyhow::Result<App> {
    let sink = HttpSink::new(
        config.sink.base_url.clone(),
        config.sink.api_key.clone(),
        config.sink_timeout(),
    )
    .context("failed to create delivery sink")?;

    let app = SchedulerBuilder::from_config(config)
        .store(Arc::new(JsonFileStore::new(config.store.dir.clone())))
        .executor(Arc::new(FixtureExecutor::new(
            config.executor.fixtures_dir.clone(),
        )))
        .sink(Arc::new(sink))
        .with_standard_commands()
        .expect_commands(&CommandKind::ALL)
        .build()?;
    Ok(app)
}

async fn dispatch_and_print(app: &App, command: Command) -> anyhow::Result<()> {
    let response = app.dispatch(command).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run(app: App) -> anyhow::Result<()> {
    let ticks = TickLoop::spawn(app.scheduler.clone(), app.scheduler.settings().tick_interval);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<Command>(&line) {
                        Ok(command) => {
                            if let Err(e) = dispatch_and_print(&app, command).await {
                                warn!(error = %e, "command failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed command"),
                    },
                    None => stdin_open = false,
                }
            }
        }
    }

    ticks.shutdown_and_join().await;
    app.scheduler.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config).context("failed to load configuration")?;

    // one-shot commands load and rewrite the whole backlog, so only one
    // process may own the store at a time
    let lock = RunnerLock::new(
        config.store.dir.clone(),
        Arc::new(SystemClock),
        config.lock_stale_after(),
    );
    let _guard = match cli.command {
        CliCommand::Run => Some(lock.acquire(config.lock_heartbeat()).await?),
        _ => {
            lock.ensure_free().await?;
            None
        }
    };

    let app = build_app(&config)?;
    let restored = app.scheduler.restore().await?;
    info!(
        tasks = restored.tasks,
        buffered_deliveries = restored.buffered_deliveries,
        "state loaded from {}",
        config.store.dir.display()
    );

    match cli.command {
        CliCommand::Run => run(app).await,
        CliCommand::Enqueue {
            keywords,
            categories,
            max_pages,
            priority,
            value,
            dependencies,
            max_retries,
        } => {
            let options = TaskOptions {
                categories: if categories.is_empty() {
                    Category::ALL.to_vec()
                } else {
                    categories
                },
                max_pages_per_category: max_pages,
                priority_tier: priority,
                estimated_value: value,
                dependencies,
                max_retries,
                ..TaskOptions::default()
            };
            dispatch_and_print(&app, Command::Enqueue { keywords, options }).await
        }
        CliCommand::Status => dispatch_and_print(&app, Command::GetStatus).await,
        CliCommand::Pause => dispatch_and_print(&app, Command::Pause).await,
        CliCommand::Resume => dispatch_and_print(&app, Command::Resume).await,
        CliCommand::Stop => dispatch_and_print(&app, Command::Stop).await,
    }
}
