#![forbid(unsafe_code)]

//! `exam-session-sync`: drive one exam session from line commands.
//!
//! Loads configuration and a test layout, opens the session against a
//! `SQLite`-backed shared record store with a durable local queue, and reads
//! commands from stdin. Logs go to stderr; command output to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use exam_session_sync::channel::ChannelHub;
use exam_session_sync::connectivity::Connectivity;
use exam_session_sync::models::annotation::{AnnotationOp, Highlight};
use exam_session_sync::models::layout::TestLayout;
use exam_session_sync::models::record::session_id_for;
use exam_session_sync::orchestrator::controller::{SessionController, SessionDeps, SessionParams};
use exam_session_sync::persistence::db;
use exam_session_sync::persistence::queue_store::open_queue_store;
use exam_session_sync::persistence::record_repo::RecordRepo;
use exam_session_sync::persistence::record_store::RecordStore;
use exam_session_sync::results::RecordResultService;
use exam_session_sync::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "exam-session-sync", about = "Offline-tolerant exam session driver", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the TOML test layout.
    #[arg(long)]
    layout: PathBuf,

    /// Student identifier.
    #[arg(long)]
    user: String,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

enum Flow {
    Continue,
    Quit,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("exam-session-sync bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    let layout = Arc::new(TestLayout::load_from_path(&args.layout)?);
    info!(test_id = %layout.test_id, "configuration and layout loaded");

    // ── Open stores ─────────────────────────────────────
    let queue = open_queue_store(&config.queue_db_path).await;
    let records = Arc::new(db::connect(&config.record_db_path).await?);
    let remote: Arc<dyn RecordStore> = Arc::new(RecordRepo::new(records));
    info!("stores opened");

    // ── Open session ────────────────────────────────────
    let session_id = session_id_for(&args.user, &layout.test_id);
    let hub = ChannelHub::new();
    let connectivity = Connectivity::default();
    let deps = SessionDeps {
        queue,
        remote: Arc::clone(&remote),
        channel: Arc::new(hub.channel(&session_id)),
        results: Arc::new(RecordResultService::new(remote)),
        connectivity: connectivity.clone(),
    };
    let controller = SessionController::open(
        &config,
        deps,
        SessionParams {
            user_id: args.user,
            layout,
            instance_token: None,
        },
    )
    .await?;
    print_status(&controller);

    // ── Command loop ────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => line
                .map_err(|err| AppError::Io(format!("failed to read stdin: {err}")))?,
        };
        let Some(line) = line else { break };

        match execute(&controller, &connectivity, line.trim()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => {
                error!(%err, "command failed");
                println!("error: {err}");
            }
        }
    }

    controller.close().await;
    info!("exam-session-sync shut down");
    Ok(())
}

async fn execute(
    controller: &SessionController,
    connectivity: &Connectivity,
    line: &str,
) -> Result<Flow> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(Flow::Continue);
    };
    let rest: Vec<&str> = parts.collect();

    match command {
        "answer" => controller.set_answer(Some(rest.join(" "))).await?,
        "clear" => controller.set_answer(None).await?,
        "flag" => {
            let flagged = controller.toggle_flag().await?;
            println!("flagged: {flagged}");
        }
        "next" => {
            controller.go_next().await?;
        }
        "prev" => {
            controller.go_previous().await?;
        }
        "sub" => controller.select_sub_question(arg(&rest, 0, "label")?).await?,
        "highlight" => {
            let start = number(&rest, 0, "start")?;
            let end = number(&rest, 1, "end")?;
            let color = rest.get(2).copied().unwrap_or("yellow").to_owned();
            controller
                .annotate(AnnotationOp::AddHighlight {
                    highlight: Highlight { start, end, color },
                })
                .await?;
        }
        "unhighlight" => {
            let index = number(&rest, 0, "index")?;
            controller
                .annotate(AnnotationOp::RemoveHighlight { index })
                .await?;
        }
        "strike" => {
            let choice = arg(&rest, 0, "choice")?.to_owned();
            controller
                .annotate(AnnotationOp::ToggleStrikethrough { choice })
                .await?;
        }
        "clear-annotations" => controller.annotate(AnnotationOp::ClearAll).await?,
        "offline" => connectivity.set_online(false),
        "online" => connectivity.set_online(true),
        "visible" => controller.notify_visible(),
        "hidden" => controller.notify_hidden(),
        "take-control" => controller.take_control().await?,
        "sync" => {
            let outcome = controller.flush_now().await?;
            println!("sync: {outcome:?}");
        }
        "submit" => {
            let outcome = controller.submit_test().await?;
            println!("submit: {outcome:?}");
        }
        "retry" => {
            let outcome = controller.retry_submit().await?;
            println!("retry: {outcome:?}");
        }
        "status" => {}
        "quit" | "exit" => return Ok(Flow::Quit),
        other => {
            println!("unknown command: {other}");
            return Ok(Flow::Continue);
        }
    }

    print_status(controller);
    Ok(Flow::Continue)
}

fn arg<'a>(rest: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    rest.get(index)
        .copied()
        .ok_or_else(|| AppError::Config(format!("missing argument: {name}")))
}

fn number(rest: &[&str], index: usize, name: &str) -> Result<usize> {
    arg(rest, index, name)?
        .parse()
        .map_err(|err| AppError::Config(format!("invalid {name}: {err}")))
}

fn print_status(controller: &SessionController) {
    match serde_json::to_string(&controller.view()) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(%err, "failed to render session view"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
