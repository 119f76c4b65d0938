use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use todod::cli::client::{read_auth_token, DaemonClient};
use todod::config::{ConfigWatcher, DaemonConfig};
use todod::ipc::event::EventBroadcaster;
use todod::store::TaskStore;
use todod::{ipc, AppContext};
use tracing::info;

#[derive(Parser)]
#[command(name = "todod", about = "todod — local to-do host daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "TODOD_PORT")]
    port: Option<u16>,

    /// Data directory for todos.json, config, and the auth token
    #[arg(long, env = "TODOD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TODOD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1)
    #[arg(long, env = "TODOD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TODOD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Suppress informational output. Errors are still printed to stderr.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Runs todod in the foreground.
    ///
    /// Examples:
    ///   todod serve
    ///   todod
    Serve,
    /// Query the status of a running daemon.
    Status {
        /// Print raw JSON instead of the human-readable summary.
        #[arg(long)]
        json: bool,
    },
    /// List all to-do items.
    List,
    /// Add a to-do item.
    ///
    /// Examples:
    ///   todod add "buy milk"
    Add {
        /// The item text.
        text: String,
    },
    /// Toggle the completed flag of a to-do item.
    Toggle {
        /// The item id (as printed by `todod list`).
        id: i64,
    },
    /// Delete a to-do item.
    Delete {
        /// The item id (as printed by `todod list`).
        id: i64,
    },
    /// Manage the local auth token.
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Print the auth token and its file path.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls. Client subcommands
    // default to errors-only so RPC output stays clean.
    let default_level = if matches!(args.command, None | Some(Command::Serve)) {
        "info"
    } else {
        "error"
    };
    let log_level = args.log.clone().unwrap_or_else(|| default_level.to_owned());
    let log_format = std::env::var("TODOD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    let quiet = args.quiet;
    let command = args.command.take();
    match command {
        Some(Command::Status { json }) => {
            let config = client_config(&args);
            let client = daemon_client(&config)?;
            if !client.is_reachable().await {
                eprintln!(
                    "daemon not running on port {} — start it with `todod serve`",
                    config.port
                );
                std::process::exit(1);
            }
            let result = client.call_once("daemon.status", json!({})).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "todod {} — up {}s, {} todos, port {}",
                    result["version"].as_str().unwrap_or("?"),
                    result["uptime"].as_u64().unwrap_or(0),
                    result["todos"].as_u64().unwrap_or(0),
                    result["port"].as_u64().unwrap_or(0),
                );
            }
        }
        Some(Command::List) => {
            let config = client_config(&args);
            let result = daemon_client(&config)?
                .call_once("get-todos", json!({}))
                .await?;
            print_tasks(&result, quiet);
        }
        Some(Command::Add { text }) => {
            let config = client_config(&args);
            let result = daemon_client(&config)?
                .call_once("add-todo", json!({ "text": text }))
                .await?;
            print_tasks(&result, quiet);
        }
        Some(Command::Toggle { id }) => {
            let config = client_config(&args);
            let result = daemon_client(&config)?
                .call_once("toggle-todo", json!({ "id": id }))
                .await?;
            print_tasks(&result, quiet);
        }
        Some(Command::Delete { id }) => {
            let config = client_config(&args);
            let result = daemon_client(&config)?
                .call_once("delete-todo", json!({ "id": id }))
                .await?;
            print_tasks(&result, quiet);
        }
        Some(Command::Token { cmd }) => {
            let config = client_config(&args);
            match cmd {
                TokenCmd::Show => {
                    let token = read_auth_token(&config.data_dir)?;
                    println!("{}", config.data_dir.join("auth_token").display());
                    println!("{token}");
                }
            }
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log, args.bind_address).await?;
        }
    }

    Ok(())
}

/// Config for client subcommands — same resolution as the server so both
/// sides agree on port and data directory.
fn client_config(args: &Args) -> DaemonConfig {
    DaemonConfig::new(
        args.port,
        args.data_dir.clone(),
        Some("error".to_string()),
        args.bind_address.clone(),
    )
}

fn daemon_client(config: &DaemonConfig) -> Result<DaemonClient> {
    let token = read_auth_token(&config.data_dir)?;
    Ok(DaemonClient::new(config.port, token))
}

/// Print a task collection the way `todod list` shows it:
/// `[x] <id>  <text>` per line.
fn print_tasks(result: &serde_json::Value, quiet: bool) {
    let Some(tasks) = result.as_array() else {
        eprintln!("unexpected response: {result}");
        return;
    };
    if tasks.is_empty() && !quiet {
        println!("no todos");
        return;
    }
    for t in tasks {
        let mark = if t["completed"].as_bool().unwrap_or(false) {
            'x'
        } else {
            ' '
        };
        println!(
            "[{mark}] {:>13}  {}",
            t["id"].as_i64().unwrap_or(0),
            t["text"].as_str().unwrap_or("")
        );
    }
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
) -> Result<()> {
    let config = Arc::new(DaemonConfig::new(port, data_dir, log, bind_address));

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| {
            format!(
                "could not create data directory {}",
                config.data_dir.display()
            )
        })?;

    let auth_token = ipc::auth::get_or_create_token(&config.data_dir)?;

    let store = Arc::new(TaskStore::open(&config.data_dir, config.recovery).await?);
    let broadcaster = Arc::new(EventBroadcaster::new());

    // Hot-reload watcher for config.toml (non-fatal if unavailable).
    // Seeded with the resolved log level so status reflects CLI/env overrides.
    let watcher = ConfigWatcher::start(&config.data_dir, &config.log);
    let hot_config = watcher.as_ref().map(|w| w.hot.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        port = config.port,
        "todod starting"
    );

    let ctx = Arc::new(AppContext {
        config,
        store,
        broadcaster,
        started_at: std::time::Instant::now(),
        auth_token,
        hot_config,
    });

    ipc::run(ctx).await
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("todod.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(log_level)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(log_level)
                    .compact()
                    .init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
        None
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
