//! NGM CLI - drive the dashboard request layer from a terminal.
//!
//! Every subcommand goes through the same [`AppContext`] the dashboard uses:
//! the configured base URL, the persisted session store, the retrying
//! executor and the session guard. Ctrl-C cancels an in-flight request
//! through the executor's external signal.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ngm_client::{AppContext, RequestError, RequestOptions};
use ngm_config::{NgmConfig, ResolvedConfig};
use ngm_core::{
    CancelController, CancelReason, ChangeDispatcher, ChangeEvent, FileTokenStore,
    MemoryTokenStore, Navigator, Notifier, Reconcile, SessionState, TokenStore,
};
use ngm_types::{PermissionSnapshot, UserProfile};

#[derive(Parser)]
#[command(name = "ngm", version)]
#[command(about = "Call the NGM backend through the resilient request layer")]
struct Cli {
    /// Config file (default: ~/.ngm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep the session in memory; nothing is read from or written to disk
    #[arg(long, global = true)]
    ephemeral: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call an endpoint and print the parsed JSON result
    Request {
        /// Root-relative path (joined to the API base) or absolute URL
        path: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
        /// Wall-clock budget for the whole call, retries included
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Do not send the bearer token
        #[arg(long)]
        no_auth: bool,
        /// Print status and body without parsing
        #[arg(long)]
        raw: bool,
    },
    /// Store a bearer token, with optional cached profile and permissions
    Login {
        token: String,
        /// JSON file with the user profile
        #[arg(long)]
        profile: Option<PathBuf>,
        /// JSON file with `[{ "module_key", "can_view" }]`
        #[arg(long)]
        permissions: Option<PathBuf>,
    },
    /// Clear the stored session
    Logout,
    /// Show the stored session
    Session,
    /// Check whether a view may be opened with the stored session
    Check { view: String },
    /// Read realtime change events (JSON lines) from stdin and print reconcile actions
    Watch {
        /// Tables that support in-place row patches
        #[arg(long, value_delimiter = ',')]
        patchable: Vec<String>,
    },
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // ~/.ngm/logs/ngm.log
    if let Some(config_path) = NgmConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("ngm.log"));
    }

    candidates.push(PathBuf::from(".ngm").join("logs").join("ngm.log"));
    candidates
}

/// Notifications go to stderr so stdout stays machine-readable.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn success(&self, title: &str, message: &str) {
        eprintln!("{title}: {message}");
    }

    fn warning(&self, title: &str, message: &str) {
        eprintln!("warning: {title}: {message}");
    }

    fn error(&self, title: &str, message: &str, details: Option<&str>) {
        eprintln!("error: {title}: {message}");
        if let Some(details) = details {
            tracing::debug!(title, details, "Error details");
        }
    }
}

struct ConsoleNavigator {
    api_base: String,
}

impl Navigator for ConsoleNavigator {
    fn navigate(&self, location: &str) {
        let location = location.trim_start_matches('/');
        eprintln!(
            "Session ended. Sign in again at {}/{location} and run `ngm login <token>`.",
            self.api_base
        );
    }
}

fn load_config(path: Option<&Path>) -> Result<ResolvedConfig> {
    let config = match path {
        Some(path) => Some(NgmConfig::load_from(path.to_path_buf())?),
        None => NgmConfig::load()?,
    };
    Ok(ngm_config::resolve(config.as_ref())?)
}

fn open_store(config: &ResolvedConfig, ephemeral: bool) -> Result<Arc<dyn TokenStore>> {
    match &config.store_path {
        Some(path) if !ephemeral => Ok(Arc::new(FileTokenStore::open(path.clone())?)),
        _ => Ok(Arc::new(MemoryTokenStore::new())),
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&config, cli.ephemeral)?;
    let navigator = Arc::new(ConsoleNavigator {
        api_base: config.api_base.clone(),
    });
    let ctx = AppContext::start(config, store, Arc::new(ConsoleNotifier), navigator)?;

    let result = run(&ctx, cli.command).await;
    ctx.shutdown();
    result
}

async fn run(ctx: &AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::Request {
            path,
            method,
            data,
            timeout_ms,
            no_auth,
            raw,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method {method:?}"))?;
            let mut options = RequestOptions::new().method(method);
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(ms));
            }
            if no_auth {
                options = options.skip_auth();
            }
            if let Some(data) = data {
                let body: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
                options = options.json(body);
            }
            request(ctx, &path, options, raw).await
        }
        Commands::Login {
            token,
            profile,
            permissions,
        } => {
            let profile: Option<UserProfile> =
                profile.as_deref().map(read_json_file).transpose()?;
            let permissions: Option<PermissionSnapshot> =
                permissions.as_deref().map(read_json_file).transpose()?;
            let session = ctx
                .session
                .login(&token, profile.as_ref(), permissions.as_ref())?;
            match session.expires_at {
                Some(expires_at) => println!("Logged in; session expires {expires_at}"),
                None => println!("Logged in"),
            }
            Ok(())
        }
        Commands::Logout => {
            ctx.session.logout();
            Ok(())
        }
        Commands::Session => {
            print_session(ctx);
            Ok(())
        }
        Commands::Check { view } => {
            if ctx.session.check_access(&view) {
                println!("{view}: allowed");
                Ok(())
            } else {
                bail!("{view}: sign-in required")
            }
        }
        Commands::Watch { patchable } => {
            watch(ctx, patchable).await;
            Ok(())
        }
    }
}

async fn request(ctx: &AppContext, path: &str, options: RequestOptions, raw: bool) -> Result<()> {
    let interrupt = CancelController::new();
    let options = options.signal(interrupt.signal());
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel(CancelReason::Aborted);
        }
    });
    let result = print_response(ctx, path, options, raw).await;
    ctrl_c.abort();
    result
}

async fn print_response(
    ctx: &AppContext,
    path: &str,
    options: RequestOptions,
    raw: bool,
) -> Result<()> {
    if raw {
        match ctx.client.request_raw(path, options).await {
            Ok(Some(response)) => {
                println!("{}", response.status());
                println!("{}", response.text().await?);
            }
            Ok(None) => {}
            Err(e) => return Err(surface(ctx, e)),
        }
        return Ok(());
    }

    match ctx.client.request(path, options).await {
        Ok(Some(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
        Ok(None) => {}
        Err(e) => return Err(surface(ctx, e)),
    }
    Ok(())
}

fn surface(ctx: &AppContext, error: RequestError) -> anyhow::Error {
    if let Some(summary) = error.user_summary() {
        ctx.notifier
            .error("Request failed", &summary, Some(&error.to_string()));
    }
    anyhow::Error::new(error)
}

fn print_session(ctx: &AppContext) {
    let Some(session) = ctx.session.session() else {
        println!("state: {:?}", SessionState::Unauthenticated);
        return;
    };
    println!("state: {:?}", ctx.session.state());
    if let Some(subject) = &session.subject {
        println!("subject: {subject}");
    }
    if let Some(role) = &session.role {
        println!("role: {role}");
    }
    match session.expires_at {
        Some(expires_at) => println!("expires: {expires_at}"),
        None => println!("expires: never"),
    }
    if let Some(name) = ctx.session.profile().and_then(|p| p.user_name) {
        println!("user: {name}");
    }
    let permissions = ctx.session.permissions();
    let visible: Vec<&str> = permissions
        .entries()
        .iter()
        .filter(|p| p.can_view)
        .map(|p| p.module_key.as_str())
        .collect();
    if !visible.is_empty() {
        println!("modules: {}", visible.join(", "));
    }
}

async fn watch(ctx: &AppContext, patchable: Vec<String>) {
    let (tx, rx) = mpsc::channel::<ChangeEvent>(64);

    let reader = ctx.spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeEvent>(&line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Skipping unreadable change event: {e}"),
            }
        }
        Ok::<(), String>(())
    });

    ChangeDispatcher::new(patchable)
        .run(rx, |action| match action {
            Reconcile::FullRefresh { table } => println!("refresh {table}"),
            Reconcile::Patch { table, record_id } => println!("patch {table} {record_id}"),
        })
        .await;

    // The reader exits once stdin closes; its errors already went to the monitor.
    let _ = reader.await;
}
