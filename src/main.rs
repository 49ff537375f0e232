use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{Notify, RwLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use calm_mail::config::{DEFAULT_CONFIG_PATH, EnvOverrides, MailConfig};
use calm_mail::dashboard::{DashboardState, dashboard_routes};
use calm_mail::gmail::{CredentialStore, GmailApi, GmailClient};
use calm_mail::llm::{LlmConfig, create_provider};
use calm_mail::pipeline::poller::{InboxPoller, PollerSettings, spawn_poller};
use calm_mail::pipeline::router::HybridRouter;
use calm_mail::store::{Database, LibSqlBackend};

/// Gmail inbox triage: sender rules, a kill list and a local LLM.
#[derive(Parser)]
#[command(name = "calm-mail", version)]
struct Cli {
    /// Path to config.json.
    #[arg(long, env = "CALM_MAIL_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the inbox (default).
    Run {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Run the OAuth consent flow and save token.json.
    Authorize,

    /// Install a Google OAuth client-secrets file. Clears the stored token.
    ImportCredentials {
        /// Downloaded client secrets JSON.
        path: PathBuf,
    },
}

/// Console logging plus, when `CALM_MAIL_LOG_DIR` is set, a daily-rolling
/// file of the `activity` target.
fn init_tracing() -> Option<WorkerGuard> {
    let console = fmt::layer().with_target(false).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let (activity, guard) = match std::env::var_os("CALM_MAIL_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "activity.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target("activity", tracing::Level::INFO));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(activity)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let file_config = MailConfig::load_or_init(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let overrides = EnvOverrides::from_env();
    let config = overrides.apply(&file_config);
    config.validate()?;

    let credentials = Arc::new(CredentialStore::new(
        &config.credentials_path,
        &config.token_path,
    ));

    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::ImportCredentials { path } => {
            credentials.import_credentials(&path).await?;
            eprintln!("Credentials imported. Run `calm-mail authorize` next.");
            Ok(())
        }
        Command::Authorize => {
            credentials.authorize_interactive().await?;
            eprintln!("Authorized. Token saved to {}", config.token_path.display());
            Ok(())
        }
        Command::Run { once } => {
            run(cli.config, file_config, overrides, config, credentials, once).await
        }
    }
}

async fn run(
    config_path: PathBuf,
    file_config: MailConfig,
    overrides: EnvOverrides,
    config: MailConfig,
    credentials: Arc<CredentialStore>,
    once: bool,
) -> anyhow::Result<()> {
    eprintln!("📬 Calm Mail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!(
        "   Mode: {}",
        if config.ai_enabled {
            format!("sniper + AI ({} at {})", config.model, config.ollama_url)
        } else {
            "sniper only".to_string()
        }
    );

    credentials
        .ensure_authorized()
        .await
        .context("Gmail authorization failed")?;
    let gmail: Arc<dyn GmailApi> = Arc::new(GmailClient::new(credentials)?);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Router ───────────────────────────────────────────────────────────
    let llm = if config.ai_enabled {
        let llm = create_provider(&LlmConfig::from_mail_config(&config))?;
        if let Err(e) = llm.health_check().await {
            tracing::warn!("LLM health check failed, AI mode will defer messages: {e}");
        }
        Some(llm)
    } else {
        None
    };
    let router = HybridRouter::from_config(&config, llm)?;
    eprintln!(
        "   Rules: {} sender, {} kill list",
        router.rules().rule_count(),
        router.rules().kill_count()
    );

    let poller = Arc::new(InboxPoller::new(
        gmail,
        router,
        Arc::clone(&db),
        PollerSettings::from_config(&config),
    ));

    if once {
        let report = poller.run_cycle().await?;
        eprintln!(
            "   Done: {} labeled, {} deleted, {} ignored, {} deferred, {} skipped, {} failed",
            report.labeled,
            report.deleted,
            report.ignored,
            report.deferred,
            report.skipped,
            report.failed
        );
        return Ok(());
    }

    let trigger = Arc::new(Notify::new());
    let interval = Duration::from_secs(config.poll_interval_secs);

    // ── Dashboard ────────────────────────────────────────────────────────
    if config.dashboard_port != 0 {
        let port = config.dashboard_port;
        let app = dashboard_routes(DashboardState {
            config: Arc::new(RwLock::new(file_config)),
            overrides,
            config_path,
            poller: Arc::clone(&poller),
            db,
            trigger: Arc::clone(&trigger),
        });
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind dashboard port {port}"))?;
        eprintln!("   Dashboard: http://127.0.0.1:{port}/api/status");
        tokio::spawn(async move {
            tracing::info!(port, "Dashboard server started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Dashboard server stopped: {e}");
            }
        });
    } else {
        eprintln!("   Dashboard: disabled");
    }

    eprintln!("   Polling every {}s. Ctrl-C to stop.\n", interval.as_secs());
    let (handle, shutdown) = spawn_poller(poller, interval, Arc::clone(&trigger));

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    shutdown.store(true, Ordering::Relaxed);
    trigger.notify_one();
    let _ = handle.await;
    Ok(())
}
