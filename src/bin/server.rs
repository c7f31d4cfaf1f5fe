use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use logpose::audit::AuditSink;
use logpose::auth::IdentityGate;
use logpose::config::{parse_email_list, parse_root_list, Config, Environment};
use logpose::repos::RepoRegistry;
use logpose::sessions::{SessionLimits, SessionManager};
use logpose::settings::SettingsStore;
use logpose::tasks::TaskRunner;
use logpose::worktrees::WorktreeManager;
use logpose::{build_router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "logposed", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, env = "HOST", default_value = logpose::DEFAULT_HOST)]
    host: String,
    /// Port for the HTTP server
    #[arg(long, env = "PORT", default_value_t = logpose::DEFAULT_PORT)]
    port: u16,
    /// Runtime environment; production enforces the identity-provider config
    #[arg(long, env = "LOGPOSE_ENV", value_enum, default_value = "development")]
    env: Environment,
    /// Comma-separated absolute paths holding repositories
    #[arg(long, env = "REPO_ROOTS")]
    repo_roots: String,
    /// Comma-separated emails allowed through the gate (seed; settings file wins)
    #[arg(long, env = "ALLOWLIST_EMAILS", default_value = "")]
    allowlist_emails: String,
    /// Subset of the allowlist with admin rights
    #[arg(long, env = "ADMIN_EMAILS", default_value = "")]
    admin_emails: String,
    /// Cloudflare Access team domain, e.g. team.cloudflareaccess.com
    #[arg(long, env = "CF_ACCESS_TEAM_DOMAIN")]
    cf_access_team_domain: Option<String>,
    /// Cloudflare Access application audience tag
    #[arg(long, env = "CF_ACCESS_AUD")]
    cf_access_aud: Option<String>,
    /// Accept X-Dev-Email / devEmail in development
    #[arg(long, env = "DEV_AUTH", default_value_t = false)]
    dev_auth: bool,
    #[arg(long, env = "MAX_SESSIONS_PER_USER", default_value_t = 3)]
    max_sessions_per_user: usize,
    #[arg(long, env = "MAX_TOTAL_SESSIONS", default_value_t = 20)]
    max_total_sessions: usize,
    #[arg(long, env = "DISCONNECTED_TTL_MINUTES", default_value_t = 20)]
    disconnected_ttl_minutes: u64,
    #[arg(long, env = "MAX_FILE_SIZE_BYTES", default_value_t = 2_000_000)]
    max_file_size_bytes: u64,
    #[arg(long, env = "TASKS_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    tasks_enabled: bool,
    /// Path to the assistant binary spawned in each session
    #[arg(long, env = "CLAUDE_PATH", default_value = "claude")]
    claude_path: String,
    /// Directory for settings, task definitions, and audit logs
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Directory for server log files
    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    let config = Arc::new(Config {
        host: options.host.clone(),
        port: options.port,
        environment: options.env,
        repo_roots: parse_root_list(&options.repo_roots),
        allowlist_emails: parse_email_list(&options.allowlist_emails),
        admin_emails: parse_email_list(&options.admin_emails),
        cf_access_team_domain: options.cf_access_team_domain,
        cf_access_aud: options.cf_access_aud,
        dev_auth: options.dev_auth,
        max_sessions_per_user: options.max_sessions_per_user,
        max_total_sessions: options.max_total_sessions,
        disconnected_ttl_minutes: options.disconnected_ttl_minutes,
        max_file_size_bytes: options.max_file_size_bytes,
        tasks_enabled: options.tasks_enabled,
        claude_path: options.claude_path,
        data_dir: options.data_dir,
    });
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialization order: settings, audit, sessions, then the server.
    let settings = Arc::new(SettingsStore::load(
        &config.data_dir,
        config.allowlist_emails.clone(),
        config.admin_emails.clone(),
    ));
    let audit = Arc::new(AuditSink::new(&config.data_dir));
    let sessions = SessionManager::new(
        config.claude_path.clone(),
        SessionLimits {
            max_per_user: config.max_sessions_per_user,
            max_total: config.max_total_sessions,
            disconnected_ttl: config.disconnected_ttl(),
        },
    );
    sessions.spawn_reaper();

    let state = AppState {
        registry: Arc::new(RepoRegistry::new(config.repo_roots.clone())),
        worktrees: Arc::new(WorktreeManager::new()),
        sessions,
        auth: Arc::new(IdentityGate::new(config.clone(), settings.clone())),
        settings,
        audit,
        tasks: Arc::new(TaskRunner::load(&config.data_dir, config.tasks_enabled)),
        config: config.clone(),
    };

    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("logposed listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Console logging always; a daily-rolling file under `log_dir` when that
/// directory is writable. The returned guard must outlive the server or the
/// file writer loses buffered lines.
fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_writer = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, "logposed.log");
            Some(tracing_appender::non_blocking(appender))
        }
        Err(e) => {
            eprintln!(
                "log directory {} unavailable ({e}); console logging only",
                log_dir.display()
            );
            None
        }
    };

    let console = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    match file_writer {
        Some((writer, guard)) => {
            console
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_target(false)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            console.init();
            None
        }
    }
}
