use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vmlab::api;
use vmlab::auth;
use vmlab::db::Database;
use vmlab::orchestrator::{HttpOrchestrator, OrchestratorApi};
use vmlab::reaper::{Reaper, ReaperConfig, ReaperReport};
use vmlab::session::{SessionRepository, SessionService, SessionServiceConfig};
use vmlab::settings::SettingsRepository;
use vmlab::template::TemplateRepository;
use vmlab_protocol::api::Disposal;

const APP_NAME: &str = "vmlab";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_reap(ctx: RuntimeContext) -> Result<()> {
    handle_reap(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Reap => async_reap(ctx),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "vmlab - ephemeral per-user VM sessions with idle reclamation.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON (also switches logs to JSON)
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server and the session reaper
    Serve(ServeCommand),
    /// Run a single reaper pass against the database and exit
    Reap,
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Orchestrator base URL (overrides orchestrator.base_url)
    #[arg(long, value_name = "URL")]
    orchestrator_url: Option<String>,
    /// Do not start the background reaper
    #[arg(long = "no-reaper")]
    no_reaper: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("vmlab={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Services log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    /// CLI flags win; otherwise `logging.level` from config.
    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    fn database_path(&self) -> PathBuf {
        self.paths.data_dir.join("vmlab.db")
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    server: ServerConfig,
    orchestrator: OrchestratorConfig,
    sessions: SessionsConfig,
    reaper: ReaperSettings,
    auth: auth::AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct OrchestratorConfig {
    base_url: String,
    /// Bearer token. Supports `env:VAR_NAME`.
    token: Option<String>,
    request_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    fn resolved_token(&self) -> Result<Option<String>> {
        match self.token.as_deref() {
            None => Ok(None),
            Some(token) => match token.strip_prefix("env:") {
                Some(var) => env::var(var)
                    .map(Some)
                    .with_context(|| format!("orchestrator.token: env var {} is not set", var)),
                None => Ok(Some(token.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    max_concurrent_sessions: i64,
    per_user_session_limit: i64,
    provisioning_timeout_secs: u64,
    provisioning_poll_interval_ms: u64,
    /// Let `GET /sessions?touch=true` count as activity.
    touch_on_list: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        let defaults = SessionServiceConfig::default();
        Self {
            max_concurrent_sessions: defaults.max_concurrent_sessions,
            per_user_session_limit: defaults.per_user_session_limit,
            provisioning_timeout_secs: defaults.provisioning_timeout.as_secs(),
            provisioning_poll_interval_ms: defaults.provisioning_poll_interval.as_millis() as u64,
            touch_on_list: defaults.touch_on_list,
        }
    }
}

impl From<&SessionsConfig> for SessionServiceConfig {
    fn from(cfg: &SessionsConfig) -> Self {
        Self {
            max_concurrent_sessions: cfg.max_concurrent_sessions,
            per_user_session_limit: cfg.per_user_session_limit,
            provisioning_timeout: Duration::from_secs(cfg.provisioning_timeout_secs),
            provisioning_poll_interval: Duration::from_millis(cfg.provisioning_poll_interval_ms),
            touch_on_list: cfg.touch_on_list,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ReaperSettings {
    enabled: bool,
    interval_seconds: u64,
    disposal: Disposal,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            disposal: Disposal::Delete,
        }
    }
}

impl From<&ReaperSettings> for ReaperConfig {
    fn from(cfg: &ReaperSettings) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_seconds.max(1)),
            disposal: cfg.disposal,
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("{}", render(&ctx.common, &ctx.config)?);
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

/// Render as JSON, YAML or debug text per the global output flags.
fn render<T: Serialize + fmt::Debug>(common: &CommonOpts, value: &T) -> Result<String> {
    if common.json {
        serde_json::to_string_pretty(value).context("serializing output to JSON")
    } else if common.yaml {
        serde_yaml::to_string(value).context("serializing output to YAML")
    } else {
        Ok(format!("{value:#?}"))
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

struct Services {
    sessions: SessionService,
    templates: TemplateRepository,
    reaper: Arc<Reaper>,
}

async fn build_services(ctx: &RuntimeContext, orchestrator_url: Option<&str>) -> Result<Services> {
    let db_path = ctx.database_path();
    info!("Database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let base_url = orchestrator_url.unwrap_or(&ctx.config.orchestrator.base_url);
    info!("Orchestrator: {}", base_url);
    let orchestrator: Arc<dyn OrchestratorApi> = Arc::new(HttpOrchestrator::new(
        base_url,
        ctx.config.orchestrator.resolved_token()?,
        Duration::from_secs(ctx.config.orchestrator.request_timeout_secs),
    )?);

    let templates = TemplateRepository::new(database.pool().clone());
    let sessions = SessionService::new(
        SessionRepository::new(database.pool().clone()),
        templates.clone(),
        SettingsRepository::new(database.pool().clone()),
        orchestrator,
        SessionServiceConfig::from(&ctx.config.sessions),
    );
    let reaper = Arc::new(Reaper::new(
        sessions.clone(),
        ReaperConfig::from(&ctx.config.reaper),
    ));

    Ok(Services {
        sessions,
        templates,
        reaper,
    })
}

async fn handle_reap(ctx: &RuntimeContext) -> Result<()> {
    let services = build_services(ctx, None).await?;
    let report: ReaperReport = services.reaper.tick(vmlab_protocol::now_ms()).await?;

    if ctx.common.json || ctx.common.yaml {
        println!("{}", render(&ctx.common, &report)?);
    } else {
        println!(
            "idle: {}, retried: {}, abandoned: {}, auto-deleted: {}, failed: {}",
            report.idle.len(),
            report.retried.len(),
            report.abandoned.len(),
            report.auto_deleted.len(),
            report.failed.len()
        );
        for (id, error) in &report.failed {
            println!("  {id}: {error}");
        }
    }

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} reaper action(s) failed", report.failed.len()))
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting vmlab server...");

    let auth_config = ctx.config.auth.clone();
    auth_config
        .validate()
        .context("Invalid auth configuration")?;
    info!(
        "Auth mode: {}",
        if auth_config.dev_mode {
            "development"
        } else {
            "production"
        }
    );
    let auth_state = auth::AuthState::new(auth_config);

    let services = build_services(ctx, cmd.orchestrator_url.as_deref()).await?;

    let shutdown = CancellationToken::new();
    let reaper_task = if ctx.config.reaper.enabled && !cmd.no_reaper {
        Some(services.reaper.clone().spawn(shutdown.clone()))
    } else {
        warn!("Session reaper disabled; idle sessions will not be reclaimed server-side");
        None
    };

    let sessions_for_shutdown = services.sessions.clone();
    let state = api::AppState::new(
        services.sessions,
        services.templates,
        services.reaper,
        auth_state,
    );
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let signal_token = shutdown.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
        sessions_for_shutdown.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    shutdown.cancel();
    if let Some(task) = reaper_task {
        if let Err(e) = task.await {
            warn!("Reaper task ended abnormally: {:?}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!(
        "# Configuration for {}\n# File: {}\n# Environment overrides: {}__SECTION__KEY\n\n",
        APP_NAME,
        path.display(),
        env_prefix()
    );
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
