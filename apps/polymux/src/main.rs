use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use polymux_auth::{
    set_quota_cooldown_disabled, Auth, AuthRegistry, AuthStore, QuotaManager, Refresher, Selector,
    StickyStore,
};
use polymux_core::{Manager, ManagerConfig, UsageRecord, UsageSink};
use polymux_provider::ExecutorRegistry;

mod config;
mod server;

use config::Config;

#[derive(Parser)]
#[command(name = "polymux", version, about = "Multiplex subscription LLM accounts behind one API")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    auth_dir: Option<String>,
    #[arg(long)]
    proxy: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default).
    Serve,
    /// Validate pasted credential JSON and write it as an auth file.
    Import {
        /// Read from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Env,
    /// Print the version.
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(Some(&cli.config))?;
    if let Some(host) = cli.host.clone() {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(auth_dir) = cli.auth_dir.clone() {
        config.auth_dir = auth_dir;
    }
    if let Some(proxy) = cli.proxy.clone() {
        config.proxy_url = Some(proxy);
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config),
        Command::Import { file } => import(&config, file.as_deref()),
        Command::Env => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Version => {
            println!("polymux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn serve(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve_async(config))
}

async fn serve_async(config: Config) -> anyhow::Result<()> {
    set_quota_cooldown_disabled(config.disable_cooling);

    let store = AuthStore::new(config.auth_dir_resolved())
        .with_context(|| format!("opening auth dir {}", config.auth_dir))?;
    let quota = Arc::new(QuotaManager::new());
    let registry = Arc::new(AuthRegistry::new(Some(store), Arc::clone(&quota)));
    let loaded = registry.load_from_store();
    info!(auths = loaded, "auth directory loaded");

    let sticky = Arc::new(StickyStore::new());
    sticky.spawn_sweeper();
    let selector = Selector::new(Arc::clone(&sticky), Arc::clone(&quota));

    let executors = Arc::new(ExecutorRegistry::new(config.proxy_url.clone()));
    let refresher = Arc::new(Refresher::new(
        Arc::clone(&registry),
        Arc::clone(&executors) as Arc<dyn polymux_auth::RefreshDispatch>,
        None,
    ));
    refresher.spawn();

    let manager = Manager::new(
        Arc::clone(&registry),
        selector,
        executors,
        vec![Arc::new(UsageLogSink) as Arc<dyn UsageSink>],
        ManagerConfig {
            max_attempts: config.request_retry.max(1),
            max_retry_interval: config.max_retry_interval(),
            proxy: config.proxy_url.clone(),
            max_response_size: config.max_response_size,
            stream_timeout: std::time::Duration::from_secs(config.stream_timeout.max(1)),
        },
    );

    let state = Arc::new(server::AppState {
        manager: Arc::new(manager),
        config: Arc::new(config.clone()),
    });
    let app = server::router(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn import(config: &Config, file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            use std::io::Read;
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let mut auth: Auth = serde_json::from_str(&text).context("parsing credential JSON")?;
    if auth.provider.trim().is_empty() {
        anyhow::bail!("credential is missing a provider");
    }
    if auth.id.trim().is_empty() {
        auth.id = format!(
            "{}-{:08x}",
            auth.provider,
            polymux_common::fnv32a(&text)
        );
    }
    let has_secret = auth.metadata.access_token.is_some()
        || auth.metadata.refresh_token.is_some()
        || auth.metadata.extra.contains_key("api_key");
    if !has_secret {
        anyhow::bail!("credential carries no access_token, refresh_token, or api_key");
    }

    let store = AuthStore::new(config.auth_dir_resolved())?;
    store.save(&auth)?;
    println!(
        "imported {} credential as {}",
        auth.provider,
        AuthStore::file_name_for(&auth)
    );
    Ok(())
}

/// Structured usage records on the log stream; the database-backed sink is
/// the persistence collaborator's to provide.
struct UsageLogSink;

impl UsageSink for UsageLogSink {
    fn write(&self, record: &UsageRecord) {
        info!(
            event = "usage",
            trace_id = %record.trace_id,
            auth_id = %record.auth_id,
            provider = %record.provider,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cached_tokens = record.cached_tokens,
            success = record.success,
            cost_usd = record.cost_usd,
        );
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("polymux={default_level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
