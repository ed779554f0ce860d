use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use codedrop_server::{
    build_router, AppState, HttpPolicy, TrustedHeaderIdentity, DEFAULT_IDENTITY_HEADER,
};
use codedrop_storage::{LocalBlobStore, SqliteStore, StorageConfig};
use codedrop_transfer::{
    AbuseGuard, AbusePolicy, AbuseStore, BlobStore, Clock, CodePolicy, MemoryBlobStore,
    MemoryStore, RedemptionDesk, SystemClock, TransferLifecycle, TransferPolicy, TransferStore,
};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "One-time file hand-off daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        #[arg(long, default_value = "config/codedrop.toml")]
        config: PathBuf,
    },
    /// Parse and validate a config file without starting the daemon.
    Check {
        #[arg(long, default_value = "config/codedrop.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    codes: CodePolicy,
    #[serde(default)]
    transfers: TransferPolicy,
    #[serde(default)]
    abuse: AbusePolicy,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
    #[serde(default = "default_identity_header")]
    identity_header: String,
    #[serde(default)]
    trust_forwarded_for: bool,
    #[serde(default = "default_max_upload_bytes")]
    max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct StorageSection {
    backend: StorageBackend,
    sqlite_path: String,
    blob_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: "data/codedrop.db".to_string(),
            blob_dir: PathBuf::from("data/blobs"),
        }
    }
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

fn default_max_upload_bytes() -> usize {
    HttpPolicy::default().max_upload_bytes
}

impl RuntimeConfig {
    fn parse(source: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.codes.validate().context("invalid [codes] section")?;
        self.transfers
            .validate()
            .context("invalid [transfers] section")?;
        self.abuse.validate().context("invalid [abuse] section")?;
        if self.http.max_upload_bytes == 0 {
            return Err(anyhow!("http.max_upload_bytes must be positive"));
        }
        if requires_token(&self.http.bind) && self.http.auth_token.is_none() {
            return Err(anyhow!(
                "non-loopback bind {} requires http.auth_token",
                self.http.bind
            ));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Check { config } => {
            let config = load_config(&config)?;
            info!(
                bind = %config.http.bind,
                backend = ?config.storage.backend,
                min_code_length = config.codes.min_length,
                max_code_length = config.codes.max_length,
                "config ok"
            );
            Ok(())
        }
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    RuntimeConfig::parse(&config_source)
        .with_context(|| format!("invalid config at {}", config_path.display()))
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;

    let backends = open_backends(&config.storage).await?;

    let require_bearer = requires_token(&config.http.bind) || config.http.auth_token.is_some();
    if !requires_token(&config.http.bind) {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lifecycle = TransferLifecycle::new(
        backends.transfers,
        config.codes.clone(),
        config.transfers.clone(),
        clock.clone(),
    );
    let guard = AbuseGuard::new(backends.abuse, config.abuse.clone(), clock);
    let identity = TrustedHeaderIdentity::new(&config.http.identity_header)?;
    let state = AppState::new(
        RedemptionDesk::new(lifecycle, guard),
        backends.blobs,
        Arc::new(identity),
        HttpPolicy {
            auth_token: config.http.auth_token.clone(),
            require_bearer,
            trust_forwarded_for: config.http.trust_forwarded_for,
            max_upload_bytes: config.http.max_upload_bytes,
        },
    );
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "codedropd listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server failed")
}

struct Backends {
    transfers: Arc<dyn TransferStore>,
    abuse: Arc<dyn AbuseStore>,
    blobs: Arc<dyn BlobStore>,
}

async fn open_backends(storage: &StorageSection) -> Result<Backends> {
    match storage.backend {
        StorageBackend::Sqlite => {
            if !storage.sqlite_path.starts_with("sqlite:") {
                ensure_parent_dir(Path::new(&storage.sqlite_path)).await?;
            }
            let store = Arc::new(
                SqliteStore::connect(&StorageConfig::new(storage.sqlite_path.clone())).await?,
            );
            info!(
                sqlite_path = %storage.sqlite_path,
                blob_dir = %storage.blob_dir.display(),
                "sqlite storage backend"
            );
            Ok(Backends {
                transfers: store.clone(),
                abuse: store,
                blobs: Arc::new(LocalBlobStore::new(storage.blob_dir.clone())),
            })
        }
        StorageBackend::Memory => {
            warn!("memory storage backend: transfers are lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Backends {
                transfers: store.clone(),
                abuse: store,
                blobs: Arc::new(MemoryBlobStore::new()),
            })
        }
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display())),
        _ => Ok(()),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
