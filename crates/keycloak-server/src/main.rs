use std::env;

use anyhow::Context;
use keycloak_config::loader::{DEFAULT_CONFIG_FILE, load_config};
use keycloak_server::observability;
use keycloak_server::runtime::ClusterRuntime;

const CONFIG_PATH_ENV: &str = "KEYCLOAK_CONFIG";

/// Where the configuration path came from.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    CliArgument,
    EnvironmentVariable,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable ({CONFIG_PATH_ENV})"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    observability::apply_logging_level(&cfg.logging.level);

    let runtime = match ClusterRuntime::builder(cfg).build().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Cluster runtime initialization failed: {e}");
            std::process::exit(2);
        }
    };

    if let Err(err) = serve(&runtime).await {
        eprintln!("Cluster runtime error: {err:#}");
        std::process::exit(1);
    }
}

async fn serve(runtime: &ClusterRuntime) -> anyhow::Result<()> {
    // prime the key cache so the first token validation does not pay for it
    let keys = runtime.key_locator().iter_keys().await.len();
    tracing::info!(keys, locator = %runtime.key_locator(), "Initial key fetch done");

    runtime
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("housekeeping loop stopped")
}

/// Resolves the configuration path: `--config <path>`, then
/// `KEYCLOAK_CONFIG`, then `keycloak.toml`.
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default)
}
