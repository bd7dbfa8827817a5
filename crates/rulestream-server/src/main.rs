use std::env;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use rulestream_server::config::loader::load_config;
use rulestream_server::{ServerBuilder, observability};

/// Where the configuration path came from.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    CliArgument,
    EnvironmentVariable,
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CliArgument => write!(f, "--config"),
            Self::EnvironmentVariable => write!(f, "RULESTREAM_CONFIG"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[derive(Debug)]
enum RunError {
    /// Configuration or wiring failed; exit code 2
    Startup(anyhow::Error),
    Serve(anyhow::Error),
}

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("Ignoring unreadable .env file: {e}"),
    }
    observability::init_tracing();

    match run().await {
        Ok(()) => {}
        Err(RunError::Startup(e)) => {
            eprintln!("rulestream failed to start: {e:#}");
            std::process::exit(2);
        }
        Err(RunError::Serve(e)) => {
            eprintln!("rulestream stopped with an error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Loads configuration, builds the server and serves until Ctrl+C.
async fn run() -> Result<(), RunError> {
    let (config_path, source) = resolve_config_path();
    let required = !matches!(source, ConfigSource::Default);
    let cfg = load_config(Path::new(&config_path), required)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("loading configuration from {config_path}"))
        .map_err(RunError::Startup)?;

    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    observability::apply_logging_level(&cfg.logging.level);

    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .await
        .map_err(RunError::Startup)?;

    server.run().await.map_err(RunError::Serve)
}

/// `--config <path>`, then `RULESTREAM_CONFIG`, then `rulestream.toml`.
fn resolve_config_path() -> (String, ConfigSource) {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(path) = args
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| pair[1].clone())
    {
        return (path, ConfigSource::CliArgument);
    }

    match env::var("RULESTREAM_CONFIG") {
        Ok(path) if !path.is_empty() => (path, ConfigSource::EnvironmentVariable),
        _ => ("rulestream.toml".to_string(), ConfigSource::Default),
    }
}
