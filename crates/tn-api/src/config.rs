use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tn_infra::cluster::DEFAULT_CREATE_CONCURRENCY;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is invalid: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// Bearer key for the control API. The server refuses to start without one.
    pub api_key: Option<String>,
    /// Root of per-deployment manifest directories.
    pub output_dir: PathBuf,
    /// Bound on concurrent machine creations, image pushes and removals.
    pub concurrency: usize,
    /// When set, deploy this experiment once and exit instead of serving.
    pub experiment_file: Option<PathBuf>,
}

fn parse<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.into());
    value.parse().map_err(|_| ConfigError::Invalid { name, value })
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let concurrency: usize = parse("CREATE_CONCURRENCY", &DEFAULT_CREATE_CONCURRENCY.to_string())?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "CREATE_CONCURRENCY",
                value: "0".into(),
            });
        }

        Ok(Self {
            listen_addr: parse("LISTEN_ADDR", "0.0.0.0:8080")?,
            api_key: env::var("TESTNET_API_KEY").ok().filter(|k| !k.is_empty()),
            output_dir: env::var("OUTPUT_DIR")
                .unwrap_or_else(|_| "deployments".into())
                .into(),
            concurrency,
            experiment_file: env::var("EXPERIMENT_FILE").ok().map(PathBuf::from),
        })
    }
}
