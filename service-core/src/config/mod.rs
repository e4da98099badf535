use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Settings every process in the workspace shares.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "quote-billing".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            otlp_endpoint: None,
            environment: default_environment(),
        }
    }
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }
}

/// Load a settings struct from an optional file named `file_stem`
/// (any format the `config` crate understands) overlaid with environment
/// variables using `prefix` and a `__` separator for nesting.
///
/// `.env` is read first so local development can keep variables there.
pub fn load_layered<T: DeserializeOwned>(file_stem: &str, prefix: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name(file_stem).required(false))
        .add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
