//! Layered configuration loading.
//!
//! Sources, lowest priority first:
//!
//! 1. Field defaults of [`AlbaEmConfig`]
//! 2. An optional TOML file
//! 3. Environment variables prefixed `ALBAEM_` (e.g. `ALBAEM_HOST=em01`,
//!    `ALBAEM_TIMEOUT_MS=500`). A double underscore descends into tables, so
//!    `ALBAEM_FORMULAS__3="value*1e6"` sets the formula of channel 3.
//!
//! The merged result is validated before it is returned.

use crate::driver::AlbaEmConfig;
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::path::Path;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "ALBAEM_";

/// Load and validate the driver configuration.
///
/// # Arguments
///
/// * `path` - Optional TOML file. A path that does not exist is an error;
///   pass `None` to configure from the environment alone.
pub fn load(path: Option<&Path>) -> Result<AlbaEmConfig> {
    let mut figment = Figment::new();

    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    extract(figment)
}

/// Load and validate a configuration from TOML text (no environment layer).
pub fn load_str(text: &str) -> Result<AlbaEmConfig> {
    extract(Figment::new().merge(Toml::string(text)))
}

fn extract(figment: Figment) -> Result<AlbaEmConfig> {
    let config: AlbaEmConfig = figment
        .extract()
        .context("Failed to extract Em# configuration")?;

    config
        .validate()
        .context("Em# configuration validation failed")?;

    tracing::debug!(host = %config.host, port = config.port, mock = config.mock, "Loaded Em# configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host = "electrometer02"
timeout_ms = 250
trigger_input = "TRIGGER_IN"
points_per_step = 3

[formulas]
2 = "value * -1"
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.host, "electrometer02");
        assert_eq!(config.port, 5025);
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.trigger_input, "TRIGGER_IN");
        assert_eq!(config.points_per_step, 3);
        assert_eq!(config.formulas["2"], "value * -1");
    }

    #[test]
    fn test_env_overrides_nested_formula() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "host = \"electrometer03\"").unwrap();

        std::env::set_var("ALBAEM_FORMULAS__3", "value*3");
        let loaded = load(Some(file.path()));
        std::env::remove_var("ALBAEM_FORMULAS__3");

        let config = loaded.unwrap();
        assert_eq!(config.host, "electrometer03");
        assert_eq!(config.formulas["3"], "value*3");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("albaem.toml");
        assert!(load(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load_str(r#"host = "em""#).is_ok());
        assert!(load_str("port = 5025").is_err());
        assert!(load_str("host = \"em\"\n[formulas]\n1 = \"value +\"").is_err());
        assert!(load_str("host = \"em\"\nport = \"not a port\"").is_err());
    }
}
