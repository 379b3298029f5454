//! Service configuration. Defaults live here as constants; a TOML file,
//! `POTATO_*` environment variables and `PORT` are layered on top.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Interface the HTTP server binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Port the HTTP server listens on unless `PORT` says otherwise
pub const DEFAULT_PORT: u16 = 8000;

/// The path to the trained checkpoint
pub const DEFAULT_MODEL_PATH: &str = "Potato_Model.pth";

/// Default tracing filter, used when `RUST_LOG` is unset
pub const DEFAULT_LOG: &str = "info";

/// Largest accepted upload, in bytes
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "potato.toml";

/// Prefix of the environment variables that override settings
pub const ENV_PREFIX: &str = "POTATO";

/// When the model checkpoint is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Load before the server starts accepting requests
    Eager,

    /// Load on the first prediction request
    Lazy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub load: LoadPolicy,
    pub max_upload_bytes: usize,
    pub log: String,
}

impl Settings {
    /// Read settings from the process environment. `file`, when given, must
    /// exist; otherwise `potato.toml` is used if present.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::layered(
            file,
            Environment::with_prefix(ENV_PREFIX),
            env::var("PORT").ok(),
        )
    }

    fn layered(
        file: Option<&Path>,
        environment: Environment,
        port: Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        Config::builder()
            .set_default("host", DEFAULT_HOST)?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("model_path", DEFAULT_MODEL_PATH)?
            .set_default("load", "eager")?
            .set_default("max_upload_bytes", MAX_UPLOAD_BYTES as i64)?
            .set_default("log", DEFAULT_LOG)?
            .add_source(file)
            .add_source(environment)
            .set_override_option("port", port)?
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_env() -> Environment {
        Environment::with_prefix("POTATO_TEST_NOTHING_SET")
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::layered(None, quiet_env(), None).unwrap();
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.model_path, PathBuf::from(DEFAULT_MODEL_PATH));
        assert_eq!(settings.load, LoadPolicy::Eager);
        assert_eq!(settings.max_upload_bytes, MAX_UPLOAD_BYTES);
    }

    #[test]
    fn test_file_then_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(
            &path,
            "port = 5000\nmodel_path = \"weights/potato.safetensors\"\nload = \"lazy\"\n",
        )
        .unwrap();

        let settings = Settings::layered(Some(&path), quiet_env(), None).unwrap();
        assert_eq!(settings.port, 5000);
        assert_eq!(settings.load, LoadPolicy::Lazy);
        assert_eq!(
            settings.model_path,
            PathBuf::from("weights/potato.safetensors")
        );

        // PORT beats the file
        let settings =
            Settings::layered(Some(&path), quiet_env(), Some("9123".into())).unwrap();
        assert_eq!(settings.port, 9123);
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(Settings::layered(Some(&path), quiet_env(), None).is_err());
    }

    #[test]
    fn test_bad_port() {
        assert!(Settings::layered(None, quiet_env(), Some("eighty".into())).is_err());
    }
}
