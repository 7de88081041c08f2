//! Configuration-file loading. The file's content (database path, keep-alive
//! timing, Last.fm credentials) is this crate's own concern; the `Config`
//! struct and loader follow the `toml` + `serde::Deserialize` pattern used
//! for this exact purpose elsewhere in the pack.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context};
use etcetera::BaseStrategy;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub database_path: Option<String>,
    pub keep_alive_interval_ms: Option<u64>,
    pub lastfm: Option<LastFmConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastFmConfig {
    pub api_key: String,
    pub shared_secret: String,
}

impl Config {
    /// Load from `path` if given, otherwise fall back to defaults. Missing
    /// keys in a present file also fall back to defaults field-by-field,
    /// via `serde`'s `Default` handling on `Option<T>` fields.
    pub fn load(path: Option<&Utf8Path>) -> Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file at {path}"))?;
        toml::from_str(&text).with_context(|| format!("could not parse config file at {path}"))
    }

    /// `database_path` if set, otherwise the platform cache directory, the
    /// way `system.rs::System::new` picks its own cache path today.
    pub fn resolve_database_path(&self) -> Result<Utf8PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(Utf8PathBuf::from(path));
        }
        let dirs = etcetera::choose_base_strategy().wrap_err("could not locate a cache directory")?;
        let path = dirs.cache_dir().join("pmp-server").join("pmp.sqlite");
        Utf8PathBuf::from_path_buf(path).map_err(|p| color_eyre::eyre::eyre!("cache directory path {p:?} is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = Config::load(None).unwrap();
        assert!(config.lastfm.is_none());
    }

    #[test]
    fn resolve_database_path_prefers_explicit_setting() {
        let config = Config { database_path: Some("/tmp/explicit.sqlite".to_string()), ..Config::default() };
        assert_eq!(config.resolve_database_path().unwrap().as_str(), "/tmp/explicit.sqlite");
    }

    #[test]
    fn parses_lastfm_section() {
        let toml = r#"
            database_path = "/tmp/pmp.sqlite"

            [lastfm]
            api_key = "key"
            shared_secret = "secret"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database_path.as_deref(), Some("/tmp/pmp.sqlite"));
        assert_eq!(config.lastfm.unwrap().api_key, "key");
    }
}
