use anyhow::{Context, anyhow};
use pacsvault_core::config::PacsConfig;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Node configuration: store connection plus the processing core settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    #[serde(flatten)]
    pub core: PacsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string. `DATABASE_URL` wins when set.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Where the configuration came from, for the startup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    EnvInline,
    Defaults,
}

impl ServerConfig {
    /// Load configuration. Evaluation order:
    /// 1) `explicit` (the `--config` flag),
    /// 2) `$PACSVAULT_CONFIG_PATH` (TOML or JSON file),
    /// 3) `$PACSVAULT_CONFIG_JSON` (inline JSON),
    /// 4) `pacsvault.toml` / `config/pacsvault.toml` in the working directory,
    /// 5) defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, ConfigSource)> {
        if let Some(path) = explicit {
            return Ok((Self::load_from_file(path)?, ConfigSource::File(path.into())));
        }

        if let Ok(path) = env::var("PACSVAULT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            return Ok((Self::load_from_file(&path)?, ConfigSource::File(path)));
        }

        if let Ok(raw) = env::var("PACSVAULT_CONFIG_JSON") {
            let config = Self::parse_json(&raw).context("failed to parse PACSVAULT_CONFIG_JSON")?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            return Ok((Self::load_from_file(&path)?, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Defaults))
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "pacsvault.toml",
            "pacsvault.json",
            "config/pacsvault.toml",
            "config/pacsvault.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    /// Connection string from the flag/env override or the config file.
    pub fn database_url(&self, override_url: Option<&str>) -> anyhow::Result<String> {
        override_url
            .map(str::to_string)
            .or_else(|| self.database.url.clone())
            .ok_or_else(|| anyhow!("no database url: set DATABASE_URL or [database].url"))
    }
}
