use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_BATCH, Delimiter};
use crate::error::IngestError;
use crate::grouper::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_CONFIG_FILE: &str = "kira-sg.json";
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:7000/api/fhir";
pub const DEFAULT_COUCH_DATABASE: &str = "metadata";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const ROW_STORE_PASSWORD_ENV: &str = "KIRA_SG_ROW_STORE_PASSWORD";
pub const REGISTRY_TOKEN_ENV: &str = "KIRA_SG_REGISTRY_TOKEN";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub row_store: Option<RowStoreEntry>,
    #[serde(default)]
    pub ingest: IngestSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RegistrySection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
    #[serde(default)]
    pub cache_lookups: Option<bool>,
}

/// Either a URL (CouchDB) or a directory (file store), or the long form.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RowStoreEntry {
    Shorthand(String),
    Detailed(RowStoreObject),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStoreKind {
    Couch,
    File,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RowStoreObject {
    pub kind: RowStoreKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IngestSection {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub default_batch: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub base_url: String,
    pub timeout: Duration,
    pub retries: usize,
    pub cache_lookups: bool,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CouchSettings {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum RowStoreSettings {
    Couch(CouchSettings),
    File { root: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub chunk_size: usize,
    pub default_batch: String,
    pub delimiter: Option<Delimiter>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_batch: DEFAULT_BATCH.to_string(),
            delimiter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub registry: RegistrySettings,
    pub row_store: RowStoreSettings,
    pub ingest: IngestSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `kira-sg.json` in the working directory when present.
    /// Secrets are taken from the environment afterwards.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| IngestError::ConfigParse(err.to_string()))?
        };

        let mut resolved = Self::resolve_config(config)?;
        Self::apply_env(&mut resolved);
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let default_timeout = Duration::from_secs(
            config
                .registry
                .timeout_secs
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        let registry = RegistrySettings {
            base_url: config
                .registry
                .base_url
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            timeout: default_timeout,
            retries: config.registry.retries.unwrap_or(0),
            cache_lookups: config.registry.cache_lookups.unwrap_or(true),
            token: None,
        };

        let row_store = match config.row_store {
            None => RowStoreSettings::File {
                root: default_row_store_root()?,
            },
            Some(RowStoreEntry::Shorthand(value)) => {
                if value.starts_with("http://") || value.starts_with("https://") {
                    RowStoreSettings::Couch(CouchSettings {
                        url: value,
                        database: DEFAULT_COUCH_DATABASE.to_string(),
                        username: None,
                        password: None,
                        timeout: default_timeout,
                    })
                } else {
                    RowStoreSettings::File {
                        root: Utf8PathBuf::from(value),
                    }
                }
            }
            Some(RowStoreEntry::Detailed(obj)) => match obj.kind {
                RowStoreKind::Couch => RowStoreSettings::Couch(CouchSettings {
                    url: obj.url.ok_or_else(|| {
                        IngestError::ConfigParse("row_store.url is required for couch".to_string())
                    })?,
                    database: obj
                        .database
                        .unwrap_or_else(|| DEFAULT_COUCH_DATABASE.to_string()),
                    username: obj.username,
                    password: None,
                    timeout: obj
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default_timeout),
                }),
                RowStoreKind::File => RowStoreSettings::File {
                    root: match obj.path {
                        Some(path) => Utf8PathBuf::from(path),
                        None => default_row_store_root()?,
                    },
                },
            },
        };

        let delimiter = config
            .ingest
            .delimiter
            .map(|value| value.parse::<Delimiter>())
            .transpose()?;
        let ingest = IngestSettings {
            chunk_size: config
                .ingest
                .chunk_size
                .unwrap_or(DEFAULT_CHUNK_SIZE)
                .max(1),
            default_batch: config
                .ingest
                .default_batch
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BATCH.to_string()),
            delimiter,
        };

        Ok(ResolvedConfig {
            schema_version,
            registry,
            row_store,
            ingest,
        })
    }

    fn apply_env(resolved: &mut ResolvedConfig) {
        if let Ok(token) = std::env::var(REGISTRY_TOKEN_ENV) {
            if !token.is_empty() {
                resolved.registry.token = Some(token);
            }
        }
        if let RowStoreSettings::Couch(couch) = &mut resolved.row_store {
            if let Ok(password) = std::env::var(ROW_STORE_PASSWORD_ENV) {
                couch.password = Some(password);
            }
        }
    }
}

/// `~/.cache/kira-sample-graph/rows`, or `.kira-sg/rows` when no home
/// directory can be found.
pub fn default_row_store_root() -> Result<Utf8PathBuf, IngestError> {
    if let Some(root) = BaseDirs::new().and_then(|dirs| {
        Utf8PathBuf::from_path_buf(
            dirs.home_dir()
                .join(".cache")
                .join("kira-sample-graph")
                .join("rows"),
        )
        .ok()
    }) {
        return Ok(root);
    }
    let cwd = std::env::current_dir().map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd.join(".kira-sg").join("rows"))
        .map_err(|_| IngestError::Filesystem("invalid row store path".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_url_selects_couch() {
        let config = Config {
            row_store: Some(RowStoreEntry::Shorthand(
                "http://localhost:5984".to_string(),
            )),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        match resolved.row_store {
            RowStoreSettings::Couch(couch) => {
                assert_eq!(couch.database, DEFAULT_COUCH_DATABASE);
                assert_eq!(couch.timeout, Duration::from_secs(60));
            }
            other => panic!("unexpected row store {other:?}"),
        }
        assert_eq!(resolved.registry.base_url, DEFAULT_REGISTRY_URL);
        assert!(resolved.registry.cache_lookups);
        assert_eq!(resolved.ingest.chunk_size, 1000);
    }
}
