use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::copy::CopyMode;
use crate::domain::Location;
use crate::error::IngestError;
use crate::feed::Credentials;
use crate::location::LocationRegistry;

pub const DEFAULT_CONFIG_FILE: &str = "atom-ingest.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
    #[serde(default)]
    pub locations: Vec<LocationEntry>,
    #[serde(default)]
    pub copy_mode: Option<CopyMode>,
    #[serde(default)]
    pub bootstrap_schemas: Option<bool>,
    #[serde(default)]
    pub state_path: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FeedEntry {
    Shorthand(String),
    Detailed(FeedEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FeedEntryObject {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LocationEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub url: String,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub feeds: Vec<FeedRequest>,
    pub locations: LocationRegistry,
    pub copy_mode: CopyMode,
    pub bootstrap_schemas: bool,
    pub state_path: Option<Utf8PathBuf>,
    pub data_dir: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(IngestError::ConfigParse(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }

        let feeds = config
            .feeds
            .into_iter()
            .map(|entry| match entry {
                FeedEntry::Shorthand(url) => Ok(FeedRequest {
                    url: non_empty_url(url)?,
                    credentials: None,
                }),
                FeedEntry::Detailed(obj) => Ok(FeedRequest {
                    url: non_empty_url(obj.url)?,
                    credentials: obj.username.map(|username| Credentials {
                        username,
                        password: obj.password,
                    }),
                }),
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let mut locations = LocationRegistry::new();
        for entry in config.locations {
            locations.register(
                Location {
                    name: entry.name,
                    url: entry.url,
                },
                entry.pattern.as_deref(),
            )?;
        }

        Ok(ResolvedConfig {
            feeds,
            locations,
            copy_mode: config.copy_mode.unwrap_or_default(),
            bootstrap_schemas: config.bootstrap_schemas.unwrap_or(true),
            state_path: config.state_path.map(Utf8PathBuf::from),
            data_dir: config.data_dir.map(Utf8PathBuf::from),
        })
    }
}

fn non_empty_url(url: String) -> Result<String, IngestError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(IngestError::ConfigParse("feed url must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationResolver;

    #[test]
    fn parse_config_shorthand() {
        let config: Config = serde_json::from_str(
            r#"{
                "feeds": ["https://feeds.example.org/atom",
                          {"url": "https://private.example.org/atom", "username": "sync", "password": "s3cret"}],
                "locations": [{"name": "archive", "url": "https://data.example.org/"}]
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.feeds.len(), 2);
        assert!(resolved.feeds[0].credentials.is_none());
        assert_eq!(
            resolved.feeds[1].credentials.as_ref().map(|c| c.username.as_str()),
            Some("sync")
        );
        assert_eq!(resolved.copy_mode, CopyMode::Async);
        assert!(resolved.bootstrap_schemas);
        assert!(
            resolved
                .locations
                .resolve_location("https://data.example.org/a.bin")
                .is_some()
        );
    }
}
