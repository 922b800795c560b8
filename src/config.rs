//! Configuration file handling

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use eyre::Context;
use reqwest::Url;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Endpoint of the ip-api.com JSON lookup service.
const DEFAULT_ENDPOINT: &str = "http://ip-api.com/json";

/// Tracker configuration object
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageTable,
    #[serde(default)]
    pub geolocation: GeolocationTable,
    #[serde(default)]
    pub report: ReportTable,
    #[serde(default)]
    pub logging: LoggingTable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct StorageTable {
    /// Directory holding the request log
    pub log_dir: PathBuf,

    /// Name of the request log inside `log_dir`
    pub file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GeolocationTable {
    /// Base URL of the lookup service; the address is appended as a path segment
    #[serde(deserialize_with = "deserialize_url")]
    pub endpoint: Url,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ReportTable {
    /// Countries whose accesses are never flagged
    pub allowed_countries: Vec<String>,

    /// Length of each frequency table
    pub top: usize,

    /// How many suspicious entries to print in full
    pub examples: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LoggingTable {
    /// Log verbosity
    pub verbosity: Verbosity,

    /// File to print logs to in addition to the console
    pub log_file: Option<PathBuf>,
}

// This type exists so clap and serde can figure out what variants are available for the verbosity
// option. tracing's `LevelFilter` is a struct of constants, so neither can list its values.
#[derive(ValueEnum, Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Verbosity> for LevelFilter {
    fn from(val: Verbosity) -> Self {
        match val {
            Verbosity::Off => LevelFilter::OFF,
            Verbosity::Trace => LevelFilter::TRACE,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Error => LevelFilter::ERROR,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Verbosity::Debug
        } else {
            Verbosity::Info
        }
    }
}

impl Default for StorageTable {
    fn default() -> Self {
        StorageTable {
            log_dir: PathBuf::from("./logs"),
            file_name: "webtracker_log.jsonl".to_owned(),
        }
    }
}

impl Default for GeolocationTable {
    fn default() -> Self {
        GeolocationTable {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
        }
    }
}

impl Default for ReportTable {
    fn default() -> Self {
        ReportTable {
            allowed_countries: ["Italia", "San Marino", "Vaticano"]
                .map(str::to_owned)
                .to_vec(),
            top: 5,
            examples: 3,
        }
    }
}

impl Default for LoggingTable {
    fn default() -> Self {
        LoggingTable {
            verbosity: Verbosity::default(),
            log_file: None,
        }
    }
}

// Deserialize a `Url` from a string value
fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let url = Url::parse(&String::deserialize(deserializer)?).map_err(de::Error::custom)?;
    if !url.has_host() {
        return Err(de::Error::custom("URL does not have a host component"));
    }
    Ok(url)
}

impl StorageTable {
    /// Full path of the request log.
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.file_name)
    }
}

impl Config {
    /// Load configuration from the given TOML file.
    pub async fn parse_from_file(path: &Path) -> eyre::Result<Self> {
        let file_contents = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&file_contents).wrap_err("Failed to load configuration file")
    }

    /// Load configuration from `path` if one was given, otherwise use the defaults.
    pub async fn load(path: Option<&Path>) -> eyre::Result<Self> {
        match path {
            Some(path) => Self::parse_from_file(path).await,
            None => Ok(Self::default()),
        }
    }
}
