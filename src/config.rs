use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::stages::{RampPlan, Stage, default_stages, parse_stages};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3080";
pub const DEFAULT_TARGET_PATH: &str = "/api/v1/author";
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration for {key}: '{value}'")]
    InvalidDuration {
        key: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid number for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },

    #[error("invalid stage '{0}', expected <duration>:<target> such as 1m:2")]
    InvalidStage(String),

    #[error("at least one stage is required")]
    NoStages,

    #[error("invalid target url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("cannot read options file {path}")]
    OptionsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse options file {path}")]
    OptionsJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// serde helper accepting humantime strings such as `"1m"` or `"250ms"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

/// Run options as they appear in an options file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    pub stages: Option<Vec<Stage>>,
    #[serde(rename = "startVUs")]
    pub start_vus: Option<usize>,
    pub vus: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub duration: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub graceful_ramp_down: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub graceful_stop: Option<Duration>,
}

impl Options {
    pub fn from_json_str(json: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::OptionsJson {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::OptionsFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json, path)
    }

    /// Explicit stages win. Otherwise `vus` + `duration` hold a constant
    /// load, and with neither the default ramp is used.
    pub fn plan(&self) -> Result<RampPlan, ConfigError> {
        if let Some(stages) = &self.stages {
            return RampPlan::new(self.start_vus.unwrap_or(1), stages.clone());
        }
        if let Some(duration) = self.duration {
            let vus = self.vus.unwrap_or(1);
            return RampPlan::new(vus, vec![Stage::new(duration, vus)]);
        }
        RampPlan::new(self.start_vus.unwrap_or(1), default_stages())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub path: String,
    pub plan: RampPlan,
    pub graceful_ramp_down: Duration,
    pub graceful_stop: Duration,
    pub request_timeout: Duration,
    pub summary_export: Option<PathBuf>,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = match lookup("OPTIONS_FILE") {
            Some(path) => Options::from_file(Path::new(&path))?,
            None => Options::default(),
        };

        let env_stages = lookup("STAGES");
        if let Some(raw) = &env_stages {
            let stages = parse_stages(raw)?;
            if stages.is_empty() {
                return Err(ConfigError::NoStages);
            }
            options.stages = Some(stages);
        }
        // a constant-load shorthand from the environment replaces file stages
        if env_stages.is_none() && (lookup("VUS").is_some() || lookup("DURATION").is_some()) {
            options.stages = None;
        }
        if let Some(raw) = lookup("START_VUS") {
            options.start_vus = Some(parse_number("START_VUS", &raw)?);
        }
        if let Some(raw) = lookup("VUS") {
            options.vus = Some(parse_number("VUS", &raw)?);
        }
        if let Some(raw) = lookup("DURATION") {
            options.duration = Some(parse_duration("DURATION", &raw)?);
        }
        if let Some(raw) = lookup("GRACEFUL_RAMP_DOWN") {
            options.graceful_ramp_down = Some(parse_duration("GRACEFUL_RAMP_DOWN", &raw)?);
        }
        if let Some(raw) = lookup("GRACEFUL_STOP") {
            options.graceful_stop = Some(parse_duration("GRACEFUL_STOP", &raw)?);
        }

        let request_timeout = match lookup("REQUEST_TIMEOUT") {
            Some(raw) => parse_duration("REQUEST_TIMEOUT", &raw)?,
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        let config = Config {
            base_url: lookup("BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            path: lookup("TARGET_PATH").unwrap_or_else(|| DEFAULT_TARGET_PATH.to_string()),
            plan: options.plan()?,
            graceful_ramp_down: options.graceful_ramp_down.unwrap_or(DEFAULT_GRACE),
            graceful_stop: options.graceful_stop.unwrap_or(DEFAULT_GRACE),
            request_timeout,
            summary_export: lookup("SUMMARY_EXPORT").map(PathBuf::from),
        };
        config.target_url()?;
        Ok(config)
    }

    pub fn target_url(&self) -> Result<Url, ConfigError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        Url::parse(&url).map_err(|e| ConfigError::InvalidUrl {
            reason: e.to_string(),
            url,
        })
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
        key: key.to_string(),
        value: value.to_string(),
        source,
    })
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}
