use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cron::CronExpression;
use crate::error::ConfigError;

/// Job file for the demo binary. The library core itself takes constructor
/// parameters only and never reads configuration.
#[derive(Debug, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_tick")]
    pub tick: String,
    #[serde(default = "default_wheel_size")]
    pub wheel_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub job: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub cron: String,
    /// IANA zone name; jobs without one run in UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_tick() -> String {
    "100ms".to_string()
}
fn default_wheel_size() -> usize {
    512
}
fn default_log_level() -> String {
    "info".to_string()
}

impl JobsConfig {
    pub fn tick_duration(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.tick)
            .map_err(|e| ConfigError::Validation(format!("invalid tick '{}': {e}", self.tick)))
    }
}

pub fn load_config(path: &Path) -> Result<JobsConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

pub fn validate_config(config: &JobsConfig) -> Result<(), ConfigError> {
    config.tick_duration()?;
    if config.wheel_size == 0 {
        return Err(ConfigError::Validation("wheel_size must be at least 1".to_string()));
    }

    let mut seen = HashSet::new();
    for job in &config.job {
        if job.id.is_empty() {
            return Err(ConfigError::Validation("job with empty id".to_string()));
        }
        if !seen.insert(job.id.as_str()) {
            return Err(ConfigError::Validation(format!("duplicate job id '{}'", job.id)));
        }
        CronExpression::parse(&job.cron)
            .map_err(|e| ConfigError::Validation(format!("job '{}': {e}", job.id)))?;
        if let Some(tz) = &job.timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::Validation(format!("job '{}': unknown timezone '{tz}'", job.id)))?;
        }
    }
    Ok(())
}
