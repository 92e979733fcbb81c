//! Configuration loaded from the process environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::events::DEFAULT_BUFFER_CAP;
use crate::retry::DEFAULT_MAX_RETRIES;

pub const DEFAULT_MAX_STEPS: u32 = 50;

/// Limits the job loop runs under.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Step ceiling per job.
    pub max_steps: u32,
    /// Consecutive failures per tool before escalating to a human.
    pub max_tool_retries: u32,
    pub action_timeout: Duration,
    pub decision_timeout: Duration,
    /// Events kept per job while no observer is attached.
    pub event_buffer_cap: usize,
    pub max_concurrent_jobs: usize,
    /// How long finished jobs stay queryable in memory.
    pub job_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_tool_retries: DEFAULT_MAX_RETRIES,
            action_timeout: Duration::from_secs(60),
            decision_timeout: Duration::from_secs(120),
            event_buffer_cap: DEFAULT_BUFFER_CAP,
            max_concurrent_jobs: 8,
            job_retention: Duration::from_secs(3600),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub orchestrator: OrchestratorConfig,
    /// Directory holding one checkpoint file per job.
    pub state_dir: PathBuf,
    /// SQLite database of finished jobs.
    pub archive_path: PathBuf,
    pub model_api_key: String,
    pub model_api_url: String,
    pub model: String,
    pub browser_api_url: String,
    pub browser_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = OrchestratorConfig::default();

        let orchestrator = OrchestratorConfig {
            max_steps: parse_or("MAX_STEPS", defaults.max_steps)?,
            max_tool_retries: parse_or("MAX_TOOL_RETRIES", defaults.max_tool_retries)?,
            action_timeout: Duration::from_secs(parse_or(
                "ACTION_TIMEOUT_SECS",
                defaults.action_timeout.as_secs(),
            )?),
            decision_timeout: Duration::from_secs(parse_or(
                "DECISION_TIMEOUT_SECS",
                defaults.decision_timeout.as_secs(),
            )?),
            event_buffer_cap: parse_or("EVENT_BUFFER_CAP", defaults.event_buffer_cap)?,
            max_concurrent_jobs: parse_or("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?
                .max(1),
            job_retention: Duration::from_secs(parse_or(
                "JOB_RETENTION_SECS",
                defaults.job_retention.as_secs(),
            )?),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 8000)?,
            orchestrator,
            state_dir: env::var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".scrape-orchestrator/checkpoints")),
            archive_path: env::var("ARCHIVE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".scrape-orchestrator/jobs.db")),
            model_api_key: env::var("MODEL_API_KEY").context("MODEL_API_KEY must be set")?,
            model_api_url: env::var("MODEL_API_URL")
                .unwrap_or_else(|_| crate::llm::DEFAULT_API_URL.to_string()),
            model: env::var("MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            browser_api_url: env::var("BROWSER_API_URL")
                .context("BROWSER_API_URL must be set")?,
            browser_api_key: env::var("BROWSER_API_KEY").ok().filter(|k| !k.is_empty()),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.max_tool_retries, 3);
        assert_eq!(config.event_buffer_cap, 500);
    }

    #[test]
    fn test_parse_or() {
        env::set_var("SCRAPE_TEST_PARSE_OK", " 42 ");
        env::set_var("SCRAPE_TEST_PARSE_BAD", "forty");
        assert_eq!(parse_or::<u32>("SCRAPE_TEST_PARSE_OK", 1).unwrap(), 42);
        assert_eq!(parse_or::<u32>("SCRAPE_TEST_PARSE_MISSING", 7).unwrap(), 7);

        let err = parse_or::<u32>("SCRAPE_TEST_PARSE_BAD", 1).unwrap_err();
        assert!(err.to_string().contains("SCRAPE_TEST_PARSE_BAD"));
    }
}
