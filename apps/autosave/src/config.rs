use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_FIELD_DELAY_MS: u64 = 500;
const DEFAULT_SECTION_DELAY_MS: u64 = 1000;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;

/// Autosave configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub document_store_url: String,
    /// Debounce for single form fields (name, summary, ...).
    pub field_delay: Duration,
    /// Debounce for whole repeatable sections (experience, education, ...).
    pub section_delay: Duration,
    pub store_timeout: Duration,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let document_store_url = lookup("DOCUMENT_STORE_URL").with_context(|| {
            "Required environment variable 'DOCUMENT_STORE_URL' is not set".to_string()
        })?;

        Ok(Config {
            document_store_url: document_store_url.trim_end_matches('/').to_string(),
            field_delay: Duration::from_millis(parse_positive(
                &lookup,
                "FIELD_AUTOSAVE_DELAY_MS",
                DEFAULT_FIELD_DELAY_MS,
            )?),
            section_delay: Duration::from_millis(parse_positive(
                &lookup,
                "SECTION_AUTOSAVE_DELAY_MS",
                DEFAULT_SECTION_DELAY_MS,
            )?),
            store_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "DOCUMENT_STORE_TIMEOUT_SECS",
                DEFAULT_STORE_TIMEOUT_SECS,
            )?),
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_positive<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer"))?,
        None => default,
    };
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}
