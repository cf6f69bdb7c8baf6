use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Installs the global structured-logging subscriber.
///
/// `RUST_LOG` directives win when set; otherwise the crate logs at
/// `config.rust_log`. Fails if a global subscriber is already installed.
pub fn init(config: &Config) -> Result<()> {
    tracing_subscriber::registry()
        .with(default_filter(config))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to install tracing subscriber")
}

fn default_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cv_autosave={}", &config.rust_log)))
}
