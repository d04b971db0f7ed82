//! Startup configuration loading.
//!
//! Reads the JSON config from `ONEKEY_CONFIG` (default `config.json`),
//! fills absent provider credentials from `ONEKEY_API_KEY_{ID}` env vars,
//! applies the `STRESS_TEST_MODE` toggle, and validates. A missing config
//! file starts the gateway with the example provider set so a fresh
//! checkout is immediately exercisable against the mock upstream.

use anyhow::{Context, Result};
use onekey_types::{AppConfig, AuthType, ProviderConfig, RetryConfig, TimeoutConfig};
use validator::Validate;

pub fn load() -> Result<AppConfig> {
    let path = std::env::var("ONEKEY_CONFIG").unwrap_or_else(|_| "config.json".to_string());

    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str::<AppConfig>(&raw)
            .with_context(|| format!("malformed config at {path}"))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "config file not found, using example provider set");
            example_config()
        }
        Err(err) => return Err(err).with_context(|| format!("cannot read config at {path}")),
    };

    // Credentials may live in the environment rather than on disk.
    for (id, provider) in config.providers.iter_mut() {
        if provider.api_key.is_none() {
            let var = format!("ONEKEY_API_KEY_{}", id.to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                provider.api_key = Some(key);
            }
        }
    }

    if std::env::var("STRESS_TEST_MODE").map(|v| v == "1").unwrap_or(false) {
        config.apply_stress_mode();
    }

    config.validate().context("invalid configuration")?;
    for (id, provider) in &config.providers {
        provider
            .validate()
            .with_context(|| format!("invalid provider configuration for {id}"))?;
    }

    Ok(config)
}

/// The provider set the integration test suite runs against.
fn example_config() -> AppConfig {
    let mut config = AppConfig::default();
    for (id, upstream, auth_type) in [
        ("zerion", "https://api.zerion.io", AuthType::Basic),
        ("coingecko", "https://api.coingecko.com", AuthType::Header),
        ("alchemy", "https://eth-mainnet.alchemyapi.io", AuthType::Url),
    ] {
        config.providers.insert(
            id.to_string(),
            ProviderConfig {
                prefix: id.to_string(),
                upstream: upstream.to_string(),
                auth_type,
                auth_header: matches!(auth_type, AuthType::Header)
                    .then(|| "x-cg-pro-api-key".to_string()),
                api_key: None,
                timeout: TimeoutConfig::default(),
                retry: RetryConfig::default(),
                ssl_verify: true,
            },
        );
    }
    config
}
