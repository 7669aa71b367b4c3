//! Configuration loading from environment.

use std::env;

use exchange_hex::inbound::auth::DEFAULT_AUDIENCE;

/// Where order notifications are delivered and how they are signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    pub webhook_url: String,
    pub secret: String,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_audience: String,
    pub rate_limit_per_minute: u32,
    /// Outbox delivery; the worker is not started when unset
    pub notify: Option<NotifyConfig>,
    /// OTLP export is enabled only when an endpoint is configured
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()?;

        let database_url = var("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

        let jwt_secret = var("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("JWT_SECRET environment variable is required"))?;

        let jwt_audience = var("JWT_AUDIENCE").unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());

        let rate_limit_per_minute = var("RATE_LIMIT_PER_MINUTE")
            .unwrap_or_else(|| "100".to_string())
            .parse()?;

        let notify = match var("NOTIFY_WEBHOOK_URL").filter(|s| !s.is_empty()) {
            Some(webhook_url) => {
                let secret = var("NOTIFY_SECRET").filter(|s| !s.is_empty()).ok_or_else(|| {
                    anyhow::anyhow!("NOTIFY_SECRET is required when NOTIFY_WEBHOOK_URL is set")
                })?;
                Some(NotifyConfig {
                    webhook_url,
                    secret,
                })
            }
            None => None,
        };

        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|s| !s.is_empty());

        Ok(Self {
            port,
            database_url,
            jwt_secret,
            jwt_audience,
            rate_limit_per_minute,
            notify,
            otlp_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "sqlite::memory:"),
        ("JWT_SECRET", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.jwt_audience, "authenticated");
        assert_eq!(config.rate_limit_per_minute, 100);
        assert_eq!(config.notify, None);
        assert_eq!(config.otlp_endpoint, None);
    }

    #[test]
    fn test_required_variables() {
        assert!(load(&[("JWT_SECRET", "secret")]).is_err());
        assert!(load(&[("DATABASE_URL", "sqlite::memory:")]).is_err());
        assert!(load(&[("DATABASE_URL", "sqlite::memory:"), ("JWT_SECRET", "")]).is_err());
    }

    #[test]
    fn test_notify_needs_secret() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("NOTIFY_WEBHOOK_URL", "https://hooks.example.com/orders"));
        assert!(load(&vars).is_err());

        vars.push(("NOTIFY_SECRET", "whsec"));
        let notify = load(&vars).unwrap().notify.unwrap();
        assert_eq!(notify.webhook_url, "https://hooks.example.com/orders");
        assert_eq!(notify.secret, "whsec");
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("PORT", "8080"),
            ("JWT_AUDIENCE", "exchange"),
            ("RATE_LIMIT_PER_MINUTE", "5"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.jwt_audience, "exchange");
        assert_eq!(config.rate_limit_per_minute, 5);

        vars.push(("PORT", "not-a-port"));
        assert!(load(&vars).is_err());
    }
}
