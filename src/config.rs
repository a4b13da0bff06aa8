use anyhow::Context;

use crate::auth::delegate::DEFAULT_DELEGATE_TIMEOUT;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub ttl_minutes: i64,
}

/// Remote password service; absent means passwords are hashed locally.
#[derive(Debug, Clone)]
pub struct DelegateConfig {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt: JwtConfig,
    pub delegate: Option<DelegateConfig>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let secret = var("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .context("JWT_SECRET is not set")?;
        let jwt = JwtConfig {
            secret,
            ttl_minutes: var("JWT_TTL_MINUTES")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60),
        };
        let delegate = var("PASSWORD_DELEGATE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| DelegateConfig {
                url,
                timeout_secs: var("PASSWORD_DELEGATE_TIMEOUT_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_DELEGATE_TIMEOUT.as_secs()),
            });
        let db_max_connections = var("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        Ok(Self {
            database_url,
            db_max_connections,
            jwt,
            delegate,
        })
    }
}
