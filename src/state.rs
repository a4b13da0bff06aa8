use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use crate::auth::{
    delegate::{HttpReplyChannel, PasswordDelegate, RemotePasswordClient},
    jwt::TokenService,
    password::CredentialHasher,
};
use crate::config::AppConfig;
use crate::users::{repo::PgUserStore, services::UserDirectory};

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<UserDirectory>,
    pub tokens: TokenService,
}

impl AppState {
    pub fn init(config: &AppConfig, db: PgPool) -> anyhow::Result<Self> {
        let tokens = TokenService::from_config(&config.jwt);
        let hasher = CredentialHasher::new().context("argon2 parameters")?;

        let passwords = match &config.delegate {
            Some(delegate) => {
                info!(url = %delegate.url, timeout_secs = delegate.timeout_secs, "remote password hashing");
                let channel = HttpReplyChannel::new(&delegate.url)?;
                PasswordDelegate::Remote(RemotePasswordClient::new(
                    Arc::new(channel),
                    Duration::from_secs(delegate.timeout_secs),
                ))
            }
            None => {
                info!("local password hashing");
                PasswordDelegate::Local(hasher.clone())
            }
        };

        let store = Arc::new(PgUserStore::new(db));
        let directory = UserDirectory::new(store, hasher, passwords, tokens.clone())
            .context("build user directory")?;

        Ok(Self::from_parts(Arc::new(directory), tokens))
    }

    pub fn from_parts(directory: Arc<UserDirectory>, tokens: TokenService) -> Self {
        Self { directory, tokens }
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::users::memory::MemoryUserStore;

        let tokens = TokenService::new("test-secret", time::Duration::hours(1));
        let hasher = CredentialHasher::new().expect("argon2 params");
        let directory = UserDirectory::new(
            Arc::new(MemoryUserStore::default()),
            hasher.clone(),
            PasswordDelegate::Local(hasher),
            tokens.clone(),
        )
        .expect("directory");
        Self::from_parts(Arc::new(directory), tokens)
    }
}
