//! ConfigGuard: keeps the repository's remote and identity settings in shape.

use crate::error::StoreResult;
use crate::store::{FETCH_REFSPEC, VersionStore};
use std::sync::Arc;
use tracing::{debug, info};

pub const REMOTE_URL_KEY: &str = "remote.origin.url";
pub const REMOTE_FETCH_KEY: &str = "remote.origin.fetch";
pub const USER_NAME_KEY: &str = "user.name";
pub const USER_EMAIL_KEY: &str = "user.email";

/// Expected repository configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub remote_url: String,
    pub author_name: String,
    pub author_email: String,
}

impl RepoConfig {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            author_name: "notes".to_string(),
            author_email: "notes@localhost".to_string(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    fn expected(&self) -> [(&'static str, &str); 4] {
        [
            (REMOTE_URL_KEY, self.remote_url.as_str()),
            (REMOTE_FETCH_KEY, FETCH_REFSPEC),
            (USER_NAME_KEY, self.author_name.as_str()),
            (USER_EMAIL_KEY, self.author_email.as_str()),
        ]
    }
}

pub struct ConfigGuard<S: ?Sized> {
    store: Arc<S>,
    config: RepoConfig,
}

impl<S: VersionStore + ?Sized> ConfigGuard<S> {
    pub fn new(store: Arc<S>, config: RepoConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// All four keys hold their expected values. Unreadable keys count as unset.
    pub async fn is_configured(&self) -> bool {
        for (key, expected) in self.config.expected() {
            if !self.holds(key, expected).await {
                debug!("Config {} not set to expected value", key);
                return false;
            }
        }
        true
    }

    /// Write only the keys that deviate. Returns how many were written.
    pub async fn apply_defaults(&self) -> StoreResult<usize> {
        let mut written = 0;
        for (key, expected) in self.config.expected() {
            if self.holds(key, expected).await {
                continue;
            }
            self.store.set_config(key, expected).await?;
            written += 1;
        }
        if written > 0 {
            info!("Applied {} repository config value(s)", written);
        }
        Ok(written)
    }

    async fn holds(&self, key: &str, expected: &str) -> bool {
        match self.store.get_config(key).await {
            Ok(value) => value.as_deref() == Some(expected),
            Err(e) => {
                debug!("Treating unreadable config {} as unset: {}", key, e);
                false
            }
        }
    }
}
