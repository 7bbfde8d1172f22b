//! Moderator session persisted on the device.
//!
//! Lives under the unnamespaced `admin_session` key so signing a viewer out
//! (which clears the cache namespace) does not sign the moderator out.

use std::sync::Arc;

use cb_core::validation::validate_email;
use cb_core::{AppError, KeyValueStore, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ADMIN_SESSION_KEY: &str = "admin_session";

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub email: String,
    pub token: SecretString,
}

/// On-disk shape.
#[derive(Serialize, Deserialize)]
struct StoredSession {
    #[serde(default)]
    token: String,
    #[serde(default)]
    email: String,
}

pub struct AdminGuard {
    store: Arc<dyn KeyValueStore>,
}

impl AdminGuard {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn sign_in(&self, email: &str, token: SecretString) -> Result<AdminSession> {
        validate_email(email)?;
        if token.expose_secret().trim().is_empty() {
            return Err(AppError::ValidationFailed("admin token is empty".into()));
        }
        let stored = StoredSession { token: token.expose_secret().to_string(), email: email.to_string() };
        let encoded = serde_json::to_string(&stored)
            .map_err(|e| AppError::ValidationFailed(format!("unencodable admin session: {e}")))?;
        self.store
            .set(ADMIN_SESSION_KEY, encoded)
            .await
            .map_err(|e| AppError::remote("store admin session", e))?;
        info!(email, "admin signed in");
        Ok(AdminSession { email: email.to_string(), token })
    }

    /// Run on every admin page load. Anything short of a complete entry is
    /// wiped and treated as signed out.
    pub async fn check(&self) -> Result<AdminSession> {
        let raw = self
            .store
            .get(ADMIN_SESSION_KEY)
            .await
            .map_err(|e| AppError::remote("read admin session", e))?
            .ok_or_else(|| AppError::NotAuthenticated("admin sign-in required".into()))?;

        match serde_json::from_str::<StoredSession>(&raw) {
            Ok(stored) if !stored.token.is_empty() && !stored.email.is_empty() => {
                Ok(AdminSession { email: stored.email, token: SecretString::from(stored.token) })
            }
            _ => {
                warn!("admin session entry is malformed, clearing it");
                self.clear().await;
                Err(AppError::NotAuthenticated("admin session invalid".into()))
            }
        }
    }

    pub async fn sign_out(&self) {
        self.clear().await;
        info!("admin signed out");
    }

    async fn clear(&self) {
        if let Err(e) = self.store.remove(ADMIN_SESSION_KEY).await {
            warn!(error = %e, "could not clear admin session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_gateway_memory::MemoryKeyValueStore;

    #[tokio::test]
    async fn test_sign_in_check_sign_out() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let guard = AdminGuard::new(store.clone());

        assert!(matches!(guard.check().await, Err(AppError::NotAuthenticated(_))));

        guard.sign_in("mod@schoolplatform.com", SecretString::from("tok-123".to_string())).await.unwrap();
        let session = guard.check().await.unwrap();
        assert_eq!(session.email, "mod@schoolplatform.com");
        assert_eq!(session.token.expose_secret(), "tok-123");

        guard.sign_out().await;
        assert!(guard.check().await.is_err());
        assert_eq!(store.get(ADMIN_SESSION_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incomplete_entry_is_cleared() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set(ADMIN_SESSION_KEY, r#"{"email":"mod@schoolplatform.com"}"#.to_string()).await.unwrap();
        let guard = AdminGuard::new(store.clone());

        assert!(matches!(guard.check().await, Err(AppError::NotAuthenticated(_))));
        assert_eq!(store.get(ADMIN_SESSION_KEY).await.unwrap(), None);

        store.set(ADMIN_SESSION_KEY, "not json".to_string()).await.unwrap();
        assert!(guard.check().await.is_err());
        assert_eq!(store.get(ADMIN_SESSION_KEY).await.unwrap(), None);
    }

    #[test]
    fn test_token_is_redacted_in_debug_output() {
        let session = AdminSession { email: "mod@x.edu".into(), token: SecretString::from("tok-123".to_string()) };
        assert!(!format!("{session:?}").contains("tok-123"));
    }
}
