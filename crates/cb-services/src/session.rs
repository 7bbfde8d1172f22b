//! Viewer identity lifecycle: who is signed in, and how they got there.
//!
//! The resulting [`Viewer`] is handed to every other component at
//! construction; nothing reads the session ambiently.

use std::sync::Arc;

use cb_core::validation::{validate_password, validate_username};
use cb_core::{
    decode_row, decode_rows, encode_row, AppError, AuthGateway, Badge, DataGateway, Filter, NewProfile, Profile,
    Result, Select, Table, Viewer,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::badges::BadgeEvaluator;
use crate::cache::ExpiringCache;
use crate::guard::SubmitGuard;

pub const DEFAULT_EMAIL_DOMAIN: &str = "schoolplatform.com";

/// Backend account email for a username. Registration and sign-in both
/// derive it here so the two can never disagree.
pub fn account_email(username: &str, domain: &str) -> String {
    format!("{}@{}", username.trim().to_lowercase(), domain)
}

fn profile_cache_key(user_id: Uuid) -> String {
    format!("profile:{user_id}")
}

#[derive(Debug, Clone)]
pub struct RegistrationForm {
    pub username: String,
    pub password: String,
    pub confirm_password: String,
    pub community: String,
    pub grade: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub viewer: Viewer,
    pub profile: Profile,
    /// Badges granted on the way in; empty when none applied or awarding failed.
    pub badges: Vec<Badge>,
}

pub struct SessionService {
    gateway: Arc<dyn DataGateway>,
    auth: Arc<dyn AuthGateway>,
    cache: Arc<ExpiringCache>,
    badges: Arc<BadgeEvaluator>,
    email_domain: String,
    submitting: SubmitGuard,
}

impl SessionService {
    pub fn new(
        gateway: Arc<dyn DataGateway>,
        auth: Arc<dyn AuthGateway>,
        cache: Arc<ExpiringCache>,
        badges: Arc<BadgeEvaluator>,
        email_domain: impl Into<String>,
    ) -> Self {
        Self { gateway, auth, cache, badges, email_domain: email_domain.into(), submitting: SubmitGuard::new() }
    }

    /// Works out who is looking. Never fails: an unreadable session is an
    /// anonymous viewer.
    pub async fn establish(&self) -> Viewer {
        match self.gateway.current_session().await {
            Ok(Some(user)) => self.resolve_viewer(user.id).await,
            Ok(None) => Viewer::Anonymous,
            Err(e) => {
                warn!(error = %e, "session lookup failed, continuing anonymously");
                Viewer::Anonymous
            }
        }
    }

    /// Authenticated viewer for `user_id`, with the community filled in when
    /// the profile can be found.
    pub async fn resolve_viewer(&self, user_id: Uuid) -> Viewer {
        let community = match self.profile(user_id).await {
            Ok(Some(profile)) => Some(profile.community),
            Ok(None) => {
                debug!(%user_id, "no profile for signed-in user");
                None
            }
            Err(e) => {
                warn!(%user_id, error = %e, "profile lookup failed");
                None
            }
        };
        Viewer::Authenticated { user_id, community }
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>> {
        let key = profile_cache_key(user_id);
        if let Some(profile) = self.cache.get::<Profile>(&key).await {
            return Ok(Some(profile));
        }
        let page = self
            .gateway
            .select(Table::Profiles, &Select::new(Filter::eq("id", user_id.to_string())).range(0, 1))
            .await
            .map_err(|e| AppError::remote("load profile", e))?;
        let profile = decode_rows::<Profile>(page.rows)?.into_iter().next();
        if let Some(profile) = &profile {
            self.cache.put_default(&key, profile).await;
        }
        Ok(profile)
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<Viewer> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(AppError::ValidationFailed("password is required".into()));
        }
        let _ticket = self.submitting.try_acquire("sign_in")?;

        let email = account_email(username, &self.email_domain);
        let user = self
            .auth
            .sign_in(&email, password)
            .await
            .map_err(|e| AppError::remote("sign in", e))?;
        info!(user_id = %user.id, "signed in");
        Ok(self.resolve_viewer(user.id).await)
    }

    pub async fn register(&self, form: RegistrationForm) -> Result<Registration> {
        validate_username(&form.username)?;
        validate_password(&form.password)?;
        if form.password != form.confirm_password {
            return Err(AppError::ValidationFailed("passwords do not match".into()));
        }
        let community = form.community.trim();
        if community.is_empty() {
            return Err(AppError::ValidationFailed("school is required".into()));
        }
        let _ticket = self.submitting.try_acquire("register")?;

        let email = account_email(&form.username, &self.email_domain);
        let metadata = json!({ "username": form.username, "community": community, "grade": form.grade });
        let user = self
            .auth
            .sign_up(&email, &form.password, metadata)
            .await
            .map_err(|e| AppError::remote("sign up", e))?;

        let row = encode_row(&NewProfile {
            id: user.id,
            username: form.username.clone(),
            community: community.to_string(),
            grade: form.grade.clone(),
        })?;
        let inserted = self
            .gateway
            .insert(Table::Profiles, vec![row])
            .await
            .map_err(|e| AppError::remote("create profile", e))?;
        let profile: Profile = match inserted.into_iter().next() {
            Some(row) => decode_row(row)?,
            None => return Err(AppError::RemoteFailed("create profile: backend returned no row".into())),
        };
        info!(user_id = %profile.id, community = %profile.community, "registered");

        self.cache.put_default(&profile_cache_key(profile.id), &profile).await;
        let badges = self.badges.evaluate_on_registration(&profile).await;

        Ok(Registration {
            viewer: Viewer::Authenticated { user_id: profile.id, community: Some(profile.community.clone()) },
            profile,
            badges,
        })
    }

    /// Ends the session and drops everything cached for it.
    pub async fn sign_out(&self) -> Result<Viewer> {
        self.auth.sign_out().await.map_err(|e| AppError::remote("sign out", e))?;
        self.cache.invalidate_all().await;
        info!("signed out");
        Ok(Viewer::Anonymous)
    }
}
