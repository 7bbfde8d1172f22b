//! # cb-gateway-rest
//!
//! Talks to the hosted backend over HTTP: PostgREST for rows, GoTrue for
//! accounts, and the storage API for post images. The access token from the
//! last sign-in is kept in memory and sent on every request.

pub mod postgrest;

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use cb_core::{AuthGateway, DataGateway, Filter, ObjectStore, Row, RowPage, Select, SessionUser, Table};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct ActiveSession {
    user: SessionUser,
    access_token: SecretString,
}

#[derive(Deserialize)]
struct AuthUser {
    id: uuid::Uuid,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    user: Option<AuthUser>,
    // Sign-up without auto-confirm returns the bare user.
    id: Option<uuid::Uuid>,
    email: Option<String>,
}

pub struct RestGateway {
    client: Client,
    base_url: Url,
    anon_key: SecretString,
    session: RwLock<Option<ActiveSession>>,
}

impl RestGateway {
    pub fn new(base_url: &str, anon_key: SecretString) -> anyhow::Result<Self> {
        let mut normalized = base_url.trim_end_matches('/').to_string();
        normalized.push('/');
        let base_url = Url::parse(&normalized).with_context(|| format!("invalid backend url {base_url}"))?;

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, base_url, anon_key, session: RwLock::new(None) })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(self.anon_key.expose_secret())?);
        let bearer = match self.session.read().await.as_ref() {
            Some(session) => format!("Bearer {}", session.access_token.expose_secret()),
            None => format!("Bearer {}", self.anon_key.expose_secret()),
        };
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&bearer)?);
        Ok(headers)
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<Response> {
        let response = request.headers(self.headers().await?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("backend returned {status}: {body}");
        }
        Ok(response)
    }

    fn table_url(&self, table: Table) -> anyhow::Result<Url> {
        self.endpoint(&format!("rest/v1/{table}"))
    }

    fn storage_path(bucket: &str, path: &str) -> String {
        format!("{bucket}/{}", path.trim_start_matches('/'))
    }

    async fn open_session(&self, token: TokenResponse, email: &str) -> anyhow::Result<SessionUser> {
        let (id, reported_email) = match (token.user, token.id) {
            (Some(user), _) => (user.id, user.email),
            (None, Some(id)) => (id, token.email),
            (None, None) => bail!("auth response carried no user"),
        };
        let user = SessionUser { id, email: reported_email.unwrap_or_else(|| email.to_string()) };
        if let Some(access_token) = token.access_token {
            *self.session.write().await =
                Some(ActiveSession { user: user.clone(), access_token: SecretString::from(access_token) });
        }
        Ok(user)
    }
}

#[async_trait]
impl DataGateway for RestGateway {
    async fn current_session(&self) -> anyhow::Result<Option<SessionUser>> {
        Ok(self.session.read().await.as_ref().map(|s| s.user.clone()))
    }

    async fn select(&self, table: Table, query: &Select) -> anyhow::Result<RowPage> {
        let params = postgrest::render_select(query);
        debug!(%table, ?params, "select");
        let response = self
            .send(self.client.get(self.table_url(table)?).query(&params).header("Prefer", "count=exact"))
            .await?;

        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(postgrest::parse_total);
        let rows: Vec<Row> = response.json().await?;
        Ok(RowPage { total: total.unwrap_or(rows.len() as u64), rows })
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        let response = self
            .send(
                self.client
                    .post(self.table_url(table)?)
                    .header("Prefer", "return=representation")
                    .json(&rows),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> anyhow::Result<u64> {
        let params = postgrest::render_filter(filter);
        if params.is_empty() {
            // PostgREST refuses unfiltered deletes; so do we.
            bail!("refusing to delete every row of {table}");
        }
        let response = self
            .send(
                self.client
                    .delete(self.table_url(table)?)
                    .query(&params)
                    .header("Prefer", "return=representation"),
            )
            .await?;
        let removed: Vec<Value> = response.json().await?;
        Ok(removed.len() as u64)
    }
}

#[async_trait]
impl AuthGateway for RestGateway {
    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> anyhow::Result<SessionUser> {
        let body = json!({ "email": email, "password": password, "data": metadata });
        let response = self.send(self.client.post(self.endpoint("auth/v1/signup")?).json(&body)).await?;
        let user = self.open_session(response.json().await?, email).await?;
        info!(user_id = %user.id, "account created");
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> anyhow::Result<SessionUser> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let body = json!({ "email": email, "password": password });
        let response = self.send(self.client.post(url).json(&body)).await?;
        self.open_session(response.json().await?, email).await
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        if self.session.read().await.is_some() {
            self.send(self.client.post(self.endpoint("auth/v1/logout")?)).await?;
        }
        *self.session.write().await = None;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RestGateway {
    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&format!("storage/v1/object/{}", Self::storage_path(bucket, path)))?;
        self.send(self.client.post(url).header(CONTENT_TYPE, content_type).body(data)).await?;
        Ok(())
    }

    async fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}storage/v1/object/public/{}", self.base_url, Self::storage_path(bucket, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(base: &str) -> RestGateway {
        RestGateway::new(base, SecretString::from("anon".to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_public_url_tolerates_trailing_slashes() {
        let a = gateway("https://demo.backend.test").public_url("post-images", "posts/p1/1-a.png").await;
        let b = gateway("https://demo.backend.test/").public_url("post-images", "/posts/p1/1-a.png").await;
        assert_eq!(a, "https://demo.backend.test/storage/v1/object/public/post-images/posts/p1/1-a.png");
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_base_url_is_an_error() {
        assert!(RestGateway::new("not a url", SecretString::from("anon".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_anonymous_requests_use_anon_key_as_bearer() {
        let headers = gateway("https://demo.backend.test").headers().await.unwrap();
        assert_eq!(headers["apikey"], "anon");
        assert_eq!(headers[AUTHORIZATION], "Bearer anon");
    }

    #[tokio::test]
    async fn test_token_response_opens_session() {
        let rest = gateway("https://demo.backend.test");
        let id = uuid::Uuid::now_v7();
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "jwt-abc",
            "user": { "id": id, "email": "alice@schoolplatform.com" },
        }))
        .unwrap();

        let user = rest.open_session(token, "alice@schoolplatform.com").await.unwrap();
        assert_eq!(user.id, id);
        assert_eq!(rest.current_session().await.unwrap(), Some(user));
        assert_eq!(rest.headers().await.unwrap()[AUTHORIZATION], "Bearer jwt-abc");
    }
}
