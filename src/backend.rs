//! Hosted auth and community data.
//!
//! The gallery keeps accounts and community posts in a backend-as-a-service:
//! a GoTrue-style auth API under `/auth/v1` and PostgREST-style tables under
//! `/rest/v1`. [`RestBackend`] talks to both over `reqwest` and keeps the
//! signed-in session in memory for the lifetime of the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use url::Url;

use crate::config::Config;

pub const DEFAULT_FEED_LIMIT: usize = 5;

const POSTS_TABLE: &str = "rest/v1/community_posts";
const POSTS_SELECT: &str = "*,profiles:user_id(full_name,email)";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Api(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct UserMetadata {
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl User {
    /// Name to greet the user by: full name, then e-mail, then id.
    pub fn display_name(&self) -> &str {
        self.user_metadata
            .full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Profile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub email: Option<String>,
}

/// A row of `community_posts` with its author's profile embedded.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommunityPost {
    // Numeric or uuid depending on the table definition.
    #[allow(dead_code)]
    pub id: Value,
    #[serde(default)]
    #[allow(dead_code)]
    pub user_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "profiles")]
    pub profile: Option<Profile>,
}

impl CommunityPost {
    pub fn author(&self) -> &str {
        self.profile
            .as_ref()
            .and_then(|p| p.full_name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or("Anonymous")
    }
}

// Sign-up answers with a session when accounts are auto-confirmed and with
// the bare user when e-mail confirmation is pending.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(Session),
    User(User),
}

/// Account and community operations the client depends on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Register an account. `None` means the account exists but must be
    /// confirmed by e-mail before a session is issued.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, BackendError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    /// End the current session. The local session is cleared even when the
    /// remote call fails.
    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn current_session(&self) -> Option<Session>;

    /// Re-read the signed-in user from the auth service.
    async fn current_user(&self) -> Result<User, BackendError>;

    /// Most recent community posts, newest first.
    async fn recent_posts(&self, limit: usize) -> Result<Vec<CommunityPost>, BackendError>;
}

pub struct RestBackend {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    session: RwLock<Option<Session>>,
}

impl RestBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: config.backend_url.clone(),
            api_key: config.api_key.clone(),
            session: RwLock::new(None),
        }
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.base.join(path)?;
        debug!("{} {}", method, url);
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token.unwrap_or(&self.api_key)))
    }

    async fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    async fn store_session(&self, session: &Session) {
        *self.session.write().await = Some(session.clone());
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Option<Session>, BackendError> {
        let response = self
            .request(Method::POST, "auth/v1/signup", None)?
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "full_name": full_name },
            }))
            .send()
            .await?;
        let response = check(response).await?;

        match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session(session) => {
                info!("Signed up and signed in as {}", email);
                self.store_session(&session).await;
                Ok(Some(session))
            }
            SignUpResponse::User(user) => {
                info!("Signed up {}; confirmation pending", user.email.as_deref().unwrap_or(email));
                Ok(None)
            }
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let response = self
            .request(Method::POST, "auth/v1/token", None)?
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let session: Session = check(response).await?.json().await?;

        info!(expires_in = ?session.expires_in, "Signed in as {}", email);
        self.store_session(&session).await;
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(session) = self.session.write().await.take() else {
            debug!("Sign out requested without a session");
            return Ok(());
        };

        let response = self
            .request(Method::POST, "auth/v1/logout", Some(&session.access_token))?
            .send()
            .await?;
        check(response).await?;
        info!("Signed out");
        Ok(())
    }

    async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    async fn current_user(&self) -> Result<User, BackendError> {
        let token = self.access_token().await.ok_or(BackendError::NotSignedIn)?;
        let response = self
            .request(Method::GET, "auth/v1/user", Some(&token))?
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn recent_posts(&self, limit: usize) -> Result<Vec<CommunityPost>, BackendError> {
        let token = self.access_token().await;
        let response = self
            .request(Method::GET, POSTS_TABLE, token.as_deref())?
            .query(&[
                ("select", POSTS_SELECT.to_string()),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let posts: Vec<CommunityPost> = check(response).await?.json().await?;
        debug!("Fetched {} community posts", posts.len());
        Ok(posts)
    }
}

/// Pass successful responses through; turn failures into [`BackendError::Api`].
async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = error_message(&text).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    });
    error!("Backend request failed with {}: {}", status, message);
    Err(BackendError::Api(message))
}

// The auth and table APIs disagree on where the message lives.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["msg", "message", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}
