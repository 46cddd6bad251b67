//! Video-registry adapter: token-authenticated REST client for the external
//! service where FL/FR deliverables are registered.
//!
//! The registry speaks its own angle vocabulary (`LEFT`/`RIGHT`); the
//! mapping from camera angles lives on [courtside_types::Angle].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courtside_types::RegistrySide;

/// Refresh the token when it is within this window of expiry.
pub const TOKEN_EXPIRY_BUFFER: chrono::Duration = chrono::Duration::seconds(60);

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("authentication failed with status {status}")]
    AuthFailed { status: reqwest::StatusCode },
    #[error("login response carried no access token")]
    NoToken,
    #[error("registry returned {status} for {endpoint}")]
    RequestFailed {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("malformed registry payload: {source}")]
    BadPayload {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { source } => source.is_timeout() || source.is_connect(),
            Error::RequestFailed { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// A game as the registry returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryGame {
    pub id: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub firebase_game_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryTeam {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Payload for creating a game in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct NewRegistryGame {
    pub date: String,
    pub team1_id: String,
    pub team2_id: String,
    /// The catalog-side game id, so the two systems stay linked.
    pub firebase_game_id: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team1_score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team2_score: Option<i64>,
}

/// Payload for registering one deliverable.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterVideo {
    pub game_id: String,
    pub s3_key: String,
    pub angle: RegistrySide,
    pub filename: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredVideo {
    pub id: String,
}

/// The seam the orchestrator's registration step drives.
#[async_trait::async_trait]
pub trait VideoRegistry: Send + Sync {
    async fn get_game_by_catalog_id(&self, catalog_game_id: &str)
        -> Result<Option<RegistryGame>>;
    async fn create_game(&self, game: &NewRegistryGame) -> Result<RegistryGame>;
    async fn list_teams(&self) -> Result<Vec<RegistryTeam>>;
    async fn register_video(&self, video: &RegisterVideo) -> Result<RegisteredVideo>;
    async fn health_check(&self) -> Result<bool>;
}

// ---------------------------
// token handling

#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    expires_at: DateTime<Utc>,
}

fn token_still_valid(token: &TokenState, now: DateTime<Utc>) -> bool {
    now < token.expires_at - TOKEN_EXPIRY_BUFFER
}

/// Parse a login response. The session object is either nested under
/// `session` or flat at the top level.
fn parse_login_payload(payload: &serde_json::Value, now: DateTime<Utc>) -> Result<TokenState> {
    let session = payload.get("session").unwrap_or(payload);
    let access_token = session
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or(Error::NoToken)?
        .to_string();
    let expires_in = session
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .unwrap_or(3600);
    Ok(TokenState {
        access_token,
        expires_at: now + chrono::Duration::seconds(expires_in),
    })
}

/// REST client implementation of [VideoRegistry].
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    token: tokio::sync::Mutex<Option<TokenState>>,
}

impl RegistryClient {
    pub fn new(base_url: &str, email: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(RegistryClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password: password.to_string(),
            token: tokio::sync::Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<TokenState> {
        let resp = self
            .http
            .post(format!("{}/api/v1/auth/login", self.base_url))
            .timeout(LOGIN_TIMEOUT)
            .json(&serde_json::json!({
                "email": self.email,
                "password": self.password,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::AuthFailed {
                status: resp.status(),
            });
        }
        let payload: serde_json::Value = resp.json().await?;
        let token = parse_login_payload(&payload, Utc::now())?;
        info!("authenticated with the video registry");
        Ok(token)
    }

    /// Valid bearer token, refreshing within 60 s of expiry.
    async fn bearer(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token_still_valid(token, Utc::now()) {
                return Ok(token.access_token.clone());
            }
            debug!("registry token near expiry, re-authenticating");
        }
        let fresh = self.login().await?;
        let access = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access)
    }

    async fn get_json(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(format!("{}{endpoint}", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::RequestFailed {
                endpoint: endpoint.to_string(),
                status: resp.status(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn post_json<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<serde_json::Value> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::RequestFailed {
                endpoint: endpoint.to_string(),
                status: resp.status(),
            });
        }
        Ok(resp.json().await?)
    }
}

/// Accept both a bare list and a `{games: [...]}` wrapper.
fn unwrap_listing<'a>(
    payload: &'a serde_json::Value,
    key: &str,
) -> Option<&'a Vec<serde_json::Value>> {
    match payload {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(map) => map.get(key).and_then(|v| v.as_array()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl VideoRegistry for RegistryClient {
    async fn get_game_by_catalog_id(
        &self,
        catalog_game_id: &str,
    ) -> Result<Option<RegistryGame>> {
        let payload = self
            .get_json("/api/v1/games", &[("firebase_game_id", catalog_game_id)])
            .await?;
        let Some(items) = unwrap_listing(&payload, "games") else {
            return Ok(None);
        };
        match items.first() {
            Some(item) => Ok(Some(serde_json::from_value(item.clone())?)),
            None => Ok(None),
        }
    }

    async fn create_game(&self, game: &NewRegistryGame) -> Result<RegistryGame> {
        let payload = self.post_json("/api/v1/games", game).await?;
        let created: RegistryGame = serde_json::from_value(payload)?;
        info!("created registry game {}", created.id);
        Ok(created)
    }

    async fn list_teams(&self) -> Result<Vec<RegistryTeam>> {
        let payload = self.get_json("/api/v1/teams", &[]).await?;
        match unwrap_listing(&payload, "teams") {
            Some(items) => Ok(items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn register_video(&self, video: &RegisterVideo) -> Result<RegisteredVideo> {
        let payload = self.post_json("/api/v1/videos", video).await?;
        let registered: RegisteredVideo = serde_json::from_value(payload)?;
        info!(
            "registered {} deliverable for game {} ({})",
            video.angle.as_str(),
            video.game_id,
            video.s3_key
        );
        Ok(registered)
    }

    async fn health_check(&self) -> Result<bool> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        match self.bearer().await {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!("registry reachable but authentication failed: {err}");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_types::Angle;

    #[test]
    fn token_expiry_buffer_is_sixty_seconds() {
        let now = Utc::now();
        let token = TokenState {
            access_token: "t".to_string(),
            expires_at: now + chrono::Duration::seconds(120),
        };
        assert!(token_still_valid(&token, now));
        assert!(!token_still_valid(&token, now + chrono::Duration::seconds(61)));
        // exactly at the buffer boundary counts as expired
        assert!(!token_still_valid(&token, now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn login_payload_nested_session() {
        let now = Utc::now();
        let payload = serde_json::json!({
            "session": {"access_token": "abc", "refresh_token": "r", "expires_in": 600},
            "user": {"id": "u1"}
        });
        let token = parse_login_payload(&payload, now).unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_at, now + chrono::Duration::seconds(600));
    }

    #[test]
    fn login_payload_flat_defaults_to_an_hour() {
        let now = Utc::now();
        let payload = serde_json::json!({"access_token": "xyz"});
        let token = parse_login_payload(&payload, now).unwrap();
        assert_eq!(token.access_token, "xyz");
        assert_eq!(token.expires_at, now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn login_payload_without_token_fails() {
        let payload = serde_json::json!({"user": {"id": "u1"}});
        assert!(matches!(
            parse_login_payload(&payload, Utc::now()),
            Err(Error::NoToken)
        ));
    }

    #[test]
    fn register_payload_uses_registry_vocabulary() {
        let video = RegisterVideo {
            game_id: "g-1".to_string(),
            s3_key: "court-a/2026-01-20/g/2026-01-20_g_FL.mp4".to_string(),
            angle: Angle::FL.registry_side().unwrap(),
            filename: "2026-01-20_g_FL.mp4".to_string(),
            file_size: 123,
        };
        let v = serde_json::to_value(&video).unwrap();
        assert_eq!(v["angle"], "LEFT");
        assert_eq!(v["file_size"], 123);
        assert_eq!(v["game_id"], "g-1");
    }

    #[test]
    fn listings_unwrap_both_shapes() {
        let bare = serde_json::json!([{"id": "a"}]);
        assert_eq!(unwrap_listing(&bare, "games").unwrap().len(), 1);
        let wrapped = serde_json::json!({"games": [{"id": "a"}, {"id": "b"}]});
        assert_eq!(unwrap_listing(&wrapped, "games").unwrap().len(), 2);
        let neither = serde_json::json!("nope");
        assert!(unwrap_listing(&neither, "games").is_none());
    }
}
