//! External collaborators used by packet handlers.
//!
//! Each one sits behind a small trait so handlers can be exercised without
//! network access. The production implementations are:
//! - [`JwtValidator`] for session tokens (HS256, shared secret)
//! - [`HttpSsoExchange`] for SSO tokens issued by the registration site
//! - [`YouTubeLookup`] for jukebox song metadata
//! - [`LogMailer`] and [`LogNotifier`], which only record what would be sent

use crate::config::Settings;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token rejected: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("{0} is not configured")]
    Unavailable(&'static str),
    #[error("unexpected response: {0}")]
    Malformed(String),
    #[error("no video with id {0}")]
    VideoNotFound(String),
}

/// Resolves a signed session token to a character id.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoIdentity {
    pub id: String,
    pub name: String,
    pub admitted: bool,
}

#[async_trait]
pub trait SsoExchange: Send + Sync {
    async fn exchange(&self, token: &str) -> Result<SsoIdentity, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDetails {
    pub title: String,
    /// Seconds
    pub duration: u64,
    pub thumbnail_url: String,
}

#[async_trait]
pub trait VideoLookup: Send + Sync {
    async fn lookup(&self, vid_code: &str) -> Result<VideoDetails, ServiceError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_code(&self, email: &str, code: u32);
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, subscription: &serde_json::Value, body: &str);
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    id: String,
}

pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Session tokens are not required to expire
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<String, ServiceError> {
        let data = decode::<SessionClaims>(token, &self.key, &self.validation)?;
        Ok(data.claims.id)
    }
}

#[derive(Debug, Deserialize)]
struct SsoResponse {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: SsoStatus,
}

#[derive(Debug, Default, Deserialize)]
struct SsoStatus {
    #[serde(default)]
    admitted: bool,
}

pub struct HttpSsoExchange {
    client: reqwest::Client,
    url: String,
}

impl HttpSsoExchange {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SsoExchange for HttpSsoExchange {
    async fn exchange(&self, token: &str) -> Result<SsoIdentity, ServiceError> {
        let response: SsoResponse = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(SsoIdentity {
            id: response.id,
            name: response.name.unwrap_or_else(|| "Hacker".to_string()),
            admitted: response.status.admitted,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    snippet: VideoSnippet,
    content_details: VideoContentDetails,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    thumbnails: VideoThumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct VideoThumbnails {
    #[serde(default)]
    default: Option<VideoThumbnail>,
}

#[derive(Debug, Deserialize)]
struct VideoThumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: String,
}

pub struct YouTubeLookup {
    client: reqwest::Client,
    api_key: String,
}

impl YouTubeLookup {
    const ENDPOINT: &'static str = "https://www.googleapis.com/youtube/v3/videos";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl VideoLookup for YouTubeLookup {
    async fn lookup(&self, vid_code: &str) -> Result<VideoDetails, ServiceError> {
        let response: VideoListResponse = self
            .client
            .get(Self::ENDPOINT)
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", vid_code),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::VideoNotFound(vid_code.to_string()))?;

        let duration = parse_duration(&item.content_details.duration).ok_or_else(|| {
            ServiceError::Malformed(format!("duration {}", item.content_details.duration))
        })?;

        Ok(VideoDetails {
            title: item.snippet.title,
            duration,
            thumbnail_url: item
                .snippet
                .thumbnails
                .default
                .map(|thumbnail| thumbnail.url)
                .unwrap_or_default(),
        })
    }
}

/// Parses an ISO 8601 duration such as `PT1H4M13S` into seconds.
pub fn parse_duration(text: &str) -> Option<u64> {
    let rest = text.strip_prefix('P')?;
    let (days, time) = match rest.split_once('T') {
        Some((days, time)) => (days, time),
        None => (rest, ""),
    };

    const DATE_UNITS: &[(char, u64)] = &[('D', 86_400)];
    const TIME_UNITS: &[(char, u64)] = &[('H', 3600), ('M', 60), ('S', 1)];

    let mut total = 0u64;
    for (part, units) in [(days, DATE_UNITS), (time, TIME_UNITS)] {
        let mut digits = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            let (_, scale) = units.iter().find(|(unit, _)| *unit == ch)?;
            let value: u64 = digits.parse().ok()?;
            total = value
                .checked_mul(*scale)
                .and_then(|seconds| total.checked_add(seconds))?;
            digits.clear();
        }
        if !digits.is_empty() {
            return None;
        }
    }
    Some(total)
}

/// Stand-in for any collaborator that is not configured.
pub struct Unavailable(pub &'static str);

#[async_trait]
impl SsoExchange for Unavailable {
    async fn exchange(&self, _token: &str) -> Result<SsoIdentity, ServiceError> {
        Err(ServiceError::Unavailable(self.0))
    }
}

#[async_trait]
impl VideoLookup for Unavailable {
    async fn lookup(&self, _vid_code: &str) -> Result<VideoDetails, ServiceError> {
        Err(ServiceError::Unavailable(self.0))
    }
}

pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_code(&self, email: &str, code: u32) {
        info!("Login code for {}: {:06}", email, code);
    }
}

pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, subscription: &serde_json::Value, body: &str) {
        let endpoint = subscription
            .get("endpoint")
            .and_then(|endpoint| endpoint.as_str())
            .unwrap_or("<unknown>");
        debug!("Push notification to {}: {}", endpoint, body);
    }
}

/// The collaborators a dispatcher talks to.
#[derive(Clone)]
pub struct Services {
    pub tokens: Arc<dyn TokenValidator>,
    pub sso: Arc<dyn SsoExchange>,
    pub videos: Arc<dyn VideoLookup>,
    pub mailer: Arc<dyn Mailer>,
    pub push: Arc<dyn PushNotifier>,
}

impl Services {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut services = Self::offline(&settings.auth.jwt_secret);

        if let Some(url) = &settings.auth.sso_url {
            services.sso = Arc::new(HttpSsoExchange::new(url.clone()));
        }
        if let Some(key) = &settings.video.api_key {
            services.videos = Arc::new(YouTubeLookup::new(key.clone()));
        }
        services
    }

    /// Session tokens only; SSO and video lookups always fail.
    pub fn offline(jwt_secret: &str) -> Self {
        Self {
            tokens: Arc::new(JwtValidator::new(jwt_secret)),
            sso: Arc::new(Unavailable("sso exchange")),
            videos: Arc::new(Unavailable("video lookup")),
            mailer: Arc::new(LogMailer),
            push: Arc::new(LogNotifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims<'a> {
        id: &'a str,
    }

    fn token(secret: &str, id: &str) -> String {
        encode(
            &Header::default(),
            &Claims { id },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_jwt_round_trip() {
        let validator = JwtValidator::new("secret");
        let id = validator.validate(&token("secret", "c1")).await.unwrap();
        assert_eq!(id, "c1");
    }

    #[tokio::test]
    async fn test_jwt_wrong_secret() {
        let validator = JwtValidator::new("secret");
        assert!(validator.validate(&token("other", "c1")).await.is_err());
        assert!(validator.validate("garbage").await.is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("PT4M13S"), Some(253));
        assert_eq!(parse_duration("PT45S"), Some(45));
        assert_eq!(parse_duration("PT1H2M3S"), Some(3723));
        assert_eq!(parse_duration("PT10M"), Some(600));
        assert_eq!(parse_duration("P1DT1S"), Some(86_401));
        assert_eq!(parse_duration("PT"), Some(0));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration("4M13S"), None);
        assert_eq!(parse_duration("PT4X"), None);
        assert_eq!(parse_duration("PT12"), None);
        assert_eq!(parse_duration("PTM"), None);
        assert_eq!(parse_duration("P99999999999999999DT1S"), None);
        assert_eq!(parse_duration(&format!("PT{}S", u64::MAX)), Some(u64::MAX));
        assert_eq!(parse_duration(&format!("PT{}S1S", u64::MAX)), None);
    }

    #[tokio::test]
    async fn test_offline_services() {
        let services = Services::offline("secret");
        assert!(matches!(
            services.videos.lookup("abc").await,
            Err(ServiceError::Unavailable(_))
        ));
        assert!(services.sso.exchange("abc").await.is_err());
    }
}
