//! Ephemeral credential exchange
//!
//! One POST to the credential endpoint per `start()`. No retries: a failed
//! or unusable response fails the whole start attempt, and the caller
//! decides whether to try again.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::config::{SessionConfig, TransportStrategy};
use crate::error::SessionError;

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn http_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    })
}

/// A short-lived secret authorizing one session.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Bearer secret presented to the media endpoint
    pub secret: String,
    pub issued_at: DateTime<Utc>,
    /// Expiry as reported by the issuer, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Media endpoint this credential is valid for
    pub endpoint: String,
    /// Room to join (room strategy only)
    pub room: Option<String>,
}

/// Issuer response for the direct strategy.
#[derive(Debug, Deserialize)]
struct DirectTokenResponse {
    #[serde(default)]
    client_secret: Option<String>,
    /// Unix seconds
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    url: Option<String>,
}

/// Issuer response for the room strategy.
#[derive(Debug, Deserialize)]
struct RoomTokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    room: Option<String>,
}

/// Fetch a credential for one session attempt.
pub async fn fetch_credential(config: &SessionConfig) -> Result<Credential, SessionError> {
    log::debug!("Requesting session credential from {}", config.credential_url);

    let response = http_client()
        .post(&config.credential_url)
        .send()
        .await
        .map_err(|e| SessionError::CredentialUnavailable(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = match status.as_u16() {
            401 | 403 => format!("issuer rejected the request ({})", status),
            _ => format!("issuer returned {}: {}", status, body),
        };
        return Err(SessionError::CredentialUnavailable(message));
    }

    let credential = match config.strategy {
        TransportStrategy::Direct => {
            let body: DirectTokenResponse = response.json().await.map_err(|e| {
                SessionError::CredentialUnavailable(format!("invalid response body: {}", e))
            })?;
            parse_direct(body, &config.agent_url)?
        }
        TransportStrategy::Room => {
            let body: RoomTokenResponse = response.json().await.map_err(|e| {
                SessionError::CredentialUnavailable(format!("invalid response body: {}", e))
            })?;
            parse_room(body)?
        }
    };

    match credential.expires_at {
        Some(expires) => log::info!(
            "Obtained session credential for {}, expires {}",
            credential.endpoint,
            expires
        ),
        None => log::info!(
            "Obtained session credential for {} (no expiry reported)",
            credential.endpoint
        ),
    }

    Ok(credential)
}

fn parse_direct(body: DirectTokenResponse, agent_url: &str) -> Result<Credential, SessionError> {
    let secret = body
        .client_secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            SessionError::CredentialUnavailable("response missing client secret".to_string())
        })?;

    let expires_at = body
        .expires_at
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    Ok(Credential {
        secret,
        issued_at: Utc::now(),
        expires_at,
        endpoint: body.url.unwrap_or_else(|| agent_url.to_string()),
        room: None,
    })
}

fn parse_room(body: RoomTokenResponse) -> Result<Credential, SessionError> {
    let secret = body.token.filter(|s| !s.is_empty()).ok_or_else(|| {
        SessionError::CredentialUnavailable("response missing room token".to_string())
    })?;
    let endpoint = body.url.filter(|s| !s.is_empty()).ok_or_else(|| {
        SessionError::CredentialUnavailable("response missing endpoint url".to_string())
    })?;
    let room = body.room.filter(|s| !s.is_empty()).ok_or_else(|| {
        SessionError::CredentialUnavailable("response missing room name".to_string())
    })?;

    Ok(Credential {
        secret,
        issued_at: Utc::now(),
        expires_at: None,
        endpoint,
        room: Some(room),
    })
}
