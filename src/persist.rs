//! Transcript persistence
//!
//! One flush per session, fired when the session ends. Failures are reported
//! and logged but never block or fail the session teardown; the in-memory
//! transcript remains available to the caller either way.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

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

/// Descriptive metadata stored alongside the transcript text.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub duration_seconds: i64,
    pub ended: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
struct FlushRequest<'a> {
    text: &'a str,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    metadata: &'a SessionMetadata,
}

/// Send the rendered transcript to the storage endpoint.
///
/// # Arguments
/// * `persist_url` - Storage endpoint accepting the flush POST
/// * `session_id` - Identifier the transcript is stored under
/// * `text` - Rendered transcript, one line per utterance
/// * `metadata` - Duration, end time, and room for the stored record
pub async fn flush_transcript(
    persist_url: &str,
    session_id: &str,
    text: &str,
    metadata: &SessionMetadata,
) -> Result<(), SessionError> {
    log::debug!(
        "Flushing transcript for session {} ({} bytes)",
        session_id,
        text.len()
    );

    let request = FlushRequest {
        text,
        session_id,
        metadata,
    };

    let response = http_client()
        .post(persist_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| SessionError::PersistenceFailed(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SessionError::PersistenceFailed(format!(
            "storage endpoint returned {}: {}",
            status, body
        )));
    }

    log::info!("Transcript stored for session {}", session_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flush_request_shape() {
        let metadata = SessionMetadata {
            duration_seconds: 95,
            ended: "2025-03-01T17:05:00Z".parse().unwrap(),
            room: Some("call-42".to_string()),
        };
        let request = FlushRequest {
            text: "[17:03:25] Agent: Hello",
            session_id: "a1b2c3",
            metadata: &metadata,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "text": "[17:03:25] Agent: Hello",
                "sessionId": "a1b2c3",
                "metadata": {
                    "duration_seconds": 95,
                    "ended": "2025-03-01T17:05:00Z",
                    "room": "call-42"
                }
            })
        );
    }

    #[test]
    fn test_metadata_omits_absent_room() {
        let metadata = SessionMetadata {
            duration_seconds: 10,
            ended: Utc::now(),
            room: None,
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value.get("room").is_none());
    }
}
