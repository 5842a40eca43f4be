use serde::{Deserialize, Serialize};

use crate::capture::CaptureOptions;

/// Default endpoint for obtaining an ephemeral session credential.
pub const DEFAULT_CREDENTIAL_URL: &str = "http://localhost:3001/ephemeral-token";

/// Default endpoint for persisting the finished transcript.
pub const DEFAULT_PERSIST_URL: &str = "http://localhost:3001/save-transcript";

/// Default agent endpoint for the direct offer/answer exchange.
pub const DEFAULT_AGENT_URL: &str = "http://localhost:3001/offer";

/// Which media transport the session uses to reach the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    /// Negotiate a peer connection directly with the agent endpoint
    Direct,
    /// Join a relay room and exchange media through it
    Room,
}

/// Session configuration.
///
/// All fields have defaults so a partial config (or none at all) still
/// produces a working setup against a local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint that issues ephemeral session credentials
    pub credential_url: String,
    /// Agent endpoint for the direct offer/answer exchange
    pub agent_url: String,
    /// Endpoint that stores finished transcripts
    pub persist_url: String,
    /// Media transport strategy
    pub strategy: TransportStrategy,
    /// Microphone processing switches requested from the capture stack
    pub capture: CaptureOptions,
    /// Forward in-progress speech fragments to the observer as they arrive
    pub forward_partials: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_url: DEFAULT_CREDENTIAL_URL.to_string(),
            agent_url: DEFAULT_AGENT_URL.to_string(),
            persist_url: DEFAULT_PERSIST_URL.to_string(),
            strategy: TransportStrategy::Direct,
            capture: CaptureOptions::default(),
            forward_partials: false,
        }
    }
}
