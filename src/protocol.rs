//! Wire protocol for the agent event sideband and the relay room
//!
//! Two message families share this module. `SidebandEvent` is what the agent
//! sends over the in-band data channel on a direct connection. `RoomCommand`
//! and `RoomEvent` are the client-to-relay and relay-to-client halves of the
//! room websocket protocol.
//!
//! Both inbound families collapse into [`TransportEvent`], the single surface
//! the session loop consumes, so the loop never knows which transport
//! produced an event.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::transcript::Speaker;

/// Label of the negotiated data channel carrying agent events.
pub const EVENT_CHANNEL_LABEL: &str = "agent-events";

/// Error details attached to a remote `error` event.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Best human-readable description available.
    pub fn describe(&self) -> String {
        if !self.message.is_empty() {
            self.message.clone()
        } else if !self.error_type.is_empty() {
            self.error_type.clone()
        } else {
            "Unknown agent error".to_string()
        }
    }
}

// ============================================================
// Direct transport: agent event sideband
// ============================================================

/// Events the agent sends over the data channel.
///
/// Unrecognized event types deserialize to `Unknown` and are skipped;
/// the agent is free to add event types without breaking older clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SidebandEvent {
    /// In-progress fragment of the agent's current utterance
    #[serde(rename = "agent.transcript.delta")]
    AgentTranscriptDelta { delta: String },

    /// Finalized agent utterance
    #[serde(rename = "agent.transcript.done")]
    AgentTranscriptDone { transcript: String },

    /// Finalized caller utterance, recognized remotely
    #[serde(rename = "caller.transcript.done")]
    CallerTranscriptDone { transcript: String },

    /// The agent hit an application error
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    #[serde(other)]
    Unknown,
}

impl SidebandEvent {
    /// Parse one data-channel payload. Malformed payloads and unrecognized
    /// event types are logged and dropped, never surfaced.
    pub fn parse(text: &str) -> Option<SidebandEvent> {
        match serde_json::from_str::<SidebandEvent>(text) {
            Ok(SidebandEvent::Unknown) => {
                log::debug!("Skipping unrecognized sideband event");
                None
            }
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Dropping malformed sideband payload: {}", e);
                None
            }
        }
    }

    /// Map onto the transport-agnostic event surface.
    pub fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            SidebandEvent::AgentTranscriptDelta { delta } => Some(TransportEvent::SpeechFragment {
                speaker: Speaker::Agent,
                text: delta,
            }),
            SidebandEvent::AgentTranscriptDone { transcript } => Some(TransportEvent::SpeechFinal {
                speaker: Speaker::Agent,
                text: transcript,
            }),
            SidebandEvent::CallerTranscriptDone { transcript } => {
                Some(TransportEvent::SpeechFinal {
                    speaker: Speaker::Caller,
                    text: transcript,
                })
            }
            SidebandEvent::Error { error } => Some(TransportEvent::RemoteError {
                message: error.describe(),
            }),
            SidebandEvent::Unknown => None,
        }
    }
}

// ============================================================
// Room transport: client commands and relay events
// ============================================================

/// Which room participant produced a track or utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Agent,
    Caller,
}

impl From<Origin> for Speaker {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Agent => Speaker::Agent,
            Origin::Caller => Speaker::Caller,
        }
    }
}

/// Connection quality as judged by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
    Lost,
}

/// Commands the client sends to the relay room.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RoomCommand {
    /// Join the named room
    #[serde(rename = "room.join")]
    Join { room: String },

    /// Announce the microphone track and its format
    #[serde(rename = "room.microphone")]
    Microphone { enabled: bool, sample_rate: u32 },

    /// One frame of caller audio, base64-encoded 16-bit little-endian PCM
    #[serde(rename = "room.audio")]
    Audio { frame: String },

    /// Leave the room cleanly
    #[serde(rename = "room.leave")]
    Leave,
}

impl RoomCommand {
    pub fn join(room: impl Into<String>) -> Self {
        RoomCommand::Join { room: room.into() }
    }

    /// Encode PCM samples into an audio frame command.
    pub fn audio_frame(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        RoomCommand::Audio {
            frame: STANDARD.encode(&bytes),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events the relay sends to the client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RoomEvent {
    /// The join was accepted
    #[serde(rename = "room.joined")]
    Joined {
        room: String,
        #[serde(default)]
        participant: Option<String>,
    },

    /// A participant published a media track
    #[serde(rename = "room.track")]
    TrackPublished { origin: Origin, kind: String },

    /// A recognized utterance, partial or final
    #[serde(rename = "room.transcription")]
    Transcription {
        origin: Origin,
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Relay's judgement of the connection quality
    #[serde(rename = "room.quality")]
    Quality { level: QualityLevel },

    /// The relay or the agent behind it reported an error
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    #[serde(other)]
    Unknown,
}

impl RoomEvent {
    /// Parse one relay payload, logging and dropping anything unusable.
    pub fn parse(text: &str) -> Option<RoomEvent> {
        match serde_json::from_str::<RoomEvent>(text) {
            Ok(RoomEvent::Unknown) => {
                log::debug!("Skipping unrecognized room event");
                None
            }
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Dropping malformed room payload: {}", e);
                None
            }
        }
    }

    /// Map onto the transport-agnostic event surface.
    pub fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            RoomEvent::Joined { room, .. } => {
                log::debug!("Joined room {}", room);
                Some(TransportEvent::Connected)
            }
            RoomEvent::TrackPublished { origin, kind } => {
                if origin == Origin::Agent && kind == "audio" {
                    Some(TransportEvent::RemoteAudioAvailable)
                } else {
                    None
                }
            }
            RoomEvent::Transcription {
                origin,
                text,
                is_final,
            } => {
                let speaker = Speaker::from(origin);
                if is_final {
                    Some(TransportEvent::SpeechFinal { speaker, text })
                } else {
                    Some(TransportEvent::SpeechFragment { speaker, text })
                }
            }
            RoomEvent::Quality { level } => match level {
                QualityLevel::Poor | QualityLevel::Lost => {
                    Some(TransportEvent::QualityDegraded)
                }
                _ => None,
            },
            RoomEvent::Error { error } => Some(TransportEvent::RemoteError {
                message: error.describe(),
            }),
            RoomEvent::Unknown => None,
        }
    }
}

// ============================================================
// Transport-agnostic event surface
// ============================================================

/// What a transport reports to the session loop.
///
/// Both transport strategies emit these, so the loop's handling of
/// transcripts, status changes, and failures is written exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Media and event channel are up
    Connected,
    /// The transport is gone and will not recover
    Disconnected { reason: String },
    /// The transport dropped and recovery is underway
    Reconnecting,
    /// The agent's audio track arrived
    RemoteAudioAvailable,
    /// In-progress fragment of an utterance, replaced by later fragments
    SpeechFragment { speaker: Speaker, text: String },
    /// Finalized utterance, ready to commit
    SpeechFinal { speaker: Speaker, text: String },
    /// The remote agent reported an application error
    RemoteError { message: String },
    /// Connection quality dropped enough to affect audio
    QualityDegraded,
    /// The event channel itself failed
    ChannelFailed { detail: String },
}
