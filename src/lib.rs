//! Realtime voice session client
//!
//! Runs bidirectional voice conversations with a remote speech agent:
//! caller audio goes up from the microphone, agent audio and transcript
//! events come down, and every finalized utterance from either side lands
//! in an append-only transcript that is persisted when the call ends.
//!
//! ```text
//!                  +-------------------+
//!   start/stop --> | SessionController | --> SessionEvent stream
//!                  +---------+---------+     (messages, partials, status)
//!                            |
//!             +--------------+--------------+
//!             |              |              |
//!       +-----v------+ +-----v-----+ +------v------+
//!       | credential | |  capture  | |  transport  |
//!       |  exchange  | |  (cpal)   | | direct/room |
//!       +------------+ +-----------+ +------+------+
//!                                           |
//!                                    TransportEvent
//!                                 (one surface for both
//!                                      strategies)
//! ```
//!
//! The two transport strategies differ in wire mechanics only. `direct`
//! trades SDP with the agent endpoint and carries events on a data channel;
//! `room` joins a relay over a websocket. Both collapse into the same
//! event surface, so session semantics live in exactly one place.

pub mod capture;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;

pub use capture::{CaptureHandle, CaptureOptions, CaptureSource, MicrophoneCapture, NullCapture};
pub use config::{SessionConfig, TransportStrategy};
pub use controller::{SessionController, SessionEvent, SessionEvents};
pub use credential::{fetch_credential, Credential};
pub use error::SessionError;
pub use persist::SessionMetadata;
pub use session::{ConnectionStatus, Session};
pub use transcript::{Speaker, TranscriptLog, Utterance};
pub use transport::ActiveTransport;
