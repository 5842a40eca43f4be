//! Session controller
//!
//! Owns the session lifecycle: `start()` runs the setup chain (credential,
//! microphone, transport) and hands the transport's event stream to a
//! background loop; `stop()` flushes the transcript once, tears the
//! transport down, and releases the microphone. One controller runs at most
//! one session at a time.
//!
//! The observer surface is a single unbounded event stream: committed
//! transcript lines and system notices as `Message`, optional in-progress
//! fragments as `PartialTranscript`, and every status change as
//! `StatusChanged`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{CaptureSource, MicrophoneCapture};
use crate::config::{SessionConfig, TransportStrategy};
use crate::credential::fetch_credential;
use crate::error::SessionError;
use crate::persist::{flush_transcript, SessionMetadata};
use crate::protocol::TransportEvent;
use crate::session::{ConnectionStatus, Session};
use crate::transcript::{Speaker, Utterance};
use crate::transport::ActiveTransport;

const READY_DIRECT: &str = "Receptionist is ready. How can I help you?";
const READY_ROOM: &str = "Connected! The receptionist will greet you shortly.";
const NOTICE_RECONNECTING: &str = "Reconnecting...";
const NOTICE_RECONNECTED: &str = "Reconnected successfully.";
const NOTICE_QUALITY: &str = "Connection quality is poor. Audio may be affected.";
const NOTICE_SAVE_FAILED: &str = "Transcript could not be saved.";

/// What the observer sees of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A committed transcript line, or a system notice (notices are shown
    /// but never committed to the transcript)
    Message { speaker: Speaker, text: String },
    /// In-progress speech fragment, sent only when `forward_partials` is on
    PartialTranscript { speaker: Speaker, text: String },
    /// The session's connection status changed
    StatusChanged(ConnectionStatus),
}

/// Receiving end of the observer event stream.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Drives voice sessions against the configured endpoints.
pub struct SessionController {
    config: SessionConfig,
    capture_source: Arc<dyn CaptureSource>,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

struct Inner {
    session: Option<Session>,
    transport: Option<ActiveTransport>,
    loop_task: Option<JoinHandle<()>>,
    stop_intent: CancellationToken,
    flushed: bool,
}

impl Inner {
    /// Apply a status transition if the edge table admits it. Returns
    /// whether the status actually changed; repeated and illegal
    /// transitions are absorbed silently.
    fn set_status(
        &mut self,
        next: ConnectionStatus,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return false,
        };
        if session.status == next {
            return false;
        }
        if !session.status.admits(next) {
            log::debug!(
                "SessionController: ignoring {} -> {} transition",
                session.status,
                next
            );
            return false;
        }
        log::info!("SessionController: {} -> {}", session.status, next);
        session.status = next;
        let _ = events.send(SessionEvent::StatusChanged(next));
        true
    }
}

fn notice(events: &mpsc::UnboundedSender<SessionEvent>, text: &str) {
    let _ = events.send(SessionEvent::Message {
        speaker: Speaker::System,
        text: text.to_string(),
    });
}

impl SessionController {
    /// Controller capturing from the system's default microphone.
    pub fn new(config: SessionConfig) -> (Self, SessionEvents) {
        Self::with_capture_source(config, Arc::new(MicrophoneCapture))
    }

    /// Controller with a custom capture source, for headless use and tests.
    ///
    /// Returns the controller and the observer event stream. The stream is
    /// unbounded, so slow observers never stall the session.
    ///
    /// # Arguments
    /// * `config` - Endpoints, transport strategy, and capture options
    /// * `capture_source` - Microphone seam; the null source opens no device
    pub fn with_capture_source(
        config: SessionConfig,
        capture_source: Arc<dyn CaptureSource>,
    ) -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            capture_source,
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                transport: None,
                loop_task: None,
                stop_intent: CancellationToken::new(),
                flushed: false,
            })),
            events_tx,
        };
        (controller, events_rx)
    }

    /// Start a session: fetch a credential, acquire the microphone, connect
    /// the transport, then hand event handling to the background loop.
    ///
    /// Fails with `AlreadyActive` while a session is connecting, connected,
    /// or reconnecting. A `stop()` landing mid-setup cancels the start; the
    /// call returns `Ok(())` and the session ends without connecting.
    pub async fn start(&self) -> Result<(), SessionError> {
        let stop_intent = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.session.as_ref().is_some_and(|s| s.status.is_active()) {
                return Err(SessionError::AlreadyActive);
            }
            if let Some(stale) = inner.loop_task.take() {
                stale.abort();
            }
            inner.transport = None;
            inner.session = Some(Session::new());
            inner.flushed = false;
            inner.stop_intent = stop_intent.clone();
            inner.set_status(ConnectionStatus::Connecting, &self.events_tx);
        }

        let credential = match fetch_credential(&self.config).await {
            Ok(credential) => credential,
            Err(e) => return self.fail_start(e).await,
        };
        if stop_intent.is_cancelled() {
            return Ok(());
        }

        let (capture, frames) = match self.capture_source.open(self.config.capture) {
            Ok(opened) => opened,
            Err(e) => return self.fail_start(e).await,
        };
        if stop_intent.is_cancelled() {
            capture.release();
            return Ok(());
        }

        let connected =
            ActiveTransport::connect(self.config.strategy, &credential, capture, frames).await;
        let (transport, transport_events) = match connected {
            Ok(connected) => connected,
            Err(e) => return self.fail_start(e).await,
        };

        let mut inner = self.inner.lock().await;
        if stop_intent.is_cancelled() {
            drop(inner);
            transport.close().await;
            return Ok(());
        }
        if let Some(session) = inner.session.as_mut() {
            session.room = credential.room.clone();
        }
        inner.transport = Some(transport);
        inner.set_status(ConnectionStatus::Connected, &self.events_tx);
        notice(
            &self.events_tx,
            match self.config.strategy {
                TransportStrategy::Direct => READY_DIRECT,
                TransportStrategy::Room => READY_ROOM,
            },
        );
        inner.loop_task = Some(tokio::spawn(run_event_loop(
            Arc::clone(&self.inner),
            self.events_tx.clone(),
            transport_events,
            self.config.forward_partials,
        )));
        drop(inner);

        log::info!("SessionController: started ({:?} strategy)", self.config.strategy);
        Ok(())
    }

    async fn fail_start(&self, error: SessionError) -> Result<(), SessionError> {
        log::error!("SessionController: start failed: {}", error);
        let mut inner = self.inner.lock().await;
        inner.set_status(ConnectionStatus::Error, &self.events_tx);
        Err(error)
    }

    /// End the session: close the transport, release the microphone, and
    /// flush the transcript exactly once. Safe to call at any time; repeat
    /// calls and calls with no session do nothing.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            log::debug!("SessionController: stop with no session");
            return;
        }

        inner.stop_intent.cancel();
        inner.set_status(ConnectionStatus::Ended, &self.events_tx);

        let flush_job = if inner.flushed {
            None
        } else {
            inner.flushed = true;
            inner.session.as_ref().and_then(|session| {
                if session.transcript.is_empty() {
                    log::debug!("SessionController: empty transcript, skipping flush");
                    None
                } else {
                    Some((
                        session.id.to_string(),
                        session.transcript.render(),
                        SessionMetadata {
                            duration_seconds: session.duration_seconds(),
                            ended: Utc::now(),
                            room: session.room.clone(),
                        },
                    ))
                }
            })
        };

        let transport = inner.transport.take();
        if let Some(task) = inner.loop_task.take() {
            task.abort();
        }
        drop(inner);

        if let Some(transport) = transport {
            transport.close().await;
        }

        if let Some((session_id, text, metadata)) = flush_job {
            if let Err(e) =
                flush_transcript(&self.config.persist_url, &session_id, &text, &metadata).await
            {
                log::warn!("SessionController: {}", e);
                notice(&self.events_tx, NOTICE_SAVE_FAILED);
            }
        }

        log::info!("SessionController: stopped");
    }

    /// Current connection status, `Idle` before the first start.
    pub async fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Idle)
    }

    /// Identifier of the current session, if one exists.
    pub async fn session_id(&self) -> Option<Uuid> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.id)
    }

    /// Committed transcript of the current session so far.
    pub async fn transcript(&self) -> Vec<Utterance> {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.transcript.snapshot().to_vec())
            .unwrap_or_default()
    }

    /// Rendered transcript text, exactly what persistence stores.
    pub async fn transcript_text(&self) -> String {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.transcript.render())
            .unwrap_or_default()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.stop_intent.cancel();
            if let Some(task) = inner.loop_task.take() {
                task.abort();
            }
        }
    }
}

/// Consume transport events until the transport reaches a terminal state
/// or the session is stopped out from under us.
async fn run_event_loop(
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    forward_partials: bool,
) {
    let mut pending_close: Option<ActiveTransport> = None;

    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::Connected => {
                let mut guard = inner.lock().await;
                if guard.set_status(ConnectionStatus::Connected, &events_tx) {
                    notice(&events_tx, NOTICE_RECONNECTED);
                }
            }
            TransportEvent::Reconnecting => {
                let mut guard = inner.lock().await;
                if guard.set_status(ConnectionStatus::Reconnecting, &events_tx) {
                    notice(&events_tx, NOTICE_RECONNECTING);
                }
            }
            TransportEvent::RemoteAudioAvailable => {
                log::info!("SessionController: remote audio available");
            }
            TransportEvent::SpeechFragment { speaker, text } => {
                if forward_partials {
                    let _ = events_tx.send(SessionEvent::PartialTranscript { speaker, text });
                }
            }
            TransportEvent::SpeechFinal { speaker, text } => {
                let mut guard = inner.lock().await;
                if let Some(session) = guard.session.as_mut() {
                    session.transcript.commit(speaker, text.clone());
                }
                drop(guard);
                let _ = events_tx.send(SessionEvent::Message { speaker, text });
            }
            TransportEvent::QualityDegraded => {
                notice(&events_tx, NOTICE_QUALITY);
            }
            TransportEvent::RemoteError { message } => {
                log::error!("SessionController: remote error: {}", message);
                notice(&events_tx, &message);
                let mut guard = inner.lock().await;
                guard.set_status(ConnectionStatus::Error, &events_tx);
                pending_close = guard.transport.take();
                break;
            }
            TransportEvent::Disconnected { reason } => {
                log::info!("SessionController: transport disconnected: {}", reason);
                let mut guard = inner.lock().await;
                guard.set_status(ConnectionStatus::Ended, &events_tx);
                pending_close = guard.transport.take();
                break;
            }
            TransportEvent::ChannelFailed { detail } => {
                log::warn!("SessionController: event channel failed: {}", detail);
                let mut guard = inner.lock().await;
                guard.set_status(ConnectionStatus::Ended, &events_tx);
                pending_close = guard.transport.take();
                break;
            }
        }
    }

    // the receiver must be gone before close so the transport's tasks
    // cannot block on a full event channel
    drop(transport_events);
    if let Some(transport) = pending_close {
        transport.close().await;
    }
    log::debug!("SessionController: event loop finished");
}
