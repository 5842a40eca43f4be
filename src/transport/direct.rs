//! Direct offer/answer transport
//!
//! Builds a peer connection, puts caller audio on a local track and agent
//! events on a negotiated data channel, then trades SDP with the agent
//! endpoint over one authenticated POST. Connection health flows out of the
//! peer connection state callback; there is no client-driven renegotiation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::capture::{CaptureHandle, FrameReceiver};
use crate::credential::Credential;
use crate::error::SessionError;
use crate::protocol::{SidebandEvent, TransportEvent, EVENT_CHANNEL_LABEL};

/// An established peer connection with its uplink task running.
pub struct DirectTransport {
    pc: Arc<RTCPeerConnection>,
    uplink: Option<JoinHandle<()>>,
    capture: Option<CaptureHandle>,
}

impl DirectTransport {
    pub(crate) async fn connect(
        credential: &Credential,
        capture: CaptureHandle,
        frames: FrameReceiver,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, SessionError> {
        match negotiate(credential, frames, events_tx).await {
            Ok((pc, uplink)) => Ok(Self {
                pc,
                uplink: Some(uplink),
                capture: Some(capture),
            }),
            Err(e) => {
                capture.release();
                Err(e)
            }
        }
    }

    /// Stop the uplink, close the peer connection, release the microphone.
    pub async fn close(mut self) {
        if let Some(uplink) = self.uplink.take() {
            uplink.abort();
        }
        if let Err(e) = self.pc.close().await {
            log::warn!("DirectTransport: error closing peer connection: {}", e);
        }
        if let Some(capture) = self.capture.take() {
            capture.release();
        }
        log::info!("DirectTransport: closed");
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if let Some(uplink) = self.uplink.take() {
            uplink.abort();
        }
        if let Some(capture) = self.capture.take() {
            capture.release();
        }
    }
}

async fn negotiate(
    credential: &Credential,
    frames: FrameReceiver,
    events_tx: mpsc::Sender<TransportEvent>,
) -> Result<(Arc<RTCPeerConnection>, JoinHandle<()>), SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| SessionError::NegotiationFailed(format!("codec registration: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| SessionError::NegotiationFailed(format!("interceptor setup: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(|e| {
                SessionError::NegotiationFailed(format!("peer connection setup: {}", e))
            })?,
    );

    // set up the whole local side before the offer so it all lands in the SDP
    let result = configure_and_offer(&pc, credential, frames, &events_tx).await;
    match result {
        Ok(uplink) => Ok((pc, uplink)),
        Err(e) => {
            // no half-open connections left behind
            let _ = pc.close().await;
            Err(e)
        }
    }
}

async fn configure_and_offer(
    pc: &Arc<RTCPeerConnection>,
    credential: &Credential,
    frames: FrameReceiver,
    events_tx: &mpsc::Sender<TransportEvent>,
) -> Result<JoinHandle<()>, SessionError> {
    // events ride a data channel created before the offer
    let dc = pc
        .create_data_channel(EVENT_CHANNEL_LABEL, None)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("data channel setup: {}", e)))?;

    dc.on_open(Box::new(|| {
        Box::pin(async move {
            log::info!("DirectTransport: event channel open");
        })
    }));

    let tx = events_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            if !msg.is_string {
                log::debug!("DirectTransport: ignoring binary event payload");
                return;
            }
            let text = String::from_utf8_lossy(&msg.data).to_string();
            if let Some(event) =
                SidebandEvent::parse(&text).and_then(SidebandEvent::into_transport_event)
            {
                let _ = tx.send(event).await;
            }
        })
    }));

    let tx = events_tx.clone();
    dc.on_error(Box::new(move |e| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx
                .send(TransportEvent::ChannelFailed {
                    detail: e.to_string(),
                })
                .await;
        })
    }));

    let tx = events_tx.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx
                .send(TransportEvent::ChannelFailed {
                    detail: "event channel closed".to_string(),
                })
                .await;
        })
    }));

    // caller audio goes on a local sample track
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        "caller".to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("track setup: {}", e)))?;

    // keep reading RTCP so the interceptors stay fed
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
    });

    let tx = events_tx.clone();
    let announced = Arc::new(AtomicBool::new(false));
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        let announced = Arc::clone(&announced);
        Box::pin(async move {
            log::info!("DirectTransport: remote {} track arrived", track.kind());
            if track.kind() == RTPCodecType::Audio && !announced.swap(true, Ordering::SeqCst) {
                let _ = tx.send(TransportEvent::RemoteAudioAvailable).await;
            }
            // drain the track; playback is outside this crate
            tokio::spawn(async move {
                while let Ok((_packet, _)) = track.read_rtp().await {}
            });
        })
    }));

    let tx = events_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            log::debug!("DirectTransport: peer connection state: {}", state);
            let event = match state {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportEvent::Reconnecting),
                RTCPeerConnectionState::Failed => Some(TransportEvent::Disconnected {
                    reason: "peer connection failed".to_string(),
                }),
                RTCPeerConnectionState::Closed => Some(TransportEvent::Disconnected {
                    reason: "peer connection closed".to_string(),
                }),
                _ => None,
            };
            if let Some(event) = event {
                let _ = tx.send(event).await;
            }
        })
    }));

    // offer, gather, trade with the agent endpoint
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("offer creation: {}", e)))?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("local description: {}", e)))?;
    let _ = gather_complete.recv().await;

    let local = pc.local_description().await.ok_or_else(|| {
        SessionError::NegotiationFailed("no local description after gathering".to_string())
    })?;

    let answer_sdp = exchange_sdp(&credential.endpoint, &credential.secret, &local.sdp).await?;
    let answer = RTCSessionDescription::answer(answer_sdp)
        .map_err(|e| SessionError::NegotiationFailed(format!("invalid answer sdp: {}", e)))?;
    pc.set_remote_description(answer)
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("applying answer: {}", e)))?;

    Ok(spawn_uplink(track, frames))
}

/// POST the local SDP to the agent endpoint, get the answer SDP back.
async fn exchange_sdp(endpoint: &str, secret: &str, sdp: &str) -> Result<String, SessionError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| SessionError::NegotiationFailed(format!("http client setup: {}", e)))?;

    let response = client
        .post(endpoint)
        .header("Authorization", format!("Bearer {}", secret))
        .header("Content-Type", "application/sdp")
        .body(sdp.to_string())
        .send()
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("offer request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let message = match status.as_u16() {
            401 | 403 => format!("agent endpoint rejected the credential ({})", status),
            _ => format!("agent endpoint returned {}", status),
        };
        return Err(SessionError::NegotiationFailed(message));
    }

    response
        .text()
        .await
        .map_err(|e| SessionError::NegotiationFailed(format!("unreadable answer: {}", e)))
}

/// Feed capture frames into the local track until the capture stream ends.
fn spawn_uplink(track: Arc<TrackLocalStaticSample>, mut frames: FrameReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if frame.samples.is_empty() {
                continue;
            }
            let mut data = Vec::with_capacity(frame.samples.len() * 2);
            for sample in &frame.samples {
                data.extend_from_slice(&sample.to_le_bytes());
            }
            let duration =
                Duration::from_secs_f64(frame.samples.len() as f64 / frame.sample_rate as f64);
            let sample = Sample {
                data: Bytes::from(data),
                duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                log::debug!("DirectTransport: dropping audio sample: {}", e);
            }
        }
        log::debug!("DirectTransport: capture stream ended");
    })
}
