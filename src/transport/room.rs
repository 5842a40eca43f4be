//! Relay room transport
//!
//! Joins a room over a websocket using the session credential, announces the
//! microphone track, then pumps caller audio up and relay events down on one
//! task. An abrupt socket loss triggers rejoin with backoff; a clean close
//! from the relay ends the session without rejoining.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureHandle, FrameReceiver};
use crate::credential::Credential;
use crate::error::SessionError;
use crate::protocol::{RoomCommand, RoomEvent, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Initial join attempts before giving up on `connect`.
const CONNECT_ATTEMPTS: u32 = 3;

const RECONNECT_BASE_MS: u64 = 800;
const RECONNECT_MAX_MS: u64 = 30_000;
const RECONNECT_MAX_RETRIES: u32 = 12;

/// Delay before the given rejoin attempt (1-based), exponential with a cap.
fn reconnect_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    (RECONNECT_BASE_MS << exp).min(RECONNECT_MAX_MS)
}

/// A joined relay room with its pump task running.
pub struct RoomTransport {
    pump: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    capture: Option<CaptureHandle>,
}

struct RoomLink {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

/// Everything needed to rejoin the room after a drop.
struct PumpContext {
    endpoint: String,
    secret: String,
    room: String,
    sample_rate: u32,
}

impl RoomTransport {
    pub(crate) async fn connect(
        credential: &Credential,
        capture: CaptureHandle,
        frames: FrameReceiver,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, SessionError> {
        let room = match credential.room.as_deref() {
            Some(room) => room.to_string(),
            None => {
                capture.release();
                return Err(SessionError::ChannelFailure(
                    "credential carries no room name".to_string(),
                ));
            }
        };
        let sample_rate = capture.sample_rate();

        let link =
            match join_room(&credential.endpoint, &credential.secret, &room, sample_rate).await {
                Ok(link) => link,
                Err(e) => {
                    capture.release();
                    return Err(e);
                }
            };

        let shutdown = CancellationToken::new();
        let ctx = PumpContext {
            endpoint: credential.endpoint.clone(),
            secret: credential.secret.clone(),
            room,
            sample_rate,
        };
        let pump = tokio::spawn(pump_task(ctx, link, frames, events_tx, shutdown.clone()));

        Ok(Self {
            pump: Some(pump),
            shutdown,
            capture: Some(capture),
        })
    }

    /// Leave the room, stop the pump, and release the microphone.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        if let Some(capture) = self.capture.take() {
            capture.release();
        }
        log::info!("RoomTransport: closed");
    }
}

impl Drop for RoomTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(capture) = self.capture.take() {
            capture.release();
        }
    }
}

/// Join with retries. Only used for the initial connect; rejoins after a
/// drop run their own schedule in [`recover`].
async fn join_room(
    endpoint: &str,
    secret: &str,
    room: &str,
    sample_rate: u32,
) -> Result<RoomLink, SessionError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match join_room_once(endpoint, secret, room, sample_rate).await {
            Ok(link) => return Ok(link),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let delay = Duration::from_secs(1u64 << (attempt - 1));
                log::warn!(
                    "RoomTransport: join attempt {} failed ({}), retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One full join: connect, authenticate, wait for the acknowledgement,
/// announce the microphone.
async fn join_room_once(
    endpoint: &str,
    secret: &str,
    room: &str,
    sample_rate: u32,
) -> Result<RoomLink, SessionError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| SessionError::ChannelFailure(format!("invalid endpoint url: {}", e)))?;
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", secret))
            .map_err(|e| SessionError::ChannelFailure(format!("invalid credential: {}", e)))?,
    );

    let (ws, _response) = connect_async_with_config(request, None, false)
        .await
        .map_err(|e| SessionError::ChannelFailure(format!("websocket connect failed: {}", e)))?;
    let (mut write, mut read) = ws.split();

    send_command(&mut write, &RoomCommand::join(room)).await?;

    // the join must be acknowledged before media is announced
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match RoomEvent::parse(&text) {
                Some(RoomEvent::Joined { room: joined, .. }) => {
                    log::info!("RoomTransport: joined {}", joined);
                    break;
                }
                Some(RoomEvent::Error { error }) => {
                    return Err(SessionError::ChannelFailure(format!(
                        "relay refused join: {}",
                        error.describe()
                    )));
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) => {
                return Err(SessionError::ChannelFailure(
                    "relay closed during join".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(SessionError::ChannelFailure(format!(
                    "websocket error during join: {}",
                    e
                )));
            }
            None => {
                return Err(SessionError::ChannelFailure(
                    "relay hung up during join".to_string(),
                ));
            }
        }
    }

    send_command(
        &mut write,
        &RoomCommand::Microphone {
            enabled: true,
            sample_rate,
        },
    )
    .await?;

    Ok(RoomLink { write, read })
}

async fn send_command(
    write: &mut SplitSink<WsStream, Message>,
    command: &RoomCommand,
) -> Result<(), SessionError> {
    let json = command
        .to_json()
        .map_err(|e| SessionError::ChannelFailure(format!("failed to encode command: {}", e)))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| SessionError::ChannelFailure(format!("failed to send command: {}", e)))
}

enum Recovery {
    Resumed(RoomLink),
    GaveUp,
}

/// Single task owning both socket halves: relay events flow down to the
/// session loop, capture frames flow up in 100 ms chunks.
async fn pump_task(
    ctx: PumpContext,
    link: RoomLink,
    mut frames: FrameReceiver,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let RoomLink { mut write, mut read } = link;
    let mut chunker = FrameChunker::new(ctx.sample_rate);
    let mut mic_live = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(rest) = chunker.flush() {
                    let _ = send_command(&mut write, &RoomCommand::audio_frame(&rest)).await;
                }
                let _ = send_command(&mut write, &RoomCommand::Leave).await;
                let _ = write.close().await;
                log::debug!("RoomTransport: pump stopped");
                break;
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) =
                            RoomEvent::parse(&text).and_then(RoomEvent::into_transport_event)
                        {
                            if events_tx.send(event).await.is_err() {
                                break; // session loop is gone
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::info!("RoomTransport: relay closed the connection");
                        let _ = events_tx
                            .send(TransportEvent::Disconnected {
                                reason: "closed by remote".to_string(),
                            })
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("RoomTransport: websocket error: {}", e);
                        match recover(&ctx, &events_tx, &shutdown).await {
                            Recovery::Resumed(link) => {
                                write = link.write;
                                read = link.read;
                            }
                            Recovery::GaveUp => break,
                        }
                    }
                    None => {
                        log::warn!("RoomTransport: websocket stream ended unexpectedly");
                        match recover(&ctx, &events_tx, &shutdown).await {
                            Recovery::Resumed(link) => {
                                write = link.write;
                                read = link.read;
                            }
                            Recovery::GaveUp => break,
                        }
                    }
                }
            }

            frame = frames.recv(), if mic_live => {
                match frame {
                    Some(frame) => {
                        for chunk in chunker.push(&frame.samples) {
                            if send_command(&mut write, &RoomCommand::audio_frame(&chunk))
                                .await
                                .is_err()
                            {
                                // the read half sees the same failure and recovers
                                break;
                            }
                        }
                    }
                    None => {
                        log::debug!("RoomTransport: capture stream ended");
                        mic_live = false;
                    }
                }
            }
        }
    }
}

/// Rejoin after an abrupt drop. Emits `Reconnecting` first, `Connected` on
/// success, `Disconnected` when the schedule is exhausted.
async fn recover(
    ctx: &PumpContext,
    events_tx: &mpsc::Sender<TransportEvent>,
    shutdown: &CancellationToken,
) -> Recovery {
    if shutdown.is_cancelled() {
        return Recovery::GaveUp;
    }
    if events_tx.send(TransportEvent::Reconnecting).await.is_err() {
        return Recovery::GaveUp;
    }

    for attempt in 1..=RECONNECT_MAX_RETRIES {
        let delay = Duration::from_millis(reconnect_delay_ms(attempt));
        tokio::select! {
            _ = shutdown.cancelled() => return Recovery::GaveUp,
            _ = tokio::time::sleep(delay) => {}
        }

        match join_room_once(&ctx.endpoint, &ctx.secret, &ctx.room, ctx.sample_rate).await {
            Ok(link) => {
                log::info!("RoomTransport: rejoined {} on attempt {}", ctx.room, attempt);
                if events_tx.send(TransportEvent::Connected).await.is_err() {
                    return Recovery::GaveUp;
                }
                return Recovery::Resumed(link);
            }
            Err(e) => {
                log::warn!("RoomTransport: rejoin attempt {} failed: {}", attempt, e);
            }
        }
    }

    let _ = events_tx
        .send(TransportEvent::Disconnected {
            reason: format!("gave up after {} rejoin attempts", RECONNECT_MAX_RETRIES),
        })
        .await;
    Recovery::GaveUp
}

/// Accumulates capture samples and drains them in 100 ms chunks.
struct FrameChunker {
    buffer: Vec<i16>,
    chunk_len: usize,
}

impl FrameChunker {
    fn new(sample_rate: u32) -> Self {
        Self {
            buffer: Vec::new(),
            chunk_len: (sample_rate / 10).max(1) as usize,
        }
    }

    fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.buffer.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_len {
            let rest = self.buffer.split_off(self.chunk_len);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    fn flush(&mut self) -> Option<Vec<i16>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_holds_until_full_chunk() {
        let mut chunker = FrameChunker::new(16_000); // 1600-sample chunks
        assert!(chunker.push(&[0i16; 1000]).is_empty());
        let chunks = chunker.push(&[0i16; 1000]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1600);
        assert_eq!(chunker.flush().unwrap().len(), 400);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn test_chunker_drains_multiple_chunks() {
        let mut chunker = FrameChunker::new(8_000); // 800-sample chunks
        let chunks = chunker.push(&[1i16; 2500]);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 800));
        assert_eq!(chunker.flush().unwrap().len(), 100);
    }

    #[test]
    fn test_chunker_preserves_sample_order() {
        let mut chunker = FrameChunker::new(40); // 4-sample chunks
        let chunks = chunker.push(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(chunks, vec![vec![1, 2, 3, 4]]);
        assert_eq!(chunker.flush(), Some(vec![5, 6]));
    }

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        assert_eq!(reconnect_delay_ms(1), 800);
        assert_eq!(reconnect_delay_ms(2), 1_600);
        assert_eq!(reconnect_delay_ms(3), 3_200);
        assert_eq!(reconnect_delay_ms(6), 25_600);
        assert_eq!(reconnect_delay_ms(7), 30_000);
        assert_eq!(reconnect_delay_ms(RECONNECT_MAX_RETRIES), 30_000);
    }
}
