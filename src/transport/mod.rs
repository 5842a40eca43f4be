//! Media transport strategies
//!
//! Two ways to reach the agent sit behind one surface:
//!
//! - `direct`: an offer/answer exchange with the agent endpoint, caller audio
//!   on a local track, agent events on a negotiated data channel
//! - `room`: a websocket relay room joined with the credential, caller audio
//!   as encoded frames, events multiplexed on the same socket
//!
//! Whichever strategy is active, the session loop receives the same
//! [`TransportEvent`] stream: connected, reconnecting, disconnected, remote
//! audio available, plus speech and error events. The loop never branches on
//! the strategy.

mod direct;
mod room;

pub use direct::DirectTransport;
pub use room::RoomTransport;

use tokio::sync::mpsc;

use crate::capture::{CaptureHandle, FrameReceiver};
use crate::config::TransportStrategy;
use crate::credential::Credential;
use crate::error::SessionError;
use crate::protocol::TransportEvent;

/// Transport events buffered between the transport task and the session loop.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 100;

/// A live connection to the agent, whichever strategy produced it.
pub enum ActiveTransport {
    Direct(DirectTransport),
    Room(RoomTransport),
}

impl ActiveTransport {
    /// Establish a connection using the given strategy.
    ///
    /// On success the capture handle is owned by the transport and released
    /// on close; on failure it has already been released.
    pub async fn connect(
        strategy: TransportStrategy,
        credential: &Credential,
        capture: CaptureHandle,
        frames: FrameReceiver,
    ) -> Result<(ActiveTransport, mpsc::Receiver<TransportEvent>), SessionError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = match strategy {
            TransportStrategy::Direct => {
                let transport =
                    DirectTransport::connect(credential, capture, frames, events_tx).await?;
                ActiveTransport::Direct(transport)
            }
            TransportStrategy::Room => {
                let transport =
                    RoomTransport::connect(credential, capture, frames, events_tx).await?;
                ActiveTransport::Room(transport)
            }
        };
        Ok((transport, events_rx))
    }

    /// Tear the connection down and release the capture device.
    pub async fn close(self) {
        match self {
            ActiveTransport::Direct(transport) => transport.close().await,
            ActiveTransport::Room(transport) => transport.close().await,
        }
    }
}
