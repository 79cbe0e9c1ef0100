//! Receiver loop: drains the control channel and routes decoded frames.
//!
//! Two tasks cooperate:
//! - `receive_loop` reads datagrams, decodes them and forwards the frames
//! - `dispatch_loop` applies each frame (ack resolution, traffic accounting)

use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ack::AckQueue;
use super::traffic::apply_stat;
use crate::instance::InstanceRegistry;
use crate::protocol::channel::receive_frame;
use crate::protocol::{decode, InboundFrame};

/// Buffer between the reader and the dispatcher.
pub const FRAME_CHANNEL_SIZE: usize = 64;

/// Applies decoded frames to shared state.
#[derive(Clone)]
pub struct Dispatcher {
    registry: InstanceRegistry,
    acks: Arc<AckQueue>,
}

impl Dispatcher {
    pub fn new(registry: InstanceRegistry, acks: Arc<AckQueue>) -> Self {
        Self { registry, acks }
    }

    pub fn dispatch(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Ack => {
                if let Some(id) = self.acks.resolve_next() {
                    tracing::trace!("Acknowledged request {}", id);
                }
            }
            InboundFrame::Stat(deltas) => {
                apply_stat(&self.registry, &deltas);
            }
            InboundFrame::Unknown { verb } => {
                tracing::info!("Unknown cmd received from proxy server: {}", verb);
            }
        }
    }
}

/// Read until cancelled or the channel fails. A read error after
/// cancellation is the normal shutdown path and is not reported.
pub async fn receive_loop(
    socket: Arc<UnixDatagram>,
    frames: mpsc::Sender<InboundFrame>,
    shutdown: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = receive_frame(&socket) => match res {
                Ok(data) => data,
                Err(_) if shutdown.is_cancelled() => break,
                Err(e) => {
                    tracing::error!("Control channel read failed: {}", e);
                    break;
                }
            },
        };

        match decode(&data) {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    // dispatcher gone
                    break;
                }
            }
            Err(e) => tracing::warn!("Dropping malformed frame from proxy server: {}", e),
        }
    }
    tracing::debug!("Control channel receiver finished");
}

pub async fn dispatch_loop(mut frames: mpsc::Receiver<InboundFrame>, dispatcher: Dispatcher) {
    while let Some(frame) = frames.recv().await {
        dispatcher.dispatch(frame);
    }
    tracing::debug!("Frame dispatcher finished");
}
