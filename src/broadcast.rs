//! Fan-out of payloads to every registered connection.
//!
//! A broadcast encodes its payload once and offers a clone of the frame to
//! each connection's outbound queue without waiting. Delivery is
//! best-effort: a full or closed queue fails that peer only, and every other
//! peer in the same round is still attempted.

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::protocol::{FrameKind, Payload};
use crate::registry::{ConnectionId, Registry, RegistryView};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("payload reached {delivered} connections, {} undelivered", .failed.len())]
    Undelivered {
        delivered: usize,
        failed: Vec<ConnectionId>,
    },
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Registry,
}

impl Broadcaster {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Deliver `payload` to every connection registered at call time.
    /// Returns the number of connections the frame was queued for.
    pub async fn broadcast(&self, payload: &Payload) -> Result<usize, BroadcastError> {
        self.broadcast_as(payload, FrameKind::Text).await
    }

    /// Like [`Self::broadcast`], sending the payload in a `kind` frame
    pub async fn broadcast_as(
        &self,
        payload: &Payload,
        kind: FrameKind,
    ) -> Result<usize, BroadcastError> {
        let frame = payload.to_frame_as(kind)?;
        let view = self.registry.view().await;
        fan_out(&view, frame)
    }

    /// Broadcast the current roster. The snapshot and its fan-out happen
    /// under one read lock, so every recipient sees the same membership.
    pub async fn broadcast_roster(&self) -> Result<usize, BroadcastError> {
        let view = self.registry.view().await;
        let frame = Payload::roster(view.nicknames()).to_frame()?;
        fan_out(&view, frame)
    }

    /// Build the roster payload from the current registry state
    pub async fn roster_payload(&self) -> Payload {
        Payload::roster(self.registry.snapshot_nicknames().await)
    }
}

fn fan_out(view: &RegistryView<'_>, frame: Message) -> Result<usize, BroadcastError> {
    let mut delivered = 0;
    let mut failed = Vec::new();

    view.for_each_connection(|id, sender| match sender.try_send(frame.clone()) {
        Ok(()) => delivered += 1,
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue full for {}, dropping frame", id);
            failed.push(id);
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Connection {} already closed its outbound queue", id);
            failed.push(id);
        }
    });

    if failed.is_empty() {
        Ok(delivered)
    } else {
        Err(BroadcastError::Undelivered { delivered, failed })
    }
}
