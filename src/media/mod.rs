//! Media Engine Schnittstelle
//!
//! Die eigentliche Audio/Video-Verbindung (Codecs, NAT, Geräte) liegt
//! außerhalb dieses Crates. Der Coordinator spricht sie nur über
//! [`MediaEngine`] an und bekommt Statusänderungen über eine
//! [`MediaEventSink`] zurück.

use crate::call_session::{CallId, ConnectionParams, Envelope, MediaEvent, Trigger};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Failed to join media room: {0}")]
    JoinFailed(String),
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Startet den Verbindungsaufbau
    ///
    /// Kehrt zurück, sobald der Aufbau angestoßen ist. Verbunden, getrennt
    /// oder fehlgeschlagen wird danach über `sink` gemeldet.
    async fn join(
        &self,
        call_id: &CallId,
        params: &ConnectionParams,
        sink: MediaEventSink,
    ) -> Result<(), MediaError>;

    async fn leave(&self);

    async fn set_muted(&self, muted: bool);
}

// ============================================================================
// EVENT SINK
// ============================================================================

/// Rückkanal der Media Engine zum Coordinator
///
/// Hält den Coordinator nicht am Leben; nach dessen Ende gehen Meldungen
/// verloren.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    call_id: CallId,
    tx: mpsc::WeakSender<Envelope>,
}

impl MediaEventSink {
    pub(crate) fn new(call_id: CallId, tx: mpsc::WeakSender<Envelope>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Meldet ein Event, `false` wenn der Coordinator nicht mehr läuft
    pub async fn report(&self, event: MediaEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(self.envelope(event)).await.is_ok()
    }

    /// Wie [`report`](Self::report), ohne zu warten (z.B. aus Audio-Callbacks)
    pub fn try_report(&self, event: MediaEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        match tx.try_send(self.envelope(event)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping media event for call {}: {}", self.call_id, e);
                false
            }
        }
    }

    fn envelope(&self, event: MediaEvent) -> Envelope {
        Envelope::event(Trigger::Media {
            call_id: self.call_id.clone(),
            event,
        })
    }
}
