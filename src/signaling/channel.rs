//! Abstraktion des Signaling-Kanals
//!
//! Der Coordinator kennt nur diesen Trait. Der WebSocket-Client ist eine
//! Implementierung, Tests verwenden Fakes.

use super::SignalingError;
use crate::call_session::{CallId, ConnectionParams, MediaKind};
use async_trait::async_trait;

/// Antwort des Backends auf `initiate_call`
#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedCall {
    pub call_id: CallId,
    pub params: ConnectionParams,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fordert eine Call-ID und Verbindungsparameter für einen neuen Anruf an
    ///
    /// Implementierungen begrenzen die Wartezeit selbst und liefern danach
    /// `SignalingError::Timeout`. Der Future darf jederzeit verworfen werden.
    async fn initiate_call(
        &self,
        peer_id: &str,
        media_kind: MediaKind,
    ) -> Result<InitiatedCall, SignalingError>;

    async fn accept_call(&self, call_id: &CallId) -> Result<(), SignalingError>;

    async fn decline_call(&self, call_id: &CallId) -> Result<(), SignalingError>;

    async fn cancel_call(&self, call_id: &CallId) -> Result<(), SignalingError>;

    async fn end_call(&self, call_id: &CallId, duration_secs: u64) -> Result<(), SignalingError>;
}
