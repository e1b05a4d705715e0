use super::types::CallId;
use crate::signaling::SignalingError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Connection parameters unavailable: {0}")]
    ParamsUnavailable(String),

    #[error("Media engine failure: {0}")]
    MediaEngineFailure(String),

    #[error("Signaling channel not connected")]
    SignalingUnavailable,

    #[error("No active call")]
    NoActiveCall,

    #[error("No such call: {0}")]
    NoSuchCall(CallId),

    #[error("Call coordinator is shut down")]
    CoordinatorClosed,
}

impl CallError {
    pub fn alert(&self) -> Option<AlertKind> {
        match self {
            CallError::AlreadyInCall => Some(AlertKind::AlreadyInCall),
            CallError::ParamsUnavailable(_) => Some(AlertKind::ParamsUnavailable),
            CallError::MediaEngineFailure(_) => Some(AlertKind::MediaEngineFailure),
            CallError::SignalingUnavailable => Some(AlertKind::SignalingUnavailable),
            _ => None,
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::NotConnected => CallError::SignalingUnavailable,
            other => CallError::ParamsUnavailable(other.to_string()),
        }
    }
}

/// Grund einer Benutzer-Benachrichtigung (`show_error`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AlreadyInCall,
    ParamsUnavailable,
    SignalingUnavailable,
    MediaEngineFailure,
    PeerDeclined,
}
