//! Message Types für das Call-Control-Protokoll
//!
//! JSON über WebSocket, Feldnamen in camelCase, Nachrichtentyp im Feld
//! `type`. Jede Client-Nachricht trägt einen Millisekunden-Timestamp.

use crate::call_session::{
    CallId, ConnectionParams, IncomingCallOffer, MediaKind, PeerInfo, SignalingCallEvent,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung nach dem Verbindungsaufbau
    Register {
        #[serde(rename = "userId")]
        user_id: String,
        token: String,
    },

    /// Neuen Anruf anfragen, Antwort kommt als `call_initiated`
    InitiateCall {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "mediaKind")]
        media_kind: MediaKind,
    },

    AcceptCall {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    DeclineCall {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Eigener ausgehender Anruf, bevor angenommen wurde
    CancelCall {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    EndCall {
        #[serde(rename = "callId")]
        call_id: CallId,
        /// Sekunden seit Verbindungsaufbau
        duration: u64,
    },

    Heartbeat {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::InitiateCall { .. } => "initiate_call",
            ClientMessage::AcceptCall { .. } => "accept_call",
            ClientMessage::DeclineCall { .. } => "decline_call",
            ClientMessage::CancelCall { .. } => "cancel_call",
            ClientMessage::EndCall { .. } => "end_call",
            ClientMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Client-Nachricht mit Timestamp, so wie sie auf die Leitung geht
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedMessage<'a> {
    #[serde(flatten)]
    pub message: &'a ClientMessage,
    pub timestamp: i64,
}

impl<'a> TimestampedMessage<'a> {
    pub fn now(message: &'a ClientMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Antwort auf `initiate_call`
    CallInitiated {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "connectionParams")]
        connection_params: ConnectionParams,
        #[serde(default)]
        timestamp: i64,
    },

    /// Eingehender Anruf
    IncomingCall {
        #[serde(rename = "callId")]
        call_id: CallId,
        peer: PeerInfo,
        #[serde(rename = "mediaKind")]
        media_kind: MediaKind,
        #[serde(rename = "connectionParams")]
        connection_params: ConnectionParams,
        #[serde(default)]
        timestamp: i64,
    },

    /// Gegenüber hat angenommen
    CallAccepted {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default)]
        timestamp: i64,
    },

    /// Gegenüber hat abgelehnt
    CallDeclined {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },

    /// Gegenüber hat aufgelegt
    CallEnded {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default)]
        duration: Option<u64>,
        #[serde(default)]
        timestamp: i64,
    },

    /// Anrufer hat vor der Annahme abgebrochen
    CallCancelled {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default)]
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}

impl ServerMessage {
    /// Call-Control-Event für den Coordinator, falls die Nachricht eines ist
    pub fn into_call_event(self, received_at: DateTime<Utc>) -> Option<SignalingCallEvent> {
        match self {
            ServerMessage::IncomingCall {
                call_id,
                peer,
                media_kind,
                connection_params,
                ..
            } => Some(SignalingCallEvent::IncomingCall(IncomingCallOffer {
                call_id,
                peer,
                media_kind,
                connection_params,
                received_at,
            })),
            ServerMessage::CallAccepted { call_id, .. } => {
                Some(SignalingCallEvent::Accepted { call_id })
            }
            ServerMessage::CallDeclined { call_id, .. } => {
                Some(SignalingCallEvent::Declined { call_id })
            }
            ServerMessage::CallEnded {
                call_id, duration, ..
            } => Some(SignalingCallEvent::Ended {
                call_id,
                duration_secs: duration,
            }),
            ServerMessage::CallCancelled { call_id, .. } => {
                Some(SignalingCallEvent::Cancelled { call_id })
            }
            ServerMessage::Registered { .. }
            | ServerMessage::CallInitiated { .. }
            | ServerMessage::Error { .. }
            | ServerMessage::Pong { .. } => None,
        }
    }
}
