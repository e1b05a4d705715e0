//! Eingabealphabet der State Machine
//!
//! Jede Quelle (Benutzer, Signaling, Media Engine, Timer, App-Lifecycle)
//! liefert genau eine Variante von [`Trigger`]. Die Varianten sind
//! geschlossen und werden in der Machine vollständig gematcht.

use super::error::CallError;
use super::types::{
    AttemptId, CallId, ConnectionParams, IncomingCallOffer, MediaKind, PeerInfo, TimeoutKind,
};
use std::fmt;

/// Call-Control-Events vom Signaling-Kanal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingCallEvent {
    IncomingCall(IncomingCallOffer),
    Accepted { call_id: CallId },
    Declined { call_id: CallId },
    Ended { call_id: CallId, duration_secs: Option<u64> },
    /// Anrufer hat aufgelegt, bevor wir reagiert haben
    Cancelled { call_id: CallId },
}

impl SignalingCallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalingCallEvent::IncomingCall(offer) => &offer.call_id,
            SignalingCallEvent::Accepted { call_id }
            | SignalingCallEvent::Declined { call_id }
            | SignalingCallEvent::Ended { call_id, .. }
            | SignalingCallEvent::Cancelled { call_id } => call_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalingCallEvent::IncomingCall(_) => "incoming_call",
            SignalingCallEvent::Accepted { .. } => "call_accepted",
            SignalingCallEvent::Declined { .. } => "call_declined",
            SignalingCallEvent::Ended { .. } => "call_ended",
            SignalingCallEvent::Cancelled { .. } => "call_cancelled",
        }
    }
}

/// Verbindungsstatus, den die Media Engine meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Connecting,
    Connected,
    Failed { reason: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
    /// App wird beendet (force-quit)
    Terminating,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    // Benutzer
    StartCall {
        peer: PeerInfo,
        media_kind: MediaKind,
        signaling_ready: bool,
    },
    AcceptCall { call_id: CallId },
    DeclineCall { call_id: CallId },
    HangUp,
    SetMuted { muted: bool },
    Lifecycle(AppLifecycle),

    // Antworten auf eigene Anfragen
    ParamsReady {
        attempt: AttemptId,
        call_id: CallId,
        params: ConnectionParams,
    },
    ParamsFailed { attempt: AttemptId, error: CallError },

    // Extern
    Signaling(SignalingCallEvent),
    Media { call_id: CallId, event: MediaEvent },
    TimerFired {
        call_id: CallId,
        kind: TimeoutKind,
        generation: u64,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::StartCall { peer, media_kind, .. } => {
                write!(f, "StartCall(peer: {}, {})", peer.id, media_kind.as_str())
            }
            Trigger::AcceptCall { call_id } => write!(f, "AcceptCall({})", call_id),
            Trigger::DeclineCall { call_id } => write!(f, "DeclineCall({})", call_id),
            Trigger::HangUp => f.write_str("HangUp"),
            Trigger::SetMuted { muted } => write!(f, "SetMuted({})", muted),
            Trigger::Lifecycle(state) => write!(f, "Lifecycle({:?})", state),
            Trigger::ParamsReady { attempt, call_id, .. } => {
                write!(f, "ParamsReady(attempt: {}, call: {})", attempt, call_id)
            }
            Trigger::ParamsFailed { attempt, error } => {
                write!(f, "ParamsFailed(attempt: {}, {})", attempt, error)
            }
            Trigger::Signaling(event) => {
                write!(f, "Signaling({}, {})", event.name(), event.call_id())
            }
            Trigger::Media { call_id, event } => write!(f, "Media({}, {:?})", call_id, event),
            Trigger::TimerFired {
                call_id,
                kind,
                generation,
            } => write!(f, "TimerFired({}, {:?}#{})", call_id, kind, generation),
        }
    }
}
