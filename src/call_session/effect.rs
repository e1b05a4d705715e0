//! Seiteneffekte eines Übergangs
//!
//! Die State Machine führt nichts selbst aus. Sie liefert eine geordnete
//! Liste von [`Effect`]s, die der Coordinator abarbeitet.

use super::error::AlertKind;
use super::types::{
    AttemptId, CallDirection, CallHistoryEntry, CallId, CallPhase, CallSnapshot, ConnectionParams,
    IncomingCallOffer, MediaKind, TimeoutKind,
};
use serde::Serialize;
use std::time::Duration;

/// Befehle an den Signaling-Kanal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingCommand {
    InitiateCall {
        attempt: AttemptId,
        peer_id: String,
        media_kind: MediaKind,
    },
    Accept { call_id: CallId },
    Decline { call_id: CallId },
    Cancel { call_id: CallId },
    End { call_id: CallId, duration_secs: u64 },
}

/// Befehle an die Media Engine
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCommand {
    Join {
        call_id: CallId,
        params: ConnectionParams,
    },
    Leave,
    Mute(bool),
}

/// Ereignisse für UI und Audio-Ausgabe (fire-and-forget)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CallNotice {
    PhaseChanged { from: CallPhase, to: CallPhase },
    NavigateToCall(CallSnapshot),
    ShowIncomingCall(IncomingCallOffer),
    StartRingtone(CallDirection),
    StopRingtone,
    ShowError(AlertKind),
    MuteChanged(bool),
    CallEnded(CallHistoryEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Signal(SignalingCommand),
    Media(MediaCommand),
    Notify(CallNotice),
    ArmTimer {
        call_id: CallId,
        kind: TimeoutKind,
        generation: u64,
        after: Duration,
    },
    DisarmTimer,
    RecordHistory(CallHistoryEntry),
}
