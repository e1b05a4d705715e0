//! Datentypen der Call Session
//!
//! Enthält die Session selbst, das eingehende Angebot und den
//! Historien-Eintrag, der am Ende jeder Session entsteht.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Vom Backend vergebene Call-ID (opak)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lokale ID eines Anrufversuchs
///
/// Existiert schon, bevor das Backend eine [`CallId`] vergeben hat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Phase der Call Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    /// Kein Anruf
    #[default]
    Idle,
    /// Ausgehend, Verbindungsparameter werden angefragt
    Dialing,
    /// Es klingelt (ausgehend beim Gegenüber, eingehend lokal)
    Ringing,
    /// Angenommen, Media Engine baut die Verbindung auf
    Connecting,
    /// Anruf aktiv
    Active,
    /// Session wird abgeschlossen
    Ending,
}

impl CallPhase {
    /// Prüft eine Kante gegen die Übergangstabelle.
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Idle, Dialing)
                | (Idle, Ringing)
                | (Dialing, Ringing)
                | (Dialing, Idle)
                | (Ringing, Connecting)
                | (Connecting, Active)
                | (Dialing | Ringing | Connecting | Active, Ending)
                | (Ending, Idle)
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::Idle => "idle",
            CallPhase::Dialing => "dialing",
            CallPhase::Ringing => "ringing",
            CallPhase::Connecting => "connecting",
            CallPhase::Active => "active",
            CallPhase::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// Endstatus eines Anrufs für die Historie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Completed,
    Missed,
    Declined,
    Failed,
    Cancelled,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

str_enum!(CallDirection { Outgoing => "outgoing", Incoming => "incoming" });
str_enum!(MediaKind { Audio => "audio", Video => "video" });
str_enum!(CallStatus {
    Completed => "completed",
    Missed => "missed",
    Declined => "declined",
    Failed => "failed",
    Cancelled => "cancelled",
});

// ============================================================================
// VALUE OBJECTS
// ============================================================================

/// Identität und Anzeige-Daten des Gegenübers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }
}

/// Verbindungsparameter für die Media Engine
///
/// Für den Coordinator opak, werden unverändert an `join` durchgereicht.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub room_id: String,
    pub token: String,
    /// Transport-Konfiguration (ICE Server, Credentials, ...)
    #[serde(flatten)]
    pub transport: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionParams {
    pub fn new(room_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
            transport: serde_json::Map::new(),
        }
    }
}

/// Eingehendes, noch nicht beantwortetes Anrufangebot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallOffer {
    pub call_id: CallId,
    pub peer: PeerInfo,
    pub media_kind: MediaKind,
    pub connection_params: ConnectionParams,
    pub received_at: DateTime<Utc>,
}

// ============================================================================
// SESSION
// ============================================================================

/// Art des gerade scharfen Timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKind {
    Ringing,
    Connecting,
}

/// Handle auf den scharfen Timer einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub kind: TimeoutKind,
    pub generation: u64,
}

/// Die eine Call Session des Geräts
#[derive(Debug, Clone)]
pub struct CallSession {
    pub attempt: AttemptId,
    pub call_id: Option<CallId>,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub peer: PeerInfo,
    pub media_kind: MediaKind,
    pub connection_params: Option<ConnectionParams>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub timer: Option<ArmedTimer>,
    pub muted: bool,
}

impl CallSession {
    pub fn new_outgoing(peer: PeerInfo, media_kind: MediaKind, now: DateTime<Utc>) -> Self {
        Self {
            attempt: AttemptId::generate(),
            call_id: None,
            direction: CallDirection::Outgoing,
            phase: CallPhase::Dialing,
            peer,
            media_kind,
            connection_params: None,
            started_at: now,
            connected_at: None,
            timer: None,
            muted: false,
        }
    }

    pub fn new_incoming(offer: &IncomingCallOffer, now: DateTime<Utc>) -> Self {
        Self {
            attempt: AttemptId::generate(),
            call_id: Some(offer.call_id.clone()),
            direction: CallDirection::Incoming,
            phase: CallPhase::Ringing,
            peer: offer.peer.clone(),
            media_kind: offer.media_kind,
            connection_params: Some(offer.connection_params.clone()),
            started_at: now,
            connected_at: None,
            timer: None,
            muted: false,
        }
    }

    pub fn is_call(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            attempt: self.attempt,
            call_id: self.call_id.clone(),
            direction: self.direction,
            phase: self.phase,
            peer: self.peer.clone(),
            media_kind: self.media_kind,
            started_at: self.started_at,
            connected_at: self.connected_at,
            muted: self.muted,
        }
    }
}

/// Lesbare Kopie der Session für UI und Abfragen
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub attempt: AttemptId,
    pub call_id: Option<CallId>,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub peer: PeerInfo,
    pub media_kind: MediaKind,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub muted: bool,
}

// ============================================================================
// HISTORY
// ============================================================================

/// Unveränderlicher Eintrag, genau einer pro beendeter Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    pub attempt: AttemptId,
    /// Fehlt, wenn der Anruf schon beim Wählen abgebrochen wurde
    pub call_id: Option<CallId>,
    pub direction: CallDirection,
    pub peer: PeerInfo,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

impl CallHistoryEntry {
    pub fn from_session(session: &CallSession, status: CallStatus, now: DateTime<Utc>) -> Self {
        let duration_secs = session
            .connected_at
            .map(|connected| now.signed_duration_since(connected).num_seconds().max(0) as u64)
            .unwrap_or(0);

        Self {
            attempt: session.attempt,
            call_id: session.call_id.clone(),
            direction: session.direction,
            peer: session.peer.clone(),
            media_kind: session.media_kind,
            status,
            duration_secs,
            started_at: session.started_at,
            connected_at: session.connected_at,
            ended_at: now,
        }
    }
}
