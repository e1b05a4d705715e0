//! Anrufhistorie
//!
//! Jede beendete Session liefert genau einen [`CallHistoryEntry`]. Wohin er
//! geschrieben wird, entscheidet der [`HistoryRecorder`].

mod sqlite;

use crate::call_session::CallHistoryEntry;

pub use sqlite::{HistoryError, SqliteCallHistory};

/// Senke für Historien-Einträge
///
/// `record` wird aus dem Coordinator heraus aufgerufen und darf nicht
/// blockieren.
pub trait HistoryRecorder: Send + Sync {
    fn record(&self, entry: CallHistoryEntry);
}
