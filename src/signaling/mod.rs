//! Signaling Module - WebSocket Client für das Call-Backend
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Call-Control-Nachrichten senden und Antworten zuordnen
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod channel;
mod client;
mod messages;

pub use channel::{InitiatedCall, SignalingChannel};
pub use client::{SignalingClient, SignalingError, SignalingEvent, HEARTBEAT_INTERVAL};
pub use messages::*;
