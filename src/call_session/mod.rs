//! Call Session Module
//!
//! Koordiniert genau einen Anruf pro Gerät:
//! - Reine State Machine (Phasen, Übergänge, Historie)
//! - Coordinator-Task, der Trigger seriell abarbeitet
//! - Phasen-Timer für Klingel- und Verbindungs-Timeouts
//!

mod clock;
mod coordinator;
mod effect;
mod error;
mod machine;
mod timer;
mod trigger;
mod types;

pub use clock::CallClock;
pub use coordinator::CallCoordinator;
pub(crate) use coordinator::Envelope;
pub use effect::{CallNotice, Effect, MediaCommand, SignalingCommand};
pub use error::{AlertKind, CallError};
pub use machine::{CallStateMachine, Outcome};
pub use timer::PhaseTimer;
pub use trigger::{AppLifecycle, MediaEvent, SignalingCallEvent, Trigger};
pub use types::*;
