//! Call Coordinator - Anrufsteuerung für 1:1 Audio- und Videoanrufe
//!
//! Koordiniert genau einen Anruf pro Gerät mit:
//! - WebSocket Signaling-Server für Call-Control
//! - Externer Media Engine für die eigentliche Verbindung
//! - SQLite für die lokale Anrufliste

pub mod call_session;
pub mod config;
pub mod history;
pub mod media;
pub mod signaling;

pub use call_session::{
    AppLifecycle, CallCoordinator, CallError, CallHistoryEntry, CallId, CallNotice, CallPhase,
    CallSnapshot, CallStatus, MediaEvent, MediaKind, PeerInfo,
};
pub use config::{AppConfig, CallConfig, ConfigError};

use anyhow::Context;
use history::SqliteCallHistory;
use media::MediaEngine;
use signaling::{SignalingClient, SignalingEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert tracing (mehrfacher Aufruf ist harmlos)
pub fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["call_coordinator=debug", "tungstenite=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Verdrahtet Signaling, Historie und Media Engine mit dem Coordinator
pub struct CallApp {
    config: AppConfig,
    coordinator: CallCoordinator,
    signaling: Arc<SignalingClient>,
    history: SqliteCallHistory,
    tasks: Vec<JoinHandle<()>>,
}

impl CallApp {
    /// Verbindet mit dem Signaling-Server und startet den Coordinator
    pub async fn start(config: AppConfig, media: Arc<dyn MediaEngine>) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        tracing::info!("Starting call coordinator...");

        let history = match &config.history_path {
            Some(path) => SqliteCallHistory::open(path),
            None => SqliteCallHistory::open_default(),
        }
        .context("Failed to open call history")?;

        let mut client =
            SignalingClient::new(config.websocket_url(), config.call.request_timeout());

        // Vor dem Verbinden abonnieren, sonst gehen frühe Events verloren
        let mut events = client.subscribe();

        let user_id = client
            .connect_and_register(config.user_id.clone(), config.auth_token.clone())
            .await
            .context("Failed to register with signaling server")?;
        tracing::info!("Signaling ready for user {}", user_id);

        let signaling = Arc::new(client);
        let coordinator = CallCoordinator::spawn(
            config.call.clone(),
            signaling.clone(),
            media,
            Arc::new(history.clone()),
        );

        let forwarder = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(SignalingEvent::Call(event)) => {
                            if coordinator.signaling_event(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(SignalingEvent::Disconnected) => {
                            tracing::warn!("Signaling connection lost");
                        }
                        Ok(SignalingEvent::Error { code, message }) => {
                            tracing::warn!("Signaling error {}: {}", code, message);
                        }
                        Ok(other) => tracing::debug!("Signaling event: {:?}", other),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Dropped {} signaling events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let heartbeat = Arc::clone(&signaling).start_heartbeat();

        Ok(Self {
            config,
            coordinator,
            signaling,
            history,
            tasks: vec![forwarder, heartbeat],
        })
    }

    pub fn coordinator(&self) -> &CallCoordinator {
        &self.coordinator
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }

    pub fn history(&self) -> &SqliteCallHistory {
        &self.history
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Beendet einen laufenden Anruf und stoppt alle Tasks
    pub async fn shutdown(self) -> Result<(), CallError> {
        let result = self
            .coordinator
            .app_lifecycle(AppLifecycle::Terminating)
            .await;

        for task in self.tasks {
            task.abort();
        }

        tracing::info!("Call coordinator shut down");
        result
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("signaling_url", &self.config.signaling_url)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
