//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Call-Backend:
//! - Registrierung mit User-ID und Token
//! - Request/Response-Zuordnung für `initiate_call` über die requestId
//! - Heartbeat-Keeping
//! - Event-basierte Weitergabe der Call-Control-Nachrichten

use super::channel::{InitiatedCall, SignalingChannel};
use super::messages::*;
use crate::call_session::{CallId, MediaKind, SignalingCallEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

/// Abstand der Heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Maximale Wartezeit auf `registered`
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("No response from signaling server")]
    Timeout,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung erfolgreich
    Registered { user_id: String },

    /// Call-Control-Event für den Coordinator
    Call(SignalingCallEvent),

    /// Fehler vom Server ohne zugehörige Anfrage
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<String>,
}

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Result<InitiatedCall, SignalingError>>>>>;

/// Offene Anfrage; der Eintrag verschwindet mit dem Guard, auch wenn der
/// wartende Future abgebrochen wird
struct PendingGuard {
    request_id: String,
    pending: PendingRequests,
}

impl PendingGuard {
    fn register(
        pending: &PendingRequests,
    ) -> (Self, oneshot::Receiver<Result<InitiatedCall, SignalingError>>) {
        let request_id = Uuid::new_v4().to_string();
        let (responder, response) = oneshot::channel();
        pending.lock().insert(request_id.clone(), responder);
        (
            Self {
                request_id,
                pending: Arc::clone(pending),
            },
            response,
        )
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    request_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    pending: PendingRequests,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient für den WebSocket-Endpunkt `server_url`
    pub fn new(server_url: String, request_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            request_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die registrierte User-ID zurück
    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server und registriert den Benutzer
    pub async fn connect_and_register(
        &mut self,
        user_id: String,
        token: String,
    ) -> Result<String, SignalingError> {
        tracing::info!("Connecting to signaling server: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        // Endet der Read-Task, stoppt auch der Write-Task
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let pending = Arc::clone(&self.pending);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state, &pending, &event_tx, &reg_tx)
                        }
                        Err(e) => tracing::warn!("Unparseable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            Self::fail_pending(&pending);
            drop(closed_tx);
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = &mut closed_rx => {
                        tracing::debug!("Reader finished, stopping writer");
                        break;
                    }
                };
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send_message(&ClientMessage::Register { user_id, token })
            .await?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(Ok(user_id)) => Ok(user_id),
                    Some(Err(e)) => Err(e),
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet einen Heartbeat
    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        let user_id = self.user_id().ok_or(SignalingError::NotConnected)?;
        self.send_message(&ClientMessage::Heartbeat { user_id }).await
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if !self.is_connected() {
                    break;
                }
                if let Err(e) = self.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        })
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;

        let msg_string = serde_json::to_string(&TimestampedMessage::now(message))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tracing::debug!("Sending {}", message.name());
        tx.send(msg_string)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        pending: &PendingRequests,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { user_id, .. } => {
                tracing::info!("Registered as {}", user_id);
                state.write().user_id = Some(user_id.clone());
                let _ = reg_tx.try_send(Ok(user_id.clone()));
                let _ = event_tx.send(SignalingEvent::Registered { user_id });
            }

            ServerMessage::CallInitiated {
                request_id,
                call_id,
                connection_params,
                ..
            } => match pending.lock().remove(&request_id) {
                Some(responder) => {
                    let _ = responder.send(Ok(InitiatedCall {
                        call_id,
                        params: connection_params,
                    }));
                }
                None => tracing::debug!("No pending request for call_initiated {}", request_id),
            },

            ServerMessage::Error {
                code,
                message,
                request_id: Some(request_id),
                ..
            } => {
                tracing::warn!("Request {} failed: {} {}", request_id, code, message);
                if let Some(responder) = pending.lock().remove(&request_id) {
                    let _ = responder.send(Err(SignalingError::ServerError { code, message }));
                }
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Bei Registrierungs-Fehlern auch dem reg_tx melden
                let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }

            other => {
                if let Some(event) = other.into_call_event(Utc::now()) {
                    tracing::debug!("Received {} for call {}", event.name(), event.call_id());
                    let _ = event_tx.send(SignalingEvent::Call(event));
                }
            }
        }
    }

    /// Beantwortet offene Anfragen nach Verbindungsverlust
    fn fail_pending(pending: &PendingRequests) {
        for (_, responder) in pending.lock().drain() {
            let _ = responder.send(Err(SignalingError::NotConnected));
        }
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    fn is_connected(&self) -> bool {
        SignalingClient::is_connected(self)
    }

    async fn initiate_call(
        &self,
        peer_id: &str,
        media_kind: MediaKind,
    ) -> Result<InitiatedCall, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let (guard, response) = PendingGuard::register(&self.pending);

        let message = ClientMessage::InitiateCall {
            request_id: guard.request_id.clone(),
            peer_id: peer_id.to_string(),
            media_kind,
        };
        self.send_message(&message).await?;

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => Err(SignalingError::Timeout),
        }
    }

    async fn accept_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.send_message(&ClientMessage::AcceptCall {
            call_id: call_id.clone(),
        })
        .await
    }

    async fn decline_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.send_message(&ClientMessage::DeclineCall {
            call_id: call_id.clone(),
            reason: None,
        })
        .await
    }

    async fn cancel_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.send_message(&ClientMessage::CancelCall {
            call_id: call_id.clone(),
        })
        .await
    }

    async fn end_call(&self, call_id: &CallId, duration_secs: u64) -> Result<(), SignalingError> {
        self.send_message(&ClientMessage::EndCall {
            call_id: call_id.clone(),
            duration: duration_secs,
        })
        .await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        state: Arc<RwLock<ClientState>>,
        pending: PendingRequests,
        event_tx: broadcast::Sender<SignalingEvent>,
        reg_tx: mpsc::Sender<Result<String, SignalingError>>,
        reg_rx: mpsc::Receiver<Result<String, SignalingError>>,
    }

    impl Harness {
        fn new() -> Self {
            let (event_tx, _) = broadcast::channel(16);
            let (reg_tx, reg_rx) = mpsc::channel(1);
            Self {
                state: Arc::new(RwLock::new(ClientState::default())),
                pending: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
                reg_tx,
                reg_rx,
            }
        }

        fn deliver(&self, json: &str) {
            let msg: ServerMessage = serde_json::from_str(json).unwrap();
            SignalingClient::handle_server_message(
                msg,
                &self.state,
                &self.pending,
                &self.event_tx,
                &self.reg_tx,
            );
        }
    }

    #[test]
    fn test_registered_sets_user_id() {
        let mut h = Harness::new();
        h.deliver(r#"{"type":"registered","userId":"u-1"}"#);

        assert_eq!(h.state.read().user_id.as_deref(), Some("u-1"));
        assert_eq!(h.reg_rx.try_recv().unwrap(), Ok("u-1".to_string()));
    }

    #[test]
    fn test_call_initiated_resolves_pending_request() {
        let h = Harness::new();
        let (responder, mut response) = oneshot::channel();
        h.pending.lock().insert("r-1".to_string(), responder);

        h.deliver(r#"{"type":"call_initiated","requestId":"r-1","callId":"c-1","connectionParams":{"roomId":"room","token":"tok"}}"#);

        let initiated = response.try_recv().unwrap().unwrap();
        assert_eq!(initiated.call_id, CallId::from("c-1"));
        assert_eq!(initiated.params.room_id, "room");
        assert!(h.pending.lock().is_empty());
    }

    #[test]
    fn test_error_with_request_id_fails_only_that_request() {
        let mut h = Harness::new();
        let (responder, mut response) = oneshot::channel();
        h.pending.lock().insert("r-2".to_string(), responder);
        let mut events = h.event_tx.subscribe();

        h.deliver(r#"{"type":"error","code":404,"message":"peer offline","requestId":"r-2"}"#);

        assert_eq!(
            response.try_recv().unwrap(),
            Err(SignalingError::ServerError {
                code: 404,
                message: "peer offline".to_string()
            })
        );
        assert!(events.try_recv().is_err());
        assert!(h.reg_rx.try_recv().is_err());
    }

    #[test]
    fn test_call_messages_become_events() {
        let h = Harness::new();
        let mut events = h.event_tx.subscribe();

        h.deliver(r#"{"type":"call_cancelled","callId":"c-5"}"#);
        h.deliver(r#"{"type":"pong"}"#);

        match events.try_recv().unwrap() {
            SignalingEvent::Call(SignalingCallEvent::Cancelled { call_id }) => {
                assert_eq!(call_id, CallId::from("c-5"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_fails_pending_requests() {
        let h = Harness::new();
        let (responder, mut response) = oneshot::channel();
        h.pending.lock().insert("r-3".to_string(), responder);

        SignalingClient::fail_pending(&h.pending);

        assert_eq!(response.try_recv().unwrap(), Err(SignalingError::NotConnected));
    }

    /// Client mit offenem Sendekanal, aber ohne Socket
    fn connected_client(request_timeout: Duration) -> (SignalingClient, mpsc::Receiver<String>) {
        let mut client = SignalingClient::new("ws://localhost:1/ws".to_string(), request_timeout);
        let (tx, rx) = mpsc::channel(16);
        client.tx = Some(tx);
        client.state.write().is_connected = true;
        (client, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_initiate_call_leaves_no_pending_entry() {
        let (client, mut outgoing) = connected_client(Duration::from_secs(10));
        let client = Arc::new(client);

        for _ in 0..5 {
            let task = {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.initiate_call("peer", MediaKind::Audio).await })
            };
            let sent = outgoing.recv().await.unwrap();
            assert!(sent.contains("initiate_call"));
            assert_eq!(client.pending.lock().len(), 1);

            task.abort();
            assert!(task.await.unwrap_err().is_cancelled());
            assert!(client.pending.lock().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_call_timeout_clears_pending_entry() {
        let (client, _outgoing) = connected_client(Duration::from_secs(10));

        let result = client.initiate_call("peer", MediaKind::Video).await;

        assert_eq!(result, Err(SignalingError::Timeout));
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (client, _outgoing) = connected_client(Duration::from_secs(1));
        client.state.write().is_connected = false;

        let result = client.end_call(&CallId::from("c-9"), 12).await;

        assert_eq!(result, Err(SignalingError::NotConnected));
    }

    #[tokio::test]
    async fn test_initiate_call_requires_connection() {
        let client = SignalingClient::new("ws://localhost:1/ws".to_string(), Duration::from_secs(1));
        let result = client.initiate_call("peer", MediaKind::Audio).await;
        assert_eq!(result, Err(SignalingError::NotConnected));
    }
}
