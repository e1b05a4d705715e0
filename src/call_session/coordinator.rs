//! Call Coordinator
//!
//! Ein einzelner Task besitzt die [`CallStateMachine`] und verarbeitet alle
//! Trigger nacheinander. Benutzeraktionen, Signaling, Media Engine und Timer
//! schreiben in dieselbe Queue. `HangUp` und `Terminating` laufen über eine
//! eigene Spur und überholen wartende Events.
//!
//! Seiteneffekte werden in Reihenfolge an zwei Worker weitergegeben, einen
//! für Signaling-Befehle und einen für die Media Engine. Der Coordinator
//! selbst wartet nie auf I/O.

use super::clock::CallClock;
use super::effect::{CallNotice, Effect, MediaCommand, SignalingCommand};
use super::error::CallError;
use super::machine::CallStateMachine;
use super::timer::PhaseTimer;
use super::trigger::{AppLifecycle, MediaEvent, SignalingCallEvent, Trigger};
use super::types::{AttemptId, CallId, CallPhase, CallSnapshot, MediaKind, PeerInfo};
use crate::config::CallConfig;
use crate::history::HistoryRecorder;
use crate::media::{MediaEngine, MediaEventSink};
use crate::signaling::SignalingChannel;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// QUEUE ITEMS
// ============================================================================

/// Ein Trigger in der Queue, optional mit Antwortkanal
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) trigger: Trigger,
    pub(crate) reply: Option<oneshot::Sender<Result<(), CallError>>>,
}

impl Envelope {
    pub(crate) fn event(trigger: Trigger) -> Self {
        Self {
            trigger,
            reply: None,
        }
    }

    fn request(trigger: Trigger) -> (Self, oneshot::Receiver<Result<(), CallError>>) {
        let (reply, response) = oneshot::channel();
        (
            Self {
                trigger,
                reply: Some(reply),
            },
            response,
        )
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle auf den Coordinator-Task (billig klonbar)
///
/// Der Task endet, wenn alle Handles verworfen sind oder die App
/// `Terminating` meldet.
#[derive(Clone)]
pub struct CallCoordinator {
    tx: mpsc::Sender<Envelope>,
    priority_tx: mpsc::UnboundedSender<Envelope>,
    notices: broadcast::Sender<CallNotice>,
    snapshot: Arc<RwLock<Option<CallSnapshot>>>,
    signaling: Arc<dyn SignalingChannel>,
}

impl CallCoordinator {
    /// Startet den Coordinator-Task und seine Worker
    pub fn spawn(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaEngine>,
        history: Arc<dyn HistoryRecorder>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(100);
        let snapshot = Arc::new(RwLock::new(None));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_signaling_commands(Arc::clone(&signaling), signal_rx));

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_media_commands(media, media_rx, tx.downgrade()));

        let actor = CallActor {
            machine: CallStateMachine::new(config.clone()),
            clock: CallClock::new(),
            signaling: Arc::clone(&signaling),
            history,
            notices: notices.clone(),
            snapshot: Arc::clone(&snapshot),
            events: tx.downgrade(),
            signal_tx,
            media_tx,
            timer: PhaseTimer::new(),
            params_task: None,
        };
        tokio::spawn(actor.run(rx, priority_rx));

        tracing::info!("Call coordinator started");

        Self {
            tx,
            priority_tx,
            notices,
            snapshot,
            signaling,
        }
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt zurück, sobald der Anruf in `Dialing` ist. Call-ID und
    /// Verbindungsparameter werden im Hintergrund angefragt.
    pub async fn start_call(&self, peer: PeerInfo, media_kind: MediaKind) -> Result<(), CallError> {
        let signaling_ready = self.signaling.is_connected();
        self.request(Trigger::StartCall {
            peer,
            media_kind,
            signaling_ready,
        })
        .await
    }

    pub async fn accept_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.request(Trigger::AcceptCall { call_id }).await
    }

    pub async fn decline_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.request(Trigger::DeclineCall { call_id }).await
    }

    /// Legt auf, egal in welcher Phase
    ///
    /// Läuft ein Anruf, überholt das Auflegen wartende Events. Ohne Anruf
    /// reiht es sich normal ein, damit ein noch wartendes `start_call`
    /// desselben Benutzers zuerst verarbeitet wird.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        if self.phase() == CallPhase::Idle {
            self.request(Trigger::HangUp).await
        } else {
            self.request_priority(Trigger::HangUp).await
        }
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(Trigger::SetMuted { muted }).await
    }

    pub async fn app_lifecycle(&self, state: AppLifecycle) -> Result<(), CallError> {
        match state {
            AppLifecycle::Terminating => self.request_priority(Trigger::Lifecycle(state)).await,
            _ => self.request(Trigger::Lifecycle(state)).await,
        }
    }

    /// Reicht ein Call-Control-Event vom Signaling-Kanal ein
    pub async fn signaling_event(&self, event: SignalingCallEvent) -> Result<(), CallError> {
        self.tx
            .send(Envelope::event(Trigger::Signaling(event)))
            .await
            .map_err(|_| CallError::CoordinatorClosed)
    }

    /// Rückkanal für Media-Events zu `call_id`
    pub fn media_sink(&self, call_id: CallId) -> MediaEventSink {
        MediaEventSink::new(call_id, self.tx.downgrade())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.snapshot
            .read()
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(CallPhase::Idle)
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request(&self, trigger: Trigger) -> Result<(), CallError> {
        let (envelope, response) = Envelope::request(trigger);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| CallError::CoordinatorClosed)?;
        response.await.map_err(|_| CallError::CoordinatorClosed)?
    }

    async fn request_priority(&self, trigger: Trigger) -> Result<(), CallError> {
        let (envelope, response) = Envelope::request(trigger);
        self.priority_tx
            .send(envelope)
            .map_err(|_| CallError::CoordinatorClosed)?;
        response.await.map_err(|_| CallError::CoordinatorClosed)?
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct CallActor {
    machine: CallStateMachine,
    clock: CallClock,
    signaling: Arc<dyn SignalingChannel>,
    history: Arc<dyn HistoryRecorder>,
    notices: broadcast::Sender<CallNotice>,
    snapshot: Arc<RwLock<Option<CallSnapshot>>>,
    /// Eigene Queue, schwach gehalten damit der Task mit den Handles endet
    events: mpsc::WeakSender<Envelope>,
    signal_tx: mpsc::UnboundedSender<SignalingCommand>,
    media_tx: mpsc::UnboundedSender<MediaCommand>,
    timer: PhaseTimer,
    params_task: Option<JoinHandle<()>>,
}

impl CallActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Envelope>,
        mut priority_rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                Some(envelope) = priority_rx.recv() => envelope,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if self.dispatch(envelope) {
                break;
            }
        }

        self.timer.disarm();
        if let Some(task) = self.params_task.take() {
            task.abort();
        }
        tracing::info!("Call coordinator stopped");
    }

    /// Verarbeitet einen Trigger, `true` wenn der Task enden soll
    fn dispatch(&mut self, envelope: Envelope) -> bool {
        let Envelope { trigger, reply } = envelope;
        tracing::debug!("Handling {}", trigger);

        let outcome = self.machine.handle(trigger, self.clock.now());
        for effect in outcome.effects {
            self.execute(effect);
        }

        *self.snapshot.write() = self.machine.snapshot();

        // Verspätete Antworten einer beendeten Session nicht mehr abwarten
        if self.machine.phase() == CallPhase::Idle {
            if let Some(task) = self.params_task.take() {
                task.abort();
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(outcome.result);
        }

        outcome.shutdown
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Signal(SignalingCommand::InitiateCall {
                attempt,
                peer_id,
                media_kind,
            }) => self.request_params(attempt, peer_id, media_kind),

            Effect::Signal(command) => {
                if self.signal_tx.send(command).is_err() {
                    tracing::warn!("Signaling worker gone, dropping command");
                }
            }

            Effect::Media(command) => {
                if self.media_tx.send(command).is_err() {
                    tracing::warn!("Media worker gone, dropping command");
                }
            }

            Effect::Notify(notice) => {
                // Keine Subscriber ist kein Fehler
                let _ = self.notices.send(notice);
            }

            Effect::ArmTimer {
                call_id,
                kind,
                generation,
                after,
            } => {
                let events = self.events.clone();
                self.timer.arm(after, async move {
                    if let Some(tx) = events.upgrade() {
                        let fired = Trigger::TimerFired {
                            call_id,
                            kind,
                            generation,
                        };
                        let _ = tx.send(Envelope::event(fired)).await;
                    }
                });
            }

            Effect::DisarmTimer => self.timer.disarm(),

            Effect::RecordHistory(entry) => self.history.record(entry),
        }
    }

    /// Fragt Call-ID und Verbindungsparameter an, ohne die Queue zu blockieren
    fn request_params(&mut self, attempt: AttemptId, peer_id: String, media_kind: MediaKind) {
        let Some(events) = self.events.upgrade() else {
            tracing::warn!("Coordinator queue closed, not requesting connection params");
            return;
        };
        let signaling = Arc::clone(&self.signaling);

        // Das Timeout liegt beim Kanal (`SignalingChannel::initiate_call`)
        let task = tokio::spawn(async move {
            let trigger = match signaling.initiate_call(&peer_id, media_kind).await {
                Ok(initiated) => Trigger::ParamsReady {
                    attempt,
                    call_id: initiated.call_id,
                    params: initiated.params,
                },
                Err(e) => Trigger::ParamsFailed {
                    attempt,
                    error: CallError::from(e),
                },
            };
            let _ = events.send(Envelope::event(trigger)).await;
        });

        if let Some(previous) = self.params_task.replace(task) {
            previous.abort();
        }
    }
}

// ============================================================================
// WORKERS
// ============================================================================

/// Führt Signaling-Befehle in Reihenfolge aus; Fehler werden nur geloggt
async fn run_signaling_commands(
    signaling: Arc<dyn SignalingChannel>,
    mut commands: mpsc::UnboundedReceiver<SignalingCommand>,
) {
    while let Some(command) = commands.recv().await {
        let result = match &command {
            SignalingCommand::Accept { call_id } => signaling.accept_call(call_id).await,
            SignalingCommand::Decline { call_id } => signaling.decline_call(call_id).await,
            SignalingCommand::Cancel { call_id } => signaling.cancel_call(call_id).await,
            SignalingCommand::End {
                call_id,
                duration_secs,
            } => signaling.end_call(call_id, *duration_secs).await,
            SignalingCommand::InitiateCall { .. } => continue,
        };

        if let Err(e) = result {
            tracing::warn!("Signaling command {:?} failed: {}", command, e);
        }
    }
}

/// Führt Media-Befehle in Reihenfolge aus
///
/// Ein fehlgeschlagenes `join` wird als `Failed` an den Coordinator gemeldet.
async fn run_media_commands(
    media: Arc<dyn MediaEngine>,
    mut commands: mpsc::UnboundedReceiver<MediaCommand>,
    events: mpsc::WeakSender<Envelope>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            MediaCommand::Join { call_id, params } => {
                tracing::info!("Joining media room {} for call {}", params.room_id, call_id);
                let sink = MediaEventSink::new(call_id.clone(), events.clone());
                if let Err(e) = media.join(&call_id, &params, sink.clone()).await {
                    tracing::error!("Media join failed for call {}: {}", call_id, e);
                    sink.report(MediaEvent::Failed {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
            MediaCommand::Leave => media.leave().await,
            MediaCommand::Mute(muted) => media.set_muted(muted).await,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
