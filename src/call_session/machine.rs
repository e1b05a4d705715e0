//! Call Session State Machine
//!
//! Reine Übergangslogik: `(Zustand, Trigger, Zeit) -> Outcome`. Kein I/O,
//! keine Timer, keine Locks. Alles, was nach außen wirkt, steht als
//! [`Effect`] im [`Outcome`] und wird vom Coordinator ausgeführt.

use super::effect::{CallNotice, Effect, MediaCommand, SignalingCommand};
use super::error::{AlertKind, CallError};
use super::trigger::{AppLifecycle, MediaEvent, SignalingCallEvent, Trigger};
use super::types::{
    ArmedTimer, AttemptId, CallDirection, CallHistoryEntry, CallId, CallPhase, CallSession,
    CallSnapshot, CallStatus, ConnectionParams, IncomingCallOffer, MediaKind, PeerInfo,
    TimeoutKind,
};
use crate::config::CallConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Wie viele beendete Call-IDs für die Duplikaterkennung gemerkt werden
const RECENT_CALLS: usize = 16;

/// Ergebnis eines einzelnen Triggers
#[derive(Debug)]
pub struct Outcome {
    /// Antwort an den Auslöser (nur für Benutzeraktionen relevant)
    pub result: Result<(), CallError>,
    pub transitions: Vec<(CallPhase, CallPhase)>,
    pub effects: Vec<Effect>,
    /// Coordinator soll nach diesem Trigger anhalten
    pub shutdown: bool,
}

impl Default for Outcome {
    fn default() -> Self {
        Self {
            result: Ok(()),
            transitions: Vec::new(),
            effects: Vec::new(),
            shutdown: false,
        }
    }
}

impl Outcome {
    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn notify(&mut self, notice: CallNotice) {
        self.effects.push(Effect::Notify(notice));
    }

    pub fn history(&self) -> impl Iterator<Item = &CallHistoryEntry> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::RecordHistory(entry) => Some(entry),
            _ => None,
        })
    }
}

/// Was beim Beenden an den Signaling-Kanal geht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Farewell {
    Silent,
    Decline,
    Cancel,
    End,
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug)]
pub struct CallStateMachine {
    config: CallConfig,
    session: Option<CallSession>,
    offer: Option<IncomingCallOffer>,
    next_generation: u64,
    recently_ended: VecDeque<CallId>,
}

impl CallStateMachine {
    pub fn new(config: CallConfig) -> Self {
        Self {
            config,
            session: None,
            offer: None,
            next_generation: 0,
            recently_ended: VecDeque::with_capacity(RECENT_CALLS),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(CallPhase::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn pending_offer(&self) -> Option<&IncomingCallOffer> {
        self.offer.as_ref()
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.as_ref().map(CallSession::snapshot)
    }

    /// Verarbeitet genau einen Trigger
    pub fn handle(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Outcome {
        let mut out = Outcome::default();

        match trigger {
            Trigger::StartCall {
                peer,
                media_kind,
                signaling_ready,
            } => self.start_call(&mut out, peer, media_kind, signaling_ready, now),
            Trigger::AcceptCall { call_id } => self.accept(&mut out, call_id),
            Trigger::DeclineCall { call_id } => self.decline(&mut out, call_id, now),
            Trigger::HangUp => self.hang_up(&mut out, now),
            Trigger::SetMuted { muted } => self.set_muted(&mut out, muted),
            Trigger::Lifecycle(state) => self.lifecycle(&mut out, state, now),
            Trigger::ParamsReady {
                attempt,
                call_id,
                params,
            } => self.params_ready(&mut out, attempt, call_id, params),
            Trigger::ParamsFailed { attempt, error } => self.params_failed(&mut out, attempt, error),
            Trigger::Signaling(event) => self.signaling(&mut out, event, now),
            Trigger::Media { call_id, event } => self.media(&mut out, call_id, event, now),
            Trigger::TimerFired {
                call_id,
                kind,
                generation,
            } => self.timer_fired(&mut out, call_id, ArmedTimer { kind, generation }, now),
        }

        out
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    fn start_call(
        &mut self,
        out: &mut Outcome,
        peer: PeerInfo,
        media_kind: MediaKind,
        signaling_ready: bool,
        now: DateTime<Utc>,
    ) {
        if let Some(session) = &self.session {
            tracing::warn!(
                "Rejecting call to {}: already {} with {}",
                peer.id,
                session.phase,
                session.peer.id
            );
            out.result = Err(CallError::AlreadyInCall);
            return;
        }

        if !signaling_ready {
            tracing::warn!("Rejecting call to {}: signaling not connected", peer.id);
            out.result = Err(CallError::SignalingUnavailable);
            out.notify(CallNotice::ShowError(AlertKind::SignalingUnavailable));
            return;
        }

        let session = CallSession::new_outgoing(peer, media_kind, now);
        let command = SignalingCommand::InitiateCall {
            attempt: session.attempt,
            peer_id: session.peer.id.clone(),
            media_kind,
        };
        self.session = Some(session);
        self.record(out, CallPhase::Idle, CallPhase::Dialing);
        out.push(Effect::Signal(command));
    }

    fn accept(&mut self, out: &mut Outcome, call_id: CallId) {
        match self.lookup(&call_id) {
            Some((CallDirection::Incoming, CallPhase::Ringing)) => {}
            Some(_) => {
                out.result = Err(CallError::NoSuchCall(call_id));
                return;
            }
            None => {
                out.result = Err(self.missing_call_error(call_id));
                return;
            }
        }

        self.offer = None;
        out.notify(CallNotice::StopRingtone);
        self.disarm_timer(out);
        self.advance(out, CallPhase::Connecting);
        self.arm_timer(out, TimeoutKind::Connecting);
        out.push(Effect::Signal(SignalingCommand::Accept {
            call_id: call_id.clone(),
        }));
        self.join_media(out, call_id);
        if let Some(snapshot) = self.snapshot() {
            out.notify(CallNotice::NavigateToCall(snapshot));
        }
    }

    fn decline(&mut self, out: &mut Outcome, call_id: CallId, now: DateTime<Utc>) {
        match self.lookup(&call_id) {
            Some((CallDirection::Incoming, CallPhase::Ringing)) => {
                self.terminate(out, now, CallStatus::Declined, Farewell::Decline, None);
            }
            Some(_) => out.result = Err(CallError::NoSuchCall(call_id)),
            None => out.result = Err(self.missing_call_error(call_id)),
        }
    }

    fn hang_up(&mut self, out: &mut Outcome, now: DateTime<Utc>) {
        let Some(session) = &self.session else {
            out.result = Err(CallError::NoActiveCall);
            return;
        };

        let (status, farewell) = match (session.phase, session.direction) {
            (CallPhase::Dialing, _) => (CallStatus::Cancelled, Farewell::Silent),
            (CallPhase::Ringing, CallDirection::Outgoing) => (CallStatus::Cancelled, Farewell::Cancel),
            (CallPhase::Ringing, CallDirection::Incoming) => (CallStatus::Declined, Farewell::Decline),
            (CallPhase::Connecting, _) => (CallStatus::Cancelled, Farewell::End),
            (CallPhase::Active, _) => (CallStatus::Completed, Farewell::End),
            (CallPhase::Idle | CallPhase::Ending, _) => return,
        };

        tracing::info!("Local hang-up in phase {}", session.phase);
        self.terminate(out, now, status, farewell, None);
    }

    fn set_muted(&mut self, out: &mut Outcome, muted: bool) {
        match self.session.as_mut() {
            Some(session) if matches!(session.phase, CallPhase::Connecting | CallPhase::Active) => {
                session.muted = muted;
                out.push(Effect::Media(MediaCommand::Mute(muted)));
                out.notify(CallNotice::MuteChanged(muted));
            }
            _ => out.result = Err(CallError::NoActiveCall),
        }
    }

    fn lifecycle(&mut self, out: &mut Outcome, state: AppLifecycle, now: DateTime<Utc>) {
        match state {
            AppLifecycle::Foreground | AppLifecycle::Background => {
                // Anruf läuft im Hintergrund weiter
                tracing::debug!("App lifecycle {:?} in phase {}", state, self.phase());
            }
            AppLifecycle::Terminating => {
                if self.session.is_some() {
                    self.hang_up(out, now);
                }
                out.shutdown = true;
            }
        }
    }

    // ========================================================================
    // ASYNC RESPONSES
    // ========================================================================

    fn params_ready(
        &mut self,
        out: &mut Outcome,
        attempt: AttemptId,
        call_id: CallId,
        params: ConnectionParams,
    ) {
        match self.session.as_mut() {
            Some(session) if session.attempt == attempt && session.phase == CallPhase::Dialing => {
                session.call_id = Some(call_id);
                session.connection_params = Some(params);
            }
            _ => {
                tracing::debug!("Ignoring stale connection params for attempt {}", attempt);
                return;
            }
        }

        self.advance(out, CallPhase::Ringing);
        out.notify(CallNotice::StartRingtone(CallDirection::Outgoing));
        self.arm_timer(out, TimeoutKind::Ringing);
        if let Some(snapshot) = self.snapshot() {
            out.notify(CallNotice::NavigateToCall(snapshot));
        }
    }

    fn params_failed(&mut self, out: &mut Outcome, attempt: AttemptId, error: CallError) {
        match &self.session {
            Some(session) if session.attempt == attempt && session.phase == CallPhase::Dialing => {}
            _ => {
                tracing::debug!("Ignoring stale params failure for attempt {}", attempt);
                return;
            }
        }

        tracing::warn!("Call setup failed: {}", error);
        // Gegenüber wurde nie erreicht: keine Historie
        self.session = None;
        self.record(out, CallPhase::Dialing, CallPhase::Idle);
        if let Some(alert) = error.alert() {
            out.notify(CallNotice::ShowError(alert));
        }
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    fn signaling(&mut self, out: &mut Outcome, event: SignalingCallEvent, now: DateTime<Utc>) {
        match event {
            SignalingCallEvent::IncomingCall(offer) => self.incoming_call(out, offer, now),
            SignalingCallEvent::Accepted { call_id } => self.peer_accepted(out, call_id),
            SignalingCallEvent::Declined { call_id } => self.peer_declined(out, call_id, now),
            SignalingCallEvent::Ended { call_id, .. } | SignalingCallEvent::Cancelled { call_id } => {
                self.peer_hung_up(out, call_id, now)
            }
        }
    }

    fn incoming_call(&mut self, out: &mut Outcome, offer: IncomingCallOffer, now: DateTime<Utc>) {
        if self.recently_ended.contains(&offer.call_id) {
            tracing::debug!("Ignoring duplicate offer for ended call {}", offer.call_id);
            return;
        }

        if let Some(session) = &self.session {
            if session.is_call(&offer.call_id) {
                tracing::debug!("Ignoring duplicate offer for current call {}", offer.call_id);
                return;
            }

            tracing::info!(
                "Auto-declining call {} from {}: already {}",
                offer.call_id,
                offer.peer.id,
                session.phase
            );
            out.push(Effect::Signal(SignalingCommand::Decline {
                call_id: offer.call_id.clone(),
            }));
            self.remember(offer.call_id);
            return;
        }

        tracing::info!("Incoming call {} from {}", offer.call_id, offer.peer.id);
        self.session = Some(CallSession::new_incoming(&offer, now));
        self.offer = Some(offer.clone());
        self.record(out, CallPhase::Idle, CallPhase::Ringing);
        out.notify(CallNotice::StartRingtone(CallDirection::Incoming));
        self.arm_timer(out, TimeoutKind::Ringing);
        out.notify(CallNotice::ShowIncomingCall(offer));
    }

    fn peer_accepted(&mut self, out: &mut Outcome, call_id: CallId) {
        if self.lookup(&call_id) != Some((CallDirection::Outgoing, CallPhase::Ringing)) {
            self.ignore("call_accepted", &call_id);
            return;
        }

        out.notify(CallNotice::StopRingtone);
        self.disarm_timer(out);
        self.advance(out, CallPhase::Connecting);
        self.arm_timer(out, TimeoutKind::Connecting);
        self.join_media(out, call_id);
    }

    fn peer_declined(&mut self, out: &mut Outcome, call_id: CallId, now: DateTime<Utc>) {
        if self.lookup(&call_id) != Some((CallDirection::Outgoing, CallPhase::Ringing)) {
            self.ignore("call_declined", &call_id);
            return;
        }

        self.terminate(
            out,
            now,
            CallStatus::Declined,
            Farewell::Silent,
            Some(AlertKind::PeerDeclined),
        );
    }

    fn peer_hung_up(&mut self, out: &mut Outcome, call_id: CallId, now: DateTime<Utc>) {
        let (status, farewell) = match self.lookup(&call_id) {
            Some((_, CallPhase::Active)) => (CallStatus::Completed, Farewell::End),
            Some((_, CallPhase::Connecting)) => (CallStatus::Cancelled, Farewell::Silent),
            Some((CallDirection::Outgoing, CallPhase::Ringing)) => {
                (CallStatus::Cancelled, Farewell::Silent)
            }
            Some((CallDirection::Incoming, CallPhase::Ringing)) => {
                (CallStatus::Missed, Farewell::Silent)
            }
            _ => {
                self.ignore("call_ended", &call_id);
                return;
            }
        };

        tracing::info!("Call {} ended by peer", call_id);
        self.terminate(out, now, status, farewell, None);
    }

    // ========================================================================
    // MEDIA ENGINE / TIMER
    // ========================================================================

    fn media(&mut self, out: &mut Outcome, call_id: CallId, event: MediaEvent, now: DateTime<Utc>) {
        let Some((_, phase)) = self.lookup(&call_id) else {
            self.ignore("media event", &call_id);
            return;
        };

        match (phase, event) {
            (CallPhase::Connecting, MediaEvent::Connected) => {
                self.disarm_timer(out);
                if let Some(session) = self.session.as_mut() {
                    session.connected_at = Some(now);
                }
                self.advance(out, CallPhase::Active);
                out.notify(CallNotice::StopRingtone);
            }
            (
                CallPhase::Connecting | CallPhase::Active,
                MediaEvent::Failed { reason },
            ) => {
                tracing::error!("Media engine failed for call {}: {}", call_id, reason);
                self.terminate(
                    out,
                    now,
                    CallStatus::Failed,
                    Farewell::End,
                    Some(AlertKind::MediaEngineFailure),
                );
            }
            (CallPhase::Connecting | CallPhase::Active, MediaEvent::Closed) => {
                tracing::warn!("Media connection closed unexpectedly for call {}", call_id);
                self.terminate(
                    out,
                    now,
                    CallStatus::Failed,
                    Farewell::End,
                    Some(AlertKind::MediaEngineFailure),
                );
            }
            (phase, event) => {
                tracing::debug!("Media event {:?} in phase {} is a no-op", event, phase);
            }
        }
    }

    fn timer_fired(&mut self, out: &mut Outcome, call_id: CallId, fired: ArmedTimer, now: DateTime<Utc>) {
        let session = match &self.session {
            Some(session) if session.is_call(&call_id) && session.timer == Some(fired) => session,
            _ => {
                tracing::debug!("Ignoring stale {:?} timeout for call {}", fired.kind, call_id);
                return;
            }
        };

        tracing::info!("{:?} timeout for call {}", fired.kind, call_id);
        match (fired.kind, session.direction) {
            (TimeoutKind::Ringing, CallDirection::Outgoing) => {
                self.terminate(out, now, CallStatus::Cancelled, Farewell::Cancel, None)
            }
            (TimeoutKind::Ringing, CallDirection::Incoming) => {
                self.terminate(out, now, CallStatus::Missed, Farewell::Decline, None)
            }
            (TimeoutKind::Connecting, _) => self.terminate(
                out,
                now,
                CallStatus::Failed,
                Farewell::End,
                Some(AlertKind::MediaEngineFailure),
            ),
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Richtung und Phase, falls `call_id` die aktuelle Session ist
    fn lookup(&self, call_id: &CallId) -> Option<(CallDirection, CallPhase)> {
        self.session
            .as_ref()
            .filter(|s| s.is_call(call_id))
            .map(|s| (s.direction, s.phase))
    }

    fn missing_call_error(&self, call_id: CallId) -> CallError {
        if self.session.is_none() {
            CallError::NoActiveCall
        } else {
            CallError::NoSuchCall(call_id)
        }
    }

    fn ignore(&self, what: &str, call_id: &CallId) {
        if self.recently_ended.contains(call_id) {
            tracing::debug!("Ignoring duplicate {} for ended call {}", what, call_id);
        } else {
            tracing::debug!(
                "Ignoring {} for call {} in phase {}",
                what,
                call_id,
                self.phase()
            );
        }
    }

    fn remember(&mut self, call_id: CallId) {
        if self.recently_ended.len() == RECENT_CALLS {
            self.recently_ended.pop_front();
        }
        self.recently_ended.push_back(call_id);
    }

    fn record(&self, out: &mut Outcome, from: CallPhase, to: CallPhase) {
        debug_assert!(from.can_transition_to(to), "invalid edge {} -> {}", from, to);
        tracing::info!("Call phase {} -> {}", from, to);
        out.transitions.push((from, to));
        out.notify(CallNotice::PhaseChanged { from, to });
    }

    fn advance(&mut self, out: &mut Outcome, to: CallPhase) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let from = session.phase;
        session.phase = to;
        self.record(out, from, to);
    }

    fn arm_timer(&mut self, out: &mut Outcome, kind: TimeoutKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(call_id) = session.call_id.clone() else {
            return;
        };

        if session.timer.take().is_some() {
            out.push(Effect::DisarmTimer);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let after = match kind {
            TimeoutKind::Ringing => self.config.ring_timeout(session.media_kind),
            TimeoutKind::Connecting => self.config.connecting_timeout(),
        };
        session.timer = Some(ArmedTimer { kind, generation });
        out.push(Effect::ArmTimer {
            call_id,
            kind,
            generation,
            after,
        });
    }

    fn disarm_timer(&mut self, out: &mut Outcome) {
        if let Some(session) = self.session.as_mut() {
            if session.timer.take().is_some() {
                out.push(Effect::DisarmTimer);
            }
        }
    }

    fn join_media(&mut self, out: &mut Outcome, call_id: CallId) {
        let params = self
            .session
            .as_ref()
            .and_then(|s| s.connection_params.clone());

        match params {
            Some(params) => out.push(Effect::Media(MediaCommand::Join { call_id, params })),
            None => {
                // Sollte nicht vorkommen: Ringing ohne Parameter
                tracing::error!("No connection params for call {}", call_id);
            }
        }
    }

    /// Beendet die Session über Ending nach Idle und erzeugt den Historien-Eintrag
    fn terminate(
        &mut self,
        out: &mut Outcome,
        now: DateTime<Utc>,
        status: CallStatus,
        farewell: Farewell,
        alert: Option<AlertKind>,
    ) {
        let Some(from) = self.session.as_ref().map(|s| s.phase) else {
            return;
        };

        if from == CallPhase::Ringing {
            out.notify(CallNotice::StopRingtone);
        }
        self.disarm_timer(out);
        self.advance(out, CallPhase::Ending);

        let Some(session) = self.session.take() else {
            return;
        };
        self.offer = None;

        let entry = CallHistoryEntry::from_session(&session, status, now);

        if let Some(call_id) = session.call_id.clone() {
            let command = match farewell {
                Farewell::Silent => None,
                Farewell::Decline => Some(SignalingCommand::Decline { call_id }),
                Farewell::Cancel => Some(SignalingCommand::Cancel { call_id }),
                Farewell::End => Some(SignalingCommand::End {
                    call_id,
                    duration_secs: entry.duration_secs,
                }),
            };
            if let Some(command) = command {
                out.push(Effect::Signal(command));
            }
        }

        if matches!(from, CallPhase::Connecting | CallPhase::Active) {
            out.push(Effect::Media(MediaCommand::Leave));
        }

        tracing::info!(
            "Call {} finished: {} after {}s",
            session
                .call_id
                .as_ref()
                .map(CallId::to_string)
                .unwrap_or_else(|| session.attempt.to_string()),
            status.as_str(),
            entry.duration_secs
        );

        out.push(Effect::RecordHistory(entry.clone()));
        if let Some(alert) = alert {
            out.notify(CallNotice::ShowError(alert));
        }
        out.notify(CallNotice::CallEnded(entry));

        if let Some(call_id) = session.call_id {
            self.remember(call_id);
        }
        self.record(out, CallPhase::Ending, CallPhase::Idle);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn machine() -> CallStateMachine {
        CallStateMachine::new(CallConfig::default())
    }

    fn peer() -> PeerInfo {
        PeerInfo::new("peer-p", "Pat")
    }

    fn start(m: &mut CallStateMachine, secs: i64) -> AttemptId {
        let out = m.handle(
            Trigger::StartCall {
                peer: peer(),
                media_kind: MediaKind::Audio,
                signaling_ready: true,
            },
            at(secs),
        );
        assert!(out.result.is_ok());
        m.session().unwrap().attempt
    }

    fn params(m: &mut CallStateMachine, attempt: AttemptId, call_id: &str, secs: i64) -> Outcome {
        m.handle(
            Trigger::ParamsReady {
                attempt,
                call_id: CallId::from(call_id),
                params: ConnectionParams::new("room-1", "tok-1"),
            },
            at(secs),
        )
    }

    fn offer(call_id: &str, secs: i64) -> Trigger {
        Trigger::Signaling(SignalingCallEvent::IncomingCall(IncomingCallOffer {
            call_id: CallId::from(call_id),
            peer: PeerInfo::new("peer-q", "Quinn"),
            media_kind: MediaKind::Video,
            connection_params: ConnectionParams::new("room-2", "tok-2"),
            received_at: at(secs),
        }))
    }

    fn signal(event: SignalingCallEvent) -> Trigger {
        Trigger::Signaling(event)
    }

    fn media(call_id: &str, event: MediaEvent) -> Trigger {
        Trigger::Media {
            call_id: CallId::from(call_id),
            event,
        }
    }

    fn armed(out: &Outcome) -> Option<(CallId, TimeoutKind, u64, std::time::Duration)> {
        out.effects.iter().find_map(|e| match e {
            Effect::ArmTimer {
                call_id,
                kind,
                generation,
                after,
            } => Some((call_id.clone(), *kind, *generation, *after)),
            _ => None,
        })
    }

    fn commands(out: &Outcome) -> Vec<SignalingCommand> {
        out.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Signal(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    fn has_notice(out: &Outcome, notice: &CallNotice) -> bool {
        out.effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(n) if n == notice))
    }

    /// Ausgehend bis Active bringen, gibt die Call-ID zurück
    fn outgoing_active(m: &mut CallStateMachine) -> CallId {
        let attempt = start(m, 0);
        params(m, attempt, "call-1", 1);
        m.handle(signal(SignalingCallEvent::Accepted { call_id: "call-1".into() }), at(5));
        m.handle(media("call-1", MediaEvent::Connected), at(8));
        assert_eq!(m.phase(), CallPhase::Active);
        CallId::from("call-1")
    }

    #[test]
    fn test_scenario_a_outgoing_call_completed() {
        let mut m = machine();

        let attempt = start(&mut m, 0);
        assert_eq!(m.phase(), CallPhase::Dialing);

        let out = params(&mut m, attempt, "call-1", 1);
        assert_eq!(m.phase(), CallPhase::Ringing);
        assert!(has_notice(&out, &CallNotice::StartRingtone(CallDirection::Outgoing)));
        let (_, kind, _, after) = armed(&out).unwrap();
        assert_eq!(kind, TimeoutKind::Ringing);
        assert_eq!(after, std::time::Duration::from_secs(30));

        let out = m.handle(signal(SignalingCallEvent::Accepted { call_id: "call-1".into() }), at(5));
        assert_eq!(m.phase(), CallPhase::Connecting);
        assert!(out.effects.contains(&Effect::DisarmTimer));
        assert_eq!(armed(&out).unwrap().1, TimeoutKind::Connecting);
        assert!(out
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Media(MediaCommand::Join { .. }))));

        m.handle(media("call-1", MediaEvent::Connected), at(10));
        assert_eq!(m.phase(), CallPhase::Active);

        let out = m.handle(Trigger::HangUp, at(52));
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(
            out.transitions,
            vec![(CallPhase::Active, CallPhase::Ending), (CallPhase::Ending, CallPhase::Idle)]
        );

        let history: Vec<_> = out.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallStatus::Completed);
        assert_eq!(history[0].duration_secs, 42);
        assert_eq!(
            commands(&out),
            vec![SignalingCommand::End {
                call_id: "call-1".into(),
                duration_secs: 42
            }]
        );
    }

    #[test]
    fn test_scenario_b_incoming_call_missed() {
        let mut m = machine();

        let out = m.handle(offer("C1", 0), at(0));
        assert_eq!(m.phase(), CallPhase::Ringing);
        assert!(m.pending_offer().is_some());
        let (call_id, kind, generation, after) = armed(&out).unwrap();
        assert_eq!(after, std::time::Duration::from_secs(30));

        // 28s: nichts passiert, weiterhin Ringing
        assert_eq!(m.phase(), CallPhase::Ringing);

        let out = m.handle(
            Trigger::TimerFired {
                call_id,
                kind,
                generation,
            },
            at(30),
        );
        assert_eq!(m.phase(), CallPhase::Idle);
        assert!(m.pending_offer().is_none());

        let history: Vec<_> = out.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallStatus::Missed);
        assert_eq!(commands(&out), vec![SignalingCommand::Decline { call_id: "C1".into() }]);
        assert!(has_notice(&out, &CallNotice::StopRingtone));
    }

    #[test]
    fn test_scenario_c_declined_then_late_accept_ignored() {
        let mut m = machine();
        let attempt = start(&mut m, 0);
        params(&mut m, attempt, "call-c", 1);

        let out = m.handle(signal(SignalingCallEvent::Declined { call_id: "call-c".into() }), at(4));
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(out.history().next().unwrap().status, CallStatus::Declined);
        assert!(has_notice(&out, &CallNotice::ShowError(AlertKind::PeerDeclined)));
        assert!(commands(&out).is_empty());

        let out = m.handle(signal(SignalingCallEvent::Accepted { call_id: "call-c".into() }), at(5));
        assert_eq!(m.phase(), CallPhase::Idle);
        assert!(out.effects.is_empty());
        assert!(out.transitions.is_empty());
    }

    #[test]
    fn test_scenario_d_media_closed_while_active() {
        let mut m = machine();
        let call_id = outgoing_active(&mut m);

        let out = m.handle(media(call_id.as_str(), MediaEvent::Closed), at(20));
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(out.history().next().unwrap().status, CallStatus::Failed);
        assert_eq!(
            commands(&out),
            vec![SignalingCommand::End {
                call_id,
                duration_secs: 12
            }]
        );
        assert!(out.effects.contains(&Effect::Media(MediaCommand::Leave)));
        assert!(has_notice(&out, &CallNotice::ShowError(AlertKind::MediaEngineFailure)));
    }

    #[test]
    fn test_duplicate_call_ended_records_once() {
        let mut m = machine();
        let call_id = outgoing_active(&mut m);

        let ended = || {
            signal(SignalingCallEvent::Ended {
                call_id: CallId::from("call-1"),
                duration_secs: Some(30),
            })
        };

        let first = m.handle(ended(), at(38));
        let second = m.handle(ended(), at(39));

        assert_eq!(first.history().count(), 1);
        assert_eq!(first.history().next().unwrap().status, CallStatus::Completed);
        assert_eq!(second.history().count(), 0);
        assert!(second.result.is_ok());
        assert!(second.effects.is_empty());
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(
            commands(&first),
            vec![SignalingCommand::End {
                call_id,
                duration_secs: 30
            }]
        );
    }

    #[test]
    fn test_start_call_while_busy_rejected_in_every_phase() {
        let mut m = machine();
        let busy = |m: &mut CallStateMachine| {
            let before = m.phase();
            let out = m.handle(
                Trigger::StartCall {
                    peer: PeerInfo::new("other", "Other"),
                    media_kind: MediaKind::Video,
                    signaling_ready: true,
                },
                at(3),
            );
            assert_eq!(out.result, Err(CallError::AlreadyInCall));
            assert!(out.effects.is_empty());
            assert_eq!(m.phase(), before);
        };

        let attempt = start(&mut m, 0);
        busy(&mut m);
        params(&mut m, attempt, "call-1", 1);
        busy(&mut m);
        m.handle(signal(SignalingCallEvent::Accepted { call_id: "call-1".into() }), at(2));
        busy(&mut m);
        m.handle(media("call-1", MediaEvent::Connected), at(3));
        busy(&mut m);
    }

    #[test]
    fn test_signaling_unavailable_rejects_without_session() {
        let mut m = machine();
        let out = m.handle(
            Trigger::StartCall {
                peer: peer(),
                media_kind: MediaKind::Audio,
                signaling_ready: false,
            },
            at(0),
        );
        assert_eq!(out.result, Err(CallError::SignalingUnavailable));
        assert_eq!(m.phase(), CallPhase::Idle);
        assert!(commands(&out).is_empty());
    }

    #[test]
    fn test_params_failure_returns_to_idle_without_history() {
        let mut m = machine();
        let attempt = start(&mut m, 0);

        let out = m.handle(
            Trigger::ParamsFailed {
                attempt,
                error: CallError::ParamsUnavailable("timeout".into()),
            },
            at(10),
        );
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(out.transitions, vec![(CallPhase::Dialing, CallPhase::Idle)]);
        assert_eq!(out.history().count(), 0);
        assert!(has_notice(&out, &CallNotice::ShowError(AlertKind::ParamsUnavailable)));
    }

    #[test]
    fn test_hang_up_while_dialing_ignores_late_params() {
        let mut m = machine();
        let attempt = start(&mut m, 0);

        let out = m.handle(Trigger::HangUp, at(1));
        assert_eq!(m.phase(), CallPhase::Idle);
        let entry = out.history().next().unwrap();
        assert_eq!(entry.status, CallStatus::Cancelled);
        assert!(entry.call_id.is_none());
        assert!(commands(&out).is_empty());

        let out = params(&mut m, attempt, "call-late", 2);
        assert_eq!(m.phase(), CallPhase::Idle);
        assert!(out.effects.is_empty());
    }

    #[test]
    fn test_outgoing_ring_timeout_cancels_once() {
        let mut m = machine();
        let attempt = start(&mut m, 0);
        let out = params(&mut m, attempt, "call-t", 1);
        let (call_id, kind, generation, _) = armed(&out).unwrap();

        let fire = || Trigger::TimerFired {
            call_id: call_id.clone(),
            kind,
            generation,
        };
        let first = m.handle(fire(), at(31));
        let second = m.handle(fire(), at(31));

        assert_eq!(first.history().next().unwrap().status, CallStatus::Cancelled);
        assert_eq!(commands(&first), vec![SignalingCommand::Cancel { call_id: "call-t".into() }]);
        assert!(second.effects.is_empty());
    }

    #[test]
    fn test_stale_ringing_timer_ignored_after_accept() {
        let mut m = machine();
        let out = m.handle(offer("C2", 0), at(0));
        let (call_id, kind, generation, _) = armed(&out).unwrap();

        let out = m.handle(Trigger::AcceptCall { call_id: call_id.clone() }, at(3));
        assert_eq!(m.phase(), CallPhase::Connecting);
        assert_eq!(
            commands(&out),
            vec![SignalingCommand::Accept { call_id: call_id.clone() }]
        );
        let (_, connect_kind, connect_generation, after) = armed(&out).unwrap();
        assert_eq!(connect_kind, TimeoutKind::Connecting);
        assert_eq!(after, std::time::Duration::from_secs(20));
        assert!(connect_generation > generation);

        let out = m.handle(
            Trigger::TimerFired {
                call_id,
                kind,
                generation,
            },
            at(30),
        );
        assert!(out.effects.is_empty());
        assert_eq!(m.phase(), CallPhase::Connecting);
    }

    #[test]
    fn test_connecting_timeout_fails_call() {
        let mut m = machine();
        m.handle(offer("C3", 0), at(0));
        let out = m.handle(Trigger::AcceptCall { call_id: "C3".into() }, at(2));
        let (call_id, kind, generation, _) = armed(&out).unwrap();

        let out = m.handle(
            Trigger::TimerFired {
                call_id,
                kind,
                generation,
            },
            at(22),
        );
        assert_eq!(out.history().next().unwrap().status, CallStatus::Failed);
        assert!(out.effects.contains(&Effect::Media(MediaCommand::Leave)));
        assert_eq!(
            commands(&out),
            vec![SignalingCommand::End {
                call_id: "C3".into(),
                duration_secs: 0
            }]
        );
    }

    #[test]
    fn test_collision_auto_declines_once() {
        let mut m = machine();
        let call_id = outgoing_active(&mut m);

        let out = m.handle(offer("C9", 20), at(20));
        assert_eq!(commands(&out), vec![SignalingCommand::Decline { call_id: "C9".into() }]);
        assert!(out.transitions.is_empty());
        assert_eq!(m.session().unwrap().call_id.as_ref(), Some(&call_id));

        let again = m.handle(offer("C9", 21), at(21));
        assert!(again.effects.is_empty());
    }

    #[test]
    fn test_caller_cancel_while_ringing_is_missed() {
        let mut m = machine();
        m.handle(offer("C4", 0), at(0));

        let out = m.handle(signal(SignalingCallEvent::Cancelled { call_id: "C4".into() }), at(6));
        assert_eq!(out.history().next().unwrap().status, CallStatus::Missed);
        assert!(commands(&out).is_empty());
        assert!(has_notice(&out, &CallNotice::StopRingtone));
    }

    #[test]
    fn test_user_decline_and_wrong_call_id() {
        let mut m = machine();
        m.handle(offer("C5", 0), at(0));

        let out = m.handle(Trigger::AcceptCall { call_id: "other".into() }, at(1));
        assert_eq!(out.result, Err(CallError::NoSuchCall("other".into())));
        assert_eq!(m.phase(), CallPhase::Ringing);

        let out = m.handle(Trigger::DeclineCall { call_id: "C5".into() }, at(2));
        assert_eq!(out.history().next().unwrap().status, CallStatus::Declined);
        assert_eq!(commands(&out), vec![SignalingCommand::Decline { call_id: "C5".into() }]);

        let out = m.handle(Trigger::DeclineCall { call_id: "C5".into() }, at(3));
        assert_eq!(out.result, Err(CallError::NoActiveCall));
        assert!(commands(&out).is_empty());
    }

    #[test]
    fn test_mute_requires_media() {
        let mut m = machine();
        let out = m.handle(Trigger::SetMuted { muted: true }, at(0));
        assert_eq!(out.result, Err(CallError::NoActiveCall));

        outgoing_active(&mut m);
        let out = m.handle(Trigger::SetMuted { muted: true }, at(9));
        assert!(out.result.is_ok());
        assert!(out.effects.contains(&Effect::Media(MediaCommand::Mute(true))));
        assert!(m.session().unwrap().muted);
    }

    #[test]
    fn test_background_keeps_call_and_terminating_ends_it() {
        let mut m = machine();
        outgoing_active(&mut m);

        let out = m.handle(Trigger::Lifecycle(AppLifecycle::Background), at(9));
        assert!(out.effects.is_empty());
        assert_eq!(m.phase(), CallPhase::Active);

        let out = m.handle(Trigger::Lifecycle(AppLifecycle::Terminating), at(18));
        assert!(out.shutdown);
        assert_eq!(m.phase(), CallPhase::Idle);
        assert_eq!(out.history().next().unwrap().duration_secs, 10);
    }

    // ------------------------------------------------------------------------
    // Properties über zufällige Trigger-Folgen
    // ------------------------------------------------------------------------

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Baut aus (Art, Ziel) einen Trigger, der oft die aktuelle Session trifft
        fn build(m: &CallStateMachine, kind: u8, target: u8, counter: usize) -> Trigger {
            let session = m.session();
            let call_id = match (target % 3, session.and_then(|s| s.call_id.clone())) {
                (0, Some(id)) => id,
                (1, _) => CallId::from("pool-1"),
                _ => CallId::new(format!("pool-{}", counter % 4)),
            };

            match kind % 14 {
                0 => Trigger::StartCall {
                    peer: PeerInfo::new("p", "P"),
                    media_kind: MediaKind::Audio,
                    signaling_ready: target % 5 != 0,
                },
                1 => match session {
                    Some(s) => Trigger::ParamsReady {
                        attempt: s.attempt,
                        call_id: CallId::new(format!("out-{}", counter)),
                        params: ConnectionParams::new("r", "t"),
                    },
                    None => Trigger::HangUp,
                },
                2 => match session {
                    Some(s) => Trigger::ParamsFailed {
                        attempt: s.attempt,
                        error: CallError::ParamsUnavailable("x".into()),
                    },
                    None => Trigger::SetMuted { muted: true },
                },
                3 => Trigger::Signaling(SignalingCallEvent::IncomingCall(IncomingCallOffer {
                    call_id: CallId::new(format!("in-{}", counter)),
                    peer: PeerInfo::new("q", "Q"),
                    media_kind: MediaKind::Video,
                    connection_params: ConnectionParams::new("r", "t"),
                    received_at: at(0),
                })),
                4 => Trigger::Signaling(SignalingCallEvent::Accepted { call_id }),
                5 => Trigger::Signaling(SignalingCallEvent::Declined { call_id }),
                6 => Trigger::Signaling(SignalingCallEvent::Ended {
                    call_id,
                    duration_secs: None,
                }),
                7 => Trigger::Signaling(SignalingCallEvent::Cancelled { call_id }),
                8 => Trigger::AcceptCall { call_id },
                9 => Trigger::DeclineCall { call_id },
                10 => Trigger::HangUp,
                11 => Trigger::Media {
                    call_id,
                    event: match target % 3 {
                        0 => MediaEvent::Connected,
                        1 => MediaEvent::Closed,
                        _ => MediaEvent::Failed { reason: "x".into() },
                    },
                },
                12 => match session.and_then(|s| s.timer.map(|t| (s.call_id.clone(), t))) {
                    Some((Some(id), timer)) if target % 2 == 0 => Trigger::TimerFired {
                        call_id: id,
                        kind: timer.kind,
                        generation: timer.generation,
                    },
                    _ => Trigger::TimerFired {
                        call_id,
                        kind: TimeoutKind::Ringing,
                        generation: 0,
                    },
                },
                _ => Trigger::Lifecycle(if target % 2 == 0 {
                    AppLifecycle::Background
                } else {
                    AppLifecycle::Foreground
                }),
            }
        }

        proptest! {
            #[test]
            fn phases_and_history_stay_consistent(ops in prop::collection::vec((any::<u8>(), any::<u8>()), 1..80)) {
                let mut m = machine();
                let mut started = 0usize;
                let mut finished = 0usize;

                for (step, (kind, target)) in ops.into_iter().enumerate() {
                    let trigger = build(&m, kind, target, step);
                    let out = m.handle(trigger, at(step as i64));

                    let mut last = None;
                    for (from, to) in &out.transitions {
                        prop_assert!(from.can_transition_to(*to));
                        if let Some(prev) = last {
                            prop_assert_eq!(prev, *from);
                        }
                        last = Some(*to);
                        if *from == CallPhase::Idle {
                            started += 1;
                        }
                        if *to == CallPhase::Idle {
                            finished += 1;
                        }
                    }

                    let records = out.history().count();
                    let ended_via_ending = out
                        .transitions
                        .iter()
                        .filter(|(from, to)| *from == CallPhase::Ending && *to == CallPhase::Idle)
                        .count();
                    prop_assert_eq!(records, ended_via_ending);
                    prop_assert!(records <= 1);

                    let phase = m.phase();
                    prop_assert!(phase != CallPhase::Ending);
                    match m.session() {
                        Some(session) => {
                            let timer_kind = session.timer.map(|t| t.kind);
                            let expected = match session.phase {
                                CallPhase::Ringing => Some(TimeoutKind::Ringing),
                                CallPhase::Connecting => Some(TimeoutKind::Connecting),
                                _ => None,
                            };
                            prop_assert_eq!(timer_kind, expected);
                        }
                        None => prop_assert_eq!(phase, CallPhase::Idle),
                    }
                }

                let open = usize::from(m.session().is_some());
                prop_assert_eq!(started, finished + open);
            }
        }
    }
}
