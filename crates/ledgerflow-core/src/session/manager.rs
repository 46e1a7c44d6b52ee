// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow-side session bookkeeping.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{SessionEvent, SessionPayload, SessionState, SessionStatus};
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::model::{
    Checkpoint, ConfirmationKind, FlowException, InitiatedBy, Payload, SessionId, SessionInit,
    WaitingFor,
};

/// Applies inbound session messages to a checkpoint and produces outbound ones.
///
/// Stateless apart from its timing configuration; all session state lives in the
/// checkpoint so a replayed event sees exactly what the first attempt saw.
#[derive(Debug, Clone)]
pub struct SessionManager {
    timeout: Duration,
    resend_interval: Duration,
}

impl SessionManager {
    /// Create a manager from engine settings.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.session_timeout,
            resend_interval: config.session_resend_interval,
        }
    }

    /// Open a session from the initiating side. Returns the INIT message.
    pub fn initiate(
        &self,
        checkpoint: &mut Checkpoint,
        init: &SessionInit,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent, FlowException> {
        if init.session_id.is_initiated() {
            return Err(FlowException::session(format!(
                "session id {} is reserved for initiated sessions",
                init.session_id
            )));
        }
        if checkpoint.sessions.contains_key(&init.session_id) {
            return Err(FlowException::session(format!(
                "session {} already exists",
                init.session_id
            )));
        }

        let mut state = SessionState {
            session_id: init.session_id.clone(),
            initiating_identity: checkpoint.flow_key.identity.clone(),
            initiated_identity: init.counterparty.clone(),
            protocol: init.protocol.clone(),
            require_close: init.require_close,
            context: init.context.clone(),
            status: SessionStatus::Pending,
            send_sequence: 0,
            last_contiguous: 0,
            out_of_order: BTreeMap::new(),
            inbox: VecDeque::new(),
            unacked: Vec::new(),
            close_sent: false,
            close_received: false,
            last_received_at: now,
            error: None,
        };

        let event = state.outbound(
            SessionPayload::Init {
                protocol: init.protocol.clone(),
                require_close: init.require_close,
                context: init.context.clone(),
            },
            now,
        );
        checkpoint.sessions.insert(init.session_id.clone(), state);
        Ok(event)
    }

    /// Create the initiated end from an inbound INIT. Returns the start context
    /// of the responder flow and the ACK to send.
    pub fn accept(
        &self,
        checkpoint: &mut Checkpoint,
        event: &SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<(InitiatedBy, SessionEvent), PipelineError> {
        let SessionPayload::Init {
            protocol,
            require_close,
            context,
        } = &event.payload
        else {
            return Err(PipelineError::fatal(format!(
                "session {} cannot be accepted from a {} message",
                event.session_id,
                event.payload.name()
            )));
        };

        let mut state = SessionState {
            session_id: event.session_id.clone(),
            initiating_identity: event.initiating_identity.clone(),
            initiated_identity: event.initiated_identity.clone(),
            protocol: protocol.clone(),
            require_close: *require_close,
            context: context.clone(),
            status: SessionStatus::Confirmed,
            send_sequence: 0,
            last_contiguous: event.sequence,
            out_of_order: BTreeMap::new(),
            inbox: VecDeque::new(),
            unacked: Vec::new(),
            close_sent: false,
            close_received: false,
            last_received_at: now,
            error: None,
        };
        let ack = state.outbound(SessionPayload::Ack, now);

        let initiated_by = InitiatedBy {
            session_id: event.session_id.clone(),
            counterparty: event.initiating_identity.clone(),
            context: context.clone(),
        };
        checkpoint.sessions.insert(event.session_id.clone(), state);
        Ok((initiated_by, ack))
    }

    /// Apply an inbound message.
    ///
    /// Replies (acks, errors) are appended to `out` even when an error is
    /// returned, so the hospital can publish them on abort.
    pub fn receive(
        &self,
        checkpoint: &mut Checkpoint,
        event: &SessionEvent,
        now: DateTime<Utc>,
        out: &mut Vec<SessionEvent>,
    ) -> Result<(), PipelineError> {
        let Some(state) = checkpoint.sessions.get_mut(&event.session_id) else {
            if matches!(event.payload, SessionPayload::Error { .. }) {
                debug!(session_id = %event.session_id, "Error for unknown session ignored");
                return Ok(());
            }
            // Tell the sender this end does not exist, then abort the event.
            out.push(SessionEvent {
                session_id: event.session_id.clone(),
                sequence: 0,
                received_sequence: 0,
                initiating_identity: event.initiating_identity.clone(),
                initiated_identity: event.initiated_identity.clone(),
                payload: SessionPayload::Error {
                    error: FlowException::session(format!(
                        "session {} does not exist",
                        event.session_id
                    )),
                },
                timestamp: now,
            });
            return Err(PipelineError::abort(format!(
                "{} message for unknown session {}",
                event.payload.name(),
                event.session_id
            )));
        };

        state.last_received_at = now;
        state.trim_unacked(event.received_sequence);

        match &event.payload {
            SessionPayload::Ack => {
                if state.status == SessionStatus::Pending && event.received_sequence >= 1 {
                    state.status = SessionStatus::Confirmed;
                }
                Ok(())
            }
            SessionPayload::Error { error } => {
                if state.mark_errored(error.clone()) {
                    warn!(
                        session_id = %state.session_id,
                        error = %error,
                        "Session errored by counterparty"
                    );
                }
                Ok(())
            }
            _ => {
                if event.sequence <= state.last_contiguous
                    || state.out_of_order.contains_key(&event.sequence)
                {
                    // The sender resends until acknowledged, so a lost ACK must be repeated.
                    debug!(
                        session_id = %state.session_id,
                        sequence = event.sequence,
                        "Duplicate session message acknowledged again"
                    );
                    if state.status != SessionStatus::Errored {
                        out.push(state.outbound(SessionPayload::Ack, now));
                    }
                    return Ok(());
                }
                if !state.is_active() {
                    debug!(
                        session_id = %state.session_id,
                        status = state.status.as_str(),
                        "Message for terminated session dropped"
                    );
                    return Ok(());
                }

                if state.status == SessionStatus::Pending {
                    state.status = SessionStatus::Confirmed;
                }
                state.out_of_order.insert(event.sequence, event.clone());

                while let Some(next) = state.out_of_order.remove(&(state.last_contiguous + 1)) {
                    state.last_contiguous = next.sequence;
                    match next.payload {
                        SessionPayload::Data { payload } => state.inbox.push_back(payload),
                        SessionPayload::Close => state.close_received = true,
                        _ => {}
                    }
                }
                state.refresh_close_status();

                out.push(state.outbound(SessionPayload::Ack, now));
                Ok(())
            }
        }
    }

    /// Queue one DATA message.
    pub fn send(
        &self,
        checkpoint: &mut Checkpoint,
        session_id: &SessionId,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent, FlowException> {
        let state = session_mut(checkpoint, session_id)?;
        if let Some(failure) = state.failure() {
            return Err(failure);
        }
        if state.close_sent || !state.is_active() {
            return Err(FlowException::session(format!(
                "cannot send on session {} in state {}",
                session_id,
                state.status.as_str()
            )));
        }
        Ok(state.outbound(SessionPayload::Data { payload }, now))
    }

    /// Close this end. Idempotent; returns the CLOSE message when one is sent.
    pub fn close(
        &self,
        checkpoint: &mut Checkpoint,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionEvent>, FlowException> {
        let state = session_mut(checkpoint, session_id)?;
        if !state.is_active() || state.close_sent {
            return Ok(None);
        }
        let event = state.outbound(SessionPayload::Close, now);
        state.close_sent = true;
        state.refresh_close_status();
        Ok(Some(event))
    }

    /// Close every active session without waiting for the counterparty.
    pub fn close_all(&self, checkpoint: &mut Checkpoint, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let ids: Vec<SessionId> = checkpoint.sessions.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.close(checkpoint, id, now).ok().flatten())
            .collect()
    }

    /// Error every active session and notify the counterparties.
    pub fn error_all(
        &self,
        checkpoint: &mut Checkpoint,
        error: &FlowException,
        now: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        checkpoint
            .sessions
            .values_mut()
            .filter_map(|state| {
                if !state.mark_errored(error.clone()) {
                    return None;
                }
                Some(state.outbound(
                    SessionPayload::Error {
                        error: error.clone(),
                    },
                    now,
                ))
            })
            .collect()
    }

    /// Error sessions the flow is suspended on that have been silent too long.
    pub fn check_timeouts(
        &self,
        checkpoint: &mut Checkpoint,
        now: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        let timeout = chrono_duration(self.timeout);
        let waited: Vec<SessionId> = checkpoint.waiting_for.session_ids().to_vec();
        let mut out = Vec::new();

        for id in waited {
            let Some(state) = checkpoint.sessions.get_mut(&id) else {
                continue;
            };
            if !state.is_active() || state.last_received_at + timeout > now {
                continue;
            }
            let error = FlowException::session(format!(
                "session {} timed out after {:?} without activity",
                id, self.timeout
            ));
            warn!(session_id = %id, "Session timed out");
            state.mark_errored(error.clone());
            out.push(state.outbound(SessionPayload::Error { error }, now));
        }
        out
    }

    /// Messages unacknowledged for longer than the resend interval, stamped for resending.
    pub fn due_resends(&self, checkpoint: &mut Checkpoint, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let interval = chrono_duration(self.resend_interval);
        let mut out = Vec::new();

        for state in checkpoint.sessions.values_mut() {
            if !state.is_active() {
                continue;
            }
            let last_contiguous = state.last_contiguous;
            for message in state.unacked.iter_mut() {
                if message.sent_at + interval > now {
                    continue;
                }
                message.sent_at = now;
                message.event.received_sequence = last_contiguous;
                message.event.timestamp = now;
                out.push(message.event.clone());
            }
        }
        out
    }

    /// Earliest instant at which a timeout or resend becomes due.
    pub fn next_deadline(&self, checkpoint: &Checkpoint) -> Option<DateTime<Utc>> {
        let timeout = chrono_duration(self.timeout);
        let interval = chrono_duration(self.resend_interval);

        let timeouts = checkpoint
            .waiting_for
            .session_ids()
            .iter()
            .filter_map(|id| checkpoint.sessions.get(id))
            .filter(|state| state.is_active())
            .map(|state| state.last_received_at + timeout);

        let resends = checkpoint
            .sessions
            .values()
            .filter(|state| state.is_active())
            .flat_map(|state| state.unacked.iter())
            .map(|message| message.sent_at + interval);

        timeouts.chain(resends).min()
    }

    /// Take one in-order message from every listed session.
    ///
    /// `Ok(None)` means at least one session has nothing buffered yet.
    pub fn take_data(
        &self,
        checkpoint: &mut Checkpoint,
        session_ids: &[SessionId],
    ) -> Result<Option<BTreeMap<SessionId, Payload>>, FlowException> {
        let mut ready = true;
        for id in session_ids {
            let state = checkpoint
                .sessions
                .get(id)
                .ok_or_else(|| unknown_session(id))?;
            if let Some(failure) = state.failure() {
                return Err(failure);
            }
            if state.inbox.is_empty() {
                ready = false;
            }
        }
        if !ready {
            return Ok(None);
        }

        let mut messages = BTreeMap::new();
        for id in session_ids {
            if let Some(payload) = checkpoint
                .sessions
                .get_mut(id)
                .and_then(|state| state.inbox.pop_front())
            {
                messages.insert(id.clone(), payload);
            }
        }
        Ok(Some(messages))
    }

    /// Whether every listed session reached the awaited confirmation.
    ///
    /// `Ok(false)` means still waiting.
    pub fn confirmed(
        &self,
        checkpoint: &Checkpoint,
        waiting_for: &WaitingFor,
    ) -> Result<bool, FlowException> {
        let WaitingFor::SessionConfirmation { session_ids, kind } = waiting_for else {
            return Ok(false);
        };
        let mut done = true;
        for id in session_ids {
            let state = checkpoint
                .sessions
                .get(id)
                .ok_or_else(|| unknown_session(id))?;
            match (state.status, kind) {
                (SessionStatus::Errored, _) => {
                    return Err(state
                        .failure()
                        .unwrap_or_else(|| FlowException::session("session errored")));
                }
                (SessionStatus::Pending, _) => done = false,
                (SessionStatus::Closed, _) => {}
                (_, ConfirmationKind::Close) => done = false,
                _ => {}
            }
        }
        Ok(done)
    }
}

fn session_mut<'a>(
    checkpoint: &'a mut Checkpoint,
    session_id: &SessionId,
) -> Result<&'a mut SessionState, FlowException> {
    checkpoint
        .sessions
        .get_mut(session_id)
        .ok_or_else(|| unknown_session(session_id))
}

fn unknown_session(session_id: &SessionId) -> FlowException {
    FlowException::session(format!("unknown session {}", session_id))
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowKey, HoldingIdentity, StartContext};

    fn alice() -> HoldingIdentity {
        HoldingIdentity::new("O=Alice, L=London, C=GB", "group")
    }

    fn bob() -> HoldingIdentity {
        HoldingIdentity::new("O=Bob, L=Paris, C=FR", "group")
    }

    fn checkpoint(id: &str, identity: HoldingIdentity) -> Checkpoint {
        Checkpoint::new(
            FlowKey::new(id, identity),
            "demo",
            StartContext::default(),
            Utc::now(),
        )
    }

    fn manager() -> SessionManager {
        SessionManager::new(&EngineConfig {
            session_timeout: Duration::from_secs(60),
            session_resend_interval: Duration::from_secs(5),
            ..EngineConfig::default()
        })
    }

    fn init(require_close: bool) -> SessionInit {
        SessionInit {
            session_id: SessionId::new("s1"),
            counterparty: bob(),
            protocol: "responder".to_string(),
            require_close,
            context: BTreeMap::new(),
        }
    }

    fn status(cp: &Checkpoint, id: &str) -> SessionStatus {
        cp.sessions[&SessionId::new(id)].status
    }

    /// Deliver an outbound message to the other end, returning the replies.
    fn deliver(
        m: &SessionManager,
        to: &mut Checkpoint,
        event: &SessionEvent,
    ) -> Result<Vec<SessionEvent>, PipelineError> {
        let mut out = Vec::new();
        m.receive(to, &event.flipped(), Utc::now(), &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_end_to_end_mutual_close() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());

        assert!(f.sessions.is_empty());
        let init_event = m.initiate(&mut f, &init(true), now).unwrap();
        assert_eq!(status(&f, "s1"), SessionStatus::Pending);
        assert_eq!(init_event.sequence, 1);

        let (initiated_by, ack) = m.accept(&mut c, &init_event.flipped(), now).unwrap();
        assert_eq!(initiated_by.counterparty, alice());
        assert_eq!(status(&c, "s1-INITIATED"), SessionStatus::Confirmed);

        deliver(&m, &mut f, &ack).unwrap();
        assert_eq!(status(&f, "s1"), SessionStatus::Confirmed);
        assert!(f.sessions[&SessionId::new("s1")].unacked.is_empty());

        let data = m
            .send(&mut c, &SessionId::new("s1-INITIATED"), Payload::from("ack-payload"), now)
            .unwrap();
        let replies = deliver(&m, &mut f, &data).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, SessionPayload::Ack);

        let received = m
            .take_data(&mut f, &[SessionId::new("s1")])
            .unwrap()
            .unwrap();
        assert_eq!(received[&SessionId::new("s1")], Payload::from("ack-payload"));

        let close = m.close(&mut f, &SessionId::new("s1"), now).unwrap().unwrap();
        assert_eq!(status(&f, "s1"), SessionStatus::Closing);

        deliver(&m, &mut c, &close).unwrap();
        assert_eq!(status(&c, "s1-INITIATED"), SessionStatus::Closing);
        let reply = m
            .close(&mut c, &SessionId::new("s1-INITIATED"), now)
            .unwrap()
            .unwrap();
        assert_eq!(status(&c, "s1-INITIATED"), SessionStatus::Closed);

        deliver(&m, &mut f, &reply).unwrap();
        assert_eq!(status(&f, "s1"), SessionStatus::Closed);

        let waiting = WaitingFor::SessionConfirmation {
            session_ids: vec![SessionId::new("s1")],
            kind: ConfirmationKind::Close,
        };
        assert!(m.confirmed(&f, &waiting).unwrap());
    }

    #[test]
    fn test_single_close_closes_both_ends() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());

        let init_event = m.initiate(&mut f, &init(false), now).unwrap();
        m.accept(&mut c, &init_event.flipped(), now).unwrap();

        let close = m.close(&mut f, &SessionId::new("s1"), now).unwrap().unwrap();
        assert_eq!(status(&f, "s1"), SessionStatus::Closed);
        deliver(&m, &mut c, &close).unwrap();
        assert_eq!(status(&c, "s1-INITIATED"), SessionStatus::Closed);
        assert!(m.close(&mut c, &SessionId::new("s1-INITIATED"), now).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_data_delivered_and_acked_once() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());
        let init_event = m.initiate(&mut f, &init(true), now).unwrap();
        m.accept(&mut c, &init_event.flipped(), now).unwrap();

        let data = m
            .send(&mut c, &SessionId::new("s1-INITIATED"), Payload::from("once"), now)
            .unwrap();
        let first = deliver(&m, &mut f, &data).unwrap();
        let second = deliver(&m, &mut f, &data).unwrap();

        // Delivered to the flow once, acknowledged every time
        assert_eq!(f.sessions[&SessionId::new("s1")].inbox.len(), 1);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        for ack in first.iter().chain(&second) {
            assert_eq!(ack.payload, SessionPayload::Ack);
            assert_eq!(ack.sequence, 0);
            assert_eq!(ack.received_sequence, data.sequence);
        }
        // Acks do not consume sequence numbers
        assert_eq!(f.sessions[&SessionId::new("s1")].send_sequence, 1);
    }

    #[test]
    fn test_resend_after_lost_ack_is_acknowledged() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());
        let init_event = m.initiate(&mut f, &init(true), now).unwrap();
        let (_, accept_ack) = m.accept(&mut c, &init_event.flipped(), now).unwrap();
        deliver(&m, &mut f, &accept_ack).unwrap();

        let responder = SessionId::new("s1-INITIATED");
        let data = m.send(&mut c, &responder, Payload::from("hello"), now).unwrap();
        assert_eq!(c.sessions[&responder].unacked.len(), 1);

        // Delivered, but the ACK never reaches the sender
        let lost = deliver(&m, &mut f, &data).unwrap();
        assert_eq!(lost.len(), 1);

        // The sender resends once the interval passes
        let later = now + chrono_duration(m.resend_interval) + chrono::Duration::milliseconds(1);
        let resent = m.due_resends(&mut c, later);
        assert_eq!(resent.len(), 1);
        let acks = deliver(&m, &mut f, &resent[0]).unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].received_sequence, data.sequence);
        assert_eq!(f.sessions[&SessionId::new("s1")].inbox.len(), 1);

        // The repeated ACK trims the sender's buffer and stops the resends
        deliver(&m, &mut c, &acks[0]).unwrap();
        assert!(c.sessions[&responder].unacked.is_empty());
        assert!(m.due_resends(&mut c, later + chrono_duration(m.resend_interval) * 10).is_empty());
    }

    #[test]
    fn test_out_of_order_data_is_reordered() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());
        let init_event = m.initiate(&mut f, &init(true), now).unwrap();
        m.accept(&mut c, &init_event.flipped(), now).unwrap();

        let id = SessionId::new("s1-INITIATED");
        let one = m.send(&mut c, &id, Payload::from("one"), now).unwrap();
        let two = m.send(&mut c, &id, Payload::from("two"), now).unwrap();

        let acks_two = deliver(&m, &mut f, &two).unwrap();
        assert_eq!(acks_two[0].received_sequence, 0);
        assert!(f.sessions[&SessionId::new("s1")].inbox.is_empty());

        let acks_one = deliver(&m, &mut f, &one).unwrap();
        assert_eq!(acks_one[0].received_sequence, 2);

        let inbox: Vec<_> = f.sessions[&SessionId::new("s1")].inbox.iter().cloned().collect();
        assert_eq!(inbox, vec![Payload::from("one"), Payload::from("two")]);
    }

    #[test]
    fn test_unknown_session_aborts_with_error_reply() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let stray = SessionEvent {
            session_id: SessionId::new("ghost"),
            sequence: 3,
            received_sequence: 0,
            initiating_identity: alice(),
            initiated_identity: bob(),
            payload: SessionPayload::Data {
                payload: Payload::from("?"),
            },
            timestamp: now,
        };

        let mut out = Vec::new();
        let err = m.receive(&mut f, &stray, now, &mut out).unwrap_err();
        assert!(matches!(err, PipelineError::Abort(_)));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].payload, SessionPayload::Error { .. }));
    }

    #[test]
    fn test_error_from_counterparty_fails_receive() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        let mut c = checkpoint("c", bob());
        let init_event = m.initiate(&mut f, &init(true), now).unwrap();
        m.accept(&mut c, &init_event.flipped(), now).unwrap();

        let errors = m.error_all(&mut c, &FlowException::user("boom"), now);
        assert_eq!(errors.len(), 1);
        deliver(&m, &mut f, &errors[0]).unwrap();

        assert_eq!(status(&f, "s1"), SessionStatus::Errored);
        let err = m.take_data(&mut f, &[SessionId::new("s1")]).unwrap_err();
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_waited_session_times_out() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        m.initiate(&mut f, &init(true), now).unwrap();
        f.waiting_for = WaitingFor::SessionData {
            session_ids: vec![SessionId::new("s1")],
        };

        assert!(m.check_timeouts(&mut f, now).is_empty());
        let later = now + chrono::Duration::seconds(61);
        let errors = m.check_timeouts(&mut f, later);
        assert_eq!(errors.len(), 1);
        assert_eq!(status(&f, "s1"), SessionStatus::Errored);
    }

    #[test]
    fn test_resend_after_interval() {
        let m = manager();
        let now = Utc::now();
        let mut f = checkpoint("f", alice());
        m.initiate(&mut f, &init(true), now).unwrap();

        assert_eq!(
            m.next_deadline(&f),
            Some(now + chrono::Duration::seconds(5))
        );
        assert!(m.due_resends(&mut f, now).is_empty());
        let resent = m.due_resends(&mut f, now + chrono::Duration::seconds(6));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence, 1);
    }
}
