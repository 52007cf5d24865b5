//! Call signaling: a per-pair state machine that relays call setup,
//! negotiation payloads and teardown between two users.
//!
//! Sessions are keyed by the sorted pair of participant ids, so a lookup
//! never depends on who sent the frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use courier_shared::envelope::{CallAction, CallMsg};
use courier_shared::error::{ChatError, ChatResult};
use courier_shared::types::UserId;

/// Canonical key of a two-party session: the smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey(UserId, UserId);

impl CallKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Ringing,
    Accepted,
    Negotiating,
    Active,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub caller: UserId,
    pub callee: UserId,
    pub phase: CallPhase,
    /// Last phase change; expiry counts from here.
    pub phase_since: DateTime<Utc>,
    /// Set on the first transition into `Negotiating`.
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.phase != CallPhase::Active && now - self.phase_since >= timeout
    }

    fn peer_of(&self, user: UserId) -> UserId {
        if user == self.caller {
            self.callee
        } else {
            self.caller
        }
    }

    fn advance(&mut self, phase: CallPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.phase_since = now;
    }
}

/// A signal to deliver to one participant. `actor` is the participant the
/// signal is attributed to and `counterpart` the other one.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSignal {
    pub to: UserId,
    pub actor: UserId,
    pub counterpart: UserId,
    pub msg: CallMsg,
}

/// Record of a finished call, to be stored as a direct message from the
/// caller to the callee.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub caller: UserId,
    pub callee: UserId,
    pub msg: CallMsg,
}

#[derive(Debug, Default)]
pub struct CallOutcome {
    pub signals: Vec<CallSignal>,
    pub record: Option<CallRecord>,
}

#[derive(Clone)]
pub struct CallCoordinator {
    sessions: Arc<Mutex<HashMap<CallKey, CallSession>>>,
    ring_timeout: chrono::Duration,
}

impl CallCoordinator {
    pub fn new(ring_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ring_timeout: chrono::Duration::from_std(ring_timeout)
                .unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    /// Apply a client call action sent by `from` to `to`.
    pub async fn handle(
        &self,
        from: UserId,
        to: UserId,
        msg: &CallMsg,
        now: DateTime<Utc>,
    ) -> ChatResult<CallOutcome> {
        if from == to {
            return Err(ChatError::validation("you cannot call yourself"));
        }

        let key = CallKey::new(from, to);
        let mut sessions = self.sessions.lock().await;

        // Expired sessions count as absent.
        if sessions
            .get(&key)
            .map_or(false, |s| s.is_expired(now, self.ring_timeout))
        {
            sessions.remove(&key);
            debug!(caller = %key.0, callee = %key.1, "Dropped expired call session");
        }

        if msg.action == CallAction::Start {
            if sessions.contains_key(&key) {
                return Err(ChatError::conflict("a call between you is already in progress"));
            }
            sessions.insert(
                key,
                CallSession {
                    caller: from,
                    callee: to,
                    phase: CallPhase::Ringing,
                    phase_since: now,
                    started_at: None,
                },
            );
            info!(caller = %from, callee = %to, "Call started");
            let waiting = CallMsg::signal(CallAction::Waiting)
                .with_notice("waiting for the other side to answer");
            return Ok(CallOutcome {
                signals: vec![
                    signal(from, from, to, waiting),
                    signal(to, from, to, CallMsg::signal(CallAction::Incoming)),
                ],
                record: None,
            });
        }

        let session = sessions
            .get_mut(&key)
            .ok_or_else(|| ChatError::conflict("no active call session"))?;
        let is_caller = from == session.caller;
        let peer = session.peer_of(from);
        let relay = |action: CallAction| {
            signal(peer, from, peer, CallMsg::signal(action).with_data(msg.data.clone()))
        };

        let mut outcome = CallOutcome::default();
        match msg.action {
            CallAction::Accept => {
                require_role(!is_caller, "only the callee can accept")?;
                require_phase(session, &[CallPhase::Ringing])?;
                session.advance(CallPhase::Accepted, now);
                outcome
                    .signals
                    .push(signal(peer, from, peer, CallMsg::signal(CallAction::CreateOffer)));
            }
            CallAction::Offer => {
                require_role(is_caller, "only the caller can send an offer")?;
                require_phase(session, &[CallPhase::Accepted, CallPhase::Negotiating])?;
                if session.started_at.is_none() {
                    session.started_at = Some(now);
                }
                session.advance(CallPhase::Negotiating, now);
                outcome.signals.push(relay(CallAction::Offer));
            }
            CallAction::Answer => {
                require_role(!is_caller, "only the callee can answer")?;
                require_phase(session, &[CallPhase::Negotiating])?;
                session.advance(CallPhase::Active, now);
                outcome.signals.push(relay(CallAction::Answer));
            }
            CallAction::OfferIce | CallAction::AnswerIce => {
                require_phase(
                    session,
                    &[CallPhase::Accepted, CallPhase::Negotiating, CallPhase::Active],
                )?;
                outcome.signals.push(relay(msg.action));
            }
            CallAction::Cancel => {
                require_role(is_caller, "only the caller can cancel")?;
                require_phase(
                    session,
                    &[CallPhase::Ringing, CallPhase::Accepted, CallPhase::Negotiating],
                )?;
                outcome.signals.push(signal(
                    peer,
                    from,
                    peer,
                    CallMsg::signal(CallAction::Cancelled).with_notice("the caller hung up"),
                ));
                sessions.remove(&key);
            }
            CallAction::Reject => {
                require_role(!is_caller, "only the callee can decline")?;
                require_phase(session, &[CallPhase::Ringing, CallPhase::Accepted])?;
                outcome.signals.push(signal(
                    peer,
                    from,
                    peer,
                    CallMsg::signal(CallAction::Rejected).with_notice("the call was declined"),
                ));
                sessions.remove(&key);
            }
            CallAction::Leave => {
                require_role(!is_caller, "only the callee can leave")?;
                require_phase(session, &[CallPhase::Negotiating, CallPhase::Active])?;
                outcome.signals.push(signal(
                    peer,
                    from,
                    peer,
                    CallMsg::signal(CallAction::PeerLeft).with_notice("the other side hung up"),
                ));
                sessions.remove(&key);
            }
            CallAction::HangUp => {
                require_phase(session, &[CallPhase::Negotiating, CallPhase::Active])?;
                let started = session.started_at.unwrap_or(now);
                // The record itself carries `ended` to both participants.
                outcome.record = Some(CallRecord {
                    caller: session.caller,
                    callee: session.callee,
                    msg: CallMsg::record(started, now),
                });
                info!(
                    caller = %session.caller,
                    callee = %session.callee,
                    duration_secs = (now - started).num_seconds(),
                    "Call ended"
                );
                sessions.remove(&key);
            }
            CallAction::Start
            | CallAction::Waiting
            | CallAction::Incoming
            | CallAction::CreateOffer
            | CallAction::Cancelled
            | CallAction::Rejected
            | CallAction::PeerLeft
            | CallAction::Ended
            | CallAction::TimedOut => {
                return Err(ChatError::validation("unsupported call action"));
            }
        }

        Ok(outcome)
    }

    /// Remove sessions that did not become active in time. Both
    /// participants are told the call timed out.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Vec<CallSignal> {
        let mut sessions = self.sessions.lock().await;
        let mut signals = Vec::new();
        sessions.retain(|_, session| {
            if !session.is_expired(now, self.ring_timeout) {
                return true;
            }
            info!(caller = %session.caller, callee = %session.callee, "Call session timed out");
            for to in [session.caller, session.callee] {
                signals.push(signal(
                    to,
                    session.caller,
                    session.callee,
                    CallMsg::signal(CallAction::TimedOut).with_notice("the call was not answered"),
                ));
            }
            false
        });
        signals
    }

    /// End every session `user` takes part in; each peer is told the user left.
    pub async fn end_sessions_for(&self, user: UserId) -> Vec<CallSignal> {
        let mut sessions = self.sessions.lock().await;
        let mut signals = Vec::new();
        sessions.retain(|_, session| {
            if session.caller != user && session.callee != user {
                return true;
            }
            let peer = session.peer_of(user);
            info!(user = %user, peer = %peer, "Ending call session of offline user");
            signals.push(signal(
                peer,
                user,
                peer,
                CallMsg::signal(CallAction::PeerLeft).with_notice("the other side went offline"),
            ));
            false
        });
        signals
    }

    pub async fn session(&self, a: UserId, b: UserId) -> Option<CallSession> {
        self.sessions.lock().await.get(&CallKey::new(a, b)).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn signal(to: UserId, actor: UserId, counterpart: UserId, msg: CallMsg) -> CallSignal {
    CallSignal {
        to,
        actor,
        counterpart,
        msg,
    }
}

fn require_role(ok: bool, msg: &str) -> ChatResult<()> {
    if ok {
        Ok(())
    } else {
        Err(ChatError::forbidden(msg))
    }
}

fn require_phase(session: &CallSession, allowed: &[CallPhase]) -> ChatResult<()> {
    if allowed.contains(&session.phase) {
        Ok(())
    } else {
        Err(ChatError::conflict(format!(
            "call signal not allowed while {:?}",
            session.phase
        )))
    }
}
