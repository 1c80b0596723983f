//! Session state machines for the two protocol roles.
//!
//! The initiator (a client) is stateful: it opens with a frame covering the
//! full key space, then answers every responder frame until a round settles.
//! The responder (a relay, or a peer replica serving a sync) is stateless
//! per frame, which is what lets one relay serve any number of concurrent
//! initiators without session storage.
//!
//! ```text
//!       ┌──────────┐  key accepted     ┌──────────┐  ranges settle   ┌────────┐
//! Start │ OPENING  │──────────────────▶│ SYNCING  │─────────────────▶│ CLOSED │
//!       └─────┬────┘                   └────┬─────┘                  └────────┘
//!             │ bad key / bad version       │ protocol / transport error
//!             ▼                             ▼
//!          ERRORED ◀────────────────────────┘
//! ```

use evolu_core::{EncryptedMessage, EvoluError, OwnerId, Timestamp};
use evolu_crypto::WriteKey;
use tracing::{debug, warn};

use crate::messages::{ErrorCode, ProtocolMessage, RangeEntry};
use crate::reconcile::{FrameOutcome, ReconcileConfig, Reconciler, WriteGuard};
use crate::store::MessageStore;

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, opening frame not yet sent.
    Opening,
    /// Reconciliation rounds in flight.
    Syncing,
    /// Settled cleanly.
    Closed,
    /// Terminated by an error; the orchestrator may open a new session.
    Errored,
}

/// Hard cap on rounds per session; reconciliation converges in
/// O(log |Δ|) rounds, so hitting this means a peer is misbehaving.
pub const MAX_ROUNDS: u32 = 64;

/// What the initiator should do after handling a responder frame.
#[derive(Debug)]
pub struct SessionStep {
    /// Next frame to send, absent when the session closed.
    pub reply: Option<ProtocolMessage>,
    /// Timestamps newly persisted by this frame, ascending.
    pub applied: Vec<Timestamp>,
    /// True when the session reached [`SessionPhase::Closed`].
    pub done: bool,
}

/// Client side of one reconciliation session over one owner.
pub struct InitiatorSession {
    owner: OwnerId,
    write_key: WriteKey,
    next_write_key: Option<WriteKey>,
    config: ReconcileConfig,
    phase: SessionPhase,
    rounds: u32,
}

impl InitiatorSession {
    /// New session for an owner.
    pub fn new(owner: OwnerId, write_key: WriteKey, config: ReconcileConfig) -> Self {
        Self {
            owner,
            write_key,
            next_write_key: None,
            config,
            phase: SessionPhase::Opening,
            rounds: 0,
        }
    }

    /// Request a write-key rotation with the opening frame.
    pub fn with_rotation(mut self, next: WriteKey) -> Self {
        self.next_write_key = Some(next);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Rounds completed so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Build the opening frame: the full key space plus queued local
    /// messages (`pending`, ascending) pushed eagerly.
    pub fn begin<S: MessageStore + ?Sized>(
        &mut self,
        store: &mut S,
        pending: &[EncryptedMessage],
    ) -> Result<ProtocolMessage, EvoluError> {
        if self.phase != SessionPhase::Opening {
            return Err(EvoluError::protocol("session already begun"));
        }
        let ranges =
            Reconciler::new(store, self.owner, self.config).initial_entries(pending)?;
        self.phase = SessionPhase::Syncing;
        debug!(owner = %self.owner, entries = ranges.len(), pending = pending.len(), "session opening");
        Ok(self.frame(ranges))
    }

    /// Handle a responder frame, applying pushed messages and producing the
    /// next step. `guard` vets every incoming timestamp before persistence.
    pub fn handle<S: MessageStore + ?Sized>(
        &mut self,
        store: &mut S,
        message: ProtocolMessage,
        guard: Option<WriteGuard<'_>>,
    ) -> Result<SessionStep, EvoluError> {
        if self.phase != SessionPhase::Syncing {
            return Err(EvoluError::protocol("frame outside an active session"));
        }
        match message {
            ProtocolMessage::NonInitiator { owner, ranges } => {
                if owner != self.owner {
                    self.phase = SessionPhase::Errored;
                    return Err(EvoluError::protocol("responder switched owners"));
                }
                self.rounds += 1;
                if self.rounds > MAX_ROUNDS {
                    self.phase = SessionPhase::Errored;
                    return Err(EvoluError::protocol("reconciliation did not converge"));
                }
                // The first accepted reply also confirms a requested
                // rotation took hold; authorize later frames with the new key.
                if let Some(next) = self.next_write_key.take() {
                    self.write_key = next;
                }
                let outcome = self.process(store, &ranges, guard)?;
                if outcome.is_settled() {
                    self.phase = SessionPhase::Closed;
                    debug!(owner = %self.owner, rounds = self.rounds, "session settled");
                    return Ok(SessionStep {
                        reply: None,
                        applied: outcome.applied,
                        done: true,
                    });
                }
                Ok(SessionStep {
                    reply: Some(self.frame(outcome.response)),
                    applied: outcome.applied,
                    done: false,
                })
            }
            ProtocolMessage::Error { code, detail } => {
                self.phase = SessionPhase::Errored;
                warn!(owner = %self.owner, ?code, detail = %detail, "responder reported an error");
                Err(code.to_error(&detail))
            }
            ProtocolMessage::Initiator { .. } => {
                self.phase = SessionPhase::Errored;
                Err(EvoluError::protocol("initiator frame from responder"))
            }
        }
    }

    fn process<S: MessageStore + ?Sized>(
        &mut self,
        store: &mut S,
        ranges: &[RangeEntry],
        guard: Option<WriteGuard<'_>>,
    ) -> Result<FrameOutcome, EvoluError> {
        let result =
            Reconciler::new(store, self.owner, self.config).process_entries(ranges, guard);
        if result.is_err() {
            self.phase = SessionPhase::Errored;
        }
        result
    }

    fn frame(&self, ranges: Vec<RangeEntry>) -> ProtocolMessage {
        ProtocolMessage::Initiator {
            owner: self.owner,
            write_key: self.write_key.clone(),
            next_write_key: self.next_write_key.clone(),
            ranges,
        }
    }
}

/// What one responder turn produced: the reply frame plus the timestamps
/// this frame actually persisted. An error reply always carries an empty
/// `applied` list, since a rejected frame writes nothing.
#[derive(Debug)]
pub struct ResponderStep {
    /// Frame to send back.
    pub reply: ProtocolMessage,
    /// Timestamps newly written to storage by this frame, ascending.
    pub applied: Vec<Timestamp>,
}

impl ResponderStep {
    fn error(reply: ProtocolMessage) -> Self {
        Self {
            reply,
            applied: Vec::new(),
        }
    }
}

/// Stateless responder: one frame in, one frame out.
///
/// Returns `None` when the connection should just close (the peer sent an
/// error frame; there is nothing useful to answer).
pub fn respond<S: MessageStore + ?Sized>(
    store: &mut S,
    message: ProtocolMessage,
    config: ReconcileConfig,
) -> Option<ResponderStep> {
    match message {
        ProtocolMessage::Initiator {
            owner,
            write_key,
            next_write_key,
            ranges,
        } => Some(respond_initiator(
            store,
            owner,
            &write_key,
            next_write_key.as_ref(),
            &ranges,
            config,
        )),
        ProtocolMessage::NonInitiator { .. } => {
            Some(ResponderStep::error(ProtocolMessage::Error {
                code: ErrorCode::Protocol,
                detail: "unexpected non-initiator frame".to_string(),
            }))
        }
        ProtocolMessage::Error { code, detail } => {
            warn!(?code, detail = %detail, "peer reported an error");
            None
        }
    }
}

fn respond_initiator<S: MessageStore + ?Sized>(
    store: &mut S,
    owner: OwnerId,
    write_key: &WriteKey,
    next_write_key: Option<&WriteKey>,
    ranges: &[RangeEntry],
    config: ReconcileConfig,
) -> ResponderStep {
    // Authorization comes first: an invalid key must leave storage
    // byte-for-byte untouched.
    match store.validate_write_key(&owner, write_key) {
        Ok(true) => {}
        Ok(false) => {
            warn!(owner = %owner, "write key rejected");
            return ResponderStep::error(ProtocolMessage::Error {
                code: ErrorCode::WriteKeyInvalid,
                detail: "write key does not match".to_string(),
            });
        }
        Err(err) => return ResponderStep::error(error_frame(&err)),
    }

    if let Some(next) = next_write_key {
        match store.rotate_write_key(&owner, write_key, next) {
            Ok(true) => debug!(owner = %owner, "write key rotated"),
            Ok(false) => {
                return ResponderStep::error(ProtocolMessage::Error {
                    code: ErrorCode::WriteKeyInvalid,
                    detail: "rotation rejected".to_string(),
                })
            }
            Err(err) => return ResponderStep::error(error_frame(&err)),
        }
    }

    match Reconciler::new(store, owner, config).process_entries(ranges, None) {
        Ok(outcome) => {
            debug!(
                owner = %owner,
                applied = outcome.applied.len(),
                entries = outcome.response.len(),
                "responder frame processed"
            );
            ResponderStep {
                reply: ProtocolMessage::NonInitiator {
                    owner,
                    ranges: outcome.response,
                },
                applied: outcome.applied,
            }
        }
        Err(err) => ResponderStep::error(error_frame(&err)),
    }
}

fn error_frame(err: &EvoluError) -> ProtocolMessage {
    ProtocolMessage::Error {
        code: ErrorCode::from_error(err),
        detail: err.to_string(),
    }
}
