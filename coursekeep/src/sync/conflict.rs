//! Conflict resolution sessions.
//!
//! [`ConflictResolutionCoordinator::resolve`] opens a session for a batch of
//! conflicts and hands back a [`PendingResolution`] future that completes
//! once somebody calls [`apply`](ConflictResolutionCoordinator::apply),
//! [`submit`](ConflictResolutionCoordinator::submit) or
//! [`cancel`](ConflictResolutionCoordinator::cancel). Every conflict starts
//! out as [`Side::Server`].
//!
//! At most one session is open. Opening a second one aborts the first with
//! [`AbortReason::Superseded`]. Dropping the [`PendingResolution`] closes its
//! session so a later sync pass is never blocked by an abandoned dialog.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::model::{ConflictRecord, ResolutionDirective, Side};
use crate::observer::{ListenerId, ListenerRegistry};

/// Why a session ended without a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The user dismissed the dialog.
    Cancelled,
    /// A newer session replaced this one.
    Superseded,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded by a newer session",
        })
    }
}

/// Errors from the conflict coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// The session ended without a decision. Nothing should be synced this
    /// round.
    #[error("conflict resolution session {reason}")]
    SessionAborted { reason: AbortReason },

    /// A directive left conflicts undecided. The whole batch is rejected.
    #[error("resolution is missing a decision for: {}", missing.join(", "))]
    IncompleteResolution { missing: Vec<String> },

    /// The same conflict id appeared twice in one batch.
    #[error("conflict {0} appears more than once in the batch")]
    DuplicateConflict(String),

    /// The id does not belong to the open session.
    #[error("conflict {0} is not part of the pending session")]
    UnknownConflict(String),

    /// No session is open.
    #[error("no conflict resolution session is pending")]
    NoPendingSession,
}

impl ConflictError {
    /// Whether the caller should simply try again later.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::SessionAborted { .. })
    }
}

type Outcome = Result<ResolutionDirective, ConflictError>;

/// Notification sent to listeners when a session opens.
#[derive(Debug, Clone)]
pub struct SessionOpened {
    pub session_id: u64,
    pub conflicts: Vec<ConflictRecord>,
}

/// Snapshot of the open session for rendering a merge dialog.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSession {
    pub session_id: u64,
    /// Conflicts in the order they were supplied, with the side currently
    /// selected for each.
    pub conflicts: Vec<(ConflictRecord, Side)>,
}

struct Session {
    id: u64,
    conflicts: Vec<ConflictRecord>,
    choices: ResolutionDirective,
    reply: oneshot::Sender<Outcome>,
}

impl Session {
    fn contains(&self, id: &str) -> bool {
        self.conflicts.iter().any(|c| c.id == id)
    }

    fn finish(self, outcome: Outcome) {
        // The waiter may already be gone; its guard has then cleared the slot.
        let _ = self.reply.send(outcome);
    }
}

type SessionSlot = Arc<Mutex<Option<Session>>>;

fn first_duplicate(conflicts: &[ConflictRecord]) -> Option<String> {
    let mut seen = HashSet::new();
    conflicts
        .iter()
        .find(|c| !seen.insert(c.id.as_str()))
        .map(|c| c.id.clone())
}

/// Runs one merge decision at a time between the sync layer and the user.
pub struct ConflictResolutionCoordinator {
    session: SessionSlot,
    next_session: AtomicU64,
    opened: ListenerRegistry<SessionOpened>,
}

impl ConflictResolutionCoordinator {
    pub fn new() -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            next_session: AtomicU64::new(1),
            opened: ListenerRegistry::new(),
        }
    }

    /// Open a session for `conflicts`.
    ///
    /// The session is live as soon as this returns; await the returned
    /// future for the outcome. An empty batch resolves immediately to an
    /// empty directive without opening a session.
    pub fn resolve(&self, conflicts: Vec<ConflictRecord>) -> PendingResolution {
        if let Some(duplicate) = first_duplicate(&conflicts) {
            return PendingResolution::ready(Err(ConflictError::DuplicateConflict(duplicate)));
        }
        if conflicts.is_empty() {
            return PendingResolution::ready(Ok(ResolutionDirective::new()));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let choices = conflicts
            .iter()
            .map(|c| (c.id.clone(), Side::Server))
            .collect();
        let (reply, receiver) = oneshot::channel();
        let session = Session {
            id,
            conflicts: conflicts.clone(),
            choices,
            reply,
        };

        let previous = self.session.lock().replace(session);
        if let Some(previous) = previous {
            info!(
                session = previous.id,
                replaced_by = id,
                "Conflict session superseded"
            );
            previous.finish(Err(ConflictError::SessionAborted {
                reason: AbortReason::Superseded,
            }));
        }

        info!(session = id, conflicts = conflicts.len(), "Conflict session opened");
        self.opened.dispatch(&SessionOpened {
            session_id: id,
            conflicts,
        });

        PendingResolution {
            session_id: Some(id),
            state: PendingState::Waiting {
                receiver,
                _guard: SessionGuard {
                    slot: Arc::clone(&self.session),
                    id,
                },
            },
        }
    }

    /// Choose `side` for one conflict.
    pub fn select_version(&self, id: &str, side: Side) -> Result<(), ConflictError> {
        let mut slot = self.session.lock();
        let session = slot.as_mut().ok_or(ConflictError::NoPendingSession)?;
        if !session.contains(id) {
            return Err(ConflictError::UnknownConflict(id.to_string()));
        }
        session.choices.insert(id, side);
        debug!(session = session.id, conflict = id, %side, "Version selected");
        Ok(())
    }

    /// Choose `side` for every conflict. Returns how many were set.
    pub fn resolve_all(&self, side: Side) -> Result<usize, ConflictError> {
        let mut slot = self.session.lock();
        let session = slot.as_mut().ok_or(ConflictError::NoPendingSession)?;
        for conflict in &session.conflicts {
            session.choices.insert(conflict.id.clone(), side);
        }
        debug!(session = session.id, %side, "Side applied to all conflicts");
        Ok(session.conflicts.len())
    }

    /// Finish the session with the current choices.
    pub fn apply(&self) -> Result<ResolutionDirective, ConflictError> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or(ConflictError::NoPendingSession)?;
        let directive = session.choices.clone();
        Self::complete(session, directive)
    }

    /// Finish the session with a directive built elsewhere.
    ///
    /// The directive must name every conflict in the session and nothing
    /// else. A directive with gaps fails the whole batch: the waiter
    /// receives [`ConflictError::IncompleteResolution`] and the session
    /// closes.
    pub fn submit(&self, directive: ResolutionDirective) -> Result<ResolutionDirective, ConflictError> {
        let mut slot = self.session.lock();
        let session = slot.as_ref().ok_or(ConflictError::NoPendingSession)?;
        if let Some((unknown, _)) = directive.iter().find(|(id, _)| !session.contains(id)) {
            return Err(ConflictError::UnknownConflict(unknown.to_string()));
        }
        let Some(session) = slot.take() else {
            return Err(ConflictError::NoPendingSession);
        };
        drop(slot);
        Self::complete(session, directive)
    }

    fn complete(session: Session, directive: ResolutionDirective) -> Outcome {
        let missing: Vec<String> = session
            .conflicts
            .iter()
            .filter(|c| directive.get(&c.id).is_none())
            .map(|c| c.id.clone())
            .collect();

        if !missing.is_empty() {
            let error = ConflictError::IncompleteResolution { missing };
            info!(session = session.id, error = %error, "Conflict session rejected");
            session.finish(Err(error.clone()));
            return Err(error);
        }

        info!(session = session.id, decisions = directive.len(), "Conflict session resolved");
        session.finish(Ok(directive.clone()));
        Ok(directive)
    }

    /// Abort the session. The waiter receives
    /// [`ConflictError::SessionAborted`].
    pub fn cancel(&self) -> Result<(), ConflictError> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or(ConflictError::NoPendingSession)?;
        info!(session = session.id, "Conflict session cancelled");
        session.finish(Err(ConflictError::SessionAborted {
            reason: AbortReason::Cancelled,
        }));
        Ok(())
    }

    pub fn has_pending_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// The open session's conflicts and current choices.
    pub fn pending_conflicts(&self) -> Option<PendingSession> {
        let slot = self.session.lock();
        let session = slot.as_ref()?;
        Some(PendingSession {
            session_id: session.id,
            conflicts: session
                .conflicts
                .iter()
                .map(|c| (c.clone(), session.choices.get(&c.id).unwrap_or(Side::Server)))
                .collect(),
        })
    }

    /// Be told whenever a session opens.
    ///
    /// Listeners run on the thread that called [`resolve`](Self::resolve),
    /// after the session is installed, so they may call back into the
    /// coordinator.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionOpened) + Send + Sync + 'static,
    {
        self.opened.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.opened.unsubscribe(id)
    }
}

impl Default for ConflictResolutionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConflictResolutionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolutionCoordinator")
            .field("pending", &self.has_pending_session())
            .finish()
    }
}

/// Clears the session slot when the waiter goes away first.
struct SessionGuard {
    slot: SessionSlot,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            debug!(session = self.id, "Conflict session abandoned by caller");
            *slot = None;
        }
    }
}

enum PendingState {
    Ready(Option<Outcome>),
    Waiting {
        receiver: oneshot::Receiver<Outcome>,
        _guard: SessionGuard,
    },
}

/// Outcome of a [`ConflictResolutionCoordinator::resolve`] call.
///
/// Dropping it before completion closes the session.
pub struct PendingResolution {
    session_id: Option<u64>,
    state: PendingState,
}

impl PendingResolution {
    fn ready(outcome: Outcome) -> Self {
        Self {
            session_id: None,
            state: PendingState::Ready(Some(outcome)),
        }
    }

    /// Id of the opened session, if one was opened.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }
}

impl Future for PendingResolution {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        match &mut self.state {
            PendingState::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or(Err(
                ConflictError::SessionAborted {
                    reason: AbortReason::Cancelled,
                },
            ))),
            PendingState::Waiting { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ConflictError::SessionAborted {
                    reason: AbortReason::Cancelled,
                })),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for PendingResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResolution")
            .field("session_id", &self.session_id)
            .finish()
    }
}
