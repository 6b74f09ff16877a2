//! Claim change events and the pre-commit observer hook.
//!
//! Registries describe every mutation as a [`ClaimEvent`]. Before committing,
//! the event is offered to each registered [`ClaimObserver`]; any observer may
//! veto it, which aborts the mutation with
//! [`ClaimError::Vetoed`](crate::ClaimError::Vetoed). After the commit, and
//! after the registry lock has been released, observers are notified again.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::claim::{ActorId, ClaimId, WorldId};
use crate::geometry::ClaimBounds;

/// What happened to a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimEventKind {
    /// A new claim was created.
    Create,
    /// A claim's bounds changed.
    Resize,
    /// A claim was removed administratively.
    Delete,
    /// A claim was removed by its owner.
    Abandon,
    /// A claim tree changed owner.
    Transfer,
}

/// A single claim mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEvent {
    /// Kind of mutation.
    pub kind: ClaimEventKind,
    /// The claim being changed. For cascading deletes, the root of the
    /// removed subtree.
    pub claim_id: ClaimId,
    /// World the claim lives in.
    pub world: WorldId,
    /// Who asked for the change. `None` for server-initiated changes.
    pub actor: Option<ActorId>,
    /// Bounds before the change (absent for creation).
    pub before: Option<ClaimBounds>,
    /// Bounds after the change (absent for removal).
    pub after: Option<ClaimBounds>,
}

/// An observer's decision on a pending event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the mutation proceed.
    Allow,
    /// Abort the mutation, optionally explaining why.
    Veto(Option<String>),
}

/// Hook into claim mutations.
///
/// `pre_commit` runs while the registry holds an upgradable read lock. It must
/// not call back into the committing registry; the event carries the change.
pub trait ClaimObserver: Send + Sync {
    /// Decide whether `event` may be committed.
    fn pre_commit(&self, event: &ClaimEvent) -> Verdict {
        let _ = event;
        Verdict::Allow
    }

    /// Called after `event` was committed.
    fn post_commit(&self, event: &ClaimEvent) {
        let _ = event;
    }
}

/// The observers shared by every registry of an engine.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn ClaimObserver>>>,
}

impl ObserverSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Observers run in registration order.
    pub fn register(&self, observer: Arc<dyn ClaimObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// `true` if no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `event` to every observer; the first veto wins.
    pub fn pre_commit(&self, event: &ClaimEvent) -> Verdict {
        for observer in self.snapshot() {
            if let Verdict::Veto(reason) = observer.pre_commit(event) {
                tracing::debug!(claim = %event.claim_id, kind = ?event.kind, "Mutation vetoed");
                return Verdict::Veto(reason);
            }
        }
        Verdict::Allow
    }

    /// Notifies every observer of a committed event.
    pub fn post_commit(&self, event: &ClaimEvent) {
        for observer in self.snapshot() {
            observer.post_commit(event);
        }
    }

    // Observers are called without holding the list lock so they can register
    // further observers.
    fn snapshot(&self) -> Vec<Arc<dyn ClaimObserver>> {
        self.observers.read().clone()
    }
}

/// Observer that records committed events for later polling, e.g. by a
/// boundary-visualization system that refreshes once per tick.
#[derive(Default)]
pub struct EventBuffer {
    events: Mutex<Vec<ClaimEvent>>,
}

impl EventBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all recorded events, oldest first.
    pub fn drain(&self) -> Vec<ClaimEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// `true` if nothing has been recorded since the last drain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClaimObserver for EventBuffer {
    fn post_commit(&self, event: &ClaimEvent) {
        self.events.lock().push(event.clone());
    }
}
