//! Collection status and garbage collection bookkeeping.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle status of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionStatus {
    /// Created, sync not started.
    Idle,
    /// Sync started, first data not yet ready.
    Loading,
    Ready,
    Error,
    /// State discarded; syncing again moves back to loading.
    CleanedUp,
}

impl CollectionStatus {
    /// Whether the transition table allows `self -> to`. Staying in the same
    /// status is always allowed.
    pub fn can_transition_to(self, to: CollectionStatus) -> bool {
        use CollectionStatus::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Idle, Loading | Error | CleanedUp)
                | (Loading, Ready | Error | CleanedUp)
                | (Ready, CleanedUp | Error)
                | (Error, Idle | CleanedUp)
                | (CleanedUp, Loading | Error)
        )
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Loading => "loading",
            CollectionStatus::Ready => "ready",
            CollectionStatus::Error => "error",
            CollectionStatus::CleanedUp => "cleaned-up",
        };
        f.write_str(s)
    }
}

/// Status plus the bookkeeping attached to status changes.
pub struct Lifecycle {
    collection_id: String,
    status: CollectionStatus,
    error: Option<String>,
    has_been_ready: bool,
    first_ready: Vec<Box<dyn FnOnce()>>,
    gc_time: Option<Duration>,
    gc_deadline: Option<Instant>,
}

impl Lifecycle {
    pub fn new(collection_id: impl Into<String>, gc_time_ms: u64) -> Self {
        Self {
            collection_id: collection_id.into(),
            status: CollectionStatus::Idle,
            error: None,
            has_been_ready: false,
            first_ready: Vec::new(),
            gc_time: (gc_time_ms > 0).then(|| Duration::from_millis(gc_time_ms)),
            gc_deadline: None,
        }
    }

    pub fn status(&self) -> CollectionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Move to `to`, validating against the transition table.
    ///
    /// Returns the callbacks waiting for the first `ready`, which the caller
    /// must run once its own borrows are released.
    pub fn transition(&mut self, to: CollectionStatus) -> Result<Vec<Box<dyn FnOnce()>>> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStatusTransition {
                collection: self.collection_id.clone(),
                from,
                to,
            });
        }
        if from != to {
            tracing::info!(collection = %self.collection_id, %from, %to, "collection status changed");
        }
        self.status = to;
        if to != CollectionStatus::Error {
            self.error = None;
        }
        if to == CollectionStatus::Ready && !self.has_been_ready {
            self.has_been_ready = true;
            return Ok(std::mem::take(&mut self.first_ready));
        }
        Ok(Vec::new())
    }

    /// Enter the error status, remembering why.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(CollectionStatus::Error)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn has_been_ready(&self) -> bool {
        self.has_been_ready
    }

    /// Register a callback for the first transition to ready. Returns it back
    /// when the collection is already ready so the caller can run it.
    pub fn on_first_ready(&mut self, callback: Box<dyn FnOnce()>) -> Option<Box<dyn FnOnce()>> {
        if self.has_been_ready {
            Some(callback)
        } else {
            self.first_ready.push(callback);
            None
        }
    }

    /// Reset the ready latch after cleanup so a restart notifies again.
    pub fn reset_ready(&mut self) {
        self.has_been_ready = false;
    }

    /// Called when the last subscriber leaves.
    pub fn schedule_gc(&mut self, now: Instant) {
        if let Some(delay) = self.gc_time {
            self.gc_deadline = Some(now + delay);
        }
    }

    /// Called when a subscriber arrives.
    pub fn cancel_gc(&mut self) {
        self.gc_deadline = None;
    }

    pub fn gc_deadline(&self) -> Option<Instant> {
        self.gc_deadline
    }

    /// Whether the collection should be collected at `now`.
    pub fn gc_due(&self, now: Instant) -> bool {
        self.status != CollectionStatus::CleanedUp
            && self.gc_deadline.is_some_and(|deadline| now >= deadline)
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("status", &self.status)
            .field("error", &self.error)
            .field("gc_deadline", &self.gc_deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use CollectionStatus::*;

    #[test]
    fn transition_table() {
        assert!(Idle.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Error));
        assert!(Error.can_transition_to(Idle));
        assert!(CleanedUp.can_transition_to(Loading));
        assert!(!Ready.can_transition_to(Loading));
        assert!(!Idle.can_transition_to(Ready));
        assert!(!Error.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Ready));
    }

    #[test]
    fn invalid_transition_is_an_error() {
        let mut lifecycle = Lifecycle::new("todos", 0);
        let err = lifecycle.transition(Ready).err().unwrap();
        assert_eq!(
            err.to_string(),
            "invalid status transition for collection 'todos': idle -> ready"
        );
        assert_eq!(lifecycle.status(), Idle);
    }

    #[test]
    fn first_ready_callbacks_fire_once() {
        let mut lifecycle = Lifecycle::new("todos", 0);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        assert!(lifecycle
            .on_first_ready(Box::new(move || h.set(h.get() + 1)))
            .is_none());
        lifecycle.transition(Loading).unwrap();
        for callback in lifecycle.transition(Ready).unwrap() {
            callback();
        }
        assert_eq!(hits.get(), 1);
        assert!(lifecycle.transition(Ready).unwrap().is_empty());
        assert!(lifecycle.on_first_ready(Box::new(|| {})).is_some());
    }

    #[test]
    fn gc_deadline() {
        let mut lifecycle = Lifecycle::new("todos", 1_000);
        let now = Instant::now();
        lifecycle.schedule_gc(now);
        assert!(!lifecycle.gc_due(now));
        assert!(lifecycle.gc_due(now + Duration::from_secs(2)));
        lifecycle.cancel_gc();
        assert!(!lifecycle.gc_due(now + Duration::from_secs(2)));

        let mut disabled = Lifecycle::new("todos", 0);
        disabled.schedule_gc(now);
        assert_eq!(disabled.gc_deadline(), None);
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&CleanedUp).unwrap(), "\"cleaned-up\"");
        assert_eq!(CleanedUp.to_string(), "cleaned-up");
    }
}
