//! Single-threaded deferred results.
//!
//! A [`Deferred`] is a settle-once slot shared between a producer (holding the
//! [`Resolver`]) and any number of consumers. Consumers may `.await` it, poll
//! it with [`Deferred::is_settled`], or attach a continuation with
//! [`Deferred::on_settled`]. Dropping a consumer never cancels the producer;
//! a late result is still recorded.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type Continuation<T> = Box<dyn FnOnce(&Result<T>)>;

struct Slot<T> {
    outcome: Option<Result<T>>,
    wakers: Vec<Waker>,
    continuations: Vec<Continuation<T>>,
}

/// Consumer handle of a pending result.
pub struct Deferred<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

/// Producer handle that settles a [`Deferred`].
pub struct Resolver<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Create an unsettled deferred and its resolver.
    pub fn new() -> (Self, Resolver<T>) {
        let slot = Rc::new(RefCell::new(Slot {
            outcome: None,
            wakers: Vec::new(),
            continuations: Vec::new(),
        }));
        (
            Self {
                slot: Rc::clone(&slot),
            },
            Resolver { slot },
        )
    }

    /// A deferred that is already resolved.
    pub fn resolved(value: T) -> Self {
        let (deferred, resolver) = Self::new();
        resolver.resolve(value);
        deferred
    }

    /// A deferred that is already rejected.
    pub fn rejected(error: Error) -> Self {
        let (deferred, resolver) = Self::new();
        resolver.reject(error);
        deferred
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Result<T>> {
        self.slot.borrow().outcome.clone()
    }

    /// Run `f` once settled. Runs immediately if already settled.
    pub fn on_settled(&self, f: impl FnOnce(&Result<T>) + 'static) {
        let outcome = {
            let mut slot = self.slot.borrow_mut();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        f(&outcome);
    }

    /// Settle when every deferred in `all` has settled; rejects with the first
    /// error encountered.
    pub fn join_all(all: Vec<Deferred<T>>) -> Deferred<()> {
        let (joined, resolver) = Deferred::<()>::new();
        if all.is_empty() {
            resolver.resolve(());
            return joined;
        }
        let state = Rc::new(RefCell::new((all.len(), None::<Error>, Some(resolver))));
        for deferred in all {
            let state = Rc::clone(&state);
            deferred.on_settled(move |outcome| {
                let mut guard = state.borrow_mut();
                guard.0 -= 1;
                if guard.1.is_none() {
                    if let Err(e) = outcome {
                        guard.1 = Some(e.clone());
                    }
                }
                if guard.0 == 0 {
                    let error = guard.1.take();
                    if let Some(resolver) = guard.2.take() {
                        drop(guard);
                        match error {
                            Some(e) => resolver.reject(e),
                            None => resolver.resolve(()),
                        }
                    }
                }
            });
        }
        joined
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: Error) {
        self.settle(Err(error));
    }

    pub fn settle(self, outcome: Result<T>) {
        let (wakers, continuations) = {
            let mut slot = self.slot.borrow_mut();
            if slot.outcome.is_some() {
                return;
            }
            slot.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut slot.wakers),
                std::mem::take(&mut slot.continuations),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for continuation in continuations {
            continuation(&outcome);
        }
    }
}

impl<T: Clone + 'static> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match &slot.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                slot.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = self.slot.borrow().outcome.is_some();
        f.debug_struct("Deferred").field("settled", &settled).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::cell::Cell;

    #[test]
    fn continuation_runs_on_resolve() {
        let (deferred, resolver) = Deferred::<u32>::new();
        let seen = Rc::new(Cell::new(0));
        let seen2 = Rc::clone(&seen);
        deferred.on_settled(move |r| seen2.set(*r.as_ref().unwrap()));
        assert!(!deferred.is_settled());
        resolver.resolve(7);
        assert_eq!(seen.get(), 7);
        assert_eq!(block_on(deferred).unwrap(), 7);
    }

    #[test]
    fn continuation_runs_immediately_when_settled() {
        let deferred = Deferred::resolved("x".to_string());
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        deferred.on_settled(move |_| hit2.set(true));
        assert!(hit.get());
    }

    #[test]
    fn join_all_waits_for_every_member() {
        let (a, ra) = Deferred::<()>::new();
        let (b, rb) = Deferred::<()>::new();
        let joined = Deferred::join_all(vec![a, b]);
        ra.resolve(());
        assert!(!joined.is_settled());
        rb.reject(Error::LoadSubset("boom".into()));
        assert_eq!(joined.outcome(), Some(Err(Error::LoadSubset("boom".into()))));
    }

    #[test]
    fn second_settle_is_ignored() {
        let (deferred, resolver) = Deferred::<u8>::new();
        let slot = Resolver {
            slot: Rc::clone(&deferred.slot),
        };
        resolver.resolve(1);
        slot.resolve(2);
        assert_eq!(deferred.outcome(), Some(Ok(1)));
    }
}
