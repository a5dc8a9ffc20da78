//! Context-scoped job scheduler.
//!
//! Work triggered inside a transaction (typically re-running live query
//! pipelines) is queued under the transaction's id and flushed once the
//! transaction's mutations are all applied. Jobs run in dependency order;
//! a flush that can make no progress reports a cycle.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

pub type ContextId = String;
pub type JobId = String;

/// Reports whether a dependency still has work pending in a context.
pub type PendingCheck = Rc<dyn Fn(&str) -> bool>;

/// Something a job must wait for.
#[derive(Clone)]
pub struct Dependency {
    pub job_id: JobId,
    pub has_pending: Option<PendingCheck>,
}

impl Dependency {
    pub fn job(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            has_pending: None,
        }
    }

    pub fn with_pending_check(mut self, check: impl Fn(&str) -> bool + 'static) -> Self {
        self.has_pending = Some(Rc::new(check));
        self
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("job_id", &self.job_id)
            .field("has_pending", &self.has_pending.is_some())
            .finish()
    }
}

pub struct ScheduleRequest {
    /// `None` runs the job immediately.
    pub context_id: Option<ContextId>,
    pub job_id: JobId,
    pub dependencies: Vec<Dependency>,
    pub run: Box<dyn FnOnce()>,
}

impl ScheduleRequest {
    pub fn new(
        context_id: Option<ContextId>,
        job_id: impl Into<JobId>,
        run: impl FnOnce() + 'static,
    ) -> Self {
        Self {
            context_id,
            job_id: job_id.into(),
            dependencies: Vec::new(),
            run: Box::new(run),
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

struct Job {
    dependencies: Vec<Dependency>,
    run: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct SchedulerContext {
    queue: Vec<JobId>,
    jobs: HashMap<JobId, Job>,
    completed: HashSet<JobId>,
}

impl SchedulerContext {
    fn is_ready(&self, context_id: &str, job: &Job) -> bool {
        job.dependencies.iter().all(|dep| {
            if self.queue.contains(&dep.job_id) && !self.completed.contains(&dep.job_id) {
                return false;
            }
            match &dep.has_pending {
                Some(check) => !check(context_id),
                // Unknown to this context: satisfied elsewhere.
                None => true,
            }
        })
    }
}

/// Dependency-ordered job queues keyed by context.
#[derive(Default)]
pub struct Scheduler {
    contexts: RefCell<HashMap<ContextId, SchedulerContext>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job, or run it right away when no context is given.
    ///
    /// Scheduling a job id that is already queued replaces its work but
    /// keeps its position.
    pub fn schedule(&self, request: ScheduleRequest) {
        let Some(context_id) = request.context_id else {
            (request.run)();
            return;
        };
        let mut contexts = self.contexts.borrow_mut();
        let context = contexts.entry(context_id).or_default();
        if !context.queue.contains(&request.job_id) {
            context.queue.push(request.job_id.clone());
        }
        context.completed.remove(&request.job_id);
        context.jobs.insert(
            request.job_id,
            Job {
                dependencies: request.dependencies,
                run: request.run,
            },
        );
    }

    /// Whether `context_id` has queued work for `job_id`.
    pub fn has_pending_job(&self, context_id: &str, job_id: &str) -> bool {
        self.contexts
            .borrow()
            .get(context_id)
            .is_some_and(|ctx| ctx.jobs.contains_key(job_id))
    }

    pub fn has_context(&self, context_id: &str) -> bool {
        self.contexts.borrow().contains_key(context_id)
    }

    /// Run every job queued under `context_id`.
    pub fn flush(&self, context_id: &str) -> Result<()> {
        let mut ran = 0usize;
        loop {
            let next = {
                let mut contexts = self.contexts.borrow_mut();
                let Some(context) = contexts.get_mut(context_id) else {
                    break;
                };
                if context.queue.is_empty() {
                    contexts.remove(context_id);
                    break;
                }
                let position = context.queue.iter().position(|job_id| {
                    context
                        .jobs
                        .get(job_id)
                        .is_some_and(|job| context.is_ready(context_id, job))
                });
                match position {
                    Some(position) => {
                        let job_id = context.queue.remove(position);
                        context.completed.insert(job_id.clone());
                        context.jobs.remove(&job_id)
                    }
                    None => {
                        let jobs = context.queue.clone();
                        contexts.remove(context_id);
                        tracing::warn!(context = %context_id, ?jobs, "scheduler made no progress");
                        return Err(Error::SchedulerCycle {
                            context: context_id.to_string(),
                            jobs,
                        });
                    }
                }
            };
            if let Some(job) = next {
                (job.run)();
                ran += 1;
            }
        }
        tracing::debug!(context = %context_id, jobs = ran, "scheduler flushed");
        Ok(())
    }

    /// Flush every context, stopping at the first error.
    pub fn flush_all(&self) -> Result<()> {
        let ids: Vec<ContextId> = self.contexts.borrow().keys().cloned().collect();
        for id in ids {
            self.flush(&id)?;
        }
        Ok(())
    }

    /// Drop all queued work for `context_id`.
    pub fn clear(&self, context_id: &str) {
        self.contexts.borrow_mut().remove(context_id);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("contexts", &self.contexts.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let make = move |name: &'static str| -> Box<dyn FnOnce()> {
            let l = Rc::clone(&l);
            Box::new(move || l.borrow_mut().push(name))
        };
        (log, make)
    }

    fn request(ctx: &str, job: &str, run: Box<dyn FnOnce()>) -> ScheduleRequest {
        ScheduleRequest {
            context_id: Some(ctx.to_string()),
            job_id: job.to_string(),
            dependencies: Vec::new(),
            run,
        }
    }

    #[test]
    fn runs_immediately_without_context() {
        let scheduler = Scheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(ScheduleRequest {
            context_id: None,
            job_id: "a".into(),
            dependencies: Vec::new(),
            run: make("a"),
        });
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn runs_in_dependency_order() {
        let scheduler = Scheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(request("tx", "a", make("a")).depends_on(Dependency::job("b")));
        scheduler.schedule(request("tx", "b", make("b")));
        assert!(log.borrow().is_empty());
        scheduler.flush("tx").unwrap();
        assert_eq!(*log.borrow(), vec!["b", "a"]);
        assert!(!scheduler.has_context("tx"));
    }

    #[test]
    fn rescheduling_replaces_run() {
        let scheduler = Scheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(request("tx", "a", make("first")));
        scheduler.schedule(request("tx", "b", make("b")));
        scheduler.schedule(request("tx", "a", make("second")));
        scheduler.flush("tx").unwrap();
        assert_eq!(*log.borrow(), vec!["second", "b"]);
    }

    #[test]
    fn unknown_dependencies_are_satisfied() {
        let scheduler = Scheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(request("tx", "a", make("a")).depends_on(Dependency::job("elsewhere")));
        scheduler.flush("tx").unwrap();
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn pending_check_blocks() {
        let scheduler = Scheduler::new();
        let (_log, make) = recorder();
        scheduler.schedule(
            request("tx", "a", make("a"))
                .depends_on(Dependency::job("remote").with_pending_check(|_| true)),
        );
        assert!(matches!(scheduler.flush("tx"), Err(Error::SchedulerCycle { .. })));
    }

    #[test]
    fn cycle_is_reported() {
        let scheduler = Scheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(request("tx", "a", make("a")).depends_on(Dependency::job("b")));
        scheduler.schedule(request("tx", "b", make("b")).depends_on(Dependency::job("a")));
        let err = scheduler.flush("tx").unwrap_err();
        assert_eq!(
            err,
            Error::SchedulerCycle {
                context: "tx".into(),
                jobs: vec!["a".into(), "b".into()],
            }
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn jobs_may_schedule_more_work() {
        let scheduler = Rc::new(Scheduler::new());
        let (log, make) = recorder();
        let inner = make("inner");
        let s = Rc::clone(&scheduler);
        let l = Rc::clone(&log);
        scheduler.schedule(request(
            "tx",
            "outer",
            Box::new(move || {
                l.borrow_mut().push("outer");
                s.schedule(request("tx", "inner", inner));
            }),
        ));
        scheduler.flush("tx").unwrap();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }
}
