//! Deferred execution of reaction jobs.
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use tracing::{debug, trace};

use crate::{Error, Promise, Value};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce()>;

/// Runs jobs after the current synchronous work completes.
///
/// Implementations must run jobs in FIFO order and never inside the call to
/// [`Scheduler::schedule`].
pub trait Scheduler {
    fn schedule(&self, job: Job);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on jobs run by one [`MicrotaskQueue::run_until_idle`] call.
    /// `None` drains without limit.
    pub budget: Option<usize>,
}

/// The default FIFO job queue. Clones share the same queue.
///
/// # Examples
///
/// ```
/// use promise_aplus::{MicrotaskQueue, Scheduler};
/// use std::{cell::Cell, rc::Rc};
///
/// let queue = MicrotaskQueue::new();
/// let ran = Rc::new(Cell::new(false));
/// let flag = ran.clone();
/// queue.schedule(Box::new(move || flag.set(true)));
/// assert!(!ran.get());
/// assert_eq!(queue.run_until_idle(), Ok(1));
/// assert!(ran.get());
/// ```
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: VecDeque<Job>,
    config: QueueConfig,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                jobs: VecDeque::new(),
                config,
            })),
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.borrow().config
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().jobs.is_empty()
    }

    /// Runs the oldest job. Returns false if the queue was empty.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the job runs: jobs schedule more jobs.
        let job = self.inner.borrow_mut().jobs.pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs, including the ones scheduled while draining, until the
    /// queue is empty. Returns how many jobs ran.
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let budget = self.config().budget;
        let mut ran = 0;
        loop {
            if budget.is_some_and(|budget| ran >= budget) && !self.is_empty() {
                debug!(ran, remaining = self.len(), "microtask budget exhausted");
                return Err(Error::BudgetExhausted { ran });
            }
            if !self.run_once() {
                break;
            }
            ran += 1;
        }
        trace!(ran, "microtask queue idle");
        Ok(ran)
    }

    /// Drains the queue and reports how `promise` settled: `Ok` for a
    /// fulfillment value, `Err` for a rejection reason.
    pub fn block_on(&self, promise: &Promise) -> Result<Result<Value, Value>, Error> {
        self.run_until_idle()?;
        promise.outcome().ok_or(Error::Stalled)
    }
}

impl Scheduler for MicrotaskQueue {
    fn schedule(&self, job: Job) {
        self.inner.borrow_mut().jobs.push_back(job);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MicrotaskQueue")
            .field("pending_jobs", &inner.jobs.len())
            .field("config", &inner.config)
            .finish()
    }
}
