//! Construction of promises bound to one scheduler.
use std::{fmt, rc::Rc};

use crate::{promise::Resolver, thenable, value::guard, Promise, Scheduler, Value};

/// Entry point for creating promises.
///
/// Every promise created through a runtime, and every promise derived from
/// one via `then`, schedules its reactions on the runtime's scheduler.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Rc<dyn Scheduler>,
}

impl Runtime {
    pub fn new(scheduler: impl Scheduler + 'static) -> Self {
        Runtime {
            scheduler: Rc::new(scheduler),
        }
    }

    pub fn with_scheduler(scheduler: Rc<dyn Scheduler>) -> Self {
        Runtime { scheduler }
    }

    pub fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.scheduler
    }

    /// Runs `executor` synchronously with the new promise's resolver.
    ///
    /// An `Err` returned (or a panic raised) by the executor rejects the
    /// promise, unless it already settled.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{MicrotaskQueue, Runtime, Value};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let runtime = Runtime::new(queue.clone());
    ///
    /// let promise = runtime.create(|_resolver| Err(Value::from("executor failed")));
    /// assert_eq!(queue.block_on(&promise), Ok(Err(Value::from("executor failed"))));
    /// ```
    pub fn create<F>(&self, executor: F) -> Promise
    where
        F: FnOnce(Resolver) -> Result<(), Value>,
    {
        let (promise, resolver) = self.deferred();
        let handle = resolver.clone();
        if let Err(reason) = guard(|| executor(handle)) {
            resolver.reject(reason);
        }
        promise
    }

    /// `value` unchanged when it is already a promise; otherwise a promise
    /// resolved with `value`, adopting it if it is a thenable.
    pub fn resolve(&self, value: impl Into<Value>) -> Promise {
        Promise::from_value(self.scheduler.clone(), value.into())
    }

    /// A promise rejected with `reason`. Promises used as reasons are not
    /// unwrapped.
    pub fn reject(&self, reason: impl Into<Value>) -> Promise {
        let promise = Promise::pending(self.scheduler.clone());
        promise.reject_with(reason.into());
        promise
    }

    /// A pending promise together with the resolver that settles it, for
    /// callers that control settlement from outside an executor.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{MicrotaskQueue, Runtime, Value};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let runtime = Runtime::new(queue.clone());
    ///
    /// let (promise, resolver) = runtime.deferred();
    /// assert!(promise.is_pending());
    /// resolver.reject("cancelled by caller");
    /// assert_eq!(queue.block_on(&promise), Ok(Err(Value::from("cancelled by caller"))));
    /// ```
    pub fn deferred(&self) -> (Promise, Resolver) {
        let promise = Promise::pending(self.scheduler.clone());
        let resolver = Resolver::new(&promise);
        (promise, resolver)
    }

    pub fn is_deferred_like(&self, value: &Value) -> bool {
        thenable::is_deferred_like(value)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime({:p})", Rc::as_ptr(&self.scheduler))
    }
}
