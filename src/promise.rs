//! The promise state machine.
use std::{
    cell::RefCell,
    fmt,
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use tracing::trace;

use crate::{thenable, Function, Scheduler, Value};

/// Settlement state of a [`Promise`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

/// A deferred value.
///
/// Cloning yields another handle to the same instance. Only the instance's
/// [`Resolver`] can settle it.
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<Inner>>,
    scheduler: Rc<dyn Scheduler>,
}

#[derive(Default)]
struct Inner {
    state: State,
    fulfill_reactions: Vec<Reaction>,
    reject_reactions: Vec<Reaction>,
    wakers: Vec<Waker>,
}

#[derive(Clone, Copy, Debug)]
enum Kind {
    Fulfill,
    Reject,
}

/// A handler waiting for one settlement path, plus the promise that receives
/// the handler's outcome.
struct Reaction {
    kind: Kind,
    handler: Option<Function>,
    downstream: Option<Promise>,
}

impl Reaction {
    fn run(self, argument: Value) {
        let completion = match &self.handler {
            Some(handler) => handler.invoke(&Value::Undefined, &[argument]),
            None => match self.kind {
                Kind::Fulfill => Ok(argument),
                Kind::Reject => Err(argument),
            },
        };
        let Some(downstream) = self.downstream else {
            return;
        };
        match completion {
            Ok(x) => thenable::resolve_promise(&downstream, x),
            Err(reason) => downstream.reject_with(reason),
        }
    }
}

impl Promise {
    pub(crate) fn pending(scheduler: Rc<dyn Scheduler>) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(Inner::default())),
            scheduler,
        }
    }

    /// `value` itself when it is already a promise, otherwise a new promise
    /// resolved with it.
    pub(crate) fn from_value(scheduler: Rc<dyn Scheduler>, value: Value) -> Self {
        if let Value::Promise(promise) = value {
            return promise;
        }
        let promise = Promise::pending(scheduler);
        thenable::resolve_promise(&promise, value);
        promise
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// `None` while pending, `Ok(value)` once fulfilled, `Err(reason)` once
    /// rejected.
    pub fn outcome(&self) -> Option<Result<Value, Value>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers reactions and returns the promise that settles with their
    /// outcome.
    ///
    /// A non-callable `on_fulfilled` passes the value through; a non-callable
    /// `on_rejected` passes the reason through. Handlers always run on a
    /// later turn of the scheduler, in attachment order.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Function, MicrotaskQueue, Runtime, Value};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let runtime = Runtime::new(queue.clone());
    ///
    /// let recovered = runtime
    ///     .reject("lost")
    ///     .then(Value::Undefined, Value::Undefined)
    ///     .then(Value::Undefined, Function::unary(|reason| Ok(reason)));
    /// assert_eq!(queue.block_on(&recovered), Ok(Ok(Value::from("lost"))));
    /// ```
    pub fn then(&self, on_fulfilled: impl Into<Value>, on_rejected: impl Into<Value>) -> Promise {
        let downstream = Promise::pending(self.scheduler.clone());
        self.subscribe(
            callable(on_fulfilled.into()),
            callable(on_rejected.into()),
            Some(downstream.clone()),
        );
        downstream
    }

    pub fn catch(&self, on_rejected: impl Into<Value>) -> Promise {
        self.then(Value::Undefined, on_rejected)
    }

    /// Runs `on_finally` with no arguments on either path.
    ///
    /// The original value or reason survives unless `on_finally` raises or
    /// returns something that rejects; that rejection then wins. A returned
    /// thenable is waited for before the original outcome is passed on.
    pub fn finally(&self, on_finally: impl Into<Value>) -> Promise {
        let on_finally = on_finally.into();
        let Some(callback) = on_finally.as_function().cloned() else {
            return self.then(on_finally.clone(), on_finally);
        };

        let on_fulfilled = {
            let callback = callback.clone();
            let scheduler = self.scheduler.clone();
            Function::unary(move |value| {
                let result = callback.invoke(&Value::Undefined, &[])?;
                let passed = Function::unary(move |_| Ok(value.clone()));
                Ok(Promise::from_value(scheduler.clone(), result)
                    .then(passed, Value::Undefined)
                    .into())
            })
        };
        let on_rejected = {
            let scheduler = self.scheduler.clone();
            Function::unary(move |reason| {
                let result = callback.invoke(&Value::Undefined, &[])?;
                let rethrown = Function::unary(move |_| Err(reason.clone()));
                Ok(Promise::from_value(scheduler.clone(), result)
                    .then(rethrown, Value::Undefined)
                    .into())
            })
        };
        self.then(on_fulfilled, on_rejected)
    }

    /// Waits for settlement from async code. The future never drives the
    /// scheduler; something else has to run the queue.
    pub fn settled(&self) -> Settled {
        Settled {
            promise: self.clone(),
        }
    }

    /// Appends a reaction pair, or schedules the matching reaction right away
    /// when already settled. Without a downstream promise the handlers'
    /// outcomes are dropped.
    pub(crate) fn subscribe(
        &self,
        on_fulfilled: Option<Function>,
        on_rejected: Option<Function>,
        downstream: Option<Promise>,
    ) {
        let fulfill = Reaction {
            kind: Kind::Fulfill,
            handler: on_fulfilled,
            downstream: downstream.clone(),
        };
        let reject = Reaction {
            kind: Kind::Reject,
            handler: on_rejected,
            downstream,
        };
        let (reaction, argument) = {
            let mut inner = self.inner.borrow_mut();
            match &inner.state {
                State::Pending => {
                    inner.fulfill_reactions.push(fulfill);
                    inner.reject_reactions.push(reject);
                    return;
                }
                State::Fulfilled(value) => (fulfill, value.clone()),
                State::Rejected(reason) => (reject, reason.clone()),
            }
        };
        self.enqueue(reaction, argument);
    }

    pub(crate) fn fulfill(&self, value: Value) {
        self.settle(Kind::Fulfill, value);
    }

    pub(crate) fn reject_with(&self, reason: Value) {
        self.settle(Kind::Reject, reason);
    }

    fn settle(&self, kind: Kind, argument: Value) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            let fulfilled = mem::take(&mut inner.fulfill_reactions);
            let rejected = mem::take(&mut inner.reject_reactions);
            let reactions = match kind {
                Kind::Fulfill => {
                    inner.state = State::Fulfilled(argument.clone());
                    fulfilled
                }
                Kind::Reject => {
                    inner.state = State::Rejected(argument.clone());
                    rejected
                }
            };
            (reactions, mem::take(&mut inner.wakers))
        };
        trace!(promise = ?Rc::as_ptr(&self.inner), ?kind, reactions = reactions.len(), "settled");
        for reaction in reactions {
            self.enqueue(reaction, argument.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    fn enqueue(&self, reaction: Reaction, argument: Value) {
        trace!(promise = ?Rc::as_ptr(&self.inner), kind = ?reaction.kind, "reaction scheduled");
        self.scheduler
            .schedule(Box::new(move || reaction.run(argument)));
    }
}

fn callable(value: Value) -> Option<Function> {
    match value {
        Value::Function(function) => Some(function),
        _ => None,
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let state = match inner.state {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise")
            .field("ptr", &Rc::as_ptr(&self.inner))
            .field("state", &state)
            .field("fulfill_reactions", &inner.fulfill_reactions.len())
            .field("reject_reactions", &inner.reject_reactions.len())
            .finish()
    }
}

/// Future returned by [`Promise::settled`]: `Ok` with the value, `Err` with
/// the reason.
#[derive(Debug)]
pub struct Settled {
    promise: Promise,
}

impl Future for Settled {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.promise.inner.borrow_mut();
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl IntoFuture for Promise {
    type Output = Result<Value, Value>;
    type IntoFuture = Settled;

    fn into_future(self) -> Settled {
        Settled { promise: self }
    }
}

/// The capabilities that settle one promise.
///
/// Both capabilities are no-ops once the promise settled. While an adopted
/// thenable is still pending, a later `resolve` or `reject` wins and the
/// adopted outcome is dropped when it arrives.
#[derive(Clone)]
pub struct Resolver {
    promise: Promise,
}

impl Resolver {
    pub(crate) fn new(promise: &Promise) -> Self {
        Resolver {
            promise: promise.clone(),
        }
    }

    /// Resolves with `value`, adopting it when it is a thenable.
    pub fn resolve(&self, value: impl Into<Value>) {
        if self.promise.is_pending() {
            thenable::resolve_promise(&self.promise, value.into());
        }
    }

    /// Rejects with `reason`. Reasons are never unwrapped.
    pub fn reject(&self, reason: impl Into<Value>) {
        if self.promise.is_pending() {
            self.promise.reject_with(reason.into());
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.promise.is_pending()
    }

    /// [`Resolver::resolve`] as a callable value, e.g. to hand to a `then`.
    pub fn resolve_fn(&self) -> Function {
        let resolver = self.clone();
        Function::unary(move |value| {
            resolver.resolve(value);
            Ok(Value::Undefined)
        })
    }

    /// [`Resolver::reject`] as a callable value.
    pub fn reject_fn(&self) -> Function {
        let resolver = self.clone();
        Function::unary(move |reason| {
            resolver.reject(reason);
            Ok(Value::Undefined)
        })
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.promise)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, MicrotaskQueue};
    use std::cell::Cell;
    use futures::{executor::LocalPool, task::LocalSpawnExt};
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    fn fresh() -> (MicrotaskQueue, Promise, Resolver) {
        let queue = MicrotaskQueue::new();
        let (promise, resolver) = fresh_on(&queue);
        (queue, promise, resolver)
    }

    fn fresh_on(queue: &MicrotaskQueue) -> (Promise, Resolver) {
        let promise = Promise::pending(Rc::new(queue.clone()));
        let resolver = Resolver::new(&promise);
        (promise, resolver)
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &'static str) -> Function {
        let log = log.clone();
        Function::unary(move |v| {
            log.borrow_mut().push(format!("{tag}:{v:?}"));
            Ok(v)
        })
    }

    #[test]
    fn first_settlement_wins() {
        let (queue, promise, resolver) = fresh();
        resolver.resolve(1);
        resolver.reject("late");
        resolver.resolve(2);
        assert_eq!(promise.state(), State::Fulfilled(Value::from(1)));
        assert_eq!(queue.block_on(&promise), Ok(Ok(Value::from(1))));
    }

    #[test]
    fn only_the_matching_queue_drains() {
        let (queue, promise, resolver) = fresh();
        let log = Rc::new(RefCell::new(Vec::new()));
        promise.then(recorder(&log, "ok"), recorder(&log, "err"));
        promise.then(recorder(&log, "ok2"), recorder(&log, "err2"));

        resolver.reject("nope");
        assert!(log.borrow().is_empty());
        queue.run_until_idle().unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "err:String(\"nope\")".to_owned(),
                "err2:String(\"nope\")".to_owned()
            ]
        );
    }

    #[test]
    fn reactions_on_settled_promise_are_deferred() {
        let (queue, promise, resolver) = fresh();
        resolver.resolve("done");
        let log = Rc::new(RefCell::new(Vec::new()));
        promise.then(recorder(&log, "ok"), Value::Undefined);
        assert!(log.borrow().is_empty());
        assert_eq!(queue.len(), 1);
        queue.run_until_idle().unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn handler_error_rejects_downstream() {
        let (queue, promise, resolver) = fresh();
        let downstream = promise.then(
            Function::unary(|_| Err(Value::from("handler failed"))),
            Value::Undefined,
        );
        resolver.resolve(1);
        assert_eq!(
            queue.block_on(&downstream),
            Ok(Err(Value::from("handler failed")))
        );
    }

    #[test]
    fn handler_panic_rejects_downstream() {
        let (queue, promise, resolver) = fresh();
        let downstream = promise.catch(Function::new(|_| panic!("handler blew up")));
        resolver.reject(0);
        assert_eq!(
            queue.block_on(&downstream),
            Ok(Err(Value::from(Error::Panicked("handler blew up".into()))))
        );
    }

    #[test]
    fn non_callable_handlers_pass_through() {
        let (queue, promise, resolver) = fresh();
        let downstream = promise.then(Value::from(5), Value::Null);
        resolver.resolve("kept");
        assert_eq!(queue.block_on(&downstream), Ok(Ok(Value::from("kept"))));
    }

    #[test]
    fn handler_returning_own_promise_is_a_cycle() {
        let (queue, promise, resolver) = fresh();
        let slot: Rc<RefCell<Option<Promise>>> = Rc::new(RefCell::new(None));
        let downstream = {
            let slot = slot.clone();
            promise.then(
                Function::unary(move |_| {
                    Ok(slot.borrow().clone().map_or(Value::Undefined, Value::Promise))
                }),
                Value::Undefined,
            )
        };
        *slot.borrow_mut() = Some(downstream.clone());
        resolver.resolve(1);
        assert_eq!(
            queue.block_on(&downstream),
            Ok(Err(Value::from(Error::ChainingCycle)))
        );
    }

    #[test]
    fn reject_wins_while_adoption_is_pending() {
        let (queue, promise, resolver) = fresh();
        let (inner, inner_resolver) = fresh_on(&queue);
        resolver.resolve(inner.clone());
        assert!(!resolver.is_settled());
        resolver.reject("rejected while adopting");
        assert!(resolver.is_settled());
        inner_resolver.resolve("adopted too late");
        assert_eq!(
            queue.block_on(&promise),
            Ok(Err(Value::from("rejected while adopting")))
        );
    }

    #[test]
    fn adoption_completes_when_nothing_intervenes() {
        let (queue, promise, resolver) = fresh();
        let (inner, inner_resolver) = fresh_on(&queue);
        resolver.resolve(inner.clone());
        queue.run_until_idle().unwrap();
        assert!(promise.is_pending());
        inner_resolver.resolve("adopted");
        assert_eq!(queue.block_on(&promise), Ok(Ok(Value::from("adopted"))));
    }

    #[test]
    fn debug_output_does_not_follow_settled_values() {
        let (queue, promise, resolver) = fresh();
        resolver.resolve(Value::list(vec![promise.clone().into()]));
        queue.run_until_idle().unwrap();
        let printed = format!("{promise:?}");
        assert!(printed.contains("\"fulfilled\""), "{printed}");
        assert!(format!("{:?}", promise.state()).starts_with("Fulfilled("));
    }

    #[test]
    fn finally_preserves_value_and_reason() {
        let (queue, promise, resolver) = fresh();
        let calls = Rc::new(Cell::new(0));
        let counted = {
            let calls = calls.clone();
            Function::new(move |args| {
                assert!(args.is_empty());
                calls.set(calls.get() + 1);
                Ok(Value::from("ignored"))
            })
        };
        let fulfilled = promise.finally(counted.clone());
        resolver.resolve(7);

        let (failing, failing_resolver) = fresh_on(&queue);
        let rejected = failing.finally(counted);
        failing_resolver.reject("original");

        assert_eq!(queue.block_on(&fulfilled), Ok(Ok(Value::from(7))));
        assert_eq!(queue.block_on(&rejected), Ok(Err(Value::from("original"))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn finally_rejection_supersedes() {
        let (queue, promise, resolver) = fresh();
        let raising = Function::new(|_| Err(Value::from("cleanup failed")));
        let chained = promise.finally(raising);
        resolver.reject("original");
        assert_eq!(
            queue.block_on(&chained),
            Ok(Err(Value::from("cleanup failed")))
        );

        let (other, other_resolver) = fresh_on(&queue);
        let scheduler = other.scheduler.clone();
        let returns_rejected = Function::new(move |_| {
            let rejected = Promise::pending(scheduler.clone());
            rejected.reject_with(Value::from("async cleanup failed"));
            Ok(rejected.into())
        });
        let chained = other.finally(returns_rejected);
        other_resolver.resolve(1);
        assert_eq!(
            queue.block_on(&chained),
            Ok(Err(Value::from("async cleanup failed")))
        );
    }

    #[test]
    fn finally_waits_for_returned_thenable() {
        let (queue, promise, resolver) = fresh();
        let (gate, gate_resolver) = fresh_on(&queue);
        let chained = {
            let gate = gate.clone();
            promise.finally(Function::new(move |_| Ok(gate.clone().into())))
        };
        resolver.resolve("value");
        queue.run_until_idle().unwrap();
        assert!(chained.is_pending());
        gate_resolver.resolve("gate value is discarded");
        assert_eq!(queue.block_on(&chained), Ok(Ok(Value::from("value"))));
    }

    #[test]
    fn scheduling_a_reaction_is_traced() {
        let captured = Captured::default();
        let subscriber = {
            let captured = captured.clone();
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_ansi(false)
                .with_writer(move || captured.clone())
                .finish()
        };
        tracing::subscriber::with_default(subscriber, || {
            let (queue, promise, resolver) = fresh();
            promise.then(Value::Undefined, Value::Undefined);
            resolver.resolve(1);
            queue.run_until_idle().unwrap();
        });
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("settled"), "{output}");
        assert!(output.contains("reaction scheduled"), "{output}");
    }

    #[test]
    fn settled_future_resolves_after_queue_runs() {
        let (queue, promise, resolver) = fresh();
        let mut pool = LocalPool::new();
        let seen = Rc::new(RefCell::new(None));
        {
            let seen = seen.clone();
            let promise = promise.clone();
            pool.spawner()
                .spawn_local(async move {
                    *seen.borrow_mut() = Some(promise.await);
                })
                .unwrap();
        }
        pool.run_until_stalled();
        assert!(seen.borrow().is_none());

        resolver.reject("late");
        queue.run_until_idle().unwrap();
        pool.run_until_stalled();
        assert_eq!(*seen.borrow(), Some(Err(Value::from("late"))));
    }
}
