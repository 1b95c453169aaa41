//! Aggregate operations over collections of values and thenables.
//!
//! Inputs that are not thenables count as already fulfilled and are
//! consumed synchronously. Thenables are observed through `then`, so their
//! outcomes always arrive on a later turn.
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    thenable::{self, Then},
    Function, Promise, Record, Runtime, Value,
};

enum Input {
    Plain(Value),
    Deferred(Promise),
    /// Reading the input's `then` member raised.
    Raised(Value),
}

impl Runtime {
    fn classify(&self, input: Value) -> Input {
        match thenable::then_of(&input) {
            Ok(None) => Input::Plain(input),
            Ok(Some(Then::Native(promise))) => Input::Deferred(promise),
            Ok(Some(then)) => {
                let (promise, _) = self.deferred();
                thenable::resolve_with_then(&promise, input, then);
                Input::Deferred(promise)
            }
            Err(reason) => Input::Raised(reason),
        }
    }

    /// Fulfills with every input's value, in input order, once all of them
    /// fulfilled. Rejects with the first rejection reason.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{MicrotaskQueue, Runtime, Value};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let runtime = Runtime::new(queue.clone());
    ///
    /// let (later, resolver) = runtime.deferred();
    /// let all = runtime.all([Value::from(later), runtime.resolve(2).into(), Value::from(3)]);
    /// resolver.resolve(1);
    /// assert_eq!(
    ///     queue.block_on(&all),
    ///     Ok(Ok(Value::list(vec![Value::from(1), Value::from(2), Value::from(3)])))
    /// );
    /// ```
    pub fn all<I>(&self, inputs: I) -> Promise
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let inputs: Vec<Value> = inputs.into_iter().map(Into::into).collect();
        let (promise, resolver) = self.deferred();
        if inputs.is_empty() {
            resolver.resolve(Value::list(Vec::new()));
            return promise;
        }

        let results = Rc::new(RefCell::new(vec![Value::Undefined; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        let record = {
            let resolver = resolver.clone();
            Rc::new(move |index: usize, value: Value| {
                results.borrow_mut()[index] = value;
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    resolver.resolve(Value::list(results.take()));
                }
            })
        };

        for (index, input) in inputs.into_iter().enumerate() {
            match self.classify(input) {
                Input::Plain(value) => record(index, value),
                Input::Deferred(source) => {
                    let record = record.clone();
                    let on_fulfilled = Function::unary(move |value| {
                        record(index, value);
                        Ok(Value::Undefined)
                    });
                    source.then(on_fulfilled, resolver.reject_fn());
                }
                Input::Raised(reason) => resolver.reject(reason),
            }
        }
        promise
    }

    /// Settles like whichever input settles first. A plain value wins over
    /// every thenable. An empty input never settles.
    pub fn race<I>(&self, inputs: I) -> Promise
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let (promise, resolver) = self.deferred();
        for input in inputs {
            match self.classify(input.into()) {
                Input::Plain(value) => resolver.resolve(value),
                Input::Deferred(source) => {
                    source.then(resolver.resolve_fn(), resolver.reject_fn());
                }
                Input::Raised(reason) => resolver.reject(reason),
            }
        }
        promise
    }

    /// Fulfills once every input settled, with one record per input in input
    /// order: `{status: "fulfilled", value}` or `{status: "rejected", reason}`.
    /// Never rejects.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{MicrotaskQueue, Runtime, Value};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let runtime = Runtime::new(queue.clone());
    ///
    /// let settled = runtime.all_settled([runtime.resolve(1), runtime.reject("e")]);
    /// let outcome = queue.block_on(&settled).unwrap().unwrap();
    /// let records = outcome.as_list().unwrap();
    /// assert_eq!(records[0].get("status"), Ok(Value::from("fulfilled")));
    /// assert_eq!(records[0].get("value"), Ok(Value::from(1)));
    /// assert_eq!(records[1].get("status"), Ok(Value::from("rejected")));
    /// assert_eq!(records[1].get("reason"), Ok(Value::from("e")));
    /// ```
    pub fn all_settled<I>(&self, inputs: I) -> Promise
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let inputs: Vec<Value> = inputs.into_iter().map(Into::into).collect();
        let (promise, resolver) = self.deferred();
        if inputs.is_empty() {
            resolver.resolve(Value::list(Vec::new()));
            return promise;
        }

        let results = Rc::new(RefCell::new(vec![Value::Undefined; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        let record = Rc::new(move |index: usize, outcome: Result<Value, Value>| {
            let entry = match outcome {
                Ok(value) => Record::new().with("status", "fulfilled").with("value", value),
                Err(reason) => Record::new().with("status", "rejected").with("reason", reason),
            };
            results.borrow_mut()[index] = entry.into();
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                resolver.resolve(Value::list(results.take()));
            }
        });

        for (index, input) in inputs.into_iter().enumerate() {
            match self.classify(input) {
                Input::Plain(value) => record(index, Ok(value)),
                Input::Deferred(source) => {
                    let on_fulfilled = {
                        let record = record.clone();
                        Function::unary(move |value| {
                            record(index, Ok(value));
                            Ok(Value::Undefined)
                        })
                    };
                    let on_rejected = {
                        let record = record.clone();
                        Function::unary(move |reason| {
                            record(index, Err(reason));
                            Ok(Value::Undefined)
                        })
                    };
                    source.then(on_fulfilled, on_rejected);
                }
                Input::Raised(reason) => record(index, Err(reason)),
            }
        }
        promise
    }
}
