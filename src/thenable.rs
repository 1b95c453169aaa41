//! Capability detection and the thenable resolution procedure.
//!
//! Adopting a value into a promise goes through [`resolve_promise`]:
//!
//! 1. a promise resolved with itself rejects with [`Error::ChainingCycle`];
//! 2. values that are not objects or callables fulfill directly;
//! 3. the `then` member is read once, and a raising read rejects;
//! 4. a non-callable `then` fulfills with the value itself;
//! 5. a callable `then` is called with the value as receiver and a fresh pair
//!    of callbacks sharing one latch. Only the first callback call counts, and
//!    a raise from `then` after the latch fired is ignored.
//!
//! A foreign thenable that calls back synchronously with another thenable is
//! adopted in place, inside that callback, so nested `then` calls happen
//! before the outer `then` returns.
use std::{cell::Cell, rc::Rc};

use tracing::debug;

use crate::{value::guard, Error, Function, Promise, Value};

/// How a thenable's `then` is reached.
pub(crate) enum Then {
    /// One of our own promises; its reactions are registered directly.
    Native(Promise),
    Foreign(Function),
}

/// Reads the `then` member of `value`. `Ok(None)` means `value` is not a
/// thenable.
pub(crate) fn then_of(value: &Value) -> Result<Option<Then>, Value> {
    match value {
        Value::Promise(promise) => Ok(Some(Then::Native(promise.clone()))),
        value if value.is_object_or_callable() => match guard(|| value.get("then"))? {
            Value::Function(then) => Ok(Some(Then::Foreign(then))),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

/// True when `value` is an object or callable with a callable `then` member.
///
/// A `then` member whose read raises makes the value not deferred-like.
///
/// # Examples
///
/// ```
/// use promise_aplus::{is_deferred_like, Function, Record, Value};
///
/// let thenable = Record::new().with("then", Function::new(|_| Ok(Value::Undefined)));
/// assert!(is_deferred_like(&thenable.into()));
/// assert!(!is_deferred_like(&Record::new().with("then", 1).into()));
/// assert!(!is_deferred_like(&Value::from("then")));
/// ```
pub fn is_deferred_like(value: &Value) -> bool {
    matches!(then_of(value), Ok(Some(_)))
}

/// Adopts the eventual outcome of `x` into `target`.
pub(crate) fn resolve_promise(target: &Promise, x: Value) {
    if let Value::Promise(promise) = &x {
        if promise.ptr_eq(target) {
            debug!("promise resolved with itself");
            target.reject_with(Error::ChainingCycle.into());
            return;
        }
    }
    match then_of(&x) {
        Ok(Some(then)) => resolve_with_then(target, x, then),
        Ok(None) => target.fulfill(x),
        Err(reason) => target.reject_with(reason),
    }
}

/// Calls `then` on `x` once its `then` member has been read.
pub(crate) fn resolve_with_then(target: &Promise, x: Value, then: Then) {
    match then {
        Then::Native(promise) => {
            let on_fulfilled = {
                let target = target.clone();
                Function::unary(move |y| {
                    resolve_promise(&target, y);
                    Ok(Value::Undefined)
                })
            };
            let on_rejected = {
                let target = target.clone();
                Function::unary(move |r| {
                    target.reject_with(r);
                    Ok(Value::Undefined)
                })
            };
            promise.subscribe(Some(on_fulfilled), Some(on_rejected), None);
        }
        Then::Foreign(then) => {
            // shared by both callbacks; only the first call counts
            let called = Rc::new(Cell::new(false));
            let on_fulfilled = {
                let called = called.clone();
                let target = target.clone();
                Function::unary(move |y| {
                    if !called.replace(true) {
                        resolve_promise(&target, y);
                    }
                    Ok(Value::Undefined)
                })
            };
            let on_rejected = {
                let called = called.clone();
                let target = target.clone();
                Function::unary(move |r| {
                    if !called.replace(true) {
                        target.reject_with(r);
                    }
                    Ok(Value::Undefined)
                })
            };

            if let Err(reason) = then.invoke(&x, &[on_fulfilled.into(), on_rejected.into()]) {
                if called.replace(true) {
                    debug!(?reason, "thenable raised after settling; ignored");
                } else {
                    target.reject_with(reason);
                }
            }
        }
    }
}
