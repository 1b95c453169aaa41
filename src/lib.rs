//! Promises/A+ deferred values for a single-threaded, cooperatively
//! scheduled world.
//!
//! A [`Promise`] settles at most once. Reactions registered with
//! [`Promise::then`] always run on a later turn of the [`Scheduler`], never
//! inside the call that registered or triggered them. Any value exposing a
//! callable `then` member is adopted, including thenables that have nothing
//! to do with this crate.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{Function, MicrotaskQueue, Runtime, Value};
//!
//! let queue = MicrotaskQueue::new();
//! let runtime = Runtime::new(queue.clone());
//!
//! let doubled = runtime
//!     .create(|resolver| {
//!         resolver.resolve(21);
//!         Ok(())
//!     })
//!     .then(
//!         Function::unary(|v| Ok(Value::from(v.as_number().unwrap_or_default() * 2.0))),
//!         Value::Undefined,
//!     );
//!
//! assert!(doubled.is_pending());
//! assert_eq!(queue.block_on(&doubled), Ok(Ok(Value::from(42))));
//! ```
use thiserror::Error;

mod combinators;
pub mod promise;
pub mod queue;
pub mod runtime;
pub mod thenable;
pub mod value;

pub use promise::{Promise, Resolver, Settled, State};
pub use queue::{Job, MicrotaskQueue, QueueConfig, Scheduler};
pub use runtime::Runtime;
pub use thenable::is_deferred_like;
pub use value::{Completion, Function, Object, Record, Value};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A promise was resolved with itself.
    #[error("chaining cycle detected for promise")]
    ChainingCycle,
    /// User code panicked while the library was running it.
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("promise is still pending and the microtask queue is idle")]
    Stalled,
    #[error("microtask budget exhausted after {ran} jobs")]
    BudgetExhausted { ran: usize },
}
