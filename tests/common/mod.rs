#![allow(dead_code)]
//! Shared integration test utilities.
use std::sync::Once;

use promise_aplus::{Function, MicrotaskQueue, Runtime, Value};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. `RUST_LOG`
/// overrides the default `warn` filter.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn runtime() -> (MicrotaskQueue, Runtime) {
    init_test_logging();
    let queue = MicrotaskQueue::new();
    (queue.clone(), Runtime::new(queue))
}

/// Calls a callback value handed to a `then` implementation.
pub fn call(callback: &Value, argument: impl Into<Value>) {
    let _ = callback
        .as_function()
        .expect("callback is callable")
        .call(&Value::Undefined, &[argument.into()]);
}

/// A handler that returns its argument unchanged and logs it under `tag`.
pub fn logging(log: &std::rc::Rc<std::cell::RefCell<Vec<String>>>, tag: &'static str) -> Function {
    let log = log.clone();
    Function::unary(move |value| {
        log.borrow_mut().push(format!("{tag} {value:?}"));
        Ok(value)
    })
}
