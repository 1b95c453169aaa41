//! Dynamic values carried by promises.
//!
//! Adoption is duck-typed: anything that is an object or a callable and
//! exposes a callable `then` member is treated as a thenable. [`Value`] is the
//! small value universe that makes that check expressible, and [`Object`] is
//! the seam foreign thenables plug into.
use std::{
    any::Any,
    cell::RefCell,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

use crate::{Error, Promise};

/// The outcome of running user code: `Ok` is a returned value, `Err` a raised
/// one.
pub type Completion = Result<Value, Value>;

/// Member access for object values.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Object, Value};
///
/// struct Broken;
///
/// impl Object for Broken {
///     fn get(&self, _key: &str) -> Result<Value, Value> {
///         Err("getter exploded".into())
///     }
/// }
///
/// let value = Value::object(Broken);
/// assert_eq!(value.get("then"), Err(Value::from("getter exploded")));
/// ```
pub trait Object {
    /// Reads the member named `key`. Missing members read as
    /// [`Value::Undefined`]; `Err` is a value raised by the read itself.
    fn get(&self, key: &str) -> Completion;
}

/// An ordered, string-keyed property bag.
#[derive(Default)]
pub struct Record {
    fields: RefCell<Vec<(String, Value)>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Record::set`].
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets `key`, replacing an existing field in place.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let mut fields = self.fields.borrow_mut();
        match fields.iter_mut().find(|(name, _)| *name == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key, value)),
        }
    }

    pub fn field(&self, key: &str) -> Option<Value> {
        self.fields
            .borrow()
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }
}

impl Object for Record {
    fn get(&self, key: &str) -> Completion {
        Ok(self.field(key).unwrap_or_default())
    }
}

type NativeFn = dyn Fn(&Value, &[Value]) -> Completion;

/// A shared callable. Calls receive the receiver (`this`) and the argument
/// list.
#[derive(Clone)]
pub struct Function(Rc<FunctionInner>);

struct FunctionInner {
    call: Box<NativeFn>,
    members: Option<Rc<dyn Object>>,
}

impl Function {
    /// A function that ignores its receiver.
    pub fn new(f: impl Fn(&[Value]) -> Completion + 'static) -> Self {
        Self::method(move |_, args| f(args))
    }

    /// A function that sees its receiver.
    pub fn method(f: impl Fn(&Value, &[Value]) -> Completion + 'static) -> Self {
        Function(Rc::new(FunctionInner {
            call: Box::new(f),
            members: None,
        }))
    }

    /// A function of its first argument; a missing argument is `Undefined`.
    pub fn unary(f: impl Fn(Value) -> Completion + 'static) -> Self {
        Self::new(move |args| f(args.first().cloned().unwrap_or_default()))
    }

    /// Gives the function readable members, so a callable can itself be a
    /// thenable.
    pub fn with_members(self, members: impl Object + 'static) -> Self {
        Function(Rc::new(FunctionInner {
            call: Box::new(move |this: &Value, args: &[Value]| self.call(this, args)),
            members: Some(Rc::new(members)),
        }))
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Completion {
        (self.0.call)(this, args)
    }

    /// Like [`Function::call`], but a panic becomes a raised
    /// [`Error::Panicked`].
    pub(crate) fn invoke(&self, this: &Value, args: &[Value]) -> Completion {
        guard(|| self.call(this, args))
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn get(&self, key: &str) -> Completion {
        match &self.0.members {
            Some(members) => members.get(key),
            None => Ok(Value::Undefined),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Rc::as_ptr(&self.0))
    }
}

/// Runs user code, converting a panic into a raised value.
pub(crate) fn guard<T>(f: impl FnOnce() -> Result<T, Value>) -> Result<T, Value> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload)).into()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// A value that can flow through a promise as a fulfillment value, a
/// rejection reason or a handler argument.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    List(Rc<[Value]>),
    Object(Rc<dyn Object>),
    Function(Function),
    Promise(Promise),
    Error(Error),
}

impl Value {
    pub fn object(object: impl Object + 'static) -> Self {
        Value::Object(Rc::new(object))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// True for everything that may carry members: lists, objects,
    /// callables, promises and errors.
    pub fn is_object_or_callable(&self) -> bool {
        matches!(
            self,
            Value::List(_)
                | Value::Object(_)
                | Value::Function(_)
                | Value::Promise(_)
                | Value::Error(_)
        )
    }

    /// Reads a member. Only objects and callables with members can raise;
    /// a promise exposes its own `then`.
    pub fn get(&self, key: &str) -> Completion {
        match self {
            Value::Object(object) => object.get(key),
            Value::Function(function) => function.get(key),
            Value::Promise(promise) if key == "then" => {
                let promise = promise.clone();
                Ok(Function::new(move |args| {
                    let on_fulfilled = args.first().cloned().unwrap_or_default();
                    let on_rejected = args.get(1).cloned().unwrap_or_default();
                    Ok(promise.then(on_fulfilled, on_rejected).into())
                })
                .into())
            }
            _ => Ok(Value::Undefined),
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(promise) => Some(promise),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(object) => write!(f, "Object({:p})", Rc::as_ptr(object)),
            Value::Function(function) => function.fmt(f),
            Value::Promise(promise) => promise.fmt(f),
            Value::Error(error) => write!(f, "Error({error})"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items.into())
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::object(record)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Option<Function>> for Value {
    fn from(function: Option<Function>) -> Self {
        function.map_or(Value::Undefined, Value::Function)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::Promise(promise)
    }
}

impl From<Error> for Value {
    fn from(error: Error) -> Self {
        Value::Error(error)
    }
}
