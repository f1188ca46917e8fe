//! Sandbox side of the bridge.
//!
//! The sandbox is a dedicated thread that owns an [`Interpreter`]. It never
//! shares memory with the host except through the
//! [`SharedRegion`](crate::region::SharedRegion): commands arrive as replies
//! to blocking `read` requests, and everything the interpreter produces
//! (output lines, prompts, images, command completions) is posted to the
//! outbound [`AsyncChannel`](crate::queue::AsyncChannel).
//!
//! Interpreter implementations see only two things: their own value type and
//! an [`Io`] context for the duration of each call.

mod endpoint;
mod worker;

use std::collections::HashMap;

pub use endpoint::Io;
pub(crate) use endpoint::{SandboxEndpoint, SandboxLink};
pub(crate) use worker::spawn_worker;

use crate::{
    error::TransportError,
    protocol::{Handle, ValueKind},
    value::Value,
};

/// Interpreter-facing failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A condition signalled by user code. Reported to the host as an
    /// evaluation error.
    #[error("{0}")]
    Error(String),

    #[error("interrupted")]
    Interrupted,

    /// The bridge failed underneath the interpreter. The worker exits.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Condition {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Function argument as the interpreter sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument<V> {
    pub name: Option<String>,
    pub value: V,
}

/// A synchronous, single-threaded interpreter hosted in the sandbox.
///
/// Every method runs on the sandbox thread. Methods taking an [`Io`] may
/// block on host requests (console input, host calls) through it.
pub trait Interpreter {
    type Value: Clone;

    /// Evaluate `code` with `env` bound for the duration of the evaluation.
    ///
    /// # Errors
    /// Returns a [`Condition`] if evaluation fails or is interrupted.
    fn eval(
        &mut self,
        code: &str,
        env: &[(String, Self::Value)],
        io: &mut Io<'_>,
    ) -> Result<Self::Value, Condition>;

    /// Apply a function value to arguments.
    ///
    /// # Errors
    /// Returns a [`Condition`] if `function` is not callable or the call
    /// fails.
    fn call(
        &mut self,
        function: &Self::Value,
        args: &[Argument<Self::Value>],
        io: &mut Io<'_>,
    ) -> Result<Self::Value, Condition>;

    fn kind(&self, value: &Self::Value) -> ValueKind;

    /// Convert a value to its wire form.
    ///
    /// # Errors
    /// Returns a [`Condition`] for values with no wire form, such as
    /// functions.
    fn to_wire(&self, value: &Self::Value) -> Result<Value, Condition>;

    /// # Errors
    /// Returns a [`Condition`] if the wire value has no interpreter form.
    fn from_wire(&mut self, value: &Value) -> Result<Self::Value, Condition>;

    /// Printed representation, as the console shows it.
    fn to_text(&self, value: &Self::Value) -> String;

    /// Bind `name` in the global environment.
    ///
    /// # Errors
    /// Returns a [`Condition`] if the name cannot be bound.
    fn bind(&mut self, name: &str, value: Self::Value) -> Result<(), Condition>;

    /// Evaluate one console line and print its visible result.
    ///
    /// # Errors
    /// Returns a [`Condition`] if evaluation fails.
    fn eval_console(&mut self, line: &str, io: &mut Io<'_>) -> Result<(), Condition> {
        let value = self.eval(line, &[], io)?;
        if self.kind(&value) != ValueKind::Null {
            io.stdout(&self.to_text(&value))?;
        }
        Ok(())
    }

    /// # Errors
    /// The default implementation rejects every request.
    fn install_packages(&mut self, names: &[String], io: &mut Io<'_>) -> Result<(), Condition> {
        let _ = (names, io);
        Err(Condition::error("package installation is not supported"))
    }

    fn prompt(&self) -> &str {
        "> "
    }
}

/// Values the host holds handles to.
///
/// Handles are allocated from a counter and never reused, so a stale handle
/// can only miss, never alias another value.
#[derive(Debug)]
pub(crate) struct HandleTable<V> {
    next: u64,
    values: HashMap<Handle, V>,
}

impl<V> HandleTable<V> {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            values: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: V) -> Handle {
        let handle = Handle::new(self.next);
        self.next += 1;
        self.values.insert(handle, value);
        handle
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&V> {
        self.values.get(&handle)
    }

    pub(crate) fn release(&mut self, handle: Handle) -> Option<V> {
        self.values.remove(&handle)
    }

    pub(crate) fn contains(&self, handle: Handle) -> bool {
        self.values.contains_key(&handle)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }
}
