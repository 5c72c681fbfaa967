//! The error taxonomy and the `raise`-propagated error object (§4.7, §6.6).
//!
//! Every failure the evaluator or macro-expander can produce is a [`JasprError`]:
//! a fixed `err` code plus a human-readable `why` and arbitrary context keys. There
//! is no separate "panic" path — errors always flow through [`crate::signal::raise`].

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Value;

/// The exhaustive error code taxonomy from §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ErrCode {
    NoBinding,
    NoKey,
    NoMatch,
    BadName,
    BadArgs,
    BadModule,
    BadPattern,
    NotCallable,
    NoPrimitive,
    NotJSON,
    ParseFailed,
    EvalFailed,
    ReadFailed,
    WriteFailed,
    NativeError,
    NotImplemented,
    AssertFailed,
    ChanClosed,
}

/// A raised error: ordinary data from the evaluator's perspective, carried
/// through `raise` like any other value until a signal handler inspects it.
///
/// `context` holds the well-known extra keys from §6.6 (`fn`, `args`, `name`,
/// `callee`, `key`, `in`, `code`, `context`, `module`, `filename`, `line`,
/// `column`, `help`) plus any caller-supplied ones. Context values are plain
/// JSON-ish `Value`s; a `JasprError` that never captured a magic value is
/// itself always JSON-serializable (§3.1).
#[derive(Debug, Clone)]
pub struct JasprError {
    pub err: ErrCode,
    pub why: String,
    pub context: Vec<(String, Value)>,
}

impl JasprError {
    pub fn new(err: ErrCode, why: impl Into<String>) -> Self {
        Self { err, why: why.into(), context: Vec::new() }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.context.push((key.to_owned(), value));
        self
    }

    pub fn bad_args(why: impl Into<String>) -> Self {
        Self::new(ErrCode::BadArgs, why)
    }

    pub fn not_callable(why: impl Into<String>) -> Self {
        Self::new(ErrCode::NotCallable, why)
    }

    pub fn no_key(why: impl Into<String>) -> Self {
        Self::new(ErrCode::NoKey, why)
    }

    pub fn no_primitive(head: &str) -> Self {
        Self::new(ErrCode::NoPrimitive, format!("no such primitive: {head}"))
    }

    pub fn no_binding(why: impl Into<String>) -> Self {
        Self::new(ErrCode::NoBinding, why)
    }

    /// Wraps a host-language panic payload/message as the `NativeError` a
    /// native function's exception is translated into before being raised (§7).
    pub fn native_error(message: impl Into<String>) -> Self {
        Self::new(ErrCode::NativeError, message)
    }
}

impl fmt::Display for JasprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.err, self.why)
    }
}

impl std::error::Error for JasprError {}

/// Result alias used throughout the evaluator and expander.
pub type RunResult<T> = Result<T, JasprError>;
