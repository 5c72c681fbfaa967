//! Native functions (§6.5): the host-language escape hatch call dispatch
//! (§4.5.1) falls into when the callee is neither a closure nor one of the
//! structural call forms (empty-array constructor, number index, string key
//! lookup).
//!
//! Arguments are always fully forced `Value`s by the time a native function
//! sees them — the call-dispatch code in `eval.rs` awaits every argument
//! Deferred before invoking either form below, per §6.5.

use std::{future::Future, pin::Pin, rc::Rc};

use crate::{error::RunResult, fiber::Rt, value::Value};

pub(crate) type NativeResultFuture = Pin<Box<dyn Future<Output = RunResult<Value>>>>;

/// A host-provided function. The synchronous form never suspends and cannot
/// itself spawn concurrent work; the asynchronous form gets the shared
/// runtime handle and may `.await` (a channel op, I/O, another native call).
#[derive(Clone)]
pub(crate) enum NativeFn {
    Sync(Rc<dyn Fn(&mut crate::fiber::Runtime, &[Value]) -> RunResult<Value>>),
    Async(Rc<dyn Fn(Rt, Vec<Value>) -> NativeResultFuture>),
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("NativeFn::Sync(..)"),
            Self::Async(_) => f.write_str("NativeFn::Async(..)"),
        }
    }
}

impl NativeFn {
    pub(crate) fn sync(f: impl Fn(&mut crate::fiber::Runtime, &[Value]) -> RunResult<Value> + 'static) -> Self {
        Self::Sync(Rc::new(f))
    }

    pub(crate) fn r#async<F, Fut>(f: F) -> Self
    where
        F: Fn(Rt, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = RunResult<Value>> + 'static,
    {
        Self::Async(Rc::new(move |rt, args| Box::pin(f(rt, args))))
    }

    pub(crate) async fn call(&self, rt: &Rt, args: Vec<Value>) -> RunResult<Value> {
        match self {
            Self::Sync(f) => f(&mut rt.borrow_mut(), &args),
            Self::Async(f) => f(rt.clone(), args).await,
        }
    }
}
