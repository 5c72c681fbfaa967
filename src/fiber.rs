//! Fibers, Branches, and Junctions (§3.5, §5): the structured-concurrency
//! runtime the evaluator spawns sub-expressions onto.
//!
//! The reference implementation is callback/CPS based (§9 design notes
//! suggest modelling "each suspension point as a state-machine task that
//! yields a `Pending(&Deferred)`"). Rust's `async`/`.await` already compiles
//! to exactly that state machine, so the evaluator and macro-expander are
//! written as ordinary `async fn`s, and this module supplies the minimal
//! single-threaded executor that drives them: a task slab, a ready queue, and
//! a hand-rolled `Waker` (stdlib `core::task::Wake` requires `Send + Sync`,
//! which would force thread-safety this single-event-loop runtime never
//! needs, so the waker is built from `RawWaker` directly — a well-worn
//! pattern for single-threaded toy executors).
//!
//! A [`Branch`] is a node in the cancellation tree (§3.5). A [`Fiber`] is a
//! `Deferred` cell backing one spawned computation, owned by exactly one
//! Branch. A [`Junction`] (the `$junction` special form, §4.5) is built from
//! ordinary branches and fibers: peer branches under one parent, first
//! completion cancels the rest.

use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use ahash::AHashMap;

use crate::{
    error::{ErrCode, JasprError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    tracer::{JasprTracer, NoopTracer},
    value::Value,
};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Identifier for a node in the cancellation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(u32);

struct BranchNode {
    parent: Option<BranchId>,
    children: Vec<BranchId>,
    cancelled: bool,
    on_cancel: Vec<Box<dyn FnOnce()>>,
    /// Deferred cells (fibers) owned directly by this branch.
    active_fibers: Vec<HeapId>,
}

/// Shared mutable state: the value arena, the interner, and the cancellation
/// tree. Cloning an [`Rt`] is an `Rc` bump; every async fn in the evaluator
/// and expander takes one by value or reference and borrows it only across
/// synchronous stretches of code (never across an `.await`).
pub type Rt = Rc<RefCell<Runtime>>;

pub struct Runtime {
    pub heap: Heap,
    pub interns: Interns,
    branches: Vec<BranchNode>,
    root: BranchId,
    pub limits: ResourceLimits,
    fiber_count: usize,
    pub tracer: Rc<dyn JasprTracer>,
    /// `$`-prefixed native primitives consulted by array-head dispatch for
    /// any head that isn't one of the fixed special forms (§4.5, §6.5). Empty
    /// by default; an embedder (or this crate's own `builtins::install_prelude`)
    /// populates it via [`Runtime::register_primitive`]-style inserts.
    pub(crate) primitives: AHashMap<StringId, Value>,
    /// The optional REPL/diagnostics callback (§6.4): invoked instead of the
    /// tracer's silent `on_unhandled` hook when a `raise` reaches the root
    /// with no bound handler.
    pub(crate) unhandled_callback: Option<Rc<dyn Fn(&JasprError)>>,
}

/// Resource limits enforced by the scheduler (§9 design notes: bound recursion
/// and runaway fan-out so a hostile or buggy program can't exhaust the host
/// process). The spec's error taxonomy has no dedicated "resource exceeded"
/// code; exceeding a limit is reported as `EvalFailed` (an Open Question this
/// implementation resolves explicitly — see `DESIGN.md`).
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_branch_depth: usize,
    pub max_live_fibers: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_branch_depth: 4096, max_live_fibers: 1_000_000 }
    }
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(ResourceLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self::with_limits_and_tracer(limits, Rc::new(NoopTracer))
    }

    #[must_use]
    pub fn with_limits_and_tracer(limits: ResourceLimits, tracer: Rc<dyn JasprTracer>) -> Self {
        let root_node = BranchNode { parent: None, children: Vec::new(), cancelled: false, on_cancel: Vec::new(), active_fibers: Vec::new() };
        Self {
            heap: Heap::new(),
            interns: Interns::new(),
            branches: vec![root_node],
            root: BranchId(0),
            limits,
            fiber_count: 0,
            tracer,
            primitives: AHashMap::new(),
            unhandled_callback: None,
        }
    }

    /// Installs the REPL/diagnostics callback (§6.4): called in place of the
    /// tracer's `on_unhandled` hook whenever a `raise` reaches the root with
    /// no bound signal handler.
    pub fn set_unhandled_callback(&mut self, f: impl Fn(&JasprError) + 'static) {
        self.unhandled_callback = Some(Rc::new(f));
    }

    #[must_use]
    pub fn root_branch(&self) -> BranchId {
        self.root
    }

    fn depth_of(&self, id: BranchId) -> usize {
        let mut depth = 0;
        let mut cur = Some(id);
        while let Some(b) = cur {
            depth += 1;
            cur = self.branches[b.0 as usize].parent;
        }
        depth
    }

    /// Creates a new child Branch of `parent`.
    pub fn new_branch(&mut self, parent: BranchId) -> RunResult<BranchId> {
        if self.depth_of(parent) >= self.limits.max_branch_depth {
            return Err(JasprError::new(ErrCode::EvalFailed, "maximum branch nesting depth exceeded"));
        }
        let id = BranchId(u32::try_from(self.branches.len()).expect("branch arena overflow"));
        self.branches.push(BranchNode {
            parent: Some(parent),
            children: Vec::new(),
            cancelled: self.branches[parent.0 as usize].cancelled,
            on_cancel: Vec::new(),
            active_fibers: Vec::new(),
        });
        self.branches[parent.0 as usize].children.push(id);
        self.tracer.on_branch_created(id, parent);
        Ok(id)
    }

    #[must_use]
    pub fn is_cancelled(&self, id: BranchId) -> bool {
        self.branches[id.0 as usize].cancelled
    }

    /// Registers an on-cancel listener (§3.5). Runs once, the first time this
    /// branch (or an ancestor) is cancelled.
    pub fn on_cancel(&mut self, id: BranchId, f: impl FnOnce() + 'static) {
        if self.branches[id.0 as usize].cancelled {
            f();
        } else {
            self.branches[id.0 as usize].on_cancel.push(Box::new(f));
        }
    }

    /// Cancels `id` and, breadth-first, every descendant (§5: "schedule
    /// cancel-propagation breadth-first" to bound recursion depth).
    /// Idempotent: a branch already cancelled is skipped entirely, so its
    /// listeners never run twice.
    pub fn cancel_branch(&mut self, id: BranchId) {
        let mut queue = VecDeque::from([id]);
        while let Some(b) = queue.pop_front() {
            let node = &mut self.branches[b.0 as usize];
            if node.cancelled {
                continue;
            }
            node.cancelled = true;
            let listeners = std::mem::take(&mut node.on_cancel);
            let fibers = std::mem::take(&mut node.active_fibers);
            let children = node.children.clone();
            self.tracer.on_branch_cancelled(b);
            for listener in listeners {
                listener();
            }
            for fiber in fibers {
                cancel_deferred(self, fiber);
            }
            queue.extend(children);
        }
    }

    fn track_fiber(&mut self, branch: BranchId, fiber: HeapId) {
        self.branches[branch.0 as usize].active_fibers.push(fiber);
        self.fiber_count += 1;
        self.tracer.on_fiber_spawned(branch);
    }

    fn untrack_fiber(&mut self, branch: BranchId, fiber: HeapId) {
        if let Some(node) = self.branches.get_mut(branch.0 as usize) {
            node.active_fibers.retain(|&f| f != fiber);
        }
        self.fiber_count = self.fiber_count.saturating_sub(1);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Deferred primitives (§4.1)
// ---------------------------------------------------------------------

/// Allocates a fresh unresolved Deferred cell and returns its id.
pub(crate) fn new_deferred(rt: &Rt) -> HeapId {
    rt.borrow_mut().heap.alloc(HeapData::Deferred(crate::heap::DeferredState::Unresolved(Vec::new())))
}

/// `resolve(value)` (§4.1). Resolving an already-cancelled Deferred is a
/// silent no-op; resolving an already-resolved one is a fatal implementation
/// error (caught here as a panic, matching §7: "Double resolve... aborts the
/// runtime... not a user-visible error").
pub(crate) fn resolve_deferred(rt: &Rt, id: HeapId, value: Value) {
    let mut runtime = rt.borrow_mut();
    resolve_deferred_locked(&mut runtime, id, value);
}

fn resolve_deferred_locked(runtime: &mut Runtime, id: HeapId, value: Value) {
    let wakers = match runtime.heap.get_mut(id) {
        HeapData::Deferred(state) => match state {
            crate::heap::DeferredState::Cancelled => return,
            crate::heap::DeferredState::Resolved(_) => panic!("double resolve of Deferred {id:?}"),
            crate::heap::DeferredState::Unresolved(wakers) => std::mem::take(wakers),
        },
        _ => unreachable!("resolve_deferred called on a non-Deferred HeapId"),
    };
    *runtime.heap.get_mut(id) = HeapData::Deferred(crate::heap::DeferredState::Resolved(value));
    for waker in wakers {
        waker.wake();
    }
}

/// `cancel()` (§4.1): mark cancelled, clear listeners without invoking them.
/// A no-op on an already-resolved or already-cancelled cell.
fn cancel_deferred(runtime: &mut Runtime, id: HeapId) {
    if let HeapData::Deferred(state @ crate::heap::DeferredState::Unresolved(_)) = runtime.heap.get_mut(id) {
        *state = crate::heap::DeferredState::Cancelled;
    }
}

/// Awaits a Deferred cell, suspending the current task if unresolved. Never
/// completes if the cell is (or becomes) cancelled — the owning task simply
/// stops making progress, which is how branch cancellation takes effect
/// (§5: "a cancelled Fiber never resolves; any outstanding await on it never fires").
pub(crate) fn await_deferred(rt: Rt, id: HeapId) -> impl Future<Output = Value> {
    AwaitDeferred { rt, id }
}

struct AwaitDeferred {
    rt: Rt,
    id: HeapId,
}

impl Future for AwaitDeferred {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Value> {
        let mut runtime = self.rt.borrow_mut();
        match runtime.heap.get_mut(self.id) {
            HeapData::Deferred(crate::heap::DeferredState::Resolved(v)) => Poll::Ready(*v),
            HeapData::Deferred(crate::heap::DeferredState::Unresolved(wakers)) => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
            HeapData::Deferred(crate::heap::DeferredState::Cancelled) => Poll::Pending,
            _ => unreachable!("await_deferred called on a non-Deferred HeapId"),
        }
    }
}

/// Forces a value: if it's a `Deferred`, suspends until it resolves (or
/// forever, if it's cancelled); otherwise returns it immediately. Every
/// evaluator/expander step that inspects a value of unknown type goes
/// through this first (§5 "Suspension points").
pub(crate) fn force(rt: Rt, v: Value) -> BoxFuture<Value> {
    Box::pin(async move {
        match v {
            Value::Deferred(id) => await_deferred(rt, id).await,
            other => other,
        }
    })
}

// ---------------------------------------------------------------------
// Spawning fibers
// ---------------------------------------------------------------------

/// A handle to a spawned Fiber: the Deferred backing its eventual result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FiberHandle(HeapId);

impl FiberHandle {
    pub(crate) fn await_result(self, rt: &Rt) -> impl Future<Output = Value> {
        await_deferred(rt.clone(), self.0)
    }

    /// The `Deferred` cell backing this fiber's eventual result. `$arrayMake`/
    /// `$objectMake` (§4.5) store this directly as a slot so the array/object
    /// they build can hand back an unresolved placeholder without blocking on
    /// it — the caller forces each slot on demand, same as any other lazy
    /// value (§4.1).
    pub(crate) fn into_deferred(self) -> Value {
        Value::Deferred(self.0)
    }
}

/// Spawns `fut` as a Fiber owned by `branch`. Returns immediately; `fut` runs
/// cooperatively as the executor is driven (see `run_until_stalled`).
pub(crate) fn spawn_fiber(exec: &Ex, rt: &Rt, branch: BranchId, fut: BoxFuture<Value>) -> FiberHandle {
    let fiber_id = new_deferred(rt);
    rt.borrow_mut().track_fiber(branch, fiber_id);
    let task = FiberTask { rt: rt.clone(), branch, fiber_id, inner: fut, finished: false };
    exec.borrow_mut().spawn(Box::pin(task));
    FiberHandle(fiber_id)
}

struct FiberTask {
    rt: Rt,
    branch: BranchId,
    fiber_id: HeapId,
    inner: BoxFuture<Value>,
    finished: bool,
}

impl Future for FiberTask {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(());
        }
        if this.rt.borrow().is_cancelled(this.branch) {
            this.finished = true;
            return Poll::Ready(());
        }
        match this.inner.as_mut().poll(cx) {
            Poll::Ready(value) => {
                this.finished = true;
                let mut runtime = this.rt.borrow_mut();
                runtime.untrack_fiber(this.branch, this.fiber_id);
                resolve_deferred_locked(&mut runtime, this.fiber_id, value);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---------------------------------------------------------------------
// Junction (§4.5 `$junction`, §5 "Junction semantics")
// ---------------------------------------------------------------------

/// Races `exprs` against each other under `parent`. The first to resolve
/// cancels every other peer (before any observer sees the result) and
/// becomes the junction's value. If every peer is cancelled first (e.g. the
/// junction's own branch is cancelled from outside), the junction never
/// resolves.
pub(crate) fn spawn_junction(exec: &Ex, rt: &Rt, parent: BranchId, exprs: Vec<BoxFuture<Value>>) -> RunResult<FiberHandle> {
    let junction_branch = rt.borrow_mut().new_branch(parent)?;
    let winner = new_deferred(rt);

    let mut peer_branches = Vec::with_capacity(exprs.len());
    for _ in &exprs {
        peer_branches.push(rt.borrow_mut().new_branch(junction_branch)?);
    }

    for (i, expr) in exprs.into_iter().enumerate() {
        let my_branch = peer_branches[i];
        let siblings: Vec<BranchId> = peer_branches.iter().copied().filter(|&b| b != my_branch).collect();
        let rt_clone = rt.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let value = expr.await;
            {
                let mut runtime = rt_clone.borrow_mut();
                for sibling in &siblings {
                    runtime.cancel_branch(*sibling);
                }
                resolve_deferred_locked(&mut runtime, winner, value);
            }
            Value::Null
        });
        spawn_fiber(exec, rt, my_branch, fut);
    }

    Ok(FiberHandle(winner))
}

// ---------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------

/// Shared handle to an [`Executor`]. A separate `Rc<RefCell<_>>` from [`Rt`]
/// so that spawning a new fiber from inside a task's `poll` (e.g. `$junction`
/// spawning its peers) never conflicts with a borrow the driver loop is
/// holding — see `run_until_stalled`, which never holds this borrow across a
/// `poll` call.
pub type Ex = Rc<RefCell<Executor>>;

/// The task slab and ready queue. The ready queue is further split out into
/// its own `Rc<RefCell<_>>` (see [`WakerData`]) so that waking a task — which
/// can happen from inside code that already holds `Runtime`'s borrow, e.g.
/// resolving a Deferred from within another task's poll — never risks a
/// double-borrow panic.
pub struct Executor {
    tasks: Vec<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    free: Vec<usize>,
    ready: Rc<RefCell<VecDeque<usize>>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self { tasks: Vec::new(), free: Vec::new(), ready: Rc::new(RefCell::new(VecDeque::new())) }
    }

    #[must_use]
    pub fn new_shared() -> Ex {
        Rc::new(RefCell::new(Self::new()))
    }

    fn spawn(&mut self, fut: Pin<Box<dyn Future<Output = ()>>>) -> usize {
        let idx = if let Some(idx) = self.free.pop() {
            self.tasks[idx] = Some(fut);
            idx
        } else {
            self.tasks.push(Some(fut));
            self.tasks.len() - 1
        };
        self.ready.borrow_mut().push_back(idx);
        idx
    }

    /// Runs every ready task to the point of suspension, repeatedly, until no
    /// task is ready to make progress (the single-event-loop "dispatcher runs
    /// ready callbacks to completion before advancing" model from §5).
    ///
    /// Never holds `exec`'s own borrow across a `poll` call: a task's body may
    /// itself spawn further fibers (e.g. `$junction`'s peers), which needs a
    /// fresh borrow of the same `Ex`.
    pub fn run_until_stalled(exec: &Ex) {
        let ready = exec.borrow().ready.clone();
        loop {
            let Some(idx) = ready.borrow_mut().pop_front() else { break };
            let Some(mut fut) = exec.borrow_mut().tasks[idx].take() else { continue };
            let waker = make_waker(idx, ready.clone());
            let mut cx = Context::from_waker(&waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    exec.borrow_mut().free.push(idx);
                }
                Poll::Pending => {
                    exec.borrow_mut().tasks[idx] = Some(fut);
                }
            }
        }
    }
}

struct WakerData {
    task: usize,
    ready: Rc<RefCell<VecDeque<usize>>>,
}

fn make_waker(task: usize, ready: Rc<RefCell<VecDeque<usize>>>) -> Waker {
    let data = Rc::into_raw(Rc::new(WakerData { task, ready })).cast::<()>();
    // SAFETY: `data` was just produced by `Rc::into_raw` on an `Rc<WakerData>`,
    // and the vtable's four functions only ever reconstruct/clone/drop that
    // same `Rc<WakerData>` from matching raw pointers, per `Rc`'s documented
    // `into_raw`/`from_raw` contract.
    unsafe { Waker::from_raw(RawWaker::new(data, &WAKER_VTABLE)) }
}

const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(data: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(data.cast::<WakerData>()) };
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned).cast::<()>(), &WAKER_VTABLE)
}

unsafe fn waker_wake(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data.cast::<WakerData>()) };
    rc.ready.borrow_mut().push_back(rc.task);
}

unsafe fn waker_wake_by_ref(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data.cast::<WakerData>()) };
    rc.ready.borrow_mut().push_back(rc.task);
    std::mem::forget(rc);
}

unsafe fn waker_drop(data: *const ()) {
    drop(unsafe { Rc::from_raw(data.cast::<WakerData>()) });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Rt, Ex) {
        (Rc::new(RefCell::new(Runtime::new())), Executor::new_shared())
    }

    #[test]
    fn fiber_resolves_and_is_observable() {
        let (rt, exec) = setup();
        let root = rt.borrow().root_branch();
        let handle = spawn_fiber(&exec, &rt, root, Box::pin(async { Value::Number(42.0) }));
        Executor::run_until_stalled(&exec);
        let FiberHandle(id) = handle;
        match rt.borrow().heap.get(id) {
            HeapData::Deferred(crate::heap::DeferredState::Resolved(Value::Number(n))) => assert_eq!(*n, 42.0),
            _ => panic!("fiber did not resolve"),
        }
    }

    #[test]
    fn cancelling_a_branch_twice_is_idempotent() {
        let (rt, _exec) = setup();
        let root = rt.borrow().root_branch();
        let child = rt.borrow_mut().new_branch(root).unwrap();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        rt.borrow_mut().on_cancel(child, move || *calls2.borrow_mut() += 1);
        rt.borrow_mut().cancel_branch(child);
        rt.borrow_mut().cancel_branch(child);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn junction_returns_fast_result_and_cancels_the_other() {
        let (rt, exec) = setup();
        let root = rt.borrow().root_branch();

        let fast: BoxFuture<Value> = Box::pin(async { Value::Number(1.0) });
        let slow_ran = Rc::new(RefCell::new(false));
        let slow_ran2 = slow_ran.clone();
        let slow: BoxFuture<Value> = Box::pin(async move {
            std::future::pending::<()>().await;
            *slow_ran2.borrow_mut() = true;
            Value::Number(2.0)
        });

        let handle = spawn_junction(&exec, &rt, root, vec![fast, slow]).unwrap();
        Executor::run_until_stalled(&exec);

        let FiberHandle(id) = handle;
        match rt.borrow().heap.get(id) {
            HeapData::Deferred(crate::heap::DeferredState::Resolved(Value::Number(n))) => assert_eq!(*n, 1.0),
            _ => panic!("junction did not resolve to the fast branch"),
        }
        assert!(!*slow_ran.borrow());
    }
}
