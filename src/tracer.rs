//! Evaluator tracing: hook points at the events the runtime's owner is most
//! likely to want visibility into (branch lifecycle, fiber spawn, raised and
//! unhandled errors).
//!
//! Unlike the teacher's `VmTracer` (a per-opcode hook threaded through the VM
//! as a generic type parameter so the compiler monomorphizes `NoopTracer` down
//! to nothing), this runtime carries its tracer as `Rc<dyn JasprTracer>`: the
//! hooks here fire at branch/fiber/raise granularity, not per-instruction, so
//! dynamic dispatch's cost is immaterial and a trait object lets a host swap
//! tracers at construction time without a generic parameter on every public
//! type. All methods default to no-ops, same as the teacher's trait, so a
//! partial implementation only pays for the hooks it overrides.

use crate::{error::JasprError, fiber::BranchId};

/// Hook points into the evaluator's structured-concurrency runtime.
pub trait JasprTracer {
    /// A child Branch was created under `parent`.
    fn on_branch_created(&self, _id: BranchId, _parent: BranchId) {}

    /// `id` (and, by propagation, its whole subtree) was just cancelled.
    fn on_branch_cancelled(&self, _id: BranchId) {}

    /// A Fiber was spawned on `branch`.
    fn on_fiber_spawned(&self, _branch: BranchId) {}

    /// A `raise` occurred, before the signal-handler search.
    fn on_raised(&self, _err: &JasprError) {}

    /// A `raise` reached the root with no handler; the owning branch is about
    /// to be cancelled.
    fn on_unhandled(&self, _err: &JasprError) {}
}

/// Zero-cost production default: every hook is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl JasprTracer for NoopTracer {}

/// Human-readable trace to stderr, for interactive debugging of the evaluator
/// itself (cancellation propagation and unhandled raises are otherwise silent
/// by design, per §4.7 — "there is no default top-level reporting").
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl JasprTracer for StderrTracer {
    fn on_branch_created(&self, id: BranchId, parent: BranchId) {
        eprintln!("branch {id:?} created under {parent:?}");
    }

    fn on_branch_cancelled(&self, id: BranchId) {
        eprintln!("branch {id:?} cancelled");
    }

    fn on_fiber_spawned(&self, branch: BranchId) {
        eprintln!("fiber spawned on {branch:?}");
    }

    fn on_raised(&self, err: &JasprError) {
        eprintln!("raise: {err}");
    }

    fn on_unhandled(&self, err: &JasprError) {
        eprintln!("unhandled raise, cancelling owning branch: {err}");
    }
}
