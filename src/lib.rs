//! Late GC root placement for functions in SSA form.
//!
//! The goal: minimize the number of root slots and the stores that maintain
//! them, subject to the constraint that at every safepoint, every live
//! tracked pointer sits in some slot of a frame the collector can walk.
//! The only places rootedness matters are safepoints (any call that is not
//! a whitelisted helper), so everything here is phrased in terms of what is
//! live when a safepoint is reached.
//!
//! The pass runs as a pipeline over each function:
//!
//! 1. **Local scan** (`scan`).  Each block is walked in reverse, numbering
//!    every distinct tracked base pointer, recording def/use orderings
//!    relative to the safepoints in the block, and lifting selects and phis
//!    of derived pointers into fresh joins of their bases so the base is
//!    never lost across a merge.
//! 2. **Dataflow** (`liveness`).  Textbook iterative liveness, extended
//!    with a forward "defined but not yet rooted" problem whose propagation
//!    any safepoint kills.
//! 3. **Live-set assembly** (`liveness`).  Per-safepoint live sets from the
//!    block-level solution plus the local orderings, load-refined so that a
//!    value loaded from an immutable field of a live object claims no slot;
//!    then the interference graph.
//! 4. **Coloring** (`coloring`).  Greedy coloring in a perfect elimination
//!    order (maximum-cardinality search); values live across a
//!    returns-twice call get exclusive pre-assigned slots.
//! 5. **Frame placement** (`rewrite`).  Allocate and zero the frame, link
//!    it into the per-thread chain, sink tracked allocas into it, emit the
//!    minimum cover of slot stores, pop on every return.
//! 6. **Cleanup** (`cleanup`).  Lower the placeholder intrinsics and the
//!    arg-array calling conventions; strip root-annotation bundles.
//!
//! The pass mutates the function in place and reports a single "changed"
//! bit; malformed input is a compiler bug and panics.

mod bitvec;
mod cleanup;
mod coloring;
mod ir;
mod liveness;
mod pass;
mod rewrite;
mod scan;

#[cfg(test)]
mod tests;

pub use crate::bitvec::BitVec;
pub use crate::cleanup::{classify_pool, MAX_POOL_ALLOC};
pub use crate::ir::{
    AddrSpace, Block, BlockIx, CallAttrs, CallConv, CallInst, DebugLoc, Func, FuncDecl, Inst,
    InstIx, Module, SymIx, Tbaa, Ty, Value, WORD_BYTES,
};
pub use crate::pass::{
    RootPlacement, ALLOC_OBJ, BIG_ALLOC, POINTER_FROM_OBJREF, POOL_ALLOC, ROOT_FLUSH, TLS_GETTER,
};
pub use crate::rewrite::PGCSTACK_WORD_OFFSET;
