//! The pass driver: well-known-symbol resolution and the per-function
//! pipeline.
//!
//! Construction resolves (and where needed interns) the runtime symbols the
//! pass cooperates with.  Running the pass on a function applies the six
//! stages in order (local scan, dataflow, live-set assembly, coloring,
//! frame placement, cleanup), each stage observing the committed output of
//! the one before.  A module that never declared the thread-state getter
//! gets the degenerate mode: cleanup only, no liveness, no frame.

use log::debug;

use crate::coloring::color_roots;
use crate::ir::{AddrSpace, Func, FuncDecl, Inst, Module, SymIx, Ty, Value};
use crate::liveness::compute_liveness;

/// Returns a pointer to the per-thread state; its presence in the entry
/// block is what marks a function as managed.
pub const TLS_GETTER: &str = "gc_get_tls_state";
/// Ordering marker erased during cleanup.
pub const ROOT_FLUSH: &str = "gc.root_flush";
/// Placeholder unwrap of a tracked reference to its raw address.
pub const POINTER_FROM_OBJREF: &str = "gc.pointer_from_objref";
/// Placeholder allocation, lowered to a pool or big allocation.
pub const ALLOC_OBJ: &str = "gc.alloc_obj";
/// `(ptls, pool_index, pool_size) -> tracked`; interned on first need.
pub const POOL_ALLOC: &str = "gc_pool_alloc";
/// `(ptls, nbytes) -> tracked`; interned on first need.
pub const BIG_ALLOC: &str = "gc_big_alloc";

pub struct RootPlacement {
    pub(crate) ptls_getter: Option<SymIx>,
    pub(crate) root_flush: Option<SymIx>,
    pub(crate) pointer_from_objref: Option<SymIx>,
    pub(crate) alloc_obj: Option<SymIx>,
    pub(crate) pool_alloc: Option<SymIx>,
    pub(crate) big_alloc: Option<SymIx>,
    pub(crate) memcmp: Option<SymIx>,
}

impl RootPlacement {
    /// Resolve the well-known symbols once per module.  The allocator
    /// entry points are declared here if the module allocates but has not
    /// declared them itself.
    pub fn new(module: &mut Module) -> Self {
        let ptls_getter = module.lookup(TLS_GETTER);
        let root_flush = module.lookup(ROOT_FLUSH);
        let pointer_from_objref = module.lookup(POINTER_FROM_OBJREF);
        let alloc_obj = module.lookup(ALLOC_OBJ);
        let memcmp = module.lookup("memcmp");
        let (pool_alloc, big_alloc) = if alloc_obj.is_some() {
            let pool = module.declare(FuncDecl {
                name: POOL_ALLOC.to_string(),
                ret_ty: Ty::Ptr(AddrSpace::Tracked),
                arg_tys: vec![Ty::Ptr(AddrSpace::Generic), Ty::Int(32), Ty::Int(32)],
                ret_noalias: true,
            });
            let big = module.declare(FuncDecl {
                name: BIG_ALLOC.to_string(),
                ret_ty: Ty::Ptr(AddrSpace::Tracked),
                arg_tys: vec![Ty::Ptr(AddrSpace::Generic), Ty::Int(64)],
                ret_noalias: true,
            });
            (Some(pool), Some(big))
        } else {
            (None, None)
        };
        Self { ptls_getter, root_flush, pointer_from_objref, alloc_obj, pool_alloc, big_alloc, memcmp }
    }

    /// Run the pass over one function.  Returns whether the IR changed.
    pub fn run_on_function(&self, func: &mut Func) -> bool {
        debug!("root placement: processing {}", func.name);
        let getter = match self.ptls_getter {
            Some(g) => g,
            None => return self.cleanup_ir(func),
        };
        let ptls = func.blocks[func.entry().index()].insts.iter().copied().find(|&iix| {
            matches!(func.inst(iix), Inst::Call(c) if c.callee == Value::Func(getter))
        });
        let ptls = match ptls {
            Some(p) => p,
            // Not a managed function; only the cleanup applies.
            None => return self.cleanup_ir(func),
        };
        let mut state = self.local_scan(func);
        compute_liveness(func, &mut state);
        let colors = color_roots(&state);
        self.place_roots_and_update_calls(func, &state, &colors, ptls);
        self.cleanup_ir(func);
        true
    }
}
