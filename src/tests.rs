//! End-to-end tests for the pass, driven through a small function builder.

use crate::coloring::color_roots;
use crate::ir::{
    AddrSpace, BlockIx, CallAttrs, CallConv, CallInst, DebugLoc, Func, FuncDecl, Inst, InstIx,
    Module, Tbaa, Ty, Value,
};
use crate::liveness::compute_liveness;
use crate::pass::{
    RootPlacement, ALLOC_OBJ, BIG_ALLOC, POINTER_FROM_OBJREF, POOL_ALLOC, ROOT_FLUSH, TLS_GETTER,
};
use crate::scan::State;

fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

//=============================================================================
// Test scaffolding

const TRACKED: Ty = Ty::Ptr(AddrSpace::Tracked);
const LOADED: Ty = Ty::Ptr(AddrSpace::Loaded);
const GENERIC: Ty = Ty::Ptr(AddrSpace::Generic);

/// A module with the full runtime surface declared, plus a few ordinary
/// callees for tests to use.
fn runtime_module() -> Module {
    let mut m = Module::new();
    declare(&mut m, TLS_GETTER, GENERIC, vec![]);
    declare(&mut m, ROOT_FLUSH, Ty::Void, vec![]);
    declare(&mut m, POINTER_FROM_OBJREF, Ty::Int(64), vec![Ty::Ptr(AddrSpace::Derived)]);
    declare(&mut m, ALLOC_OBJ, TRACKED, vec![GENERIC, Ty::Int(64), TRACKED]);
    declare(&mut m, "memcmp", Ty::Int(32), vec![GENERIC, GENERIC, Ty::Int(64)]);
    declare(&mut m, "foo", Ty::Void, vec![TRACKED, TRACKED]);
    declare(&mut m, "g", Ty::Void, vec![TRACKED]);
    declare(&mut m, "h", Ty::Void, vec![TRACKED]);
    declare(&mut m, "mk", TRACKED, vec![]);
    declare(&mut m, "setjmpish", Ty::Void, vec![]);
    m
}

fn declare(m: &mut Module, name: &str, ret_ty: Ty, arg_tys: Vec<Ty>) -> crate::ir::SymIx {
    m.declare(FuncDecl { name: name.to_string(), ret_ty, arg_tys, ret_noalias: false })
}

/// Statement-level builder so tests read roughly like the IR they create.
struct Fb {
    func: Func,
    cur: BlockIx,
}

impl Fb {
    fn new(name: &str, arg_tys: Vec<Ty>) -> Self {
        let func = Func::new(name, arg_tys);
        let cur = func.entry();
        Self { func, cur }
    }

    fn block(&mut self) -> BlockIx {
        self.func.add_block()
    }

    fn switch(&mut self, bix: BlockIx) {
        self.cur = bix;
    }

    fn inst(&mut self, inst: Inst) -> Value {
        Value::Inst(self.func.push_inst(self.cur, inst))
    }

    fn call_to(&mut self, m: &Module, name: &str, args: Vec<Value>) -> Value {
        let six = m.lookup(name).unwrap();
        let ty = m.decl(six).ret_ty;
        self.inst(Inst::Call(CallInst {
            callee: Value::Func(six),
            args,
            ty,
            cconv: CallConv::Normal,
            returns_twice: false,
            has_bundle: false,
            attrs: CallAttrs::default(),
            dbg: None,
        }))
    }

    fn tls(&mut self, m: &Module) -> Value {
        self.call_to(m, TLS_GETTER, vec![])
    }

    fn load_tracked(&mut self, ptr: Value) -> Value {
        self.inst(Inst::Load { ty: TRACKED, ptr, tbaa: None })
    }

    fn load_immut(&mut self, ptr: Value) -> Value {
        self.inst(Inst::Load { ty: TRACKED, ptr, tbaa: Some(Tbaa::Immut) })
    }

    fn store(&mut self, val: Value, ptr: Value) {
        self.inst(Inst::Store { val, ptr, tbaa: None });
    }

    fn br(&mut self, dest: BlockIx) {
        self.inst(Inst::Br { dest });
    }

    fn cond_br(&mut self, cond: Value, on_true: BlockIx, on_false: BlockIx) {
        self.inst(Inst::CondBr { cond, on_true, on_false });
    }

    fn ret(&mut self) {
        self.inst(Inst::Ret { val: None });
    }

    fn finish(self) -> Func {
        self.func
    }
}

fn run(m: &mut Module, func: &mut Func) -> bool {
    init_logging();
    let pass = RootPlacement::new(m);
    pass.run_on_function(func)
}

/// Scan + dataflow + coloring without the rewrite, for tests that inspect
/// the analysis results directly.
fn analyze(m: &mut Module, func: &mut Func) -> (State, Vec<i32>) {
    init_logging();
    let pass = RootPlacement::new(m);
    let mut state = pass.local_scan(func);
    compute_liveness(func, &mut state);
    let colors = color_roots(&state);
    (state, colors)
}

//=============================================================================
// IR inspection helpers

fn all_insts(func: &Func) -> Vec<InstIx> {
    let mut out = Vec::new();
    for block in &func.blocks {
        out.extend(block.insts.iter().copied());
    }
    out
}

fn count_matching(func: &Func, pred: impl Fn(&Inst) -> bool) -> usize {
    all_insts(func).into_iter().filter(|&iix| pred(func.inst(iix))).count()
}

/// The frame alloca, if the function got one: the pass leaves it as the
/// first instruction of the entry block.
fn frame_of(func: &Func) -> Option<InstIx> {
    let &first = func.blocks[func.entry().index()].insts.first()?;
    match func.inst(first) {
        Inst::Alloca { elem_ty, count: Some(Value::ConstInt(n)) }
            if *elem_ty == TRACKED && *n > 0 =>
        {
            Some(first)
        }
        _ => None,
    }
}

fn frame_slots(func: &Func, frame: InstIx) -> i64 {
    match func.inst(frame) {
        Inst::Alloca { count: Some(Value::ConstInt(n)), .. } => *n,
        other => panic!("not a frame alloca: {:?}", other),
    }
}

/// Stores into root slots (frame offsets 2 and up).
fn root_stores(func: &Func, frame: InstIx) -> Vec<InstIx> {
    all_insts(func)
        .into_iter()
        .filter(|&iix| match func.inst(iix) {
            Inst::Store { ptr: Value::Inst(p), .. } => matches!(
                func.inst(*p),
                Inst::Gep { base: Value::Inst(b), offset: Value::ConstInt(off), .. }
                    if *b == frame && *off >= 2
            ),
            _ => false,
        })
        .collect()
}

/// Frame pops: the chain-head restores, one per return.
fn count_pops(func: &Func) -> usize {
    count_matching(func, |inst| {
        matches!(inst, Inst::Load { tbaa: Some(Tbaa::GcFrame), .. })
    })
}

fn count_rets(func: &Func) -> usize {
    count_matching(func, |inst| matches!(inst, Inst::Ret { .. }))
}

/// Frame pushes: the store of the `nroots << 1` metadata word.
fn count_pushes(func: &Func, frame: InstIx) -> usize {
    all_insts(func)
        .into_iter()
        .filter(|&iix| match func.inst(iix) {
            Inst::Store { ptr: Value::Inst(p), val: Value::ConstInt(_), .. } => matches!(
                func.inst(*p),
                Inst::Gep { base: Value::Inst(b), offset: Value::ConstInt(0), .. } if *b == frame
            ),
            _ => false,
        })
        .count()
}

fn calls_to(func: &Func, m: &Module, name: &str) -> Vec<InstIx> {
    let six = m.lookup(name).unwrap();
    all_insts(func)
        .into_iter()
        .filter(|&iix| {
            matches!(func.inst(iix), Inst::Call(c) if c.callee == Value::Func(six))
        })
        .collect()
}

/// Every pair of values sharing a color must never be live at the same
/// safepoint.
fn assert_coloring_independent(state: &State, colors: &[i32]) {
    for ls in &state.live_sets {
        let members: Vec<usize> = ls.iter().collect();
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                assert_ne!(
                    colors[a], colors[b],
                    "values {} and {} are co-live but share color {}",
                    a, b, colors[a]
                );
            }
        }
    }
}

fn assert_no_empty_color_class(colors: &[i32]) {
    let max = colors.iter().copied().max().unwrap_or(-1);
    for c in 0..=max {
        assert!(colors.contains(&c), "color {} has no member", c);
    }
}

//=============================================================================
// Scenario tests

// Straight-line block with one real call: both loaded values need slots,
// with stores emitted immediately above the call.
#[test]
fn straight_line_single_call() {
    let mut m = runtime_module();
    let mut b = Fb::new("straight_line", vec![LOADED, LOADED]);
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(0));
    let y = b.load_tracked(Value::Arg(1));
    b.call_to(&m, "foo", vec![x, y]);
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));

    let frame = frame_of(&func).expect("expected a frame");
    assert_eq!(frame_slots(&func, frame), 4); // 2 roots + 2 metadata words
    assert_eq!(count_pushes(&func, frame), 1);
    assert_eq!(count_pops(&func), 1);
    assert_eq!(count_rets(&func), 1);
    assert_eq!(root_stores(&func, frame).len(), 2);
    // The zeroing of the frame happens exactly once, in bulk.
    assert_eq!(count_matching(&func, |i| matches!(i, Inst::Memset { .. })), 1);
}

// Two values with disjoint live intervals share a single slot.
#[test]
fn disjoint_intervals_share_slot() {
    let mut m = runtime_module();
    let mut b = Fb::new("disjoint", vec![LOADED, LOADED]);
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(0));
    b.call_to(&m, "g", vec![x]);
    let y = b.load_tracked(Value::Arg(1));
    b.call_to(&m, "h", vec![y]);
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    assert_coloring_independent(&state, &colors);
    let live: Vec<i32> = colors.iter().copied().filter(|&c| c >= 0).collect();
    assert_eq!(live.len(), 2);
    assert_eq!(live[0], live[1], "disjoint intervals should share a slot");

    let mut func2 = {
        let mut b = Fb::new("disjoint", vec![LOADED, LOADED]);
        b.tls(&m);
        let x = b.load_tracked(Value::Arg(0));
        b.call_to(&m, "g", vec![x]);
        let y = b.load_tracked(Value::Arg(1));
        b.call_to(&m, "h", vec![y]);
        b.ret();
        b.finish()
    };
    assert!(run(&mut m, &mut func2));
    let frame = frame_of(&func2).expect("expected a frame");
    assert_eq!(frame_slots(&func2, frame), 3); // one shared root
    assert_eq!(root_stores(&func2, frame).len(), 2); // restored before each call
}

// Diamond merging two loads through a phi: the phi is its own def, its
// operand uses belong to the predecessors, and one slot suffices.
#[test]
fn diamond_phi() {
    let mut m = runtime_module();
    let mut b = Fb::new("diamond", vec![Ty::Int(1), LOADED, LOADED]);
    let bb_a = b.block();
    let bb_b = b.block();
    let bb_c = b.block();
    b.tls(&m);
    b.cond_br(Value::Arg(0), bb_a, bb_b);
    b.switch(bb_a);
    let x = b.load_tracked(Value::Arg(1));
    b.br(bb_c);
    b.switch(bb_b);
    let y = b.load_tracked(Value::Arg(2));
    b.br(bb_c);
    b.switch(bb_c);
    let z = b.inst(Inst::Phi { ty: TRACKED, incoming: vec![(bb_a, x), (bb_b, y)] });
    b.call_to(&m, "h", vec![z]);
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    // Phi operand uses live on the incoming edges.
    let xn = state.all_ptr_numbering[&x] as usize;
    let yn = state.all_ptr_numbering[&y] as usize;
    assert!(state.block_states[bb_a.index()].phi_outs.get(xn));
    assert!(state.block_states[bb_b.index()].phi_outs.get(yn));
    assert_coloring_independent(&state, &colors);
    assert_eq!(colors.iter().filter(|&&c| c >= 0).count(), 1, "only the phi needs a slot");

    let mut func2 = {
        let mut b = Fb::new("diamond", vec![Ty::Int(1), LOADED, LOADED]);
        let bb_a = b.block();
        let bb_b = b.block();
        let bb_c = b.block();
        b.tls(&m);
        b.cond_br(Value::Arg(0), bb_a, bb_b);
        b.switch(bb_a);
        let x = b.load_tracked(Value::Arg(1));
        b.br(bb_c);
        b.switch(bb_b);
        let y = b.load_tracked(Value::Arg(2));
        b.br(bb_c);
        b.switch(bb_c);
        let z = b.inst(Inst::Phi { ty: TRACKED, incoming: vec![(bb_a, x), (bb_b, y)] });
        b.call_to(&m, "h", vec![z]);
        b.ret();
        b.finish()
    };
    assert!(run(&mut m, &mut func2));
    let frame = frame_of(&func2).expect("expected a frame");
    assert_eq!(frame_slots(&func2, frame), 3);
    assert_eq!(root_stores(&func2, frame).len(), 1, "one store at the point dominating the call");
}

// A load from an immutable field of an object that is itself live at the
// safepoint claims no slot of its own.
#[test]
fn immutable_load_refinement() {
    let mut m = runtime_module();
    declare(&mut m, "g2", Ty::Void, vec![TRACKED, TRACKED]);
    let mut b = Fb::new("refine", vec![]);
    b.tls(&m);
    let p = b.call_to(&m, "mk", vec![]);
    let x = b.load_immut(p);
    b.call_to(&m, "g2", vec![x, p]);
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    let pn = state.all_ptr_numbering[&p] as usize;
    let xn = state.all_ptr_numbering[&x] as usize;
    let g2_live = state
        .live_sets
        .iter()
        .find(|ls| ls.get(pn))
        .expect("p live somewhere");
    assert!(!g2_live.get(xn), "refined load must not appear in the live set");
    assert_eq!(colors[xn], -1, "refined load needs no slot");
    assert!(colors[pn] >= 0);
    assert_no_empty_color_class(&colors);
}

// A load refined to the caller's frame (number -1) never occupies a slot,
// so the function needs no frame at all.
#[test]
fn frame_ref_load_is_caller_rooted() {
    let mut m = runtime_module();
    let mut b = Fb::new("caller_rooted", vec![GENERIC]);
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(0));
    b.call_to(&m, "g", vec![x]);
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    assert!(frame_of(&func).is_none(), "caller-rooted load must not force a frame");
}

// Everything live at a returns-twice safepoint gets its own permanent slot.
#[test]
fn returns_twice_gets_exclusive_slots() {
    let mut m = runtime_module();
    declare(&mut m, "use3", Ty::Void, vec![TRACKED, TRACKED, TRACKED]);
    let mut b = Fb::new("rt", vec![LOADED, LOADED, LOADED]);
    b.tls(&m);
    let a = b.load_tracked(Value::Arg(0));
    let bb = b.load_tracked(Value::Arg(1));
    let c = b.load_tracked(Value::Arg(2));
    let six = m.lookup("setjmpish").unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![],
        ty: Ty::Void,
        cconv: CallConv::Normal,
        returns_twice: true,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.call_to(&m, "use3", vec![a, bb, c]);
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    let nums: Vec<usize> = [a, bb, c]
        .iter()
        .map(|v| state.all_ptr_numbering[v] as usize)
        .collect();
    let mut assigned: Vec<i32> = nums.iter().map(|&n| colors[n]).collect();
    assigned.sort();
    assert_eq!(assigned, vec![0, 1, 2], "pre-assigned colors are exclusive and dense");
    // No other value may share a pre-assigned slot.
    for (n, &c) in colors.iter().enumerate() {
        if !nums.contains(&n) {
            assert!(c < 0 || c > 2, "value {} shares a pre-assigned slot", n);
        }
    }
    assert_coloring_independent(&state, &colors);
}

// Allocation lowering: small sizes go to a pool with the rounded size,
// large ones to the big-object allocator; the tag is stored one word
// behind the object; attributes and debug location survive.
#[test]
fn allocation_lowering_pool() {
    let mut m = runtime_module();
    let mut b = Fb::new("alloc_pool", vec![]);
    let ptls = b.tls(&m);
    let six = m.lookup(ALLOC_OBJ).unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![ptls, Value::ConstInt(32), Value::NullPtr(AddrSpace::Tracked)],
        ty: TRACKED,
        cconv: CallConv::Normal,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs { ret_noalias: true },
        dbg: Some(DebugLoc { line: 7, col: 3 }),
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));

    assert!(calls_to(&func, &m, ALLOC_OBJ).is_empty());
    let pool_calls = calls_to(&func, &m, POOL_ALLOC);
    assert_eq!(pool_calls.len(), 1);
    match func.inst(pool_calls[0]) {
        Inst::Call(c) => {
            // 32 bytes of payload + the tag word rounds up to the 48 class.
            assert_eq!(c.args[1], Value::ConstInt(3));
            assert_eq!(c.args[2], Value::ConstInt(48));
            assert!(c.attrs.ret_noalias);
            assert_eq!(c.dbg, Some(DebugLoc { line: 7, col: 3 }));
        }
        _ => unreachable!(),
    }
    // Tag store at word -1, through the derived space.
    let tag_stores = count_matching(&func, |i| {
        matches!(i, Inst::Store { tbaa: Some(Tbaa::Tag), .. })
    });
    assert_eq!(tag_stores, 1);
    assert_eq!(
        count_matching(&func, |i| matches!(
            i,
            Inst::Gep { offset: Value::ConstInt(-1), ty: Ty::Ptr(AddrSpace::Derived), .. }
        )),
        1
    );
}

#[test]
fn allocation_lowering_big() {
    let mut m = runtime_module();
    let mut b = Fb::new("alloc_big", vec![]);
    let ptls = b.tls(&m);
    let six = m.lookup(ALLOC_OBJ).unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![ptls, Value::ConstInt(4096), Value::NullPtr(AddrSpace::Tracked)],
        ty: TRACKED,
        cconv: CallConv::Normal,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let big_calls = calls_to(&func, &m, BIG_ALLOC);
    assert_eq!(big_calls.len(), 1);
    match func.inst(big_calls[0]) {
        Inst::Call(c) => assert_eq!(c.args[1], Value::ConstInt(4096 + 8)),
        _ => unreachable!(),
    }
}

//=============================================================================
// Boundary behaviors

#[test]
fn nothing_live_no_frame() {
    let mut m = runtime_module();
    let mut b = Fb::new("empty", vec![]);
    b.tls(&m);
    b.ret();
    let mut func = b.finish();

    run(&mut m, &mut func);
    assert!(frame_of(&func).is_none());
    assert_eq!(count_pops(&func), 0);
}

#[test]
fn allocas_alone_still_get_a_frame() {
    let mut m = runtime_module();
    let mut b = Fb::new("allocas", vec![]);
    b.tls(&m);
    let a = b.inst(Inst::Alloca { elem_ty: TRACKED, count: None });
    b.inst(Inst::LifetimeStart { ptr: a });
    b.store(Value::NullPtr(AddrSpace::Tracked), a);
    b.inst(Inst::LifetimeEnd { ptr: a });
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let frame = frame_of(&func).expect("alloca must force a frame");
    assert_eq!(frame_slots(&func, frame), 3); // one alloca slot + metadata
    // The alloca is gone, replaced by a slot address; lifetime markers with it.
    assert_eq!(count_matching(&func, |i| matches!(i, Inst::Alloca { count: None, .. })), 0);
    assert_eq!(
        count_matching(&func, |i| matches!(
            i,
            Inst::LifetimeStart { .. } | Inst::LifetimeEnd { .. }
        )),
        0
    );
    // The user store now targets the frame slot.
    assert_eq!(root_stores(&func, frame).len(), 1);
    assert_eq!(count_pops(&func), 1);
}

// Phi of tracked values across a loop back-edge: coloring terminates and a
// single slot serves the loop-carried chain.
#[test]
fn loop_phi_single_slot() {
    let mut m = runtime_module();
    let mut b = Fb::new("loop", vec![Ty::Int(1), LOADED]);
    let bb_loop = b.block();
    let bb_exit = b.block();
    let x0 = {
        b.tls(&m);
        let x0 = b.load_tracked(Value::Arg(1));
        b.br(bb_loop);
        x0
    };
    b.switch(bb_loop);
    let phi_iix = b.func.push_inst(bb_loop, Inst::Phi { ty: TRACKED, incoming: vec![] });
    let z = Value::Inst(phi_iix);
    b.call_to(&m, "g", vec![z]);
    let z2 = b.load_tracked(Value::Arg(1));
    b.cond_br(Value::Arg(0), bb_loop, bb_exit);
    let entry = b.func.entry();
    match b.func.inst_mut(phi_iix) {
        Inst::Phi { incoming, .. } => {
            incoming.push((entry, x0));
            incoming.push((bb_loop, z2));
        }
        _ => unreachable!(),
    }
    b.switch(bb_exit);
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    assert_coloring_independent(&state, &colors);
    assert_eq!(
        colors.iter().filter(|&&c| c >= 0).count(),
        1,
        "only the loop phi is live at the safepoint"
    );
}

#[test]
fn pushes_and_pops_balance_across_returns() {
    let mut m = runtime_module();
    let mut b = Fb::new("two_rets", vec![Ty::Int(1), LOADED]);
    let bb_a = b.block();
    let bb_b = b.block();
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(1));
    b.cond_br(Value::Arg(0), bb_a, bb_b);
    b.switch(bb_a);
    b.call_to(&m, "g", vec![x]);
    b.ret();
    b.switch(bb_b);
    b.call_to(&m, "h", vec![x]);
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let frame = frame_of(&func).expect("expected a frame");
    assert_eq!(count_pushes(&func, frame), 1);
    assert_eq!(count_rets(&func), 2);
    assert_eq!(count_pops(&func), 2, "every return restores the chain head");
}

// Running the scan on two identical functions yields identical numberings.
#[test]
fn scan_is_deterministic() {
    let build = || {
        let m = runtime_module();
        let mut b = Fb::new("det", vec![LOADED, LOADED]);
        b.tls(&m);
        let x = b.load_tracked(Value::Arg(0));
        b.call_to(&m, "g", vec![x]);
        let y = b.load_tracked(Value::Arg(1));
        b.call_to(&m, "foo", vec![x, y]);
        b.ret();
        b.finish()
    };
    init_logging();
    let mut m = runtime_module();
    let pass = RootPlacement::new(&mut m);
    let mut f1 = build();
    let mut f2 = build();
    let s1 = pass.local_scan(&mut f1);
    let s2 = pass.local_scan(&mut f2);
    assert_eq!(s1.max_ptr_number, s2.max_ptr_number);
    assert_eq!(s1.max_safepoint_number, s2.max_safepoint_number);
    for (b1, b2) in s1.block_states.iter().zip(s2.block_states.iter()) {
        assert_eq!(b1.defs, b2.defs);
        assert_eq!(b1.up_exposed_uses, b2.up_exposed_uses);
        assert_eq!(b1.up_exposed_uses_unrooted, b2.up_exposed_uses_unrooted);
    }
}

//=============================================================================
// Lifting

// A phi of derived pointers gets a lifted phi of the bases, and the lifted
// phi takes the slot.
#[test]
fn derived_phi_is_lifted() {
    let mut m = runtime_module();
    let mut b = Fb::new("lift", vec![Ty::Int(1), LOADED, LOADED]);
    let bb_a = b.block();
    let bb_b = b.block();
    let bb_c = b.block();
    b.tls(&m);
    b.cond_br(Value::Arg(0), bb_a, bb_b);
    b.switch(bb_a);
    let xa = b.load_tracked(Value::Arg(1));
    let ca = b.inst(Inst::AddrSpaceCast { val: xa, ty: Ty::Ptr(AddrSpace::Derived) });
    let da = b.inst(Inst::Gep {
        base: ca,
        offset: Value::ConstInt(2),
        ty: Ty::Ptr(AddrSpace::Derived),
    });
    b.br(bb_c);
    b.switch(bb_b);
    let xb = b.load_tracked(Value::Arg(2));
    let db = b.inst(Inst::AddrSpaceCast { val: xb, ty: Ty::Ptr(AddrSpace::Derived) });
    b.br(bb_c);
    b.switch(bb_c);
    let dphi = b.inst(Inst::Phi {
        ty: Ty::Ptr(AddrSpace::Derived),
        incoming: vec![(bb_a, da), (bb_b, db)],
    });
    // Keep the derived phi alive across a safepoint via a store.
    b.call_to(&m, "mk", vec![]);
    b.store(dphi, Value::Arg(1));
    b.ret();
    let mut func = b.finish();

    let (state, colors) = analyze(&mut m, &mut func);
    // The derived phi shares its number with a lifted tracked phi in the
    // same block.
    let dn = state.all_ptr_numbering[&dphi];
    assert!(dn >= 0);
    let lifted = state.reverse_ptr_numbering[dn as usize];
    match lifted {
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Phi { ty, incoming } => {
                assert_eq!(*ty, TRACKED);
                assert_eq!(incoming.len(), 2);
            }
            other => panic!("lifted join is not a phi: {:?}", other),
        },
        other => panic!("lifted join is not an instruction: {:?}", other),
    }
    assert!(colors[dn as usize] >= 0, "the lifted base needs a slot");
    assert_coloring_independent(&state, &colors);
}

// A select of derived pointers with one untracked arm joins the tracked
// base against null.
#[test]
fn derived_select_is_lifted_with_null_arm() {
    let mut m = runtime_module();
    let mut b = Fb::new("lift_select", vec![Ty::Int(1), LOADED, GENERIC]);
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(1));
    let dx = b.inst(Inst::AddrSpaceCast { val: x, ty: Ty::Ptr(AddrSpace::Derived) });
    let dy = b.inst(Inst::AddrSpaceCast { val: Value::Arg(2), ty: Ty::Ptr(AddrSpace::Derived) });
    let sel = b.inst(Inst::Select {
        cond: Value::Arg(0),
        on_true: dx,
        on_false: dy,
        ty: Ty::Ptr(AddrSpace::Derived),
    });
    b.call_to(&m, "mk", vec![]);
    b.store(sel, Value::Arg(2));
    b.ret();
    let mut func = b.finish();

    let (state, _colors) = analyze(&mut m, &mut func);
    let sn = state.all_ptr_numbering[&sel];
    assert!(sn >= 0);
    match state.reverse_ptr_numbering[sn as usize] {
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Select { on_true, on_false, ty, .. } => {
                assert_eq!(*ty, TRACKED);
                assert_eq!(*on_true, x);
                assert_eq!(*on_false, Value::NullPtr(AddrSpace::Tracked));
            }
            other => panic!("lifted join is not a select: {:?}", other),
        },
        other => panic!("lifted join is not an instruction: {:?}", other),
    }
}

//=============================================================================
// Cleanup-only behaviors

#[test]
fn degenerate_mode_without_tls_getter() {
    // No thread-state getter declared: liveness and frames are skipped, but
    // the placeholder lowering still runs.
    let mut m = Module::new();
    declare(&mut m, POINTER_FROM_OBJREF, Ty::Int(64), vec![Ty::Ptr(AddrSpace::Derived)]);
    let mut b = Fb::new("degenerate", vec![TRACKED]);
    let six = m.lookup(POINTER_FROM_OBJREF).unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![Value::Arg(0)],
        ty: Ty::Int(64),
        cconv: CallConv::Normal,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    assert!(frame_of(&func).is_none());
    assert!(calls_to(&func, &m, POINTER_FROM_OBJREF).is_empty());
    assert_eq!(count_matching(&func, |i| matches!(i, Inst::PtrToInt { .. })), 1);
}

#[test]
fn root_flush_is_erased() {
    let mut m = runtime_module();
    let mut b = Fb::new("flush", vec![]);
    b.tls(&m);
    b.call_to(&m, ROOT_FLUSH, vec![]);
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    assert!(calls_to(&func, &m, ROOT_FLUSH).is_empty());
}

#[test]
fn bundle_is_stripped() {
    let mut m = runtime_module();
    let mut b = Fb::new("bundle", vec![TRACKED]);
    b.tls(&m);
    let six = m.lookup("g").unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![Value::Arg(0)],
        ty: Ty::Void,
        cconv: CallConv::Normal,
        returns_twice: false,
        has_bundle: true,
        attrs: CallAttrs::default(),
        dbg: Some(DebugLoc { line: 12, col: 1 }),
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let g_calls = calls_to(&func, &m, "g");
    assert_eq!(g_calls.len(), 1);
    match func.inst(g_calls[0]) {
        Inst::Call(c) => {
            assert!(!c.has_bundle);
            assert_eq!(c.args, vec![Value::Arg(0)]);
            assert_eq!(c.dbg, Some(DebugLoc { line: 12, col: 1 }));
        }
        _ => unreachable!(),
    }
}

#[test]
fn arg_array_call_uses_scratch_frame() {
    let mut m = Module::new();
    declare(&mut m, "apply", TRACKED, vec![]);
    let mut b = Fb::new("jlcall", vec![TRACKED, TRACKED]);
    let six = m.lookup("apply").unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![Value::Arg(0), Value::Arg(1)],
        ty: TRACKED,
        cconv: CallConv::ArgArray,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let calls = calls_to(&func, &m, "apply");
    assert_eq!(calls.len(), 1);
    let (scratch, nargs) = match func.inst(calls[0]) {
        Inst::Call(c) => {
            assert_eq!(c.cconv, CallConv::Normal);
            assert_eq!(c.args.len(), 2);
            (c.args[0], c.args[1])
        }
        _ => unreachable!(),
    };
    assert_eq!(nargs, Value::ConstInt(2));
    // The scratch array was patched to the max arg count seen.
    match scratch {
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Alloca { elem_ty, count } => {
                assert_eq!(*elem_ty, TRACKED);
                assert_eq!(*count, Some(Value::ConstInt(2)));
            }
            other => panic!("callee array is not an alloca: {:?}", other),
        },
        other => panic!("callee array is not an instruction: {:?}", other),
    }
    // Both arguments were parked in the array first.
    assert_eq!(
        count_matching(&func, |i| matches!(
            i,
            Inst::Store { val: Value::Arg(_), .. }
        )),
        2
    );
}

#[test]
fn arg_array_with_func_keeps_leading_operand() {
    let mut m = Module::new();
    declare(&mut m, "apply_f", TRACKED, vec![]);
    let mut b = Fb::new("jlcall_f", vec![TRACKED, TRACKED]);
    let six = m.lookup("apply_f").unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![Value::Arg(0), Value::Arg(1)],
        ty: TRACKED,
        cconv: CallConv::ArgArrayWithFunc,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let calls = calls_to(&func, &m, "apply_f");
    assert_eq!(calls.len(), 1);
    match func.inst(calls[0]) {
        Inst::Call(c) => {
            assert_eq!(c.args.len(), 3);
            assert_eq!(c.args[0], Value::Arg(0), "function operand passed through");
            assert_eq!(c.args[2], Value::ConstInt(1));
        }
        _ => unreachable!(),
    }
}

#[test]
fn arg_array_call_with_no_args_passes_null() {
    let mut m = Module::new();
    declare(&mut m, "apply0", TRACKED, vec![]);
    let mut b = Fb::new("jlcall0", vec![]);
    let six = m.lookup("apply0").unwrap();
    b.inst(Inst::Call(CallInst {
        callee: Value::Func(six),
        args: vec![],
        ty: TRACKED,
        cconv: CallConv::ArgArray,
        returns_twice: false,
        has_bundle: false,
        attrs: CallAttrs::default(),
        dbg: None,
    }));
    b.ret();
    let mut func = b.finish();

    assert!(run(&mut m, &mut func));
    let calls = calls_to(&func, &m, "apply0");
    match func.inst(calls[0]) {
        Inst::Call(c) => {
            assert_eq!(c.args[0], Value::NullPtr(AddrSpace::Generic));
            assert_eq!(c.args[1], Value::ConstInt(0));
        }
        _ => unreachable!(),
    }
    // The scratch array was never used and must be gone.
    assert_eq!(count_matching(&func, |i| matches!(i, Inst::Alloca { .. })), 0);
}

// The whitelisted helpers are not safepoints: a value live only across
// them needs no slot.
#[test]
fn whitelisted_calls_are_not_safepoints() {
    let mut m = runtime_module();
    let mut b = Fb::new("whitelist", vec![LOADED, GENERIC]);
    b.tls(&m);
    let x = b.load_tracked(Value::Arg(0));
    b.call_to(&m, "memcmp", vec![Value::Arg(1), Value::Arg(1), Value::ConstInt(8)]);
    b.store(x, Value::Arg(1));
    b.ret();
    let mut func = b.finish();

    run(&mut m, &mut func);
    assert!(frame_of(&func).is_none(), "memcmp must not force rooting");
}
