//! Local scan: the first stage of the pass.
//!
//! Each basic block is walked in reverse instruction order, so that the
//! safepoints already seen when a def is reached are exactly the safepoints
//! *below* it in the block.  The scan assigns every distinct tracked base
//! pointer a dense value number, records per-block def/use orderings in
//! `BlockState`, numbers safepoints, and lifts selects and phis of derived
//! pointers into fresh joins of their tracked bases.

use log::info;

use crate::bitvec::BitVec;
use crate::ir::{AddrSpace, BlockIx, Func, Inst, InstIx, Map, Ty, Value};
use crate::pass::RootPlacement;

/// Value number of anything already rooted by the caller or the frame:
/// constants, arguments, non-tracked allocas.
pub const NUM_ROOTED: i32 = -1;

//=============================================================================
// Per-block and per-function scan state

#[derive(Default)]
pub struct BlockState {
    /// Numbers defined in this block.
    pub defs: BitVec,
    /// Numbers used by a phi in a successor; live on the outgoing edge.
    pub phi_outs: BitVec,
    /// Uses reaching the top of the block with a safepoint below them.
    pub up_exposed_uses: BitVec,
    /// Uses reaching the top of the block with no safepoint below them.
    pub up_exposed_uses_unrooted: BitVec,
    /// Numbers defined below the block's last safepoint (or anywhere in the
    /// block, if it has none).
    pub down_exposed_unrooted: BitVec,
    pub live_in: BitVec,
    pub live_out: BitVec,
    pub unrooted_in: BitVec,
    pub unrooted_out: BitVec,
    /// Safepoint numbers in reverse program order: the first entry is the
    /// last safepoint the block executes.
    pub safepoints: Vec<usize>,
    pub has_safepoint: bool,
}

pub struct State {
    /// Highest value number assigned so far; `-1` when none yet.
    pub max_ptr_number: i32,
    /// Highest safepoint number assigned so far; `-1` when none yet.
    pub max_safepoint_number: i32,
    /// Number cache for every value the scan has looked at, including
    /// derived pointers (which share their base's number).
    pub all_ptr_numbering: Map<Value, i32>,
    /// Per-lane numbers for vectors of pointers.
    pub all_vector_numbering: Map<Value, Vec<i32>>,
    /// Numbers of defs only.
    pub ptr_numbering: Map<Value, i32>,
    /// Defining value for each assigned number.
    pub reverse_ptr_numbering: Vec<Value>,
    /// Interference adjacency: for each number, every number that shares
    /// some safepoint live set with it.  A value live anywhere lists itself,
    /// which distinguishes "never live at a safepoint" from "live alone".
    pub neighbors: Vec<Vec<u32>>,
    pub block_states: Vec<BlockState>,
    /// `n -> r`: the value numbered `n` is rooted whenever `r` is (or
    /// unconditionally, for `r == NUM_ROOTED`), so `n` may be dropped from
    /// any live set containing `r`.
    pub load_refinements: Map<u32, i32>,
    pub safepoint_numbering: Map<InstIx, usize>,
    pub reverse_safepoint_numbering: Vec<InstIx>,
    /// Parent block of each safepoint.
    pub safepoint_blocks: Vec<BlockIx>,
    /// Calls that may return twice; all of these are also safepoints.
    pub returns_twice: Vec<InstIx>,
    /// Values live at each safepoint, by safepoint number.
    pub live_sets: Vec<BitVec>,
    /// Values that are live at the safepoint iff they are live out of its
    /// block.
    pub live_if_live_out: Vec<Vec<u32>>,
    /// Tracked-type allocas; no liveness is attempted for these, they are
    /// simply relocated into dedicated frame slots.
    pub allocas: Vec<InstIx>,
}

impl State {
    fn new(num_blocks: usize) -> Self {
        let mut block_states = Vec::with_capacity(num_blocks);
        block_states.resize_with(num_blocks, BlockState::default);
        Self {
            max_ptr_number: -1,
            max_safepoint_number: -1,
            all_ptr_numbering: Map::default(),
            all_vector_numbering: Map::default(),
            ptr_numbering: Map::default(),
            reverse_ptr_numbering: Vec::new(),
            neighbors: Vec::new(),
            block_states,
            load_refinements: Map::default(),
            safepoint_numbering: Map::default(),
            reverse_safepoint_numbering: Vec::new(),
            safepoint_blocks: Vec::new(),
            returns_twice: Vec::new(),
            live_sets: Vec::new(),
            live_if_live_out: Vec::new(),
            allocas: Vec::new(),
        }
    }

    pub fn num_safepoints(&self) -> usize {
        self.reverse_safepoint_numbering.len()
    }
}

//=============================================================================
// Base recovery

/// Walk from an arbitrary value back to the base it derives from, through
/// bitcasts, in-space address-space casts, geps and union-rep field
/// extracts.  Anything else terminates the walk; a terminus outside the
/// known def shapes is a compiler bug.
pub fn find_base_value(state: &State, func: &Func, v: Value, use_cache: bool) -> Value {
    let mut cur = v;
    loop {
        if use_cache {
            let cached = match func.value_ty(cur) {
                Ty::Ptr(_) => state.all_ptr_numbering.contains_key(&cur),
                _ => state.all_vector_numbering.contains_key(&cur),
            };
            if cached {
                return cur;
            }
        }
        match cur {
            Value::Inst(iix) => match func.inst(iix) {
                Inst::BitCast { val, .. } => cur = *val,
                Inst::AddrSpaceCast { val, .. } => {
                    // A cast out of the special range is itself the base.
                    if func.value_ty(*val).addrspace() == Some(AddrSpace::Generic) {
                        break;
                    }
                    cur = *val;
                }
                Inst::Gep { base, .. } => cur = *base,
                Inst::ExtractValue { agg, .. } => {
                    if !func.value_ty(*agg).is_union_rep() {
                        break;
                    }
                    cur = *agg;
                }
                _ => break,
            },
            _ => break,
        }
    }
    let ok = match cur {
        Value::Arg(_) | Value::NullPtr(_) | Value::ConstInt(_) | Value::Func(_) => true,
        Value::Inst(iix) => matches!(
            func.inst(iix),
            Inst::Load { .. }
                | Inst::Call(_)
                | Inst::Select { .. }
                | Inst::Phi { .. }
                | Inst::AddrSpaceCast { .. }
                | Inst::Alloca { .. }
                | Inst::ExtractValue { .. }
        ),
    };
    assert!(ok, "unexpected instruction during base recovery: {:?}", cur);
    cur
}

/// If `v` is a union-rep aggregate, emit an extract of its pointer field
/// just before `before` and return that instead.
pub fn maybe_extract_union(func: &mut Func, bix: BlockIx, before: InstIx, v: Value) -> Value {
    if func.value_ty(v).is_union_rep() {
        let e = func.insert_before(
            bix,
            before,
            Inst::ExtractValue { agg: v, field: 0, ty: Ty::Ptr(AddrSpace::Tracked) },
        );
        Value::Inst(e)
    } else {
        v
    }
}

//=============================================================================
// Numbering

fn assign_fresh_number(state: &mut State, def: Value) -> i32 {
    state.max_ptr_number += 1;
    let num = state.max_ptr_number;
    assert_eq!(state.reverse_ptr_numbering.len(), num as usize);
    state.reverse_ptr_numbering.push(def);
    num
}

fn cache_number(state: &mut State, base: Value, orig: Value, num: i32) {
    state.ptr_numbering.insert(base, num);
    state.all_ptr_numbering.insert(base, num);
    state.all_ptr_numbering.insert(orig, num);
}

/// Number a scalar tracked pointer (or union-rep aggregate), allocating a
/// fresh number for a previously unseen base.
pub fn number(state: &mut State, func: &mut Func, v: Value) -> i32 {
    let vty = func.value_ty(v);
    assert!(vty.is_special_ptr() || vty.is_union_rep(), "numbering a non-GC value {:?}", v);
    let cur = find_base_value(state, func, v, true);
    if let Some(&num) = state.all_ptr_numbering.get(&cur) {
        return num;
    }
    let cur_ty = func.value_ty(cur);
    let tracked = cur_ty.addrspace() == Some(AddrSpace::Tracked);

    #[derive(Clone, Copy)]
    enum BaseKind {
        Rooted,
        LiftSelect,
        LiftPhi,
        Fresh,
    }
    let kind = match cur {
        // Rooted in the parent frame.
        Value::Arg(_) | Value::NullPtr(_) | Value::ConstInt(_) | Value::Func(_) => {
            BaseKind::Rooted
        }
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Alloca { .. } => BaseKind::Rooted,
            Inst::AddrSpaceCast { .. } if !tracked => BaseKind::Rooted,
            Inst::Select { .. } if !tracked => BaseKind::LiftSelect,
            Inst::Phi { .. } if !tracked => BaseKind::LiftPhi,
            Inst::ExtractValue { agg, .. } if !cur_ty.is_union_rep() => {
                panic!("unhandled extract of non-union aggregate {:?}", agg)
            }
            _ => {
                assert!(
                    tracked || cur_ty.is_union_rep(),
                    "base {:?} is neither tracked nor union-rep",
                    cur
                );
                BaseKind::Fresh
            }
        },
    };
    let num = match kind {
        BaseKind::Rooted => NUM_ROOTED,
        BaseKind::Fresh => assign_fresh_number(state, cur),
        BaseKind::LiftSelect | BaseKind::LiftPhi => {
            let iix = match cur {
                Value::Inst(iix) => iix,
                _ => unreachable!(),
            };
            let bix = func.block_of(iix);
            let num = match kind {
                BaseKind::LiftSelect => lift_select(state, func, bix, iix),
                _ => lift_phi(state, func, bix, iix),
            };
            state.all_ptr_numbering.insert(v, num);
            return num;
        }
    };
    cache_number(state, cur, v, num);
    num
}

/// Number every lane of a vector of pointers.  Only vector loads introduce
/// fresh lane numbers; shuffles and inserts of tracked vectors have never
/// been emitted by the front end and are left unimplemented.
pub fn number_vector(state: &mut State, func: &mut Func, v: Value) -> Vec<i32> {
    if let Some(nums) = state.all_vector_numbering.get(&v) {
        return nums.clone();
    }
    let cur = find_base_value(state, func, v, true);
    if let Some(nums) = state.all_vector_numbering.get(&cur) {
        return nums.clone();
    }
    let cur_ty = func.value_ty(cur);
    let nums: Vec<i32> = match cur {
        Value::Arg(_) | Value::NullPtr(_) | Value::ConstInt(_) | Value::Func(_) => Vec::new(),
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Alloca { .. } => Vec::new(),
            Inst::AddrSpaceCast { .. } if cur_ty.addrspace() != Some(AddrSpace::Tracked) => {
                Vec::new()
            }
            Inst::ShuffleVector { .. } => panic!("unhandled shuffle of tracked vector"),
            Inst::InsertElement { .. } => panic!("unhandled insert into tracked vector"),
            Inst::Load { ty, .. } => {
                let lanes = match ty {
                    Ty::PtrVec(_, n) => *n,
                    _ => panic!("vector numbering of non-vector load"),
                };
                (0..lanes).map(|_| assign_fresh_number(state, cur)).collect()
            }
            other => panic!("unhandled vector def {:?}", other),
        },
    };
    state.all_vector_numbering.insert(cur, nums.clone());
    if v != cur {
        state.all_vector_numbering.insert(v, nums.clone());
    }
    nums
}

//=============================================================================
// Def/use recording

fn note_def(state: &mut State, bix: BlockIx, num: i32) {
    assert!(num != NUM_ROOTED);
    let n = num as usize;
    let safepoints_below = {
        let bbs = &mut state.block_states[bix.index()];
        assert!(!bbs.defs.get(n), "SSA violation or misnumbering?");
        bbs.defs.set(n);
        bbs.up_exposed_uses.clear(n);
        bbs.up_exposed_uses_unrooted.clear(n);
        if !bbs.has_safepoint {
            bbs.down_exposed_unrooted.set(n);
        }
        bbs.safepoints.clone()
    };
    // The def could be live at any safepoint below it in the block, but only
    // if it is live out of the block at all.
    for sp in safepoints_below {
        state.live_if_live_out[sp].push(num as u32);
    }
}

fn maybe_note_def(state: &mut State, func: &mut Func, bix: BlockIx, def: Value, refined: Option<i32>) {
    let rt = func.value_ty(def);
    let num = if rt.is_special_ptr() {
        assert!(
            rt.addrspace() == Some(AddrSpace::Tracked),
            "def of GC interest, but not tracked: {:?}",
            def
        );
        number(state, func, def)
    } else if rt.is_union_rep() {
        number(state, func, def)
    } else if rt.is_special_ptr_vec() {
        for num in number_vector(state, func, def) {
            note_def(state, bix, num);
            if let Some(r) = refined {
                state.load_refinements.insert(num as u32, r);
            }
        }
        return;
    } else {
        return;
    };
    note_def(state, bix, num);
    if let Some(r) = refined {
        state.load_refinements.insert(num as u32, r);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum UseBucket {
    /// A safepoint below the use will observe the value.
    UpExposed,
    /// No safepoint below the use in this block.
    UpExposedUnrooted,
    /// The use lives on the edge into `target`; record it in the
    /// predecessor's phi-out set.
    PhiOut,
}

fn note_use(state: &mut State, func: &mut Func, target: BlockIx, v: Value, bucket: UseBucket) {
    // Constants never need rooting; skip early so vectors of constants need
    // no special handling.
    if v.is_const() {
        return;
    }
    let nums: Vec<i32> = if func.value_ty(v).is_special_ptr_vec() {
        number_vector(state, func, v)
    } else {
        vec![number(state, func, v)]
    };
    let bbs = &mut state.block_states[target.index()];
    for num in nums {
        if num == NUM_ROOTED {
            continue;
        }
        match bucket {
            UseBucket::UpExposed => bbs.up_exposed_uses.set(num as usize),
            UseBucket::UpExposedUnrooted => bbs.up_exposed_uses_unrooted.set(num as usize),
            UseBucket::PhiOut => bbs.phi_outs.set(num as usize),
        }
    }
}

fn note_operand_uses(state: &mut State, func: &mut Func, bix: BlockIx, iix: InstIx, bucket: UseBucket) {
    for v in func.inst(iix).operands() {
        if !func.value_ty(v).is_special_ptr() {
            continue;
        }
        note_use(state, func, bix, v, bucket);
    }
}

fn note_safepoint(state: &mut State, bix: BlockIx, iix: InstIx) -> usize {
    state.max_safepoint_number += 1;
    let sp = state.max_safepoint_number as usize;
    state.safepoint_numbering.insert(iix, sp);
    state.reverse_safepoint_numbering.push(iix);
    state.safepoint_blocks.push(bix);
    // Everything upward exposed here is live at this safepoint even if it
    // has a def further up this same block (in which case it never enters
    // the cross-block dataflow).  The unrooted bucket is drained: this
    // safepoint roots it.
    let bbs = &mut state.block_states[bix.index()];
    {
        let BlockState { up_exposed_uses, up_exposed_uses_unrooted, .. } = &mut *bbs;
        up_exposed_uses.union_with(up_exposed_uses_unrooted);
        up_exposed_uses_unrooted.clear_all();
    }
    state.live_sets.push(bbs.up_exposed_uses.clone());
    state.live_if_live_out.push(Vec::new());
    sp
}

//=============================================================================
// Lifting of derived selects and phis

/// Build a select over the tracked bases of a derived select's operands,
/// and number the derived select as that join.
pub fn lift_select(state: &mut State, func: &mut Func, bix: BlockIx, si: InstIx) -> i32 {
    let (cond, on_true, on_false) = match func.inst(si) {
        Inst::Select { cond, on_true, on_false, .. } => (*cond, *on_true, *on_false),
        other => panic!("lift_select on {:?}", other),
    };
    let mut true_base = find_base_value(state, func, on_true, false);
    let mut false_base = find_base_value(state, func, on_false, false);
    let true_tracked = func.value_ty(true_base).addrspace() == Some(AddrSpace::Tracked)
        || func.value_ty(true_base).is_union_rep();
    let false_tracked = func.value_ty(false_base).addrspace() == Some(AddrSpace::Tracked)
        || func.value_ty(false_base).is_union_rep();
    if !true_tracked && !false_tracked {
        // Both arms already rooted elsewhere; nothing to join.
        return NUM_ROOTED;
    }
    true_base = maybe_extract_union(func, bix, si, true_base);
    false_base = maybe_extract_union(func, bix, si, false_base);
    if !true_tracked {
        true_base = Value::NullPtr(AddrSpace::Tracked);
    }
    if !false_tracked {
        false_base = Value::NullPtr(AddrSpace::Tracked);
    }
    let lift = func.insert_before(
        bix,
        si,
        Inst::Select {
            cond,
            on_true: true_base,
            on_false: false_base,
            ty: Ty::Ptr(AddrSpace::Tracked),
        },
    );
    let num = assign_fresh_number(state, Value::Inst(lift));
    cache_number(state, Value::Inst(lift), Value::Inst(si), num);
    num
}

/// Build a phi over the tracked bases of a derived phi's incoming values,
/// and number the derived phi as that join.  Union-rep bases are unwrapped
/// in the predecessor, before its terminator, since that is where the edge
/// value must be materialized.
pub fn lift_phi(state: &mut State, func: &mut Func, bix: BlockIx, phi: InstIx) -> i32 {
    let incoming = match func.inst(phi) {
        Inst::Phi { incoming, .. } => incoming.clone(),
        other => panic!("lift_phi on {:?}", other),
    };
    let mut lifted = Vec::with_capacity(incoming.len());
    for (pred, val) in incoming {
        let mut base = find_base_value(state, func, val, false);
        if func.value_ty(base).is_union_rep() {
            let term = func.terminator(pred);
            base = maybe_extract_union(func, pred, term, base);
        }
        if func.value_ty(base).addrspace() != Some(AddrSpace::Tracked) {
            base = Value::NullPtr(AddrSpace::Tracked);
        }
        lifted.push((pred, base));
    }
    let lift = func.insert_before(
        bix,
        phi,
        Inst::Phi { ty: Ty::Ptr(AddrSpace::Tracked), incoming: lifted },
    );
    let num = assign_fresh_number(state, Value::Inst(lift));
    cache_number(state, Value::Inst(lift), Value::Inst(phi), num);
    num
}

//=============================================================================
// The scan itself

/// Is this pointer a slot in the caller's frame or argument area?  Loads of
/// tracked values through such a pointer are rooted by the caller.  Only a
/// gep chain ending at a non-special argument qualifies; anything else is
/// numbered and rooted normally.
fn looks_like_frame_ref(func: &Func, v: Value) -> bool {
    if func.value_ty(v).is_special_ptr() {
        return false;
    }
    match v {
        Value::Inst(iix) => match func.inst(iix) {
            Inst::Gep { base, .. } => looks_like_frame_ref(func, *base),
            _ => false,
        },
        Value::Arg(_) => true,
        _ => false,
    }
}

impl RootPlacement {
    pub(crate) fn local_scan(&self, func: &mut Func) -> State {
        info!("local_scan: begin ({})", func.name);
        let mut state = State::new(func.num_blocks());
        for n in 0..func.num_blocks() {
            let bix = BlockIx::new(n);
            // Reverse walk with a live index: lifting inserts fresh joins
            // before the instruction being scanned, and those joins must
            // themselves be scanned (they are defs like any other).
            let mut pos = func.blocks[n].insts.len();
            while pos > 0 {
                pos -= 1;
                let len_before = func.blocks[n].insts.len();
                let iix = func.blocks[n].insts[pos];
                self.scan_inst(&mut state, func, bix, iix);
                pos += func.blocks[n].insts.len() - len_before;
            }
            // Pre-seed the dataflow variables.
            let bbs = &mut state.block_states[n];
            {
                let BlockState { live_in, up_exposed_uses, up_exposed_uses_unrooted, .. } =
                    &mut *bbs;
                live_in.union_with(up_exposed_uses);
                live_in.union_with(up_exposed_uses_unrooted);
            }
            bbs.unrooted_out = bbs.down_exposed_unrooted.clone();
        }
        info!(
            "local_scan: end ({} values, {} safepoints)",
            state.max_ptr_number + 1,
            state.num_safepoints()
        );
        state
    }

    fn scan_inst(&self, state: &mut State, func: &mut Func, bix: BlockIx, iix: InstIx) {
        match func.inst(iix).clone() {
            Inst::Call(call) => {
                maybe_note_def(state, func, bix, Value::Inst(iix), None);
                note_operand_uses(state, func, bix, iix, UseBucket::UpExposed);
                // Union-rep aggregates passed to a call keep their payload
                // live too; they fall through the scalar filter above.
                for &a in &call.args {
                    if func.value_ty(a).is_union_rep() {
                        note_use(state, func, bix, a, UseBucket::UpExposed);
                    }
                }
                if call.returns_twice {
                    state.returns_twice.push(iix);
                }
                if let Value::Func(six) = call.callee {
                    // Known helpers emitted by codegen that are not
                    // safepoints.
                    if self.pointer_from_objref == Some(six) || self.memcmp == Some(six) {
                        return;
                    }
                }
                let sp = note_safepoint(state, bix, iix);
                let bbs = &mut state.block_states[bix.index()];
                bbs.has_safepoint = true;
                bbs.safepoints.push(sp);
            }
            Inst::Load { ty, ptr, tbaa } => {
                // A load from an immutable field stays rooted as long as the
                // object it was loaded from does, so its uses can be refined
                // to uses of that object.
                let mut refined = None;
                if tbaa.map_or(false, |t| t.is_immut()) && func.value_ty(ptr).is_special_ptr() {
                    refined = Some(number(state, func, ptr));
                } else if ty.is_special_ptr() && looks_like_frame_ref(func, ptr) {
                    // Loads from the caller's argument area.
                    refined = Some(NUM_ROOTED);
                }
                maybe_note_def(state, func, bix, Value::Inst(iix), refined);
                note_operand_uses(state, func, bix, iix, UseBucket::UpExposedUnrooted);
            }
            Inst::Select { ty, .. } => {
                if !ty.is_special_ptr() {
                    return;
                }
                if ty.addrspace() != Some(AddrSpace::Tracked) {
                    // A derived select needs an extra select over the bases
                    // for the root.
                    if state.all_ptr_numbering.contains_key(&Value::Inst(iix)) {
                        return;
                    }
                    lift_select(state, func, bix, iix);
                } else {
                    maybe_note_def(state, func, bix, Value::Inst(iix), None);
                    note_operand_uses(state, func, bix, iix, UseBucket::UpExposedUnrooted);
                }
            }
            Inst::Phi { ty, incoming } => {
                if !ty.is_special_ptr() {
                    return;
                }
                if ty.addrspace() != Some(AddrSpace::Tracked) {
                    if state.all_ptr_numbering.contains_key(&Value::Inst(iix)) {
                        return;
                    }
                    lift_phi(state, func, bix, iix);
                } else {
                    maybe_note_def(state, func, bix, Value::Inst(iix), None);
                    // Phi operands are neither live into this block nor out
                    // of the predecessor's body; they live on the edge.
                    for (pred, val) in incoming {
                        note_use(state, func, pred, val, UseBucket::PhiOut);
                    }
                }
            }
            Inst::Store { .. } | Inst::Ret { .. } => {
                note_operand_uses(state, func, bix, iix, UseBucket::UpExposedUnrooted);
            }
            Inst::AddrSpaceCast { ty, .. } => {
                if ty.addrspace() == Some(AddrSpace::Tracked) {
                    maybe_note_def(state, func, bix, Value::Inst(iix), None);
                }
            }
            Inst::Alloca { elem_ty, count } => {
                if elem_ty == Ty::Ptr(AddrSpace::Tracked) && count.is_none() {
                    state.allocas.push(iix);
                }
            }
            _ => {}
        }
    }
}
