//! Frame emission and root store placement.
//!
//! The frame is a contiguous stack region of `nroots + 2` pointer-sized
//! slots: word 0 holds `nroots << 1`, word 1 the saved head of the
//! per-thread root chain, words `2 ..` the roots themselves (alloca-backed
//! roots first, then the colored slots).  The frame is zeroed with one bulk
//! clear, pushed onto the thread's chain right after the thread-state
//! lookup, and popped at every return.
//!
//! Stores to the slots are sunk to just above the first safepoint that needs
//! the value rooted, rather than placed at the def: on paths that reach no
//! safepoint (commonly the fast path, with the safepoints on error paths)
//! no store is executed at all.

use log::info;

use crate::bitvec::BitVec;
use crate::ir::{
    AddrSpace, BlockIx, Func, Inst, InstIx, Tbaa, Ty, Value, WORD_BYTES,
};
use crate::pass::RootPlacement;
use crate::scan::{maybe_extract_union, State};

/// Word offset of the root-chain head within the thread-state object.
pub const PGCSTACK_WORD_OFFSET: i64 = 0;

/// First frame slot available for roots (slots 0 and 1 are metadata).
const FIRST_ROOT_SLOT: usize = 2;

impl RootPlacement {
    pub(crate) fn place_roots_and_update_calls(
        &self,
        func: &mut Func,
        state: &State,
        colors: &[i32],
        ptls: InstIx,
    ) {
        let max_color = colors.iter().copied().max().unwrap_or(-1);
        if max_color == -1 && state.allocas.is_empty() {
            // Nothing is ever live at a safepoint: no frame at all.
            return;
        }
        let num_roots = (max_color + 1) as usize + state.allocas.len();
        info!(
            "place_roots: {} roots ({} colored, {} allocas)",
            num_roots,
            max_color + 1,
            state.allocas.len()
        );

        let entry = func.entry();
        let frame = func.push_front(
            entry,
            Inst::Alloca {
                elem_ty: Ty::Ptr(AddrSpace::Tracked),
                count: Some(Value::ConstInt((num_roots + 2) as i64)),
            },
        );
        func.insert_after(
            entry,
            frame,
            Inst::Memset {
                dst: Value::Inst(frame),
                byte: 0,
                len: Value::ConstInt((WORD_BYTES as i64) * (num_roots + 2) as i64),
                tbaa: Some(Tbaa::GcFrame),
            },
        );
        self.push_gc_frame(func, frame, num_roots, ptls);

        // Sink the surviving allocas into dedicated slots.
        let mut alloca_slot = FIRST_ROOT_SLOT;
        for &ai in &state.allocas {
            let gep = func.insert_after(
                entry,
                frame,
                Inst::Gep {
                    base: Value::Inst(frame),
                    offset: Value::ConstInt(alloca_slot as i64),
                    ty: Ty::Ptr(AddrSpace::Generic),
                },
            );
            alloca_slot += 1;
            // Lifetime markers on the alloca no longer describe anything
            // true once the storage is part of the frame.
            erase_lifetime_users(func, Value::Inst(ai));
            func.replace_all_uses_with(Value::Inst(ai), Value::Inst(gep));
            let abix = func.block_of(ai);
            func.erase(abix, ai);
        }

        let min_color_root = alloca_slot;
        self.place_gc_frame_stores(func, state, min_color_root, colors, frame);

        for n in 0..func.num_blocks() {
            let bix = BlockIx::new(n);
            if matches!(func.inst(func.terminator(bix)), Inst::Ret { .. }) {
                self.pop_gc_frame(func, bix, frame, ptls);
            }
        }
    }

    /// Link the frame into the per-thread chain: write the metadata word,
    /// save the old chain head into slot 1, and make the frame the new head.
    fn push_gc_frame(&self, func: &mut Func, frame: InstIx, num_roots: usize, ptls: InstIx) {
        let entry = func.entry();
        let gep0 = func.insert_after(
            entry,
            ptls,
            Inst::Gep {
                base: Value::Inst(frame),
                offset: Value::ConstInt(0),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        let st_meta = func.insert_after(
            entry,
            gep0,
            Inst::Store {
                val: Value::ConstInt((num_roots as i64) << 1),
                ptr: Value::Inst(gep0),
                tbaa: Some(Tbaa::GcFrame),
            },
        );
        let pgcstack = func.insert_after(
            entry,
            st_meta,
            Inst::Gep {
                base: Value::Inst(ptls),
                offset: Value::ConstInt(PGCSTACK_WORD_OFFSET),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        let prev = func.insert_after(
            entry,
            pgcstack,
            Inst::Load { ty: Ty::Ptr(AddrSpace::Generic), ptr: Value::Inst(pgcstack), tbaa: None },
        );
        let gep1 = func.insert_after(
            entry,
            prev,
            Inst::Gep {
                base: Value::Inst(frame),
                offset: Value::ConstInt(1),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        let st_prev = func.insert_after(
            entry,
            gep1,
            Inst::Store {
                val: Value::Inst(prev),
                ptr: Value::Inst(gep1),
                tbaa: Some(Tbaa::GcFrame),
            },
        );
        func.insert_after(
            entry,
            st_prev,
            Inst::Store { val: Value::Inst(frame), ptr: Value::Inst(pgcstack), tbaa: None },
        );
    }

    /// Restore the chain head from slot 1, just before the return.
    fn pop_gc_frame(&self, func: &mut Func, bix: BlockIx, frame: InstIx, ptls: InstIx) {
        let gep1 = func.insert_before_terminator(
            bix,
            Inst::Gep {
                base: Value::Inst(frame),
                offset: Value::ConstInt(1),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        let prev = func.insert_before_terminator(
            bix,
            Inst::Load {
                ty: Ty::Ptr(AddrSpace::Generic),
                ptr: Value::Inst(gep1),
                tbaa: Some(Tbaa::GcFrame),
            },
        );
        let pgcstack = func.insert_before_terminator(
            bix,
            Inst::Gep {
                base: Value::Inst(ptls),
                offset: Value::ConstInt(PGCSTACK_WORD_OFFSET),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        func.insert_before_terminator(
            bix,
            Inst::Store {
                val: Value::Inst(prev),
                ptr: Value::Inst(pgcstack),
                tbaa: Some(Tbaa::GcFrame),
            },
        );
    }

    fn place_gc_frame_stores(
        &self,
        func: &mut Func,
        state: &State,
        min_color_root: usize,
        colors: &[i32],
        frame: InstIx,
    ) {
        let preds = func.pred_map();
        for n in 0..func.num_blocks() {
            let bix = BlockIx::new(n);
            if !state.block_states[n].has_safepoint {
                continue;
            }
            // What is already rooted when this block is entered, on every
            // path: the intersection of the final live sets of the
            // safepoint-bearing ancestors, looking through safepoint-free
            // blocks.
            let mut last_live = BitVec::new();
            add_in_pred_live_outs(func, &preds, state, bix, &mut last_live);
            // Safepoints were recorded during the reverse scan, so iterate
            // them backwards to move forwards through the block.
            for &sp in state.block_states[n].safepoints.iter().rev() {
                let now_live = &state.live_sets[sp];
                for num in now_live.iter() {
                    if !last_live.get(num) {
                        self.place_gc_frame_store(
                            func,
                            state,
                            num as u32,
                            min_color_root,
                            colors,
                            frame,
                            bix,
                            state.reverse_safepoint_numbering[sp],
                        );
                    }
                }
                last_live = now_live.clone();
            }
        }
    }

    fn place_gc_frame_store(
        &self,
        func: &mut Func,
        state: &State,
        num: u32,
        min_color_root: usize,
        colors: &[i32],
        frame: InstIx,
        bix: BlockIx,
        before: InstIx,
    ) {
        let val = get_ptr_for_number(func, state, num, bix, before);
        let color = colors[num as usize];
        assert!(color >= 0, "store requested for uncolored value {}", num);
        let slot = color as i64 + min_color_root as i64;
        let gep = func.insert_before(
            bix,
            before,
            Inst::Gep {
                base: Value::Inst(frame),
                offset: Value::ConstInt(slot),
                ty: Ty::Ptr(AddrSpace::Generic),
            },
        );
        let val = maybe_extract_union(func, bix, before, val);
        func.insert_before(bix, before, Inst::Store { val, ptr: Value::Inst(gep), tbaa: None });
    }
}

/// The defining value for a number; vector lanes need an extract of the
/// right lane at the insertion point.
fn get_ptr_for_number(
    func: &mut Func,
    state: &State,
    num: u32,
    bix: BlockIx,
    before: InstIx,
) -> Value {
    let val = state.reverse_ptr_numbering[num as usize];
    if func.value_ty(val).is_special_ptr_vec() {
        let nums = &state.all_vector_numbering[&val];
        let lane = nums
            .iter()
            .position(|&n| n == num as i32)
            .expect("vector lane lost its number");
        let e = func.insert_before(
            bix,
            before,
            Inst::ExtractElement {
                vec: val,
                lane: lane as u32,
                ty: Ty::Ptr(AddrSpace::Tracked),
            },
        );
        Value::Inst(e)
    } else {
        val
    }
}

/// Walk safepoint-free predecessors up to the nearest safepoint on each
/// path, intersecting their final live sets (union for the first one
/// reached): everything in the result is in its slot on every path into
/// `bix`.
fn add_in_pred_live_outs(
    func: &Func,
    preds: &[Vec<BlockIx>],
    state: &State,
    bix: BlockIx,
    live_in: &mut BitVec,
) {
    let mut first = true;
    let mut visited = vec![false; func.num_blocks()];
    let mut worklist = vec![bix];
    while let Some(b) = worklist.pop() {
        for &p in &preds[b.index()] {
            if visited[p.index()] {
                continue;
            }
            visited[p.index()] = true;
            let pbs = &state.block_states[p.index()];
            if !pbs.has_safepoint {
                worklist.push(p);
            } else {
                let last_sp = pbs.safepoints[0];
                if first {
                    live_in.union_with(&state.live_sets[last_sp]);
                    first = false;
                } else {
                    live_in.intersect_with(&state.live_sets[last_sp]);
                }
            }
        }
    }
}

fn erase_lifetime_users(func: &mut Func, root: Value) {
    let mut worklist = vec![root];
    let mut to_delete: Vec<(BlockIx, InstIx)> = Vec::new();
    while let Some(v) = worklist.pop() {
        for (bix, iix) in users_of(func, v) {
            match func.inst(iix) {
                Inst::LifetimeStart { .. } | Inst::LifetimeEnd { .. } => {
                    to_delete.push((bix, iix));
                }
                Inst::Gep { .. } | Inst::BitCast { .. } | Inst::AddrSpaceCast { .. } => {
                    worklist.push(Value::Inst(iix));
                }
                Inst::Call(_)
                | Inst::Load { .. }
                | Inst::Store { .. }
                | Inst::Select { .. }
                | Inst::Phi { .. } => {}
                other => panic!("unexpected use of relocated alloca: {:?}", other),
            }
        }
    }
    for (bix, iix) in to_delete {
        func.erase(bix, iix);
    }
}

fn users_of(func: &Func, v: Value) -> Vec<(BlockIx, InstIx)> {
    let mut out = Vec::new();
    for (n, block) in func.blocks.iter().enumerate() {
        for &iix in &block.insts {
            let mut uses = false;
            func.inst(iix).visit_operands(|o| {
                if o == v {
                    uses = true;
                }
            });
            if uses {
                out.push((BlockIx::new(n), iix));
            }
        }
    }
    out
}
