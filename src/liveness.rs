//! Iterative bidirectional dataflow and safepoint live-set assembly.
//!
//! The dataflow equations, over the boolean lattice of value-number sets:
//!
//! ```text
//! LiveOut[B]    = PhiOuts[B] ∪ ⋃_{S ∈ succ(B)} LiveIn[S]
//! LiveIn[B]     = (LiveOut[B] \ Defs[B]) ∪ UpExposedUses[B] ∪ UpExposedUsesUnrooted[B]
//! UnrootedIn[B] = ⋃_{P ∈ pred(B)} UnrootedOut[P]
//! UnrootedOut[B] = DownExposedUnrooted[B] ∪ (HasSafepoint[B] ? ∅ : UnrootedIn[B])
//! ```
//!
//! Liveness is a backward problem; rootedness is a forward problem killed by
//! any safepoint in the block.  Both are iterated together to a fixed point,
//! visiting blocks in reverse post-order on the expectation that live ranges
//! are longer than unrooted ranges (which stop at the first safepoint).

use log::{debug, info};

use crate::bitvec::BitVec;
use crate::ir::Func;
use crate::scan::{State, NUM_ROOTED};

pub fn compute_liveness(func: &Func, state: &mut State) {
    info!("compute_liveness: begin");
    let preds = func.pred_map();
    let rpo = func.reverse_post_order();
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut any_changed = false;
        for &bix in &rpo {
            let mut new_live_out = state.block_states[bix.index()].phi_outs.clone();
            for succ in func.succs(bix) {
                new_live_out.union_with(&state.block_states[succ.index()].live_in);
            }
            {
                let bbs = &mut state.block_states[bix.index()];
                if new_live_out != bbs.live_out {
                    any_changed = true;
                    bbs.live_out = new_live_out;
                }
                let mut new_live_in = bbs.live_out.clone();
                new_live_in.and_not(&bbs.defs);
                new_live_in.union_with(&bbs.up_exposed_uses);
                new_live_in.union_with(&bbs.up_exposed_uses_unrooted);
                if new_live_in != bbs.live_in {
                    any_changed = true;
                    bbs.live_in = new_live_in;
                }
            }
            let mut new_unrooted_in = BitVec::new();
            for &p in &preds[bix.index()] {
                new_unrooted_in.union_with(&state.block_states[p.index()].unrooted_out);
            }
            let bbs = &mut state.block_states[bix.index()];
            if new_unrooted_in != bbs.unrooted_in {
                any_changed = true;
                bbs.unrooted_in = new_unrooted_in;
                if !bbs.has_safepoint {
                    let unrooted_in = bbs.unrooted_in.clone();
                    bbs.unrooted_out.union_with(&unrooted_in);
                }
            }
        }
        if !any_changed {
            break;
        }
    }
    info!("compute_liveness: converged after {} rounds", rounds);

    for (n, bbs) in state.block_states.iter().enumerate() {
        debug!(
            "b{:<3}  live_in {:?}  live_out {:?}  defs {:?}",
            n, bbs.live_in, bbs.live_out, bbs.defs
        );
    }

    compute_live_sets(func, state);
    info!("compute_liveness: end");
}

/// Finish each safepoint's live set by adding the values live across its
/// whole block and the recorded live-if-live-out candidates that did turn
/// out to be live out, then refine loads away, then build the interference
/// adjacency.
fn compute_live_sets(_func: &Func, state: &mut State) {
    for sp in 0..state.num_safepoints() {
        let bix = state.safepoint_blocks[sp];
        let (live_across, confirmed) = {
            let bbs = &state.block_states[bix.index()];
            let mut live_across = bbs.live_in.clone();
            live_across.intersect_with(&bbs.live_out);
            let confirmed: Vec<u32> = state.live_if_live_out[sp]
                .iter()
                .copied()
                .filter(|&n| bbs.live_out.get(n as usize))
                .collect();
            (live_across, confirmed)
        };
        let ls = &mut state.live_sets[sp];
        ls.union_with(&live_across);
        for n in confirmed {
            ls.set(n as usize);
        }
        // Apply load refinements: a value whose refinement is rooted (or
        // live right here) needs no slot of its own.
        let members: Vec<usize> = ls.iter().collect();
        for n in members {
            if let Some(&r) = state.load_refinements.get(&(n as u32)) {
                if r == NUM_ROOTED || ls.get(r as usize) {
                    ls.clear(n);
                }
            }
        }
        debug!("safepoint {}: live {:?}", sp, state.live_sets[sp]);
    }

    // The interference graph: two values are neighbors when some safepoint
    // holds both.  A value is explicitly its own neighbor when it is live
    // anywhere at all, to distinguish "live alone at some safepoint" from
    // "never live at any safepoint".
    let num_values = (state.max_ptr_number + 1) as usize;
    let mut neighbors = Vec::with_capacity(num_values);
    for n in 0..num_values {
        let mut bits = BitVec::new();
        for ls in &state.live_sets {
            if ls.get(n) {
                bits.union_with(ls);
            }
        }
        neighbors.push(bits.iter().map(|x| x as u32).collect());
    }
    state.neighbors = neighbors;
}
