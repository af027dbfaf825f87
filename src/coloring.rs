//! Slot assignment by chordal graph coloring.
//!
//! Two values that are never simultaneously live at a safepoint can share a
//! frame slot.  Finding the minimum number of slots is graph coloring on the
//! interference graph.  That is NP-hard in general, but because the roots
//! are in SSA form the graph is chordal (or very nearly so, modulo the
//! lifted joins), and greedy coloring in a perfect elimination order is
//! optimal there.  The order is produced by maximum-cardinality search over
//! a bucketed priority structure.

use log::debug;

use crate::bitvec::BitVec;
use crate::scan::State;

/// Color of a value that never needs a slot.
pub const NO_COLOR: i32 = -1;

//=============================================================================
// Perfect-elimination-order iterator

const PROCESSED: u32 = u32::max_value();

#[derive(Clone, Copy)]
struct PeoElement {
    /// Number of already-processed neighbors; `PROCESSED` once the vertex
    /// itself has been handed out.
    weight: u32,
    /// Position of the vertex's current (live) entry in `levels[weight]`.
    pos: u32,
}

/// Hands out vertices in a perfect elimination order (for chordal graphs)
/// via maximum-cardinality search.  Every vertex starts in bucket zero; when
/// a vertex is processed each unprocessed neighbor moves up one bucket.
/// Queue entries invalidated by a move are tombstoned in place and skipped
/// lazily.
pub struct PeoIterator {
    elements: Vec<PeoElement>,
    /// `levels[w]` holds (possibly tombstoned, `-1`) vertices of weight `w`.
    levels: Vec<Vec<i32>>,
}

impl PeoIterator {
    pub fn new(num_vertices: usize) -> Self {
        let mut elements = Vec::with_capacity(num_vertices);
        let mut first_level = Vec::with_capacity(num_vertices);
        for i in 0..num_vertices {
            elements.push(PeoElement { weight: 0, pos: i as u32 });
            first_level.push(i as i32);
        }
        Self { elements, levels: vec![first_level] }
    }

    pub fn next(&mut self, neighbors: &[Vec<u32>]) -> Option<usize> {
        // Pop from the highest non-empty bucket, skipping tombstones.
        let mut next_element: i32 = -1;
        while next_element == -1 {
            match self.levels.last_mut() {
                None => return None,
                Some(level) => loop {
                    match level.pop() {
                        None => break,
                        Some(e) => {
                            if e != -1 {
                                next_element = e;
                                break;
                            }
                        }
                    }
                },
            }
            if self.levels.last().map_or(false, |l| l.is_empty()) {
                self.levels.pop();
            }
        }
        let v = next_element as usize;
        self.elements[v].weight = PROCESSED;
        // Raise the unprocessed neighbors one level.
        for &nb in &neighbors[v] {
            let nb = nb as usize;
            if nb == v {
                continue;
            }
            let w = self.elements[nb].weight;
            if w == PROCESSED {
                continue;
            }
            // Kill the old queue position.
            self.levels[w as usize][self.elements[nb].pos as usize] = -1;
            let nw = (w + 1) as usize;
            self.elements[nb].weight = nw as u32;
            if nw >= self.levels.len() {
                self.levels.push(Vec::new());
            }
            self.levels[nw].push(nb as i32);
            self.elements[nb].pos = (self.levels[nw].len() - 1) as u32;
        }
        Some(v)
    }
}

//=============================================================================
// Greedy coloring

/// Assign a color (slot index) to every value that is live at some
/// safepoint.  Values live at a returns-twice safepoint are pre-assigned
/// exclusive colors `0 .. k-1` first; regular colors are shifted above them
/// and never shared with them.
pub fn color_roots(state: &State) -> Vec<i32> {
    let num_values = (state.max_ptr_number + 1) as usize;
    let mut colors = vec![NO_COLOR; num_values];

    // Permanent slots for everything live across a call with unobservable
    // control flow: it may "return" at a moment liveness cannot see, so no
    // sharing is sound.
    let mut preassigned: i32 = 0;
    for iix in &state.returns_twice {
        let sp = state.safepoint_numbering[iix];
        for n in state.live_sets[sp].iter() {
            if colors[n] == NO_COLOR {
                colors[n] = preassigned;
                preassigned += 1;
            }
        }
    }

    let mut peo = PeoIterator::new(num_values);
    let mut max_assigned: i32 = -1;
    let mut used = BitVec::new();
    while let Some(v) = peo.next(&state.neighbors) {
        if colors[v] != NO_COLOR {
            continue;
        }
        if state.neighbors[v].is_empty() {
            // Not live at any safepoint; no slot needed.
            continue;
        }
        used.clear_all();
        for &nb in &state.neighbors[v] {
            let c = colors[nb as usize];
            // Pre-assigned colors live in a disjoint low range.
            if c == NO_COLOR || c < preassigned {
                continue;
            }
            used.set((c - preassigned) as usize);
        }
        let new_color = used.first_unset() as i32;
        if new_color > max_assigned {
            max_assigned = new_color;
        }
        colors[v] = new_color + preassigned;
    }

    for (n, &c) in colors.iter().enumerate() {
        if c != NO_COLOR {
            debug!("value {} assigned color {}", n, c);
        }
    }
    colors
}

//=============================================================================
// Tests

#[cfg(test)]
mod test {
    use super::PeoIterator;

    #[test]
    fn peo_emits_every_vertex_once() {
        // Triangle 0-1-2 plus the isolated vertex 3.  Self-edges mirror how
        // the interference adjacency is built.
        let neighbors: Vec<Vec<u32>> =
            vec![vec![0, 1, 2], vec![0, 1, 2], vec![0, 1, 2], vec![]];
        let mut peo = PeoIterator::new(neighbors.len());
        let mut seen = vec![false; neighbors.len()];
        while let Some(v) = peo.next(&neighbors) {
            assert!(!seen[v], "vertex {} handed out twice", v);
            seen[v] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn peo_prefers_saturated_vertices() {
        // Path 0-1-2 (with self-edges).  After the first vertex is taken,
        // its neighbor must come out before the far end of the path.
        let neighbors: Vec<Vec<u32>> = vec![vec![0, 1], vec![0, 1, 2], vec![1, 2]];
        let mut peo = PeoIterator::new(3);
        let first = peo.next(&neighbors).unwrap();
        let second = peo.next(&neighbors).unwrap();
        if first == 0 || first == 2 {
            assert_eq!(second, 1);
        }
        assert!(peo.next(&neighbors).is_some());
        assert!(peo.next(&neighbors).is_none());
    }
}
