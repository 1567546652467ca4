/* The MIT License (MIT)
* Copyright (c) 2024 Nathan Hoos
*
* Permission is hereby granted, free of charge, to any person obtaining a copy
* of this software and associated documentation files (the "Software"), to deal
* in the Software without restriction, including without limitation the rights
* to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
* copies of the Software, and to permit persons to whom the Software is
* furnished to do so, subject to the following conditions:
*
* The above copyright notice and this permission notice shall be included in
* all copies or substantial portions of the Software.
*
* THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
* IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
* FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
* AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
* LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
* OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
* THE SOFTWARE.
*/

//! Transducer representation.
//!
//! An FST is parsed once into a flat arc array and then lazily augmented
//! with derived data as the gradient or decoder passes need it: state
//! adjacency lists, topologically sorted arc orders, feature lists and
//! gradient scratch. Each layer can be torn down independently after a pass;
//! the cache level decides how much survives to the next iteration
//! (0 keeps nothing, 4 keeps everything).
//!
//! Training FSTs must be lattices: acyclic, with state 0 the unique source
//! and `final_state` the unique sink. Both properties are checked by the
//! topological sort.

use anyhow::{bail, Result};
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;

use crate::model::{FeatRef, LabelRef};

/// One transition. `psi`/`alpha`/`beta` are per-iteration scalars owned by
/// whichever worker currently processes the FST; `eback` is the Viterbi
/// back-pointer to the argmax incoming arc.
pub struct Arc {
    pub src: u32,
    pub trg: u32,
    pub ilbl: LabelRef,
    pub olbl: LabelRef,
    /// Dense scores from the input columns past the labels.
    pub dense: SmallVec<[f64; 2]>,
    pub psi: f64,
    pub alpha: f64,
    pub beta: f64,
    pub eback: u32,
}

/// Incoming and outgoing arc indices of a state.
#[derive(Default)]
pub struct State {
    pub ilst: SmallVec<[u32; 4]>,
    pub olst: SmallVec<[u32; 4]>,
}

/// Cache levels: what survives between iterations for a given FST.
pub const CACHE_STATES: u32 = 1;
pub const CACHE_SORT: u32 = 2;
pub const CACHE_FEATURES: u32 = 3;
pub const CACHE_SCRATCH: u32 = 4;

pub struct Fst {
    /// Sign decides the training side: positive for hypothesis spaces,
    /// negative for references, zero for decode-only data.
    pub mult: f64,
    pub nstates: usize,
    pub final_state: usize,
    pub arcs: Vec<Arc>,

    // Level 1: adjacency.
    pub states: Vec<State>,
    /// First (in, out) pair index of each state; pairs of state `s` are
    /// `pair_base[s] + ni * olst.len() + no`.
    pub pair_base: Vec<u32>,
    pub npairs: usize,

    // Level 2: arc orders consistent with a forward / backward topological
    // order of states.
    pub s2t: Vec<u32>,
    pub t2s: Vec<u32>,

    // Level 3: feature lists, one contiguous arena per kind with per-slot
    // spans.
    pub ufeat: Vec<FeatRef>,
    pub uspan: Vec<(u32, u32)>,
    pub bfeat: Vec<FeatRef>,
    pub bspan: Vec<(u32, u32)>,

    // Level 4: gradient scratch, the pairwise log-potentials.
    pub pair_psi: Vec<f64>,
}

impl Fst {
    pub fn new(mult: f64) -> Fst {
        Fst {
            mult,
            nstates: 0,
            final_state: usize::MAX,
            arcs: Vec::new(),
            states: Vec::new(),
            pair_base: Vec::new(),
            npairs: 0,
            s2t: Vec::new(),
            t2s: Vec::new(),
            ufeat: Vec::new(),
            uspan: Vec::new(),
            bfeat: Vec::new(),
            bspan: Vec::new(),
            pair_psi: Vec::new(),
        }
    }

    /// Build the per-state adjacency lists and the pair index base. No-op
    /// when already present.
    pub fn add_states(&mut self) {
        if !self.states.is_empty() {
            return;
        }
        let mut states: Vec<State> = (0..self.nstates).map(|_| State::default()).collect();
        for (ia, arc) in self.arcs.iter().enumerate() {
            states[arc.src as usize].olst.push(ia as u32);
            states[arc.trg as usize].ilst.push(ia as u32);
        }
        let mut base = Vec::with_capacity(self.nstates);
        let mut npairs = 0u32;
        for s in &states {
            base.push(npairs);
            npairs += (s.ilst.len() * s.olst.len()) as u32;
        }
        self.states = states;
        self.pair_base = base;
        self.npairs = npairs as usize;
    }

    pub fn remove_states(&mut self) {
        self.states = Vec::new();
        self.pair_base = Vec::new();
        self.npairs = 0;
    }

    #[inline(always)]
    pub fn pair_index(&self, state: usize, ni: usize, no: usize) -> usize {
        self.pair_base[state] as usize + ni * self.states[state].olst.len() + no
    }

    /// Kahn topological sort of the states, forward from the source or
    /// backward from the sink. Also validates the lattice shape: exactly one
    /// extremal state on the chosen side, which must be state 0 (forward) or
    /// the final state (backward), and no cycles.
    pub fn toposort(&self, rev: bool) -> Result<Vec<u32>> {
        let n = self.nstates;
        let mut deg: Vec<usize> = (0..n)
            .map(|s| {
                if rev {
                    self.states[s].olst.len()
                } else {
                    self.states[s].ilst.len()
                }
            })
            .collect();
        let mut lst: Vec<u32> = (0..n as u32).collect();
        let mut done = 0;
        while done < n {
            let mut last = done;
            for i in done..n {
                if deg[lst[i] as usize] == 0 {
                    lst.swap(i, last);
                    last += 1;
                }
            }
            if done == 0 {
                if last != 1 {
                    bail!("not a single {} state", if rev { "final" } else { "initial" });
                }
                let expect = if rev { self.final_state } else { 0 };
                if lst[0] as usize != expect {
                    bail!(
                        "{} state is not the designated one",
                        if rev { "final" } else { "initial" }
                    );
                }
            }
            if last == done {
                bail!("cycle detected in transducer");
            }
            for i in done..last {
                let s = &self.states[lst[i] as usize];
                if rev {
                    for &ia in &s.ilst {
                        deg[self.arcs[ia as usize].src as usize] -= 1;
                    }
                } else {
                    for &ia in &s.olst {
                        deg[self.arcs[ia as usize].trg as usize] -= 1;
                    }
                }
            }
            done = last;
        }
        Ok(lst)
    }

    /// Build the forward (`s2t`) and backward (`t2s`) arc orders from the
    /// two state sorts. No-op when already present.
    pub fn add_sort(&mut self) -> Result<()> {
        if !self.s2t.is_empty() {
            return Ok(());
        }
        let narcs = self.arcs.len();
        let mut s2t = Vec::with_capacity(narcs);
        let mut t2s = Vec::with_capacity(narcs);
        let mut flag = FixedBitSet::with_capacity(narcs);

        for &is in &self.toposort(false)? {
            for &ia in &self.states[is as usize].olst {
                if !flag.contains(ia as usize) {
                    s2t.push(ia);
                    flag.insert(ia as usize);
                }
            }
        }
        flag.clear();
        for &is in &self.toposort(true)? {
            for &ia in &self.states[is as usize].ilst {
                if !flag.contains(ia as usize) {
                    t2s.push(ia);
                    flag.insert(ia as usize);
                }
            }
        }
        self.s2t = s2t;
        self.t2s = t2s;
        Ok(())
    }

    pub fn remove_sort(&mut self) {
        self.s2t = Vec::new();
        self.t2s = Vec::new();
    }

    pub fn remove_features(&mut self) {
        self.ufeat = Vec::new();
        self.uspan = Vec::new();
        self.bfeat = Vec::new();
        self.bspan = Vec::new();
    }

    /// Allocate the pairwise log-potential scratch. No-op when present.
    pub fn add_scratch(&mut self) {
        if self.pair_psi.is_empty() && self.npairs > 0 {
            self.pair_psi = vec![0.0; self.npairs];
        }
    }

    pub fn remove_scratch(&mut self) {
        self.pair_psi = Vec::new();
    }

    /// Tear down everything above the given cache level.
    pub fn teardown(&mut self, cache_lvl: u32) {
        if cache_lvl < CACHE_SCRATCH {
            self.remove_scratch();
        }
        if cache_lvl < CACHE_FEATURES {
            self.remove_features();
        }
        if cache_lvl < CACHE_SORT {
            self.remove_sort();
        }
        if cache_lvl < CACHE_STATES {
            self.remove_states();
        }
    }

    /// Unigram feature list of an arc.
    #[inline(always)]
    pub fn arc_feats(&self, ia: usize) -> &[FeatRef] {
        let (off, cnt) = self.uspan[ia];
        &self.ufeat[off as usize..(off + cnt) as usize]
    }

    /// Bigram feature list of a pair slot.
    #[inline(always)]
    pub fn pair_feats(&self, pair: usize) -> &[FeatRef] {
        let (off, cnt) = self.bspan[pair];
        &self.bfeat[off as usize..(off + cnt) as usize]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::Label;
    use crate::model::LabelRef;
    use smallvec::smallvec;

    // Labels live for the whole test; leaking keeps LabelRef honest without
    // dragging a Model into structural tests.
    pub(crate) fn label(name: &str) -> LabelRef {
        let lbl: &'static Label = Box::leak(Box::new(Label {
            raw: crate::hashing::hash_str(name),
            toks: name.split('|').map(crate::hashing::hash_str).collect(),
        }));
        LabelRef::new(lbl)
    }

    pub(crate) fn arc(src: u32, trg: u32, i: &str, o: &str) -> Arc {
        Arc {
            src,
            trg,
            ilbl: label(i),
            olbl: label(o),
            dense: smallvec![],
            psi: 0.0,
            alpha: 0.0,
            beta: 0.0,
            eback: 0,
        }
    }

    pub(crate) fn diamond() -> Fst {
        // 0 -> 1 -> 3 and 0 -> 2 -> 3
        let mut fst = Fst::new(1.0);
        fst.arcs = vec![
            arc(0, 1, "a", "a"),
            arc(0, 2, "b", "b"),
            arc(1, 3, "c", "c"),
            arc(2, 3, "d", "d"),
        ];
        fst.nstates = 4;
        fst.final_state = 3;
        fst
    }

    #[test]
    fn adjacency_lists() {
        let mut fst = diamond();
        fst.add_states();
        assert_eq!(fst.states[0].olst.as_slice(), &[0, 1]);
        assert_eq!(fst.states[3].ilst.as_slice(), &[2, 3]);
        assert_eq!(fst.states[1].ilst.as_slice(), &[0]);
        // One (in, out) pair in each middle state.
        assert_eq!(fst.npairs, 2);
        assert_eq!(fst.pair_index(2, 0, 0), 1);
    }

    #[test]
    fn toposort_orders_states() {
        let mut fst = diamond();
        fst.add_states();
        let fwd = fst.toposort(false).unwrap();
        assert_eq!(fwd[0], 0);
        assert_eq!(fwd[3], 3);
        let bwd = fst.toposort(true).unwrap();
        assert_eq!(bwd[0], 3);
        assert_eq!(bwd[3], 0);
    }

    #[test]
    fn arc_orders_are_consistent_permutations() {
        let mut fst = diamond();
        fst.add_states();
        fst.add_sort().unwrap();
        let mut fwd = fst.s2t.clone();
        let mut bwd = fst.t2s.clone();
        fwd.sort_unstable();
        bwd.sort_unstable();
        assert_eq!(fwd, vec![0, 1, 2, 3]);
        assert_eq!(bwd, vec![0, 1, 2, 3]);
        // In s2t order, an arc's source never appears downstream of its
        // target.
        let pos: Vec<usize> = {
            let mut p = vec![0; 4];
            for (i, &a) in fst.s2t.iter().enumerate() {
                p[a as usize] = i;
            }
            p
        };
        assert!(pos[0] < pos[2]); // 0->1 before 1->3
        assert!(pos[1] < pos[3]); // 0->2 before 2->3
    }

    #[test]
    fn cycle_is_structural_error() {
        let mut fst = Fst::new(1.0);
        fst.arcs = vec![arc(0, 1, "a", "a"), arc(1, 2, "b", "b"), arc(2, 1, "c", "c")];
        fst.nstates = 3;
        fst.final_state = 2;
        fst.add_states();
        assert!(fst.toposort(false).is_err());
    }

    #[test]
    fn two_sources_is_structural_error() {
        let mut fst = Fst::new(1.0);
        // States 0 and 2 both have in-degree 0.
        fst.arcs = vec![arc(0, 1, "a", "a"), arc(2, 1, "b", "b")];
        fst.nstates = 3;
        fst.final_state = 1;
        fst.add_states();
        assert!(fst.toposort(false).is_err());
    }

    #[test]
    fn teardown_respects_cache_level() {
        let mut fst = diamond();
        fst.add_states();
        fst.add_sort().unwrap();
        fst.add_scratch();
        fst.teardown(2);
        assert!(fst.pair_psi.is_empty());
        assert!(!fst.s2t.is_empty());
        assert!(!fst.states.is_empty());
        fst.teardown(0);
        assert!(fst.s2t.is_empty());
        assert!(fst.states.is_empty());
    }
}
