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

//! Decoding: Viterbi best path and scored-lattice dump.
//!
//! Viterbi is the gradient's forward pass moved into the tropical semiring:
//! `logsum` becomes `max` and each arc records a back-pointer to its argmax
//! incoming arc. Backtracking from the best arc into the final state yields
//! the best path, printed as `input@output` pairs in source-to-target
//! order.
//!
//! The scored dump re-emits the whole lattice annotated with the ψ scores
//! of the current model, renumbering each arc to a state of its own so the
//! pairwise potentials become plain arc scores; states 0 and 1 are reserved
//! for the initial and final state of the emitted lattice.

use std::io::Write;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

use crate::dataset::Dataset;
use crate::features::Generator;
use crate::fst::Fst;
use crate::gradient::compute_psi;
use crate::model::Model;
use crate::progress::Progress;

/// Tropical forward pass: best log-score per arc plus argmax back-pointer.
pub fn viterbi_forward(fst: &mut Fst) {
    let Fst {
        arcs,
        states,
        s2t,
        pair_base,
        pair_psi,
        ..
    } = fst;
    for &o in s2t.iter() {
        let o = o as usize;
        let src = arcs[o].src as usize;
        if src == 0 {
            arcs[o].alpha = arcs[o].psi;
            continue;
        }
        let st = &states[src];
        let no = st.olst.iter().position(|&x| x as usize == o).unwrap();
        let psi = arcs[o].psi;
        let mut best = f64::NEG_INFINITY;
        let mut back = 0u32;
        for (ni, &ia) in st.ilst.iter().enumerate() {
            let pair = pair_base[src] as usize + ni * st.olst.len() + no;
            let v = psi + pair_psi[pair] + arcs[ia as usize].alpha;
            if v > best {
                best = v;
                back = ia;
            }
        }
        arcs[o].alpha = best;
        arcs[o].eback = back;
    }
}

/// Follow the back-pointers from the best final arc down to the initial
/// state. Returns the raw label hashes `(input, output)` per arc in
/// source-to-target order.
pub fn backtrack(fst: &Fst) -> Vec<(u64, u64)> {
    let mut best = f64::NEG_INFINITY;
    let mut ei = 0usize;
    for (e, arc) in fst.arcs.iter().enumerate() {
        if arc.trg as usize != fst.final_state {
            continue;
        }
        if arc.alpha > best {
            best = arc.alpha;
            ei = e;
        }
    }
    let mut path = Vec::new();
    let mut arc = &fst.arcs[ei];
    path.push((arc.ilbl.get().raw, arc.olbl.get().raw));
    while arc.src != 0 {
        arc = &fst.arcs[arc.eback as usize];
        path.push((arc.ilbl.get().raw, arc.olbl.get().raw));
    }
    path.reverse();
    path
}

/// Emit the scored lattice. Every arc of the input becomes a state of the
/// output (index + 2, after the reserved initial 0 and final 1), so an
/// output arc from state-of(e_in) to state-of(e_out) carries
/// `pairψ + ψ(e_out)`; arcs out of the initial state carry plain ψ, arcs
/// into the final state are epsilon with score 0.
pub fn dump_scored(fst: &Fst, mdl: &Model, out: &mut dyn Write) -> Result<()> {
    let mut ids: FxHashMap<u32, u32> = FxHashMap::default();
    fn state_of(ids: &mut FxHashMap<u32, u32>, arc: u32) -> u32 {
        let next = ids.len() as u32 + 2;
        *ids.entry(arc).or_insert(next)
    }

    let initial = &fst.states[0];
    for &eo in &initial.olst {
        let arc = &fst.arcs[eo as usize];
        let ilbl = mdl.pool.get(arc.ilbl.get().raw);
        let olbl = mdl.pool.get(arc.olbl.get().raw);
        let trg = state_of(&mut ids, eo);
        writeln!(out, "0\t{}\t{}\t{}\t{:.6}", trg, ilbl, olbl, arc.psi)?;
    }
    for is in 0..fst.nstates {
        let st = &fst.states[is];
        for ni in 0..st.ilst.len() {
            for no in 0..st.olst.len() {
                let (ei, eo) = (st.ilst[ni], st.olst[no]);
                let arc = &fst.arcs[eo as usize];
                let ilbl = mdl.pool.get(arc.ilbl.get().raw);
                let olbl = mdl.pool.get(arc.olbl.get().raw);
                let score = fst.pair_psi[fst.pair_index(is, ni, no)] + arc.psi;
                let src = state_of(&mut ids, ei);
                let trg = state_of(&mut ids, eo);
                writeln!(out, "{}\t{}\t{}\t{}\t{:.6}", src, trg, ilbl, olbl, score)?;
            }
        }
    }
    let final_st = &fst.states[fst.final_state];
    for &ei in &final_st.ilst {
        let src = state_of(&mut ids, ei);
        writeln!(out, "{}\t1\t<eps>\t0.0", src)?;
    }
    writeln!(out, "1")?;
    writeln!(out, "EOS")?;
    Ok(())
}

/// Decode every FST of a dataset: Viterbi paths, or the full scored
/// lattices when `scored` is set. All per-FST caches are torn down after
/// each record.
pub fn decode(
    mdl: &Model,
    gen: &Generator,
    dat: &Dataset,
    out: &mut dyn Write,
    scored: bool,
) -> Result<()> {
    let prg = Progress::start(1000);
    for (id, cell) in dat.fsts.iter().enumerate() {
        // Decoding is single-threaded; nothing else touches the cells.
        let fst: &mut Fst = unsafe { cell.get() };
        fst.add_states();
        fst.add_sort().with_context(|| format!("decode fst #{}", id + 1))?;
        gen.add_features(mdl, fst);
        fst.add_scratch();
        compute_psi(mdl, fst);
        if scored {
            dump_scored(fst, mdl, out)?;
        } else {
            viterbi_forward(fst);
            for (ihsh, ohsh) in backtrack(fst) {
                write!(out, "{}@{} ", mdl.pool.get(ihsh), mdl.pool.get(ohsh))?;
            }
            writeln!(out)?;
        }
        fst.teardown(0);
        prg.tick();
    }
    prg.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::tests::arc;
    use crate::hashing::hash_str;
    use crate::strings::StringPool;
    use crate::sync::ThreadSafeCell;

    fn setup(patterns: &[&str]) -> (Model, Generator) {
        let mdl = Model::new(StringPool::new(true));
        let mut gen = Generator::new(&mdl.pool, false);
        for p in patterns {
            gen.add_pattern(&mdl.pool, p).unwrap();
        }
        // The test lattices bypass label interning, so feed the pool the
        // strings the decoder will want to print.
        for s in ["a", "b", "c", "d", "A", "B", "C", "D"] {
            mdl.pool.intern(s, true);
        }
        (mdl, gen)
    }

    fn weight(mdl: &Model, tok: &str, w: f64) {
        let id = crate::hashing::hash_words(&[hash_str(tok)]) & ((1u64 << 56) - 1);
        match mdl.features.find(id) {
            Some(f) => f.x.store(w),
            None => {
                mdl.features.insert(id, Default::default()).0.x.store(w);
            }
        }
    }

    /// Diamond lattice where the upper path is better by construction.
    fn lattice() -> Fst {
        let mut fst = Fst::new(0.0);
        fst.arcs = vec![
            arc(0, 1, "a", "A"),
            arc(0, 2, "b", "B"),
            arc(1, 3, "c", "C"),
            arc(2, 3, "d", "D"),
        ];
        fst.nstates = 4;
        fst.final_state = 3;
        fst
    }

    #[test]
    fn viterbi_returns_unique_best_path() {
        let (mdl, gen) = setup(&["0s0"]);
        weight(&mdl, "a", 2.0);
        weight(&mdl, "c", 1.0);
        weight(&mdl, "b", 0.5);

        let mut dat = Dataset::new();
        dat.fsts.push(ThreadSafeCell::new(lattice()));
        let mut out = Vec::new();
        decode(&mdl, &gen, &dat, &mut out, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a@A c@C \n");
    }

    #[test]
    fn viterbi_respects_pair_potentials() {
        let (mdl, gen) = setup(&["0s0", "0s0,1s0"]);
        // Unigram scores favor the upper path, but a strong pair potential
        // on (b, d) flips the decision.
        weight(&mdl, "a", 1.0);
        let pair_id =
            crate::hashing::hash_words(&[hash_str("b"), hash_str("d")]) & ((1u64 << 56) - 1);
        mdl.features.insert(pair_id, Default::default()).0.x.store(5.0);

        let mut dat = Dataset::new();
        dat.fsts.push(ThreadSafeCell::new(lattice()));
        let mut out = Vec::new();
        decode(&mdl, &gen, &dat, &mut out, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "b@B d@D \n");
    }

    #[test]
    fn scored_dump_shape() {
        let (mdl, gen) = setup(&["0s0"]);
        weight(&mdl, "a", 1.5);
        let mut dat = Dataset::new();
        dat.fsts.push(ThreadSafeCell::new(lattice()));
        let mut out = Vec::new();
        decode(&mdl, &gen, &dat, &mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // 2 initial arcs + 2 middle pairs + 2 final eps + final-state line
        // + EOS.
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "0\t2\ta\tA\t1.500000");
        assert!(lines[lines.len() - 2].ends_with("1"));
        assert_eq!(lines[lines.len() - 1], "EOS");
        // Every middle line targets a fresh state >= 2.
        assert!(lines[2].starts_with("2\t") || lines[2].starts_with("3\t"));
        // Final transitions are epsilon into state 1.
        assert!(lines[4].contains("\t1\t<eps>\t0.0") || lines[5].contains("\t1\t<eps>\t0.0"));
    }
}
