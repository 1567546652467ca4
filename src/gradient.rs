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

//! Gradient computation.
//!
//! For each training FST, four phases run back to back, all in log space:
//!
//! 1. ψ: per-arc and per-arc-pair log-potentials, the sums of the active
//!    feature weights (exponentials are never taken).
//! 2. Forward: `α(e) = logsum over incoming arcs e' of source(e) of
//!    (ψ(e) + pairψ(e', e) + α(e'))`, walking arcs in `s2t` order.
//! 3. Backward: the mirror image over `t2s`, with `β = 0` at the final
//!    state.
//! 4. Expectation: with `Z` the log-partition at the final state, each
//!    feature's gradient slot receives `multiplier * p` by atomic add,
//!    where `p` is the arc (or pair) posterior.
//!
//! The objective increment returned per FST is `multiplier * Z`; summed over
//! a dataset of positive hypothesis spaces and negative references this is
//! the training loss.
//!
//! # Concurrency Model
//! ```text
//! Main Thread                    Workers (xN)
//! ───────────                    ────────────
//! compute() ───┐                 ┌─ loop: claim idx = counter++
//!              │── spawn ───────►│    exclusive &mut Fst from cell
//!              │                 │    phases 1-4, atomic adds into g
//! join ◄───────┘                 └─ add local fx into shared objective
//! ```
//! A claimed index is the exclusivity token for the FST cell; features and
//! the objective are the only cross-thread write targets, both atomic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result};

use crate::dataset::Dataset;
use crate::features::Generator;
use crate::fst::Fst;
use crate::model::{Model, MAX_REAL};
use crate::progress::Progress;
use crate::sync::AtomicF64;

/// log(exp(a) + exp(b)) with the precision loss kept in the `log1p`.
/// Negative infinity is the sum identity; the explicit check avoids the
/// `-inf - -inf` NaN in the general branch.
#[inline(always)]
pub fn logsum(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        b
    } else if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// Phase 1: arc and pair log-potentials from the current weights. Dense
/// slots contribute `x_i * dense_i` when their tag window has started.
pub fn compute_psi(mdl: &Model, fst: &mut Fst) {
    let itr = mdl.itr.load(Ordering::Acquire);
    for ia in 0..fst.arcs.len() {
        let mut sum = 0.0;
        for f in fst.arc_feats(ia) {
            sum += f.get().x.load();
        }
        for i in 1..MAX_REAL {
            if mdl.start_of(128 - i) <= itr {
                sum += mdl.real_slot(i).x.load()
                    * fst.arcs[ia].dense.get(i).copied().unwrap_or(0.0);
            }
        }
        fst.arcs[ia].psi = sum;
    }
    for is in 0..fst.nstates {
        let (icnt, ocnt) = (fst.states[is].ilst.len(), fst.states[is].olst.len());
        for ni in 0..icnt {
            for no in 0..ocnt {
                let pair = fst.pair_index(is, ni, no);
                let mut sum = 0.0;
                for f in fst.pair_feats(pair) {
                    sum += f.get().x.load();
                }
                fst.pair_psi[pair] = sum;
            }
        }
    }
}

/// Phase 2: forward log-scores in `s2t` order. Arcs out of the initial
/// state seed the recursion with their own ψ.
pub fn forward(fst: &mut Fst) {
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
        let mut alpha = f64::NEG_INFINITY;
        for (ni, &ia) in st.ilst.iter().enumerate() {
            let pair = pair_base[src] as usize + ni * st.olst.len() + no;
            alpha = logsum(alpha, psi + pair_psi[pair] + arcs[ia as usize].alpha);
        }
        arcs[o].alpha = alpha;
    }
}

/// Phase 3: backward log-scores in `t2s` order, the mirror of the forward
/// pass. Arcs into the final state carry `β = 0`.
pub fn backward(fst: &mut Fst) {
    let final_state = fst.final_state;
    let Fst {
        arcs,
        states,
        t2s,
        pair_base,
        pair_psi,
        ..
    } = fst;
    for &i in t2s.iter() {
        let i = i as usize;
        let trg = arcs[i].trg as usize;
        if trg == final_state {
            arcs[i].beta = 0.0;
            continue;
        }
        let st = &states[trg];
        let ni = st.ilst.iter().position(|&x| x as usize == i).unwrap();
        let mut beta = f64::NEG_INFINITY;
        for (no, &oa) in st.olst.iter().enumerate() {
            let pair = pair_base[trg] as usize + ni * st.olst.len() + no;
            let ao = &arcs[oa as usize];
            beta = logsum(beta, ao.psi + pair_psi[pair] + ao.beta);
        }
        arcs[i].beta = beta;
    }
}

/// Log-partition: logsum of α over arcs entering the final state (their β
/// are all zero).
pub fn partition(fst: &Fst) -> f64 {
    let mut z = f64::NEG_INFINITY;
    for a in &fst.arcs {
        if a.trg as usize == fst.final_state {
            z = logsum(z, a.alpha);
        }
    }
    z
}

/// Phase 4: accumulate `multiplier * posterior` into the gradient slot of
/// every feature on every arc and arc pair. Returns `multiplier * Z`.
pub fn accumulate(mdl: &Model, fst: &Fst) -> f64 {
    let mul = fst.mult;
    let z = partition(fst);
    for (ia, a) in fst.arcs.iter().enumerate() {
        let ex = (a.alpha + a.beta - z).exp();
        for f in fst.arc_feats(ia) {
            f.get().g.add(ex * mul);
        }
        for i in 1..MAX_REAL {
            let dense = a.dense.get(i).copied().unwrap_or(0.0);
            mdl.real_slot(i).g.add(ex * dense * mul);
        }
    }
    for is in 0..fst.nstates {
        let st = &fst.states[is];
        for ni in 0..st.ilst.len() {
            for no in 0..st.olst.len() {
                let ai = &fst.arcs[st.ilst[ni] as usize];
                let ao = &fst.arcs[st.olst[no] as usize];
                let pair = fst.pair_index(is, ni, no);
                let ex = (ai.alpha + ao.beta + ao.psi + fst.pair_psi[pair] - z).exp();
                for f in fst.pair_feats(pair) {
                    f.get().g.add(ex * mul);
                }
            }
        }
    }
    mul * z
}

/// The gradient computer: dispatches the dataset to worker threads and
/// collects the objective.
pub struct Gradient<'a> {
    pub nthreads: usize,
    pub cache_lvl: u32,
    mdl: &'a Model,
    gen: &'a Generator,
    dat: &'a Dataset,
}

impl<'a> Gradient<'a> {
    pub fn new(mdl: &'a Model, gen: &'a Generator, dat: &'a Dataset) -> Gradient<'a> {
        Gradient {
            nthreads: 1,
            cache_lvl: 0,
            mdl,
            gen,
            dat,
        }
    }

    fn run_worker(&self, idx: &AtomicUsize, fx: &AtomicF64, prg: &Progress) -> Result<()> {
        let mut local = 0.0;
        loop {
            let id = idx.fetch_add(1, Ordering::AcqRel);
            if id >= self.dat.len() {
                break;
            }
            // The claimed index makes this the only thread touching the
            // cell until the pass ends.
            let fst: &mut Fst = unsafe { self.dat.fsts[id].get() };
            fst.add_states();
            fst.add_sort()
                .with_context(|| format!("training fst #{}", id + 1))?;
            self.gen.add_features(self.mdl, fst);
            fst.add_scratch();
            compute_psi(self.mdl, fst);
            forward(fst);
            backward(fst);
            local += accumulate(self.mdl, fst);
            fst.teardown(self.cache_lvl);
            prg.tick();
        }
        fx.add(local);
        Ok(())
    }

    /// One full pass over the dataset. Expects every feature's `g` to be
    /// clear on entry (the optimizer sweep leaves it that way) and returns
    /// the summed objective.
    pub fn compute(&self) -> Result<f64> {
        let prg = Progress::start((self.dat.len() / 49) as i64);
        let idx = AtomicUsize::new(0);
        let fx = AtomicF64::new(0.0);
        if self.nthreads <= 1 {
            self.run_worker(&idx, &fx, &prg)?;
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = (0..self.nthreads)
                    .map(|_| scope.spawn(|| self.run_worker(&idx, &fx, &prg)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("gradient worker panicked"))
                    .collect::<Result<Vec<()>>>()
            })?;
        }
        prg.finish();
        Ok(fx.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::tests::arc;
    use crate::model::Model;
    use crate::strings::StringPool;
    use std::sync::atomic::Ordering;

    fn setup(patterns: &[&str]) -> (Model, Generator) {
        let mdl = Model::new(StringPool::new(true));
        let mut gen = Generator::new(&mdl.pool, false);
        for p in patterns {
            gen.add_pattern(&mdl.pool, p).unwrap();
        }
        (mdl, gen)
    }

    /// Two parallel arcs 0 -> 1 labelled a and b.
    fn two_arc(mult: f64) -> Fst {
        let mut fst = Fst::new(mult);
        fst.arcs = vec![arc(0, 1, "a", "a"), arc(0, 1, "b", "b")];
        fst.nstates = 2;
        fst.final_state = 1;
        fst
    }

    fn prepare(mdl: &Model, gen: &Generator, fst: &mut Fst) {
        fst.add_states();
        fst.add_sort().unwrap();
        gen.add_features(mdl, fst);
        fst.add_scratch();
        compute_psi(mdl, fst);
        forward(fst);
        backward(fst);
    }

    #[test]
    fn logsum_identities() {
        assert_eq!(logsum(f64::NEG_INFINITY, 3.0), 3.0);
        assert_eq!(logsum(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        let v = logsum(0.0, 0.0);
        assert!((v - 2.0f64.ln()).abs() < 1e-12);
        // Symmetry.
        assert!((logsum(1.0, 2.5) - logsum(2.5, 1.0)).abs() < 1e-12);
    }

    #[test]
    fn uniform_two_arc_gradients_are_half() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut fst = two_arc(-1.0);
        prepare(&mdl, &gen, &mut fst);
        let obj = accumulate(&mdl, &fst);
        // Both weights are zero: Z = log 2, each arc posterior 1/2, and on
        // the reference side the gradient picks up the negative sign.
        assert!((obj - -(2.0f64.ln())).abs() < 1e-12);
        for (_, f) in mdl.features.iter() {
            assert!((f.g.load() - -0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn softmax_gradient_with_nonzero_weight() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut fst = two_arc(1.0);
        // Push weight onto the feature of arc "a".
        {
            let mut probe = two_arc(1.0);
            probe.add_states();
            gen.add_features(&mdl, &mut probe);
            probe.arc_feats(0)[0].get().x.store(1.0);
        }
        prepare(&mdl, &gen, &mut fst);
        accumulate(&mdl, &fst);
        let pa = 1.0f64.exp() / (1.0f64.exp() + 1.0);
        let ga = fst.arc_feats(0)[0].get().g.load();
        let gb = fst.arc_feats(1)[0].get().g.load();
        assert!((ga - pa).abs() < 1e-12);
        assert!((gb - (1.0 - pa)).abs() < 1e-12);
    }

    #[test]
    fn partition_identity_holds() {
        let (mdl, gen) = setup(&["0s0", "0t0,1t0"]);
        // A lattice with branching and bigram potentials.
        let mut fst = Fst::new(1.0);
        fst.arcs = vec![
            arc(0, 1, "a", "x"),
            arc(0, 1, "b", "y"),
            arc(1, 2, "c", "x"),
            arc(1, 2, "d", "y"),
            arc(2, 3, "e", "x"),
        ];
        fst.nstates = 4;
        fst.final_state = 3;
        // Spread some weight around so the test is not all-zeros.
        fst.add_states();
        fst.add_sort().unwrap();
        gen.add_features(&mdl, &mut fst);
        for (i, (_, f)) in mdl.features.iter().enumerate() {
            f.x.store(0.25 * (i as f64 + 1.0));
        }
        fst.add_scratch();
        compute_psi(&mdl, &mut fst);
        forward(&mut fst);
        backward(&mut fst);

        let z_final = partition(&fst);
        // The same quantity from the initial side: logsum over arcs leaving
        // state 0 of psi + beta.
        let mut z_init = f64::NEG_INFINITY;
        for a in &fst.arcs {
            if a.src == 0 {
                z_init = logsum(z_init, a.psi + a.beta);
            }
        }
        assert!((z_final - z_init).abs() < 1e-10);
    }

    #[test]
    fn posteriors_sum_to_one_per_cut() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut fst = two_arc(1.0);
        prepare(&mdl, &gen, &mut fst);
        let z = partition(&fst);
        let total: f64 = fst.arcs.iter().map(|a| (a.alpha + a.beta - z).exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn single_thread_compute_is_deterministic() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut dat = Dataset::new();
        for _ in 0..8 {
            dat.fsts.push(crate::sync::ThreadSafeCell::new(two_arc(1.0)));
        }
        let grd = Gradient::new(&mdl, &gen, &dat);
        let fx1 = grd.compute().unwrap();
        // Clear gradients the way the optimizer would.
        for (_, f) in mdl.features.iter() {
            f.g.store(0.0);
            f.frq.store(0, Ordering::Relaxed);
        }
        let fx2 = grd.compute().unwrap();
        assert_eq!(fx1.to_bits(), fx2.to_bits());
        assert!((fx1 - 8.0 * 2.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn multi_thread_compute_matches_single() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut dat = Dataset::new();
        for i in 0..32 {
            let mut fst = two_arc(if i % 2 == 0 { 1.0 } else { -1.0 });
            fst.arcs.push(arc(1, 2, "c", "c"));
            fst.nstates = 3;
            fst.final_state = 2;
            dat.fsts.push(crate::sync::ThreadSafeCell::new(fst));
        }
        let mut grd = Gradient::new(&mdl, &gen, &dat);
        let fx1 = grd.compute().unwrap();
        for (_, f) in mdl.features.iter() {
            f.g.store(0.0);
            f.frq.store(0, Ordering::Relaxed);
        }
        grd.nthreads = 4;
        let fx2 = grd.compute().unwrap();
        let rel = ((fx1 - fx2) / fx1.abs().max(1.0)).abs();
        assert!(rel < 1e-10, "fx diverged: {} vs {}", fx1, fx2);
    }

    #[test]
    fn cyclic_input_fails_structurally() {
        let (mdl, gen) = setup(&["0s0"]);
        let mut dat = Dataset::new();
        let mut fst = Fst::new(1.0);
        fst.arcs = vec![arc(0, 1, "a", "a"), arc(1, 1, "b", "b")];
        fst.nstates = 2;
        fst.final_state = 1;
        dat.fsts.push(crate::sync::ThreadSafeCell::new(fst));
        let grd = Gradient::new(&mdl, &gen, &dat);
        assert!(grd.compute().is_err());
    }
}
