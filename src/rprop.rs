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

//! Resilient back-propagation (Riedmiller & Braun, 1993) with orthant-wise
//! L1 handling.
//!
//! Each feature carries its own adaptive step size: agreeing gradient signs
//! across iterations grow it, a sign flip shrinks it and rolls the last
//! update back. L1 and frequency-weighted L1 terms are handled by
//! projecting the gradient into the current orthant and refusing updates
//! that would cross zero, so weights reach exactly 0.0 and can be pruned.
//!
//! The sweep is strictly single-threaded and must only run after the
//! gradient workers of the iteration are joined: it is the one phase that
//! removes features, and the returned [`Retired`] guards keep the removed
//! records alive until the caller has also dropped every per-FST feature
//! list that may point at them.

use crate::model::{Feature, Model};
use crate::progress::Progress;
use crate::sync::Retired;
use std::sync::atomic::Ordering;

const EPSILON: f64 = f64::EPSILON * 64.0;

/// Per-tag regularization and global step-size bounds. A tag whose ρ is
/// left at −1 inherits the tag-0 value when `inherit` runs.
pub struct Rprop {
    pub rho1: [f64; 128],
    pub rho2: [f64; 128],
    pub rho3: [f64; 128],
    pub stp_inc: f64,
    pub stp_dec: f64,
    pub stp_min: f64,
    pub stp_max: f64,
}

/// What one sweep did, for reporting and tests. `retired` owns the pruned
/// feature records; drop it only once no FST cache can still reference
/// them.
pub struct Sweep {
    pub fx: f64,
    pub norm_x: f64,
    pub norm_g: f64,
    pub norm_d: f64,
    pub retired: Vec<Retired<Feature>>,
}

impl Rprop {
    pub fn new() -> Rprop {
        let mut rho1 = [-1.0; 128];
        let mut rho2 = [-1.0; 128];
        let mut rho3 = [-1.0; 128];
        rho1[0] = 0.0;
        rho2[0] = 0.0;
        rho3[0] = 0.0;
        Rprop {
            rho1,
            rho2,
            rho3,
            stp_inc: 1.2,
            stp_dec: 0.5,
            stp_min: 1e-8,
            stp_max: 50.0,
        }
    }

    /// Fill every unset per-tag ρ from tag 0. Call once after all CLI
    /// overrides are applied.
    pub fn inherit(&mut self) {
        for i in 1..128 {
            if self.rho1[i] == -1.0 {
                self.rho1[i] = self.rho1[0];
            }
            if self.rho2[i] == -1.0 {
                self.rho2[i] = self.rho2[0];
            }
            if self.rho3[i] == -1.0 {
                self.rho3[i] = self.rho3[0];
            }
        }
    }

    /// One optimization step over every feature in the model. `ll` is the
    /// objective from the gradient pass; the regularization terms are added
    /// here and the full `fx` reported (the post-step value would cost a
    /// second gradient pass).
    pub fn step(&self, mdl: &Model, ll: f64) -> Sweep {
        let prg = Progress::start((mdl.features.len() / 49) as i64);
        let itr = mdl.itr.load(Ordering::Acquire);
        let mut fx = ll;
        let (mut nx, mut ng, mut nd) = (0.0f64, 0.0f64, 0.0f64);
        let mut retired: Vec<Retired<Feature>> = Vec::new();

        for (id, ftr) in mdl.features.iter() {
            let tag = Model::tag_of(id);
            let x = ftr.x.load();
            let frq = ftr.frq.load(Ordering::Relaxed);

            // Pruning: weights parked at zero past their removal window,
            // and features seen less often than the global minimum.
            if x == 0.0 && mdl.remove_of(tag) <= itr {
                if let Some(r) = mdl.features.remove(id) {
                    retired.push(r);
                }
                continue;
            }
            if frq < mdl.min_freq {
                if let Some(r) = mdl.features.remove(id) {
                    retired.push(r);
                }
                continue;
            }
            // Gated-off tags are left entirely untouched, frequency
            // included.
            if mdl.start_of(tag) > itr {
                continue;
            }

            if ftr.stp.load() == 0.0 {
                ftr.stp.store(0.1);
            }

            let rho1 = self.rho1[tag];
            let rho2 = self.rho2[tag];
            let rho3 = self.rho3[tag];
            let mut g = ftr.g.load() + rho2 * x;
            fx += rho2 * x * x / 2.0;
            fx += rho1 * x.abs();
            fx += rho3 * frq as f64 * x.abs();

            // Orthant projection of the L1 subgradient.
            let ar = rho1 + rho3 * frq as f64;
            let mut pg = g;
            if ar != 0.0 {
                if x < -EPSILON {
                    pg = g - ar;
                } else if x > EPSILON {
                    pg = g + ar;
                } else if g < -ar {
                    pg = g + ar;
                } else if g > ar {
                    pg = g - ar;
                } else {
                    pg = 0.0;
                }
            }

            // Step adaptation on the sign of consecutive gradients.
            let sgn = ftr.gp.load() * pg;
            if sgn < -EPSILON {
                ftr.stp.store((ftr.stp.load() * self.stp_dec).max(self.stp_min));
            } else if sgn > EPSILON {
                ftr.stp.store((ftr.stp.load() * self.stp_inc).min(self.stp_max));
            }

            // Weight update: on a sign flip take the previous update back
            // and clear the gradient so the next iteration starts from a
            // clean slate; otherwise one step against the projected
            // gradient, clamped to not cross zero under L1.
            if sgn < 0.0 {
                ftr.x.store(x - ftr.dlt.load());
                g = 0.0;
            } else {
                let stp = ftr.stp.load();
                let mut dlt = if pg < -EPSILON {
                    stp
                } else if pg > EPSILON {
                    -stp
                } else {
                    0.0
                };
                if rho1 != 0.0 && dlt * pg >= 0.0 {
                    dlt = 0.0;
                }
                ftr.dlt.store(dlt);
                ftr.x.store(x + dlt);
            }

            nx += ftr.x.load().abs();
            ng += g.abs();
            nd += ftr.dlt.load().abs();
            ftr.frq.store(0, Ordering::Relaxed);
            ftr.gp.store(g);
            ftr.g.store(0.0);
            prg.tick();
        }
        prg.finish();
        eprintln!(
            "\tll={:.2} fx={:.2} |x|={:.2} |g|={:.2} |d|={:.2}",
            -ll, fx, nx, ng, nd
        );
        Sweep {
            fx,
            norm_x: nx,
            norm_g: ng,
            norm_d: nd,
            retired,
        }
    }
}

impl Default for Rprop {
    fn default() -> Self {
        Rprop::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_str;
    use crate::strings::StringPool;

    fn model() -> Model {
        Model::new(StringPool::new(false))
    }

    fn feature<'m>(mdl: &'m Model, name: &str) -> &'m Feature {
        mdl.add_feature(0, &[hash_str(name)], false).unwrap()
    }

    #[test]
    fn first_step_moves_against_gradient() {
        let mdl = model();
        let f = feature(&mdl, "w");
        f.g.store(2.0);
        let rbp = Rprop::new();
        rbp.step(&mdl, 0.0);
        // Fresh step size 0.1, positive gradient: one step down.
        assert!((f.x.load() - -0.1).abs() < 1e-12);
        assert_eq!(f.g.load(), 0.0);
        assert_eq!(f.gp.load(), 2.0);
    }

    #[test]
    fn agreeing_signs_grow_step_until_cap() {
        let mdl = model();
        let f = feature(&mdl, "w");
        let rbp = Rprop::new();
        let mut prev = 0.1;
        for _ in 0..40 {
            f.g.store(1.0);
            rbp.step(&mdl, 0.0);
            let stp = f.stp.load();
            assert!(stp >= prev);
            assert!(stp <= rbp.stp_max);
            prev = stp;
        }
        assert!((prev - rbp.stp_max).abs() < 1e-9);
    }

    #[test]
    fn sign_flip_rolls_back_and_shrinks_step() {
        let mdl = model();
        let f = feature(&mdl, "w");
        let rbp = Rprop::new();
        f.g.store(1.0);
        rbp.step(&mdl, 0.0);
        let x_before_flip = f.x.load();
        let dlt = f.dlt.load();
        let stp = f.stp.load();
        f.g.store(-1.0);
        rbp.step(&mdl, 0.0);
        // The previous update was subtracted back out and the gradient
        // cleared for the next iteration.
        assert!((f.x.load() - (x_before_flip - dlt)).abs() < 1e-12);
        assert_eq!(f.gp.load(), 0.0);
        assert!((f.stp.load() - (stp * rbp.stp_dec)).abs() < 1e-12);
    }

    #[test]
    fn zero_weight_past_window_is_pruned() {
        let mut mdl = model();
        mdl.set_remove(0, 3).unwrap();
        mdl.itr.store(2, Ordering::Release);
        let _ = feature(&mdl, "w");
        let rbp = Rprop::new();
        // Inside the window: survives even at weight zero.
        let sweep = rbp.step(&mdl, 0.0);
        assert!(sweep.retired.is_empty());
        assert_eq!(mdl.features.len(), 1);
        // Past it: pruned.
        mdl.itr.store(3, Ordering::Release);
        let sweep = rbp.step(&mdl, 0.0);
        assert_eq!(sweep.retired.len(), 1);
        assert_eq!(mdl.features.len(), 0);
    }

    #[test]
    fn low_frequency_is_pruned() {
        let mut mdl = model();
        mdl.min_freq = 2;
        mdl.add_feature(0, &[hash_str("rare")], true).unwrap();
        let common = [hash_str("common")];
        mdl.add_feature(0, &common, true).unwrap();
        mdl.add_feature(0, &common, true).unwrap();
        let rbp = Rprop::new();
        let sweep = rbp.step(&mdl, 0.0);
        assert_eq!(sweep.retired.len(), 1);
        assert_eq!(mdl.features.len(), 1);
    }

    #[test]
    fn large_l1_pins_weights_at_exact_zero_until_pruned() {
        let mut mdl = model();
        mdl.set_remove(0, 5).unwrap();
        let f = feature(&mdl, "w");
        let mut rbp = Rprop::new();
        rbp.rho1[0] = 100.0;
        // The projected gradient is clipped to zero whenever |g| stays
        // under the L1 strength, so the weight never leaves 0.0.
        for i in 0..5 {
            mdl.itr.store(i, Ordering::Release);
            f.g.store(0.3);
            let sweep = rbp.step(&mdl, 0.0);
            assert_eq!(f.x.load(), 0.0);
            assert!(sweep.retired.is_empty());
        }
        // Once the removal window closes, the exactly-zero weight is
        // pruned.
        mdl.itr.store(5, Ordering::Release);
        f.g.store(0.3);
        let sweep = rbp.step(&mdl, 0.0);
        assert_eq!(sweep.retired.len(), 1);
        assert_eq!(mdl.features.len(), 0);
    }

    #[test]
    fn gated_tag_is_untouched() {
        let mut mdl = model();
        {
            let f = feature(&mdl, "w");
            f.g.store(5.0);
            f.frq.store(7, Ordering::Relaxed);
        }
        mdl.set_start(0, 10).unwrap();
        let f = feature(&mdl, "w");
        let rbp = Rprop::new();
        rbp.step(&mdl, 0.0);
        assert_eq!(f.x.load(), 0.0);
        assert_eq!(f.g.load(), 5.0);
        assert_eq!(f.frq.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn l2_term_enters_gradient_and_objective() {
        let mdl = model();
        let f = feature(&mdl, "w");
        f.x.store(2.0);
        let mut rbp = Rprop::new();
        rbp.rho2[0] = 0.5;
        let sweep = rbp.step(&mdl, 0.0);
        // fx picks up rho2 * x^2 / 2 = 1.0; the regularized gradient
        // rho2 * x = 1.0 is saved as gp.
        assert!((sweep.fx - 1.0).abs() < 1e-12);
        assert!((f.gp.load() - 1.0).abs() < 1e-12);
    }
}
