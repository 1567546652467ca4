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

//! Unbounded progress bars for long-running passes.
//!
//! The number of steps a pass will take is generally unknown up front
//! (dataset sizes, live feature counts), so the bars are unscaled: one tick
//! mark per `step` items, a `|` separator every 10 marks, and a timed line
//! break every 50. Gradient workers tick concurrently through an atomic
//! counter; the item that lands exactly on a boundary does the printing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::environment::QUIET;

pub struct Progress {
    step: i64,
    count: AtomicI64,
    start: Instant,
    last: Mutex<Instant>,
}

fn mins_secs(secs: u64) -> (u64, u64) {
    (secs / 60, secs % 60)
}

impl Progress {
    /// Begin a progress sequence reporting every `step` items. A step of
    /// zero is clamped to one (small datasets would otherwise never tick).
    pub fn start(step: i64) -> Progress {
        if !*QUIET {
            eprint!("        [");
        }
        let now = Instant::now();
        Progress {
            step: step.max(1),
            count: AtomicI64::new(0),
            start: now,
            last: Mutex::new(now),
        }
    }

    /// Record one processed item, printing a mark when a boundary is
    /// crossed. Safe to call from any worker thread; output interleaving is
    /// prevented by only the boundary-crossing caller printing.
    pub fn tick(&self) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.step != 0 || *QUIET {
            return;
        }
        if n % (50 * self.step) == 0 {
            let mut last = self.last.lock().unwrap();
            let (m, s) = mins_secs(last.elapsed().as_secs());
            eprint!("-]  tm={}m{:02}s\n        [", m, s);
            *last = Instant::now();
        } else if n % (10 * self.step) == 0 {
            eprint!("|");
        } else {
            eprint!("-");
        }
    }

    /// Close the bar and print the total elapsed time.
    pub fn finish(&self) {
        if *QUIET {
            return;
        }
        let (m, s) = mins_secs(self.start.elapsed().as_secs());
        eprintln!("]  total={}m{:02}s", m, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_ticks_count_every_item() {
        let prg = Arc::new(Progress::start(1000));
        let mut handles = vec![];
        for _ in 0..4 {
            let prg = Arc::clone(&prg);
            handles.push(thread::spawn(move || {
                for _ in 0..2500 {
                    prg.tick();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        prg.finish();
        assert_eq!(prg.count.load(Ordering::Relaxed), 10_000);
    }
}
