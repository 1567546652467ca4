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

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` that supports concurrent accumulation.
///
/// Gradient workers from every thread add their expectation terms into the
/// same per-feature slot, so the addition has to be atomic. The value is
/// stored as its bit pattern in an `AtomicU64` and `add` runs a
/// compare-and-swap loop: read the old bits, compute `old + delta`, publish
/// the new bits, retry on contention.
///
/// Rounding is ordinary f64 addition. The accumulation order across threads
/// is unspecified, so multi-threaded totals are only reproducible up to
/// floating-point rounding.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub const fn new(v: f64) -> Self {
        AtomicF64(AtomicU64::new(v.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    /// Atomically add `delta` to the value, returning the previous value.
    pub fn add(&self, delta: f64) -> f64 {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let new = (f64::from_bits(old) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return f64::from_bits(old),
                Err(cur) => old = cur,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        AtomicF64::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_returns_previous() {
        let v = AtomicF64::new(1.5);
        assert_eq!(v.add(2.0), 1.5);
        assert_eq!(v.load(), 3.5);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let v = Arc::new(AtomicF64::new(0.0));
        let mut handles = vec![];
        for _ in 0..8 {
            let v = Arc::clone(&v);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    v.add(1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every increment is exactly representable, so no rounding slack is
        // needed here.
        assert_eq!(v.load(), 80_000.0);
    }
}
