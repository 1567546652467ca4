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

use std::cell::UnsafeCell;

// Zero-copy cross-thread access to the per-FST working data.
//
// The dataset is shared read-mostly across gradient workers, but each FST's
// caches (state lists, sort orders, feature arenas, gradient scratch) are
// mutated by the one worker that claimed its index from the shared dispatch
// counter. The counter hands out every index exactly once per pass, so at
// any moment at most one thread holds a mutable view of a given cell, and
// the main thread only touches the cells between passes.
//
// This sidesteps the borrow checker on purpose; the claim protocol is the
// synchronization.
#[derive(Debug)]
pub struct ThreadSafeCell<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for ThreadSafeCell<T> {}

impl<T> ThreadSafeCell<T> {
    pub fn new(value: T) -> Self {
        ThreadSafeCell {
            value: UnsafeCell::new(value),
        }
    }

    /// Get mutable access to the inner value.
    ///
    /// Caller must hold the exclusivity token for this cell (the claimed
    /// dispatch index, or being the only running thread).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut T {
        &mut *self.value.get()
    }

    /// Get read-only access to the inner value.
    ///
    /// Caller must ensure no thread is writing, which holds whenever no
    /// gradient pass is running.
    pub unsafe fn get_ref(&self) -> &T {
        &*self.value.get()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
