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

//! Lock-free hash table over split-ordered lists (Shalev & Shavit, JACM
//! 2006).
//!
//! All nodes, user entries and bucket anchors alike, live in one sorted
//! lock-free list ordered by the *bit-reversed* key: a user hash `h` is
//! stored under `reverse(h) | 1`, the anchor of bucket `b` under
//! `reverse(b) & ~1`. In that order every anchor sorts immediately before
//! the user keys that mask into its bucket, so a lookup costs one anchor
//! dereference plus the length of the chain inside the bucket.
//!
//! Growing the table never rehashes: doubling `size` just makes lookups
//! consult one more key bit, and the anchor for each newly addressable
//! bucket is spliced in lazily right after its parent (the bucket index
//! with the highest set bit cleared).
//!
//! Keys are assumed to be 63-bit hashes with uniformly distributed low
//! bits; the top bit of the 64-bit value is reserved and never preserved.
//!
//! # Shared Memory Layout
//! - `head`: sentinel of the full list, embedded in the map.
//! - `table`: 0x10000 lazily allocated segments of 0x10000 anchor slots,
//!   published by CAS so racing initializers agree on one segment.
//! - `size`/`count`: the bucket mask and the entry count; the map doubles
//!   `size` by CAS when `count / size` exceeds the growth threshold.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::environment::MAP_GROW;
use crate::hashing::{bit_reverse, clear_msb};
use crate::sync::list::{self, Node};

const SEG_BITS: u64 = 16;
const SEG_SIZE: usize = 1 << SEG_BITS;

#[inline(always)]
fn key_user(hash: u64) -> u64 {
    bit_reverse(hash) | 1
}

#[inline(always)]
fn key_anchor(bucket: u64) -> u64 {
    bit_reverse(bucket) & !1
}

#[inline(always)]
fn key_to_hash(key: u64) -> u64 {
    bit_reverse(key & !1)
}

#[inline(always)]
fn is_anchor(key: u64) -> bool {
    key & 1 == 0
}

struct Segment<T> {
    slots: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> Segment<T> {
    fn alloc() -> *mut Segment<T> {
        let slots = (0..SEG_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Segment { slots }))
    }
}

/// Concurrent hash map from 63-bit hashes to values.
///
/// `find` and `insert` may be called freely from any number of threads.
/// `remove` is linearizable too, but the returned [`Retired`] guard keeps
/// the node allocated: readers that started before the removal may still
/// hold a reference into it, so the guard must be held until those readers
/// have quiesced (in this engine: until the gradient workers of the
/// iteration are joined, which is already true when the optimizer sweep
/// runs).
pub struct Map<T> {
    head: Node<T>,
    table: Box<[AtomicPtr<Segment<T>>]>,
    size: AtomicU64,
    count: AtomicU64,
    grow: u64,
}

impl<T> Map<T> {
    #[inline(always)]
    fn head_ptr(&self) -> *mut Node<T> {
        &self.head as *const Node<T> as *mut Node<T>
    }
}

impl<T: Send + Sync> Map<T> {
    pub fn new() -> Self {
        let table = (0..SEG_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let map = Map {
            head: Node {
                next: Default::default(),
                key: 0,
                val: std::mem::MaybeUninit::uninit(),
            },
            table,
            size: AtomicU64::new(0x10),
            count: AtomicU64::new(0),
            grow: *MAP_GROW,
        };
        // Root segment and root anchor are set up eagerly so every later
        // parent-chain walk terminates at an initialized bucket 0.
        let seg = Segment::alloc();
        map.table[0].store(seg, Ordering::Release);
        let anchor = Node::alloc_dummy(key_anchor(0));
        unsafe {
            list::insert(map.head_ptr(), anchor).ok();
            (*seg).slots[0].store(anchor, Ordering::Release);
        }
        map
    }

    /// Anchor node for `bucket`, initializing the segment and the anchor on
    /// first demand. A fresh anchor is inserted into the list right after
    /// its parent bucket's anchor, then published in the slot; racing
    /// initializers converge on whichever anchor won the list insert.
    fn bucket_head(&self, bucket: u64) -> *mut Node<T> {
        let seg_idx = (bucket >> SEG_BITS) as usize;
        let slot_idx = (bucket & (SEG_SIZE as u64 - 1)) as usize;
        let mut seg = self.table[seg_idx].load(Ordering::Acquire);
        if seg.is_null() {
            let fresh = Segment::alloc();
            match self.table[seg_idx].compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => seg = fresh,
                Err(winner) => {
                    unsafe { drop(Box::from_raw(fresh)) };
                    seg = winner;
                }
            }
        }
        let slot = unsafe { &(*seg).slots[slot_idx] };
        let mut anchor = slot.load(Ordering::Acquire);
        if anchor.is_null() {
            let parent = self.bucket_head(clear_msb(bucket));
            let fresh = Node::alloc_dummy(key_anchor(bucket));
            anchor = unsafe {
                match list::insert(parent, fresh) {
                    Ok(()) => fresh,
                    Err(existing) => {
                        Node::free(fresh, false);
                        existing
                    }
                }
            };
            slot.store(anchor, Ordering::Release);
        }
        anchor
    }

    /// Look up `hash`, returning a reference to its value.
    pub fn find(&self, hash: u64) -> Option<&T> {
        let bucket = hash & (self.size.load(Ordering::Acquire) - 1);
        let head = self.bucket_head(bucket);
        unsafe { list::find(head, key_user(hash)).map(|node| &*(*node).val.as_ptr()) }
    }

    /// Insert `val` under `hash` unless the key is already present. Returns
    /// the value now associated with the key and whether this call inserted
    /// it; on a lost race `val` is dropped and the winner is returned.
    pub fn insert(&self, hash: u64, val: T) -> (&T, bool) {
        let bucket = hash & (self.size.load(Ordering::Acquire) - 1);
        let head = self.bucket_head(bucket);
        let node = Node::alloc_user(key_user(hash), val);
        unsafe {
            match list::insert(head, node) {
                Ok(()) => {
                    let size = self.size.load(Ordering::Acquire);
                    let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
                    if count / size > self.grow {
                        let _ = self.size.compare_exchange(
                            size,
                            size * 2,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    (&*(*node).val.as_ptr(), true)
                }
                Err(existing) => {
                    Node::free(node, true);
                    (&*(*existing).val.as_ptr(), false)
                }
            }
        }
    }

    /// Remove `hash` from the map. The entry is unlinked immediately but
    /// its memory is owned by the returned guard; see [`Retired`].
    pub fn remove(&self, hash: u64) -> Option<Retired<T>> {
        let bucket = hash & (self.size.load(Ordering::Acquire) - 1);
        let head = self.bucket_head(bucket);
        unsafe {
            list::remove(head, key_user(hash)).map(|node| {
                self.count.fetch_sub(1, Ordering::AcqRel);
                Retired { node }
            })
        }
    }

    /// Number of user entries currently stored.
    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over `(hash, value)` pairs in split order, skipping bucket
    /// anchors. The cursor is advanced past an entry before the entry is
    /// yielded, so the caller may remove the yielded entry while iterating
    /// (the optimizer sweep does exactly that); removing entries ahead of
    /// the cursor during iteration is not supported.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: unsafe { list::next(self.head_ptr()) },
            _map: self,
        }
    }
}

impl<T: Send + Sync> Default for Map<T> {
    fn default() -> Self {
        Map::new()
    }
}

impl<T> Drop for Map<T> {
    fn drop(&mut self) {
        unsafe {
            let mut cur = list::next(self.head_ptr());
            while !cur.is_null() {
                let nxt = list::next(cur);
                Node::free(cur, !is_anchor((*cur).key));
                cur = nxt;
            }
            for slot in self.table.iter() {
                let seg = slot.load(Ordering::Acquire);
                if !seg.is_null() {
                    drop(Box::from_raw(seg));
                }
            }
        }
    }
}

pub struct Iter<'a, T> {
    cur: *mut Node<T>,
    _map: &'a Map<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            while !self.cur.is_null() {
                let node = self.cur;
                self.cur = list::next(node);
                if is_anchor((*node).key) {
                    continue;
                }
                return Some((key_to_hash((*node).key), &*(*node).val.as_ptr()));
            }
            None
        }
    }
}

/// Owner of a removed map entry.
///
/// Dropping the guard frees the node. The caller must not drop it while any
/// thread could still hold a reference obtained from `find`/`insert` before
/// the removal; the training loop satisfies this by collecting guards during
/// the single-threaded optimizer sweep and dropping them before the next
/// gradient pass spawns workers.
pub struct Retired<T> {
    node: *mut Node<T>,
}

impl<T> Retired<T> {
    pub fn hash(&self) -> u64 {
        unsafe { key_to_hash((*self.node).key) }
    }

    pub fn value(&self) -> &T {
        unsafe { &*(*self.node).val.as_ptr() }
    }
}

impl<T> Drop for Retired<T> {
    fn drop(&mut self) {
        unsafe { Node::free(self.node, true) };
    }
}

unsafe impl<T: Send> Send for Retired<T> {}
