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

//! Lock-free sorted singly-linked list (Michael, SPAA 2002).
//!
//! This is the storage layer under the split-ordered hash table. Nodes are
//! kept sorted by a 64-bit key and can be searched, inserted and removed
//! concurrently without locks. Logical deletion is a tag in the lowest bit
//! of a node's `next` word; any traversal that observes a tagged node tries
//! to physically unlink it on the way by.
//!
//! # Memory Model
//! - `next` holds `ptr | mark` in an `AtomicUsize`. Nodes are heap
//!   allocations with alignment >= 8, so the low bit is always free.
//! - All atomic operations use `SeqCst`. The traversal correctness argument
//!   (key read, then next read, then predecessor revalidation) assumes none
//!   of those three accesses are reordered against each other.
//! - Nothing here frees a node. A removed node is only unlinked; the caller
//!   must keep it alive until every traversal that could have started before
//!   the removal has finished.
//!
//! Every list starts with a sentinel head node whose key is never examined,
//! which removes the empty-list corner cases from all three operations. The
//! hash table provides those sentinels (its bucket anchors).

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

const MARK: usize = 1;

#[inline(always)]
fn is_tagged(word: usize) -> bool {
    word & MARK != 0
}

#[inline(always)]
fn untag<T>(word: usize) -> *mut Node<T> {
    (word & !MARK) as *mut Node<T>
}

/// A list node carrying a sort key and a payload.
///
/// Bucket anchors participate in the same list as user nodes but carry no
/// payload, so the payload slot is `MaybeUninit` and its liveness is tracked
/// by the key convention of the hash table (user keys have the low bit set).
#[repr(align(8))]
pub struct Node<T> {
    pub next: AtomicUsize,
    pub key: u64,
    pub val: MaybeUninit<T>,
}

impl<T> Node<T> {
    pub fn alloc_user(key: u64, val: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicUsize::new(0),
            key,
            val: MaybeUninit::new(val),
        }))
    }

    pub fn alloc_dummy(key: u64) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicUsize::new(0),
            key,
            val: MaybeUninit::uninit(),
        }))
    }

    /// Free a node, dropping the payload when `is_user` says one is live.
    ///
    /// # Safety
    /// `node` must come from `alloc_user`/`alloc_dummy`, must be reachable by
    /// no thread, and must not be freed twice.
    pub unsafe fn free(node: *mut Node<T>, is_user: bool) {
        let mut boxed = Box::from_raw(node);
        if is_user {
            boxed.val.assume_init_drop();
        }
        drop(boxed);
    }
}

pub struct SearchHit<T> {
    pub pred: *mut Node<T>,
    pub cur: *mut Node<T>,
    pub succ: *mut Node<T>,
    pub found: bool,
}

/// Walk the list from `head` looking for `key`.
///
/// Post-condition: at some instant during the call, `pred -> cur -> succ`
/// formed a chain of consecutive nodes with `pred` and `cur` unmarked, and
/// `cur.key` is the searched key (`found`) or the lowest key above it; `cur`
/// is null when the key is larger than everything in the list.
///
/// Tagged nodes met along the way are unlinked with a CAS on the
/// predecessor; when that CAS loses, the chain under our feet changed and
/// the whole traversal restarts.
///
/// # Safety
/// `head` must be a live sentinel node of a list whose removed nodes are
/// still allocated (see module docs).
pub unsafe fn search<T>(head: *mut Node<T>, key: u64) -> SearchHit<T> {
    'restart: loop {
        let mut pred = head;
        let mut cur: *mut Node<T> = untag((*head).next.load(Ordering::SeqCst));
        loop {
            if cur.is_null() {
                return SearchHit { pred, cur, succ: ptr::null_mut(), found: false };
            }
            // Read the key before the next pointer, then revalidate that
            // pred still links to cur: if it does, the (key, succ) pair we
            // read belonged to a node that was part of the chain at that
            // point.
            let ckey = (*cur).key;
            let succ_word = (*cur).next.load(Ordering::SeqCst);
            if (*pred).next.load(Ordering::SeqCst) != cur as usize {
                continue 'restart;
            }
            if !is_tagged(succ_word) {
                if ckey >= key {
                    return SearchHit {
                        pred,
                        cur,
                        succ: untag(succ_word),
                        found: ckey == key,
                    };
                }
                pred = cur;
                cur = untag(succ_word);
                continue;
            }
            // cur is logically deleted: help unlink it, restarting when the
            // predecessor moved on without us.
            let succ = untag::<T>(succ_word);
            if (*pred)
                .next
                .compare_exchange(cur as usize, succ as usize, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue 'restart;
            }
            cur = succ;
        }
    }
}

/// Find the node with `key`, if present.
///
/// # Safety
/// Same contract as [`search`].
pub unsafe fn find<T>(head: *mut Node<T>, key: u64) -> Option<*mut Node<T>> {
    let hit = search(head, key);
    if hit.found {
        Some(hit.cur)
    } else {
        None
    }
}

/// Insert `node` at its sorted position.
///
/// Returns `Ok(())` when the node went in, or `Err(existing)` when the key
/// was already present; in the latter case the caller still owns `node`.
///
/// # Safety
/// `head` per [`search`]; `node` must be unaliased and not yet in any list.
pub unsafe fn insert<T>(head: *mut Node<T>, node: *mut Node<T>) -> Result<(), *mut Node<T>> {
    let key = (*node).key;
    loop {
        let hit = search(head, key);
        if hit.found {
            return Err(hit.cur);
        }
        (*node).next.store(hit.cur as usize, Ordering::SeqCst);
        if (*hit.pred)
            .next
            .compare_exchange(hit.cur as usize, node as usize, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Remove the node with `key` and return it dethreaded.
///
/// The node is first tagged (logical delete), then unlinked from its
/// predecessor; if the unlink CAS loses, one extra search completes the
/// unlinking as a side effect. The returned node must be kept allocated
/// until concurrent traversals have quiesced.
///
/// # Safety
/// Same contract as [`search`].
pub unsafe fn remove<T>(head: *mut Node<T>, key: u64) -> Option<*mut Node<T>> {
    loop {
        let hit = search(head, key);
        if !hit.found {
            return None;
        }
        let marked = hit.succ as usize | MARK;
        if (*hit.cur)
            .next
            .compare_exchange(hit.succ as usize, marked, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }
        if (*hit.pred)
            .next
            .compare_exchange(hit.cur as usize, hit.succ as usize, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            search(head, key);
        }
        return Some(hit.cur);
    }
}

/// Step to the next node in list order, skipping nothing. Used by iteration;
/// tagged successors are followed through their untagged pointer so a
/// concurrent removal does not break the walk.
///
/// # Safety
/// Same contract as [`search`].
pub unsafe fn next<T>(node: *mut Node<T>) -> *mut Node<T> {
    untag((*node).next.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> *mut Node<u32> {
        Node::alloc_dummy(0)
    }

    unsafe fn drain(head: *mut Node<u32>) -> Vec<u64> {
        let mut keys = Vec::new();
        let mut cur = next(head);
        while !cur.is_null() {
            keys.push((*cur).key);
            let nxt = next(cur);
            Node::free(cur, true);
            cur = nxt;
        }
        Node::free(head, false);
        keys
    }

    #[test]
    fn insert_keeps_order() {
        unsafe {
            let h = head();
            for key in [9u64, 3, 7, 1, 5] {
                insert(h, Node::alloc_user(key, key as u32)).unwrap();
            }
            assert_eq!(drain(h), vec![1, 3, 5, 7, 9]);
        }
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        unsafe {
            let h = head();
            let first = Node::alloc_user(5, 50u32);
            insert(h, first).unwrap();
            let second = Node::alloc_user(5, 51u32);
            match insert(h, second) {
                Err(existing) => {
                    assert_eq!(existing, first);
                    Node::free(second, true);
                }
                Ok(()) => panic!("duplicate key must not insert"),
            }
            assert_eq!(drain(h), vec![5]);
        }
    }

    #[test]
    fn remove_unlinks() {
        unsafe {
            let h = head();
            for key in [2u64, 4, 6] {
                insert(h, Node::alloc_user(key, 0u32)).unwrap();
            }
            let removed = remove(h, 4).expect("key present");
            assert_eq!((*removed).key, 4);
            assert!(find(h, 4).is_none());
            assert!(find(h, 2).is_some());
            assert!(find(h, 6).is_some());
            Node::free(removed, true);
            assert_eq!(drain(h), vec![2, 6]);
        }
    }

    #[test]
    fn remove_missing_is_none() {
        unsafe {
            let h = head();
            insert(h, Node::alloc_user(1, 0u32)).unwrap();
            assert!(remove(h, 2).is_none());
            assert_eq!(drain(h), vec![1]);
        }
    }
}
