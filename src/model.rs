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

//! Model store: the feature table, label vocabularies and per-tag
//! hyperparameter windows.
//!
//! A feature is identified by a 64-bit value whose top 8 bits are its group
//! *tag* (0..128) and whose low 56 bits hash the materialized words of the
//! pattern that produced it. The tag selects regularization strength and an
//! activation window in training iterations; outside its window a feature
//! cannot enter the table.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use smallvec::SmallVec;

use crate::hashing::{hash_str, hash_words};
use crate::strings::StringPool;
use crate::sync::{AtomicF64, Map, Retired};

/// Number of reserved dense-feature slots (slot 0 is never reserved, so the
/// live slots are `1..MAX_REAL`). Shipped at 0, which disables the dense
/// path entirely; the code below is written for the general case and
/// compiles down to nothing at 0.
pub const MAX_REAL: usize = 0;

const ID_MASK: u64 = (1u64 << 56) - 1;

/// One sparse feature.
///
/// `g` and `frq` are written concurrently by gradient workers (atomic add /
/// atomic increment); `x` is read concurrently but written only by the
/// single-threaded optimizer sweep, which also owns `gp`, `stp` and `dlt`
/// exclusively. Everything is an atomic so both phases are race-free
/// without locks.
#[derive(Default, Debug)]
pub struct Feature {
    /// Current weight.
    pub x: AtomicF64,
    /// Gradient accumulated over the current iteration.
    pub g: AtomicF64,
    /// Gradient of the previous iteration.
    pub gp: AtomicF64,
    /// Per-coordinate step size; zero means "not initialized yet".
    pub stp: AtomicF64,
    /// Last applied weight delta, undone on gradient sign reversal.
    pub dlt: AtomicF64,
    /// Occurrence count for the current iteration.
    pub frq: AtomicU64,
}

/// A borrowed feature pointer that can sit in per-FST scratch shared across
/// worker threads.
///
/// # Safety
/// The pointee lives in the model's feature table. A `FeatRef` may be
/// dereferenced only while the table still holds (or retires-but-has-not-
/// freed) the entry; the training loop guarantees this by clearing every
/// FST's feature lists before dropping the retired entries of a pruning
/// sweep.
#[derive(Clone, Copy, Debug)]
pub struct FeatRef(*const Feature);

impl FeatRef {
    pub fn new(f: &Feature) -> Self {
        FeatRef(f as *const Feature)
    }

    #[inline(always)]
    pub fn get(&self) -> &Feature {
        unsafe { &*self.0 }
    }
}

unsafe impl Send for FeatRef {}
unsafe impl Sync for FeatRef {}

/// An input or output arc symbol. The full textual form is hashed once
/// (`raw`); the `|`-separated tokens inside it are hashed individually so
/// patterns can address them.
pub struct Label {
    pub raw: u64,
    pub toks: SmallVec<[u64; 4]>,
}

/// Borrowed label pointer, same contract as [`FeatRef`] except labels are
/// never removed, so it stays valid for the model's lifetime.
#[derive(Clone, Copy, Debug)]
pub struct LabelRef(*const Label);

impl LabelRef {
    pub fn new(l: &Label) -> Self {
        LabelRef(l as *const Label)
    }

    #[inline(always)]
    pub fn get(&self) -> &Label {
        unsafe { &*self.0 }
    }
}

unsafe impl Send for LabelRef {}
unsafe impl Sync for LabelRef {}

pub struct Model {
    pub features: Map<Feature>,
    pub pool: StringPool,
    /// Source-side label vocabulary, keyed by the hash of the raw label.
    pub src: Map<Label>,
    /// Target-side label vocabulary.
    pub trg: Map<Label>,
    /// Reserved records for dense feature slots `1..MAX_REAL`, stored under
    /// tag `128 - i` so they occupy the top of the tag space.
    pub real: Vec<FeatRef>,
    /// Current training iteration, read by workers for window gating.
    pub itr: AtomicI64,
    /// Minimum occurrence count below which a feature is pruned.
    pub min_freq: u64,
    start: [i64; 128],
    remove: [i64; 128],
    dump: Option<Mutex<BufWriter<File>>>,
}

impl Model {
    pub fn new(pool: StringPool) -> Model {
        let mut model = Model {
            features: Map::new(),
            pool,
            src: Map::new(),
            trg: Map::new(),
            real: Vec::new(),
            itr: AtomicI64::new(0),
            min_freq: 0,
            start: [0; 128],
            remove: [i64::MAX; 128],
            dump: None,
        };
        for i in 1..MAX_REAL as u64 {
            let id = (i & ID_MASK) | ((128 - i) << 56);
            let (f, _) = model.features.insert(id, Feature::default());
            let f = FeatRef::new(f);
            model.real.push(f);
        }
        model
    }

    /// Tag of a feature id (its top byte).
    #[inline(always)]
    pub fn tag_of(id: u64) -> usize {
        (id >> 56) as usize
    }

    /// Reserved record of dense slot `i`, valid for `i` in `1..MAX_REAL`.
    #[inline(always)]
    pub fn real_slot(&self, i: usize) -> &Feature {
        self.real[i - 1].get()
    }

    pub fn set_start(&mut self, tag: usize, iter: i64) -> Result<()> {
        if tag >= 128 {
            bail!("tag {} out of range (0..128)", tag);
        }
        self.start[tag] = iter;
        Ok(())
    }

    pub fn set_remove(&mut self, tag: usize, iter: i64) -> Result<()> {
        if tag >= 128 {
            bail!("tag {} out of range (0..128)", tag);
        }
        self.remove[tag] = iter;
        Ok(())
    }

    #[inline(always)]
    pub fn start_of(&self, tag: usize) -> i64 {
        self.start[tag]
    }

    #[inline(always)]
    pub fn remove_of(&self, tag: usize) -> i64 {
        self.remove[tag]
    }

    /// Route every newly inserted feature id (with its materialized words)
    /// to a dump file. Callers must keep execution single-threaded while a
    /// dump file is configured.
    pub fn set_dump(&mut self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        self.dump = Some(Mutex::new(BufWriter::new(file)));
        Ok(())
    }

    /// Intern a feature built from `words` under `tag`.
    ///
    /// Existing features are returned regardless of the tag window; a
    /// feature seen for the first time is only admitted while the current
    /// iteration lies in `[start, remove)` for its tag, otherwise `None`.
    /// When two workers race on the same fresh id, the loser's record is
    /// dropped and both get the winner.
    pub fn add_feature(&self, tag: usize, words: &[u64], count_freq: bool) -> Option<&Feature> {
        debug_assert!(tag < 128 && !words.is_empty());
        let id = (hash_words(words) & ID_MASK) | ((tag as u64) << 56);
        if let Some(f) = self.features.find(id) {
            if count_freq {
                f.frq.fetch_add(1, Ordering::Relaxed);
            }
            return Some(f);
        }
        let itr = self.itr.load(Ordering::Acquire);
        if itr < self.start[tag] || itr >= self.remove[tag] {
            return None;
        }
        let (f, fresh) = self.features.insert(id, Feature::default());
        if fresh {
            if let Some(dump) = &self.dump {
                let mut out = dump.lock().unwrap();
                let _ = write!(out, "{:016x}", id);
                for w in words {
                    let _ = write!(out, " {:016x}", w);
                }
                let _ = writeln!(out);
            }
        }
        if count_freq {
            f.frq.fetch_add(1, Ordering::Relaxed);
        }
        Some(f)
    }

    fn new_label(&self, s: &str, mandatory: bool) -> Label {
        let raw = self.pool.intern(s, mandatory);
        let toks = s
            .split('|')
            .map(|tok| self.pool.intern_bytes(tok.as_bytes(), mandatory))
            .collect();
        Label { raw, toks }
    }

    fn map_label<'a>(&'a self, voc: &'a Map<Label>, s: &str, mandatory: bool) -> &'a Label {
        let hash = hash_str(s);
        if let Some(lbl) = voc.find(hash) {
            return lbl;
        }
        // Build outside the map, then race to insert; the loser's label is
        // dropped and the winner returned, exactly like features.
        let fresh = self.new_label(s, mandatory);
        voc.insert(hash, fresh).0
    }

    /// Intern a source-side label. Source strings are optional in the pool.
    pub fn map_src(&self, s: &str) -> &Label {
        self.map_label(&self.src, s, false)
    }

    /// Intern a target-side label. Target strings are mandatory: decoding
    /// prints them.
    pub fn map_trg(&self, s: &str) -> &Label {
        self.map_label(&self.trg, s, true)
    }

    /// Merge a model file into the table: known ids get their weight
    /// overwritten, unknown ids are inserted as fresh records carrying only
    /// the stored weight.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        for (ln, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("cannot read {}", path.display()))?;
            let mut toks = line.split_whitespace();
            let (id, wgh) = match (toks.next(), toks.next()) {
                (None, _) => continue,
                (Some(id), Some(wgh)) => (id, wgh),
                _ => bail!("{}:{}: truncated feature line", path.display(), ln + 1),
            };
            let id = u64::from_str_radix(id, 16)
                .with_context(|| format!("{}:{}: bad feature id", path.display(), ln + 1))?;
            let wgh: f64 = wgh
                .parse()
                .with_context(|| format!("{}:{}: bad feature weight", path.display(), ln + 1))?;
            let ftr = match self.features.find(id) {
                Some(f) => f,
                None => self.features.insert(id, Feature::default()).0,
            };
            ftr.x.store(wgh);
        }
        Ok(())
    }

    /// Save every feature currently in the table, one
    /// `<16-hex-id> <weight>` line each.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for (id, ftr) in self.features.iter() {
            writeln!(out, "{:016x} {:.14}", id, ftr.x.load())
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        Ok(())
    }

    /// Drop all zero-weight features. Single-threaded use only; the retired
    /// records are freed on return, which is safe because nothing else can
    /// hold references at a compaction point.
    pub fn shrink(&self) {
        let mut retired: Vec<Retired<Feature>> = Vec::new();
        for (id, ftr) in self.features.iter() {
            if ftr.x.load() == 0.0 {
                if let Some(r) = self.features.remove(id) {
                    retired.push(r);
                }
            }
        }
        drop(retired);
    }

    /// Print active/total feature counts to stderr, with a per-tag
    /// breakdown in verbose mode.
    pub fn stats(&self, verbose: bool) {
        let mut tot = [0i64; 128];
        let mut act = [0i64; 128];
        let (mut t, mut a) = (0i64, 0i64);
        for (id, ftr) in self.features.iter() {
            let tag = Model::tag_of(id);
            if ftr.x.load() != 0.0 {
                act[tag] += 1;
                a += 1;
            }
            tot[tag] += 1;
            t += 1;
        }
        if verbose {
            for i in 0..128 {
                if tot[i] != 0 {
                    eprintln!("\ttag-{}={}/{}", i, act[i], tot[i]);
                }
            }
        }
        eprintln!("\tftr={}/{}", a, t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_str;
    use std::sync::Arc;
    use std::thread;

    fn model() -> Model {
        Model::new(StringPool::new(false))
    }

    #[test]
    fn feature_id_carries_tag() {
        let mdl = model();
        let words = [hash_str("tok")];
        mdl.add_feature(3, &words, false).unwrap();
        let found = mdl
            .features
            .iter()
            .map(|(id, _)| id)
            .find(|&id| Model::tag_of(id) == 3);
        assert!(found.is_some());
        assert_eq!(found.unwrap() >> 56, 3);
    }

    #[test]
    fn window_gates_fresh_features_only() {
        let mut mdl = model();
        mdl.set_start(1, 5).unwrap();
        let words = [hash_str("late")];
        // Iteration 0 is before the window: no insert.
        assert!(mdl.add_feature(1, &words, false).is_none());
        mdl.itr.store(5, Ordering::Release);
        assert!(mdl.add_feature(1, &words, false).is_some());
        // Back before the window, the existing feature is still returned.
        mdl.itr.store(0, Ordering::Release);
        assert!(mdl.add_feature(1, &words, false).is_some());
    }

    #[test]
    fn removed_window_blocks_insert() {
        let mut mdl = model();
        mdl.set_remove(0, 2).unwrap();
        mdl.itr.store(2, Ordering::Release);
        assert!(mdl.add_feature(0, &[hash_str("gone")], false).is_none());
    }

    #[test]
    fn frequency_counts_when_asked() {
        let mdl = model();
        let words = [hash_str("freq")];
        let f = mdl.add_feature(0, &words, true).unwrap();
        assert_eq!(f.frq.load(Ordering::Relaxed), 1);
        mdl.add_feature(0, &words, true).unwrap();
        mdl.add_feature(0, &words, false).unwrap();
        assert_eq!(f.frq.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_add_feature_same_id() {
        let mdl = Arc::new(model());
        let words = [hash_str("contested")];
        let mut handles = vec![];
        for _ in 0..8 {
            let mdl = Arc::clone(&mdl);
            handles.push(thread::spawn(move || {
                mdl.add_feature(0, &[hash_str("contested")], true).unwrap() as *const Feature
                    as usize
            }));
        }
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(mdl.features.len(), 1);
        let f = mdl.add_feature(0, &words, false).unwrap();
        assert_eq!(f.frq.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn labels_split_tokens() {
        let mdl = model();
        let lbl = mdl.map_trg("the|DT|det");
        assert_eq!(lbl.raw, hash_str("the|DT|det"));
        assert_eq!(lbl.toks.len(), 3);
        assert_eq!(lbl.toks[0], hash_str("the"));
        assert_eq!(lbl.toks[1], hash_str("DT"));
        assert_eq!(lbl.toks[2], hash_str("det"));
        // Interning twice returns the same record.
        let again = mdl.map_trg("the|DT|det");
        assert!(std::ptr::eq(lbl, again));
    }

    #[test]
    fn save_load_roundtrip_merges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");

        let mdl = model();
        let f = mdl.add_feature(0, &[hash_str("w")], false).unwrap();
        f.x.store(1.25);
        mdl.save(&path).unwrap();

        let other = model();
        let g = other.add_feature(0, &[hash_str("v")], false).unwrap();
        g.x.store(-3.0);
        other.load(&path).unwrap();
        // The loaded feature merged in, the unrelated one is untouched.
        assert_eq!(other.features.len(), 2);
        assert_eq!(g.x.load(), -3.0);
        let loaded = other.add_feature(0, &[hash_str("w")], false).unwrap();
        assert!((loaded.x.load() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn shrink_drops_zero_weights() {
        let mdl = model();
        let f = mdl.add_feature(0, &[hash_str("keep")], false).unwrap();
        f.x.store(0.5);
        mdl.add_feature(0, &[hash_str("drop")], false).unwrap();
        assert_eq!(mdl.features.len(), 2);
        mdl.shrink();
        assert_eq!(mdl.features.len(), 1);
    }
}
