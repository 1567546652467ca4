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

//! Feature generation from arc-pair patterns.
//!
//! A pattern is a template over a pair of adjacent arcs:
//!
//! ```text
//! [tag:][name:]item[,item]*
//! item := P S T [ = P S T ]
//! P := 0|1        which arc of the pair
//! S := s|t        source (input) or target (output) label
//! T := integer    token index inside the label
//! ```
//!
//! Materializing an item yields the token hash it points at, or for an `=`
//! item the interned hash of `"true"`/`"false"` depending on whether the two
//! tokens match. The materialized words, prefixed by the optional name hash,
//! are reduced through the feature table to one feature record per pattern
//! per site.
//!
//! A pattern whose items all touch the second arc is silently shifted onto
//! the first: it generates the same feature ids as the directly written
//! first-arc pattern and stays unigram. Only patterns touching both arcs
//! are bigram and generate on (in-arc, out-arc) pairs of each state.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

use crate::fst::Fst;
use crate::model::{FeatRef, Feature, LabelRef, Model};
use crate::strings::StringPool;

static ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01])([st])([0-9]+)(?:=([01])([st])([0-9]+))?$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Ref {
    pos: u8,
    trg_side: bool,
    tok: usize,
}

#[derive(Clone, Copy, Debug)]
struct Item {
    left: Ref,
    right: Option<Ref>,
}

#[derive(Debug)]
pub struct Pattern {
    /// Hash of the optional name, prepended to the materialized words when
    /// non-zero.
    id: u64,
    tag: usize,
    items: Vec<Item>,
}

impl Pattern {
    /// Highest arc position any item touches: 0 for unigram patterns.
    fn span(&self) -> u8 {
        self.items
            .iter()
            .flat_map(|i| [Some(i.left), i.right].into_iter().flatten())
            .map(|r| r.pos)
            .max()
            .unwrap_or(0)
    }
}

/// Compiled pattern set plus the handful of interned hashes generation
/// needs. After construction the generator is immutable and shared by all
/// gradient workers.
pub struct Generator {
    upats: Vec<Pattern>,
    bpats: Vec<Pattern>,
    htrue: u64,
    hfalse: u64,
    hempty: u64,
    /// Count occurrences on reference FSTs (negative multiplier) instead of
    /// hypothesis spaces.
    pub onref: bool,
}

impl Generator {
    pub fn new(pool: &StringPool, onref: bool) -> Generator {
        Generator {
            upats: Vec::new(),
            bpats: Vec::new(),
            htrue: pool.intern("true", false),
            hfalse: pool.intern("false", false),
            hempty: pool.intern("", false),
            onref,
        }
    }

    pub fn unigram_count(&self) -> usize {
        self.upats.len()
    }

    pub fn bigram_count(&self) -> usize {
        self.bpats.len()
    }

    /// Compile one pattern string, classifying it as unigram or bigram.
    pub fn add_pattern(&mut self, pool: &StringPool, text: &str) -> Result<()> {
        let mut rest = text;
        let mut tag = 0usize;
        if let Some((head, tail)) = rest.split_once(':') {
            if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
                tag = head.parse()?;
                if tag >= 128 {
                    bail!("pattern '{}': tag {} out of range (0..128)", text, tag);
                }
                rest = tail;
            }
        }
        let mut id = 0u64;
        if rest.chars().next().is_some_and(|c| c.is_alphabetic()) {
            let Some((name, tail)) = rest.split_once(':') else {
                bail!("pattern '{}': name without terminating ':'", text);
            };
            id = pool.intern(name, false);
            rest = tail;
        }
        if rest.is_empty() {
            bail!("pattern '{}': no items", text);
        }
        let mut items = Vec::new();
        for part in rest.split(',') {
            let Some(caps) = ITEM_RE.captures(part) else {
                bail!("pattern '{}': bad item '{}'", text, part);
            };
            let item_ref = |p: usize, s: usize, t: usize| Ref {
                pos: caps[p].parse::<u8>().unwrap(),
                trg_side: &caps[s] == "t",
                tok: caps[t].parse().unwrap(),
            };
            items.push(Item {
                left: item_ref(1, 2, 3),
                right: caps.get(4).map(|_| item_ref(4, 5, 6)),
            });
        }
        // A pattern that only ever looks at the second arc is the same
        // feature on that arc alone: shift it down so it hashes like the
        // first-arc spelling and generates per arc instead of per pair.
        if items
            .iter()
            .flat_map(|i| [Some(i.left), i.right].into_iter().flatten())
            .all(|r| r.pos == 1)
        {
            for item in &mut items {
                item.left.pos = 0;
                if let Some(r) = &mut item.right {
                    r.pos = 0;
                }
            }
        }
        let pat = Pattern { id, tag, items };
        if pat.span() == 0 {
            self.upats.push(pat);
        } else {
            self.bpats.push(pat);
        }
        Ok(())
    }

    /// Token hash an item reference points at; labels are indexed
    /// `pos * 2 + side` in the caller-built window. A token index past the
    /// end of the label materializes as the empty-string hash.
    #[inline(always)]
    fn word_of(&self, r: Ref, lbls: &[LabelRef]) -> u64 {
        let lbl = lbls[r.pos as usize * 2 + r.trg_side as usize].get();
        lbl.toks.get(r.tok).copied().unwrap_or(self.hempty)
    }

    fn materialize(&self, item: &Item, lbls: &[LabelRef]) -> u64 {
        let h1 = self.word_of(item.left, lbls);
        match item.right {
            None => h1,
            Some(r) => {
                if h1 == self.word_of(r, lbls) {
                    self.htrue
                } else {
                    self.hfalse
                }
            }
        }
    }

    fn emit<'m>(
        &self,
        mdl: &'m Model,
        pat: &Pattern,
        lbls: &[LabelRef],
        count_freq: bool,
    ) -> Option<&'m Feature> {
        let mut words: SmallVec<[u64; 8]> = SmallVec::new();
        if pat.id != 0 {
            words.push(pat.id);
        }
        for item in &pat.items {
            words.push(self.materialize(item, lbls));
        }
        mdl.add_feature(pat.tag, &words, count_freq)
    }

    /// Populate the FST's feature lists: unigram features per arc, bigram
    /// features per (incoming, outgoing) arc pair of each state. All lists
    /// go into two contiguous arenas with per-slot spans. No-op when the
    /// lists are already present (cached from a previous iteration).
    pub fn add_features(&self, mdl: &Model, fst: &mut Fst) {
        if !fst.uspan.is_empty() {
            return;
        }
        let count_freq = (fst.mult < 0.0 && self.onref) || (fst.mult > 0.0 && !self.onref);

        let narcs = fst.arcs.len();
        fst.ufeat.reserve(narcs * self.upats.len());
        fst.uspan.reserve(narcs);
        for ia in 0..narcs {
            let lbls = [fst.arcs[ia].ilbl, fst.arcs[ia].olbl];
            let off = fst.ufeat.len() as u32;
            for pat in &self.upats {
                if let Some(f) = self.emit(mdl, pat, &lbls, count_freq) {
                    fst.ufeat.push(FeatRef::new(f));
                }
            }
            fst.uspan.push((off, fst.ufeat.len() as u32 - off));
        }

        fst.bfeat.reserve(fst.npairs * self.bpats.len());
        fst.bspan.reserve(fst.npairs);
        for is in 0..fst.nstates {
            let (icnt, ocnt) = (fst.states[is].ilst.len(), fst.states[is].olst.len());
            for ni in 0..icnt {
                for no in 0..ocnt {
                    let ai = fst.states[is].ilst[ni] as usize;
                    let ao = fst.states[is].olst[no] as usize;
                    let lbls = [
                        fst.arcs[ai].ilbl,
                        fst.arcs[ai].olbl,
                        fst.arcs[ao].ilbl,
                        fst.arcs[ao].olbl,
                    ];
                    let off = fst.bfeat.len() as u32;
                    for pat in &self.bpats {
                        if let Some(f) = self.emit(mdl, pat, &lbls, count_freq) {
                            fst.bfeat.push(FeatRef::new(f));
                        }
                    }
                    fst.bspan.push((off, fst.bfeat.len() as u32 - off));
                }
            }
        }
    }
}
