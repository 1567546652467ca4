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

//! Dataset loading.
//!
//! Input files are plain text in the OpenFST convention: one record per
//! FST, records separated by an `EOS` line (surrounding whitespace
//! allowed). Inside a record, lines starting with `#` in their first byte
//! and blank lines are ignored, an arc line is
//! `src trg ilabel olabel [score]*`, and a line with one or two tokens
//! designates the final state (the optional second token, a final weight,
//! is ignored). State ids are arbitrary strings; the first one seen becomes
//! internal state 0 and must be the unique initial state.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::fst::{Arc, Fst};
use crate::model::{LabelRef, Model};
use crate::progress::Progress;
use crate::sync::ThreadSafeCell;

/// The FSTs of one training or decoding run. Cells, not plain FSTs: during
/// a gradient pass each element is claimed by exactly one worker through
/// the dispatch counter and mutated in place.
pub struct Dataset {
    pub fsts: Vec<ThreadSafeCell<Fst>>,
}

impl Dataset {
    pub fn new() -> Dataset {
        Dataset { fsts: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fsts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fsts.is_empty()
    }

    /// Load every record of `path` with the given multiplier, interning
    /// labels through the model. Errors carry the file name and an
    /// approximate line number.
    pub fn load(&mut self, path: &Path, mdl: &Model, mult: f64, tick: i64) -> Result<()> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let prg = Progress::start(tick);
        let mut block: Vec<String> = Vec::new();
        let mut first_line = 1usize;
        let mut ln = 0usize;
        for line in BufReader::new(file).lines() {
            ln += 1;
            let line = line.with_context(|| format!("cannot read {}", path.display()))?;
            if is_eos(&line) {
                self.flush(&block, mdl, mult, path, first_line)?;
                block.clear();
                first_line = ln + 1;
                prg.tick();
                continue;
            }
            block.push(line);
        }
        // A trailing record without its EOS mark still counts.
        self.flush(&block, mdl, mult, path, first_line)?;
        prg.finish();
        Ok(())
    }

    fn flush(
        &mut self,
        block: &[String],
        mdl: &Model,
        mult: f64,
        path: &Path,
        first_line: usize,
    ) -> Result<()> {
        if block.iter().all(|l| l.trim().is_empty()) {
            return Ok(());
        }
        let fst = parse_record(block, mdl, mult)
            .with_context(|| format!("{}:{}: bad record", path.display(), first_line))?;
        self.fsts.push(ThreadSafeCell::new(fst));
        Ok(())
    }
}

impl Default for Dataset {
    fn default() -> Self {
        Dataset::new()
    }
}

fn is_eos(line: &str) -> bool {
    line.trim() == "EOS"
}

/// Parse one record into an FST. A small interning map turns the textual
/// state ids into dense indices, in order of first appearance so the
/// initial state lands on 0.
pub fn parse_record(lines: &[String], mdl: &Model, mult: f64) -> Result<Fst> {
    let mut state_ids: FxHashMap<String, u32> = FxHashMap::default();
    fn intern(ids: &mut FxHashMap<String, u32>, tok: &str) -> u32 {
        match ids.get(tok) {
            Some(&id) => id,
            None => {
                let id = ids.len() as u32;
                ids.insert(tok.to_string(), id);
                id
            }
        }
    }

    let mut fst = Fst::new(mult);
    let mut final_tok: Option<String> = None;
    for line in lines {
        // A comment starts with '#' in the first byte of the line; an
        // indented '#' tokenizes like any other line.
        if line.starts_with('#') {
            continue;
        }
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.len() {
            0 => continue,
            3 => bail!("arc line with 3 tokens"),
            1 | 2 => {
                if final_tok.is_some() {
                    bail!("more than one final state line");
                }
                final_tok = Some(toks[0].to_string());
            }
            _ => {
                let src = intern(&mut state_ids, toks[0]);
                let trg = intern(&mut state_ids, toks[1]);
                fst.nstates = fst.nstates.max(src as usize + 1).max(trg as usize + 1);
                let ilbl = LabelRef::new(mdl.map_src(toks[2]));
                let olbl = LabelRef::new(mdl.map_trg(toks[3]));
                let mut dense: SmallVec<[f64; 2]> = SmallVec::new();
                for t in &toks[4..] {
                    dense.push(
                        t.parse()
                            .with_context(|| format!("bad score token '{}'", t))?,
                    );
                }
                fst.arcs.push(Arc {
                    src,
                    trg,
                    ilbl,
                    olbl,
                    dense,
                    psi: 0.0,
                    alpha: 0.0,
                    beta: 0.0,
                    eback: 0,
                });
            }
        }
    }
    let final_tok = match final_tok {
        Some(t) => t,
        None => bail!("missing final state line"),
    };
    match state_ids.get(final_tok.as_str()) {
        Some(&id) => fst.final_state = id as usize,
        None => bail!("final state '{}' not used by any arc", final_tok),
    }
    Ok(fst)
}
