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

//! Shared string pool.
//!
//! The engine never computes with strings, only with their 63-bit hashes:
//! every label and token is hashed once on input and the hash circulates
//! from there. The inverse mapping is needed only for human-facing output
//! (decoded paths, scored-FST dumps), so it is stored selectively: strings
//! interned as *mandatory* always keep their reverse entry, the rest only
//! when store-all mode is on.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::hashing::hash_bytes;
use crate::sync::Map;

pub const UNKNOWN: &str = "@@UNKNOWN";

/// Concurrent hash-to-string reverse map. Interning is safe from any
/// gradient worker; the insert race loser is simply dropped.
pub struct StringPool {
    map: Map<String>,
    all: bool,
}

impl StringPool {
    pub fn new(all: bool) -> Self {
        StringPool { map: Map::new(), all }
    }

    /// Hash a byte buffer, storing the reverse mapping when the string is
    /// mandatory or store-all mode is on. Returns the hash either way.
    pub fn intern_bytes(&self, buf: &[u8], mandatory: bool) -> u64 {
        let hash = hash_bytes(buf);
        if (mandatory || self.all) && self.map.find(hash).is_none() {
            self.map.insert(hash, String::from_utf8_lossy(buf).into_owned());
        }
        hash
    }

    pub fn intern(&self, s: &str, mandatory: bool) -> u64 {
        self.intern_bytes(s.as_bytes(), mandatory)
    }

    /// The string behind a hash, or the unknown sentinel when the reverse
    /// mapping was not stored.
    pub fn get(&self, hash: u64) -> &str {
        match self.map.find(hash) {
            Some(s) => s.as_str(),
            None => UNKNOWN,
        }
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Preload strings from a file, one per line. The first whitespace
    /// separated token of each line is ignored (it is the hash written by a
    /// previous save; strings are re-hashed on load), the remainder of the
    /// line is interned as mandatory. Empty lines are skipped.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("cannot read {}", path.display()))?;
            let rest = line
                .trim_start()
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim_start())
                .unwrap_or("");
            if !rest.is_empty() {
                self.intern(rest, true);
            }
        }
        Ok(())
    }

    /// Dump the pool, one `<16-hex-hash> <string>` line per entry, in no
    /// particular order.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for (hash, s) in self.map.iter() {
            writeln!(out, "{:016x} {}", hash, s)
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        Ok(())
    }
}
