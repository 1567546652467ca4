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

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use clap::Parser;

use lattice_crf::{decode, Dataset, Generator, Gradient, Model, Rprop, StringPool};

#[derive(Parser)]
#[command(
    name = "lattice_crf",
    version,
    about = "Train and decode log-linear models over weighted FST lattices"
)]
struct Cli {
    /// Model files to load, merged in order
    #[arg(long = "load-model", value_name = "FILE")]
    load_model: Vec<PathBuf>,
    /// File to store the final model
    #[arg(long = "save-model", value_name = "FILE")]
    save_model: Option<PathBuf>,
    /// Model file template written after each iteration (%d = iteration)
    #[arg(long = "save-model-per-iter", value_name = "TEMPLATE")]
    save_model_per_iter: Option<String>,
    /// Drop zero-weight features before the final save
    #[arg(long)]
    compact: bool,
    /// Dump every inserted feature id with its word hashes (forces 1 thread)
    #[arg(long = "dump-features", value_name = "FILE")]
    dump_features: Option<PathBuf>,

    /// Hypothesis-space training FSTs (multiplier +1)
    #[arg(long = "train-pos", value_name = "FILE")]
    train_pos: Vec<PathBuf>,
    /// Reference training FSTs (multiplier -1)
    #[arg(long = "train-neg", value_name = "FILE")]
    train_neg: Vec<PathBuf>,
    /// Development FSTs, decoded after each iteration
    #[arg(long = "devel-spc", value_name = "FILE")]
    devel_spc: Option<PathBuf>,
    /// Development output template (%d = iteration)
    #[arg(long = "devel-out", value_name = "TEMPLATE")]
    devel_out: Option<String>,
    /// Test FSTs
    #[arg(long = "test-spc", value_name = "FILE")]
    test_spc: Option<PathBuf>,
    /// Viterbi output for the test FSTs
    #[arg(long = "test-out", value_name = "FILE")]
    test_out: Option<PathBuf>,
    /// Scored-lattice output for the test FSTs
    #[arg(long = "test-fst", value_name = "FILE")]
    test_fst: Option<PathBuf>,

    /// Feature extraction pattern (repeatable)
    #[arg(long, value_name = "[TAG:][NAME:]ITEMS")]
    pattern: Vec<String>,
    /// Iteration at which a tag starts inserting features
    #[arg(long = "tag-start", value_name = "TAG:ITER")]
    tag_start: Vec<String>,
    /// Iteration at which a tag stops inserting and prunes zero weights
    #[arg(long = "tag-remove", value_name = "TAG:ITER")]
    tag_remove: Vec<String>,
    /// L1 strength, per tag or global
    #[arg(long = "tag-rho1", value_name = "[TAG:]VALUE", allow_negative_numbers = true)]
    tag_rho1: Vec<String>,
    /// L2 strength, per tag or global
    #[arg(long = "tag-rho2", value_name = "[TAG:]VALUE", allow_negative_numbers = true)]
    tag_rho2: Vec<String>,
    /// Frequency-weighted L1 strength, per tag or global
    #[arg(long = "tag-rho3", value_name = "[TAG:]VALUE", allow_negative_numbers = true)]
    tag_rho3: Vec<String>,
    /// Count feature frequencies on references instead of hypothesis spaces
    #[arg(long = "ref-freq")]
    ref_freq: bool,
    /// Prune features seen fewer times per iteration
    #[arg(long = "min-freq", value_name = "INT", default_value_t = 0)]
    min_freq: u64,

    /// Number of optimization steps
    #[arg(long, value_name = "INT", default_value_t = 15)]
    iterations: i64,
    /// Per-FST data kept between iterations (0-4)
    #[arg(long = "cache-lvl", value_name = "INT", default_value_t = 0)]
    cache_lvl: u32,
    #[arg(long = "rbp-stpinc", value_name = "FLOAT", default_value_t = 1.2)]
    rbp_stpinc: f64,
    #[arg(long = "rbp-stpdec", value_name = "FLOAT", default_value_t = 0.5)]
    rbp_stpdec: f64,
    #[arg(long = "rbp-stpmin", value_name = "FLOAT", default_value_t = 1e-8)]
    rbp_stpmin: f64,
    #[arg(long = "rbp-stpmax", value_name = "FLOAT", default_value_t = 50.0)]
    rbp_stpmax: f64,

    /// String pool files to preload
    #[arg(long = "str-load", value_name = "FILE")]
    str_load: Vec<PathBuf>,
    /// Dump the string pool to a file
    #[arg(long = "str-save", value_name = "FILE")]
    str_save: Option<PathBuf>,
    /// Store all strings in the pool, not only the mandatory ones
    #[arg(long = "str-all")]
    str_all: bool,

    /// Number of compute threads
    #[arg(long, value_name = "INT", default_value_t = 1)]
    nthreads: usize,
    #[arg(short, long)]
    verbose: bool,
}

/// `TAG:VALUE` with a mandatory tag.
fn parse_tagged<T: std::str::FromStr>(s: &str) -> Result<(usize, T)> {
    let Some((tag, val)) = s.split_once(':') else {
        bail!("expected TAG:VALUE, got '{}'", s);
    };
    let tag: usize = tag.parse().with_context(|| format!("bad tag in '{}'", s))?;
    let Ok(val) = val.parse::<T>() else {
        bail!("bad value in '{}'", s);
    };
    Ok((tag, val))
}

/// `[TAG:]VALUE`; a bare value applies to tag 0.
fn parse_rho(s: &str) -> Result<(usize, f64)> {
    if let Ok(pair) = parse_tagged::<f64>(s) {
        return Ok(pair);
    }
    let val: f64 = s.parse().with_context(|| format!("bad rho value '{}'", s))?;
    Ok((0, val))
}

/// Per-iteration output path: `%d` replaced by the iteration number, or the
/// number appended when the template has no placeholder.
fn iter_path(template: &str, iter: i64) -> PathBuf {
    if template.contains("%d") {
        PathBuf::from(template.replacen("%d", &iter.to_string(), 1))
    } else {
        PathBuf::from(format!("{}.{}", template, iter))
    }
}

fn load_all(dat: &mut Dataset, files: &[PathBuf], mdl: &Model, mult: f64, kind: &str) -> Result<()> {
    for f in files {
        eprintln!("    [{}] {}", kind, f.display());
        dat.load(f, mdl, mult, 1000)?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    // System initialization: the string pool and the model object every
    // later stage hangs off.
    eprintln!("* Setup the system base");
    eprintln!("  - Initialize string pool");
    let pool = StringPool::new(cli.str_all);
    for f in &cli.str_load {
        eprintln!("    [str] {}", f.display());
        pool.load(f)?;
    }
    eprintln!("  - Initialize model object");
    let mut mdl = Model::new(pool);

    // Data loading. FSTs stay in their compact parsed form; everything
    // derived is built lazily by the passes that need it.
    eprintln!("* Load the data");
    let mut dat_train = Dataset::new();
    load_all(&mut dat_train, &cli.train_pos, &mdl, 1.0, "pos")?;
    load_all(&mut dat_train, &cli.train_neg, &mdl, -1.0, "neg")?;
    let mut dat_devel = Dataset::new();
    if let Some(f) = &cli.devel_spc {
        eprintln!("    [spc] {}", f.display());
        dat_devel.load(f, &mdl, 0.0, 1000)?;
    }
    let mut dat_test = Dataset::new();
    if let Some(f) = &cli.test_spc {
        eprintln!("    [spc] {}", f.display());
        dat_test.load(f, &mdl, 0.0, 1000)?;
    }
    if !dat_train.is_empty() {
        eprintln!("        {} train FSTs", dat_train.len());
    }
    if !dat_devel.is_empty() {
        eprintln!("        {} devel FSTs", dat_devel.len());
    }
    if !dat_test.is_empty() {
        eprintln!("        {} test FSTs", dat_test.len());
    }

    // The model: feature generator, tag windows, previous weights.
    eprintln!("* Prepare the model");
    mdl.min_freq = cli.min_freq;
    eprintln!("  - Initialize the feature generator");
    let mut gen = Generator::new(&mdl.pool, cli.ref_freq);
    if cli.pattern.is_empty() {
        bail!("no pattern specified");
    }
    for p in &cli.pattern {
        gen.add_pattern(&mdl.pool, p)
            .with_context(|| format!("invalid pattern {}", p))?;
    }
    eprintln!("  - Initialize the feature table");
    let mut nthreads = cli.nthreads.max(1);
    if let Some(f) = &cli.dump_features {
        mdl.set_dump(f)?;
        nthreads = 1;
    }
    for s in &cli.tag_start {
        let (tag, itr) = parse_tagged::<i64>(s).with_context(|| format!("bad --tag-start {}", s))?;
        mdl.set_start(tag, itr)?;
    }
    for s in &cli.tag_remove {
        let (tag, itr) = parse_tagged::<i64>(s).with_context(|| format!("bad --tag-remove {}", s))?;
        mdl.set_remove(tag, itr)?;
    }
    if !cli.load_model.is_empty() {
        eprintln!("  - Load previous model file");
        for f in &cli.load_model {
            eprintln!("    [mdl] {}", f.display());
            mdl.load(f)?;
        }
    }
    eprintln!("  - Initialize the optimizer");
    let mut rbp = Rprop::new();
    rbp.stp_inc = cli.rbp_stpinc;
    rbp.stp_dec = cli.rbp_stpdec;
    rbp.stp_min = cli.rbp_stpmin;
    rbp.stp_max = cli.rbp_stpmax;
    for s in &cli.tag_rho1 {
        let (tag, val) = parse_rho(s).with_context(|| format!("bad --tag-rho1 {}", s))?;
        if tag >= 128 {
            bail!("tag {} out of range (0..128)", tag);
        }
        rbp.rho1[tag] = val;
    }
    for s in &cli.tag_rho2 {
        let (tag, val) = parse_rho(s).with_context(|| format!("bad --tag-rho2 {}", s))?;
        if tag >= 128 {
            bail!("tag {} out of range (0..128)", tag);
        }
        rbp.rho2[tag] = val;
    }
    for s in &cli.tag_rho3 {
        let (tag, val) = parse_rho(s).with_context(|| format!("bad --tag-rho3 {}", s))?;
        if tag >= 128 {
            bail!("tag {} out of range (0..128)", tag);
        }
        rbp.rho3[tag] = val;
    }
    rbp.inherit();

    // Optimization: gradient pass then optimizer sweep, once per
    // iteration, with the optional devel decode and model snapshot.
    if !dat_train.is_empty() {
        eprintln!("* Optimize the model");
        let mut grd = Gradient::new(&mdl, &gen, &dat_train);
        grd.nthreads = nthreads;
        grd.cache_lvl = cli.cache_lvl;
        for i in 1..=cli.iterations {
            eprintln!("  [{:3}] Start new iteration", i);
            mdl.itr.store(i, Ordering::Release);
            eprintln!("    - Compute the gradient");
            let fx = grd.compute()?;
            eprintln!("    - Apply the update");
            let sweep = rbp.step(&mdl, fx);
            // Quiescence point for pruned features: every cached list
            // that could still point at them goes away before the
            // retired records are freed.
            if !sweep.retired.is_empty() {
                for cell in &dat_train.fsts {
                    let fst = unsafe { cell.get() };
                    fst.remove_scratch();
                    fst.remove_features();
                }
            }
            drop(sweep);
            eprintln!("    - Compute stats");
            mdl.stats(cli.verbose);
            if !dat_devel.is_empty() {
                if let Some(template) = &cli.devel_out {
                    eprintln!("* Decode the devel");
                    let path = iter_path(template, i);
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    decode::decode(&mdl, &gen, &dat_devel, &mut BufWriter::new(file), false)?;
                }
            }
            if let Some(template) = &cli.save_model_per_iter {
                eprintln!("  - Save model");
                mdl.save(&iter_path(template, i))?;
            }
        }
    }

    // Decoding of the test data, Viterbi and/or full scored lattices.
    if !dat_test.is_empty() {
        if let Some(out) = &cli.test_out {
            eprintln!("* Decode the test (viterbi)");
            let file =
                File::create(out).with_context(|| format!("cannot create {}", out.display()))?;
            decode::decode(&mdl, &gen, &dat_test, &mut BufWriter::new(file), false)?;
        }
        if let Some(out) = &cli.test_fst {
            eprintln!("* Decode the test (space)");
            let file =
                File::create(out).with_context(|| format!("cannot create {}", out.display()))?;
            decode::decode(&mdl, &gen, &dat_test, &mut BufWriter::new(file), true)?;
        }
    }

    eprintln!("* Generate outputs");
    if let Some(out) = &cli.save_model {
        if cli.compact {
            eprintln!("  - Compact model");
            mdl.shrink();
        }
        eprintln!("  - Save model");
        mdl.save(out)?;
    }
    if let Some(out) = &cli.str_save {
        eprintln!("  - Dump string pool");
        mdl.pool.save(out)?;
    }
    eprintln!("* Done");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_and_rho_parsing() {
        assert_eq!(parse_tagged::<i64>("3:7").unwrap(), (3, 7));
        assert!(parse_tagged::<i64>("7").is_err());
        assert!(parse_tagged::<i64>("x:7").is_err());
        assert_eq!(parse_rho("2:0.5").unwrap(), (2, 0.5));
        assert_eq!(parse_rho("0.25").unwrap(), (0, 0.25));
        assert!(parse_rho("a:b").is_err());
    }

    #[test]
    fn iter_path_substitution() {
        assert_eq!(iter_path("model-%d.txt", 3), PathBuf::from("model-3.txt"));
        assert_eq!(iter_path("model.txt", 3), PathBuf::from("model.txt.3"));
    }
}
