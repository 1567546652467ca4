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

use once_cell::sync::Lazy;
use std::env;

/// Suppress the tick-bar progress output on stderr.
///
/// # Environment Configuration
/// Set via `LATTICE_CRF_QUIET` environment variable.
///
/// # Accepted Values
/// - "1", "true", "yes" disable the bars (case insensitive)
/// - anything else, or unset, keeps them
///
/// Section headers and the per-iteration summary line are still printed;
/// only the unbounded tick bars are silenced. Mainly useful when the output
/// is captured by a driver script or a test harness.
pub static QUIET: Lazy<bool> = Lazy::new(|| match env::var("LATTICE_CRF_QUIET") {
    Ok(val) => {
        let val = val.to_lowercase();
        val == "1" || val == "true" || val == "yes"
    }
    Err(_) => false,
});

/// Growth threshold of the lock-free feature table.
///
/// # Environment Configuration
/// Set via `LATTICE_CRF_MAP_GROW` environment variable.
///
/// # Default Behavior
/// The bucket table doubles whenever the mean per-bucket chain length
/// exceeds this value. Default is 8; lowering it trades memory for shorter
/// chains.
pub static MAP_GROW: Lazy<u64> = Lazy::new(|| {
    env::var("LATTICE_CRF_MAP_GROW")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(8)
});
