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

//! Training and decoding engine for linear-chain log-linear models over
//! weighted finite-state transducers: sparse features generated from
//! arc-pair patterns, conditional maximum-likelihood training with
//! L1/L2/frequency regularization, RPROP optimization, Viterbi decoding.

pub mod dataset;
pub mod decode;
mod environment;
pub mod features;
pub mod fst;
pub mod gradient;
pub mod hashing;
pub mod model;
pub mod progress;
pub mod rprop;
pub mod strings;
pub mod sync;

pub use dataset::Dataset;
pub use features::Generator;
pub use gradient::Gradient;
pub use model::Model;
pub use rprop::Rprop;
pub use strings::StringPool;
