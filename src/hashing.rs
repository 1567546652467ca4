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

use smallvec::SmallVec;

/// Every identifier in the engine (token, label, feature) is a 63-bit hash:
/// strings are hashed once on input and only the hash values circulate after
/// that. Collision is treated as identity, so the hash must be strong, and it
/// must be bit-stable across runs and platforms because model files store raw
/// hash values.
///
/// This is the short variant of Bob Jenkins' SpookyHash. All block reads go
/// through `u64::from_le_bytes`, so unaligned buffers and big-endian hosts
/// produce the same values as x86.
fn spooky(buf: &[u8]) -> u64 {
    const SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;
    let mut a = SEED;
    let mut b = SEED;
    let mut c = SEED;
    let mut d = SEED;
    let mut rest = buf;

    while rest.len() >= 32 {
        c = c.wrapping_add(read_u64(rest, 0));
        d = d.wrapping_add(read_u64(rest, 8));
        mix(&mut a, &mut b, &mut c, &mut d);
        a = a.wrapping_add(read_u64(rest, 16));
        b = b.wrapping_add(read_u64(rest, 24));
        rest = &rest[32..];
    }
    if rest.len() >= 16 {
        c = c.wrapping_add(read_u64(rest, 0));
        d = d.wrapping_add(read_u64(rest, 8));
        mix(&mut a, &mut b, &mut c, &mut d);
        rest = &rest[16..];
    }

    // Fold in the 0..15 remaining bytes. The tail length is mixed into the
    // top byte of d so buffers that differ only by trailing zero bytes still
    // hash differently.
    d = d.wrapping_add((rest.len() as u64) << 56);
    match rest.len() {
        0 => {
            c = c.wrapping_add(SEED);
            d = d.wrapping_add(SEED);
        }
        1..=8 => {
            c = c.wrapping_add(read_partial(rest));
        }
        _ => {
            c = c.wrapping_add(read_u64(rest, 0));
            d = d.wrapping_add(read_partial(&rest[8..]));
        }
    }

    d ^= c; c = c.rotate_left(15); d = d.wrapping_add(c);
    a ^= d; d = d.rotate_left(52); a = a.wrapping_add(d);
    b ^= a; a = a.rotate_left(26); b = b.wrapping_add(a);
    c ^= b; b = b.rotate_left(51); c = c.wrapping_add(b);
    d ^= c; c = c.rotate_left(28); d = d.wrapping_add(c);
    a ^= d; d = d.rotate_left(9);  a = a.wrapping_add(d);
    b ^= a; a = a.rotate_left(47); b = b.wrapping_add(a);
    c ^= b; b = b.rotate_left(54); c = c.wrapping_add(b);
    d ^= c; c = c.rotate_left(32); d = d.wrapping_add(c);
    a ^= d; d = d.rotate_left(25); a = a.wrapping_add(d);
    b ^= a; a = a.rotate_left(63); b = b.wrapping_add(a);
    a
}

#[inline(always)]
fn mix(a: &mut u64, b: &mut u64, c: &mut u64, d: &mut u64) {
    *c = c.rotate_left(50); *c = c.wrapping_add(*d); *a ^= *c;
    *d = d.rotate_left(52); *d = d.wrapping_add(*a); *b ^= *d;
    *a = a.rotate_left(30); *a = a.wrapping_add(*b); *c ^= *a;
    *b = b.rotate_left(41); *b = b.wrapping_add(*c); *d ^= *b;
    *c = c.rotate_left(54); *c = c.wrapping_add(*d); *a ^= *c;
    *d = d.rotate_left(48); *d = d.wrapping_add(*a); *b ^= *d;
    *a = a.rotate_left(38); *a = a.wrapping_add(*b); *c ^= *a;
    *b = b.rotate_left(37); *b = b.wrapping_add(*c); *d ^= *b;
    *c = c.rotate_left(62); *c = c.wrapping_add(*d); *a ^= *c;
    *d = d.rotate_left(34); *d = d.wrapping_add(*a); *b ^= *d;
    *a = a.rotate_left(5);  *a = a.wrapping_add(*b); *c ^= *a;
    *b = b.rotate_left(36); *b = b.wrapping_add(*c); *d ^= *b;
}

#[inline(always)]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Little-endian value of up to 8 trailing bytes.
#[inline(always)]
fn read_partial(buf: &[u8]) -> u64 {
    let mut tmp = [0u8; 8];
    tmp[..buf.len()].copy_from_slice(buf);
    u64::from_le_bytes(tmp)
}

/// Hash a raw byte buffer down to 63 bits. The high bit is reserved by the
/// hash table implementation and always cleared here.
pub fn hash_bytes(buf: &[u8]) -> u64 {
    spooky(buf) & 0x7FFF_FFFF_FFFF_FFFF
}

/// Hash a string down to 63 bits.
pub fn hash_str(s: &str) -> u64 {
    hash_bytes(s.as_bytes())
}

/// Hash an array of hash values, used to combine the materialized words of a
/// feature into its identifier. The words are serialized little-endian so the
/// result matches `hash_bytes` over the equivalent in-memory array.
pub fn hash_words(words: &[u64]) -> u64 {
    let mut buf: SmallVec<[u8; 64]> = SmallVec::with_capacity(words.len() * 8);
    for w in words {
        buf.extend_from_slice(&w.to_le_bytes());
    }
    hash_bytes(&buf)
}

/// Reverse the bit order of a value. Split-ordered lists sort keys by their
/// bit-reversed value so that doubling the bucket count splits every bucket
/// in place.
#[inline(always)]
pub fn bit_reverse(v: u64) -> u64 {
    v.reverse_bits()
}

/// Clear the highest set bit of a value. The parent of bucket `b` in a
/// split-ordered table is `b` with its highest set bit cleared.
#[inline(always)]
pub fn clear_msb(v: u64) -> u64 {
    if v == 0 {
        0
    } else {
        v & !(1u64 << (63 - v.leading_zeros()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = hash_str("the quick brown fox");
        let b = hash_str("the quick brown fox");
        assert_eq!(a, b);
        assert_ne!(a, hash_str("the quick brown fax"));
    }

    #[test]
    fn hash_high_bit_clear() {
        for s in ["", "a", "abc", "some longer input with more than thirty-two bytes in it"] {
            assert_eq!(hash_str(s) & (1u64 << 63), 0);
        }
    }

    #[test]
    fn hash_covers_all_block_sizes() {
        // Exercise the 32-byte loop, the 16-byte block and every tail length.
        let data: Vec<u8> = (0u8..=96).collect();
        let mut seen = std::collections::HashSet::new();
        for len in 0..data.len() {
            assert!(seen.insert(hash_bytes(&data[..len])));
        }
    }

    #[test]
    fn words_match_byte_serialization() {
        let words = [hash_str("a"), hash_str("b"), 42];
        let mut bytes = Vec::new();
        for w in &words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(hash_words(&words), hash_bytes(&bytes));
    }

    #[test]
    fn clear_msb_drops_highest_bit() {
        assert_eq!(clear_msb(0), 0);
        assert_eq!(clear_msb(1), 0);
        assert_eq!(clear_msb(0b1100), 0b0100);
        assert_eq!(clear_msb(1u64 << 63), 0);
        assert_eq!(clear_msb((1u64 << 63) | 7), 7);
    }

    #[test]
    fn bit_reverse_roundtrip() {
        for v in [0u64, 1, 0xDEAD_BEEF, u64::MAX, 1 << 62] {
            assert_eq!(bit_reverse(bit_reverse(v)), v);
        }
        assert_eq!(bit_reverse(1), 1 << 63);
    }
}
