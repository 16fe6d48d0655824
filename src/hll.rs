// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! A HyperLogLog cardinality sketch over client addresses.
//!
//! Each histogram entry carries two sketches, one per address family.
//! Input values are 64-bit murmur3 hashes computed with a fixed seed
//! ([`hash_address`]), so sketches produced by independent deployments
//! over the same multiset of addresses serialise to identical bytes and
//! can be merged downstream.

use std::io::Cursor;

/// The number of index bits. 2^10 = 1024 registers.
const LOG2M: u32 = 10;

/// The number of registers.
const M: usize = 1 << LOG2M;

/// The register width in bits. Register values saturate at
/// 2^REGISTER_WIDTH - 1.
const REGISTER_WIDTH: u32 = 4;

/// The maximum storable register value.
const MAX_REGISTER: u8 = (1 << REGISTER_WIDTH) - 1;

/// The serialisation format version octet.
const FORMAT_VERSION: u8 = 1;

/// The murmur3 seed for [`hash_address`]. Fixed so that independently
/// produced sketches over the same addresses are byte-identical.
const HASH_SEED: u32 = 0;

////////////////////////////////////////////////////////////////////////
// SKETCHES                                                           //
////////////////////////////////////////////////////////////////////////

/// A HyperLogLog sketch with 1024 four-bit registers.
///
/// The sketch accepts pre-computed 64-bit hashes (see
/// [`Sketch::add_raw`]); the top [`LOG2M`] bits select a register and
/// the rank of the remaining bits updates it. Registers only ever grow,
/// so the sketch (and its estimate) is monotonically non-decreasing.
#[derive(Clone)]
pub struct Sketch {
    registers: Box<[u8; M]>,
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

impl Sketch {
    /// Creates a new, empty `Sketch`.
    pub fn new() -> Self {
        Self {
            registers: Box::new([0; M]),
        }
    }

    /// Adds a pre-computed 64-bit hash to the sketch.
    pub fn add_raw(&mut self, hash: u64) {
        let index = (hash >> (64 - LOG2M)) as usize;
        let rest = hash << LOG2M;
        // The rank is the position of the leftmost one bit of the
        // remaining 54 bits, starting at one; all-zero rest saturates.
        let rank = (rest.leading_zeros() + 1).min(MAX_REGISTER as u32) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Returns whether no value has been added yet.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Merges `other` into `self` by taking the register-wise maximum.
    pub fn merge(&mut self, other: &Sketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Estimates the cardinality of the added multiset.
    pub fn estimate(&self) -> f64 {
        let m = M as f64;
        let mut sum = 0.0;
        let mut zero_registers = 0usize;
        for &register in self.registers.iter() {
            sum += 1.0 / (1u64 << register) as f64;
            if register == 0 {
                zero_registers += 1;
            }
        }

        // alpha_m for m >= 128.
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / sum;

        // Small-range correction: fall back to linear counting while
        // empty registers remain and the raw estimate is small.
        if raw <= 2.5 * m && zero_registers > 0 {
            m * (m / zero_registers as f64).ln()
        } else {
            raw
        }
    }

    /// Serialises the sketch to its dense byte form: a four-octet
    /// header (version, log2m, register width, reserved) followed by
    /// the registers packed two per octet, high nibble first.
    ///
    /// The encoding is a pure function of the register values, so two
    /// sketches over the same multiset serialise identically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut octets = Vec::with_capacity(4 + M / 2);
        octets.push(FORMAT_VERSION);
        octets.push(LOG2M as u8);
        octets.push(REGISTER_WIDTH as u8);
        octets.push(0);
        for pair in self.registers.chunks_exact(2) {
            octets.push(pair[0] << 4 | pair[1]);
        }
        octets
    }
}

////////////////////////////////////////////////////////////////////////
// ADDRESS HASHING                                                    //
////////////////////////////////////////////////////////////////////////

/// Hashes raw IP address octets for use with [`Sketch::add_raw`].
///
/// The hash is the low half of 128-bit murmur3 with a fixed seed; using
/// a deterministic seed is what makes independently produced sketches
/// mergeable.
pub fn hash_address(octets: &[u8]) -> u64 {
    murmur3::murmur3_x64_128(&mut Cursor::new(octets), HASH_SEED)
        .map(|hash| hash as u64)
        .unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_estimates_one() {
        let mut sketch = Sketch::new();
        sketch.add_raw(hash_address(&[192, 0, 2, 7]));
        let estimate = sketch.estimate();
        assert!((0.5..1.5).contains(&estimate), "estimate was {}", estimate);
    }

    #[test]
    fn duplicate_values_do_not_grow_the_estimate() {
        let mut sketch = Sketch::new();
        let hash = hash_address(&[192, 0, 2, 7]);
        sketch.add_raw(hash);
        let first = sketch.estimate();
        for _ in 0..100 {
            sketch.add_raw(hash);
        }
        assert_eq!(sketch.estimate(), first);
    }

    #[test]
    fn estimate_is_within_expected_error() {
        let mut sketch = Sketch::new();
        for i in 0u32..10_000 {
            sketch.add_raw(hash_address(&i.to_be_bytes()));
        }
        let estimate = sketch.estimate();
        // The standard error for 1024 registers is about 3.25%; allow a
        // generous 15%.
        assert!(
            (8_500.0..11_500.0).contains(&estimate),
            "estimate was {}",
            estimate,
        );
    }

    #[test]
    fn serialisation_is_deterministic() {
        let mut a = Sketch::new();
        let mut b = Sketch::new();
        // Insert the same multiset in different orders.
        for i in 0u32..500 {
            a.add_raw(hash_address(&i.to_be_bytes()));
        }
        for i in (0u32..500).rev() {
            b.add_raw(hash_address(&i.to_be_bytes()));
        }
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.to_bytes().len(), 4 + 512);
    }

    #[test]
    fn registers_are_monotonic() {
        let mut sketch = Sketch::new();
        let mut previous = sketch.registers.to_vec();
        for i in 0u32..1000 {
            sketch.add_raw(hash_address(&i.to_be_bytes()));
            for (old, new) in previous.iter().zip(sketch.registers.iter()) {
                assert!(new >= old);
            }
            previous = sketch.registers.to_vec();
        }
    }

    #[test]
    fn merge_takes_register_maxima() {
        let mut a = Sketch::new();
        let mut b = Sketch::new();
        for i in 0u32..100 {
            a.add_raw(hash_address(&i.to_be_bytes()));
        }
        for i in 100u32..200 {
            b.add_raw(hash_address(&i.to_be_bytes()));
        }
        let mut merged = a.clone();
        merged.merge(&b);

        let mut combined = Sketch::new();
        for i in 0u32..200 {
            combined.add_raw(hash_address(&i.to_be_bytes()));
        }
        assert_eq!(merged.to_bytes(), combined.to_bytes());
    }

    #[test]
    fn empty_detection_works() {
        let mut sketch = Sketch::new();
        assert!(sketch.is_empty());
        sketch.add_raw(hash_address(&[203, 0, 113, 1]));
        assert!(!sketch.is_empty());
    }
}
