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

//! The prefix-preserving address anonymisation primitive.
//!
//! This implements the Crypto-PAn construction: a keyed, deterministic
//! transformation of IP addresses in which two addresses sharing a
//! k-bit prefix map to two addresses sharing a k-bit prefix. The 32-byte
//! key splits into an AES-128 key (first half) and the seed of a secret
//! padding block (second half).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

////////////////////////////////////////////////////////////////////////
// THE PRIMITIVE                                                      //
////////////////////////////////////////////////////////////////////////

/// A keyed prefix-preserving address anonymiser.
pub struct CryptoPan {
    cipher: Aes128,

    /// The encrypted padding block, interpreted as a big-endian 128-bit
    /// integer whose bit `i` (from the top) pads position `i` of the
    /// per-bit cipher input.
    pad: u128,
}

impl CryptoPan {
    /// Creates a new `CryptoPan` from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&key[..16]));
        let mut block = GenericArray::clone_from_slice(&key[16..]);
        cipher.encrypt_block(&mut block);
        let pad = u128::from_be_bytes(block.into());
        Self { cipher, pad }
    }

    /// Anonymises an IPv4 address.
    pub fn anonymise_v4(&self, octets: [u8; 4]) -> [u8; 4] {
        let addr = (u32::from_be_bytes(octets) as u128) << 96;
        let result = self.anonymise_bits(addr, 32);
        ((result >> 96) as u32).to_be_bytes()
    }

    /// Anonymises an IPv6 address.
    pub fn anonymise_v6(&self, octets: [u8; 16]) -> [u8; 16] {
        let addr = u128::from_be_bytes(octets);
        self.anonymise_bits(addr, 128).to_be_bytes()
    }

    /// The per-bit Crypto-PAn round: for each bit position `i`, the
    /// cipher is applied to the first `i` address bits followed by the
    /// secret padding, and the top bit of the output decides whether
    /// address bit `i` flips. `addr` is left-aligned in the 128-bit
    /// block.
    fn anonymise_bits(&self, addr: u128, nbits: u32) -> u128 {
        let mut flips: u128 = 0;
        for i in 0..nbits {
            let prefix_mask: u128 = if i == 0 { 0 } else { !0u128 << (128 - i) };
            let input = (addr & prefix_mask) | (self.pad & !prefix_mask);
            let mut block = GenericArray::from(input.to_be_bytes());
            self.cipher.encrypt_block(&mut block);
            let output = u128::from_be_bytes(block.into());
            flips |= (output >> 127) << (127 - i);
        }
        addr ^ flips
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn test_instance() -> CryptoPan {
        let mut key = [0u8; 32];
        for (i, octet) in key.iter_mut().enumerate() {
            *octet = i as u8;
        }
        CryptoPan::new(&key)
    }

    /// Returns the length of the common prefix of `a` and `b` in bits.
    fn common_prefix_len(a: &[u8], b: &[u8]) -> u32 {
        let mut bits = 0;
        for (x, y) in a.iter().zip(b.iter()) {
            if x == y {
                bits += 8;
            } else {
                bits += (x ^ y).leading_zeros();
                break;
            }
        }
        bits
    }

    #[test]
    fn anonymisation_is_deterministic() {
        let cpn = test_instance();
        let addr = [192, 0, 2, 7];
        assert_eq!(cpn.anonymise_v4(addr), cpn.anonymise_v4(addr));
    }

    #[test]
    fn anonymisation_changes_the_address() {
        let cpn = test_instance();
        assert_ne!(cpn.anonymise_v4([192, 0, 2, 7]), [192, 0, 2, 7]);
        let v6 = [
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
        ];
        assert_ne!(cpn.anonymise_v6(v6), v6);
    }

    #[test]
    fn different_keys_produce_different_mappings() {
        let a = test_instance();
        let b = CryptoPan::new(&[0x5a; 32]);
        assert_ne!(
            a.anonymise_v4([192, 0, 2, 7]),
            b.anonymise_v4([192, 0, 2, 7]),
        );
    }

    #[test]
    fn prefixes_are_preserved_v4() {
        let cpn = test_instance();
        // Same /24, differing in the last octet.
        let a = cpn.anonymise_v4([192, 0, 2, 7]);
        let b = cpn.anonymise_v4([192, 0, 2, 99]);
        assert!(common_prefix_len(&a, &b) >= 24);

        // Same /8 only.
        let c = cpn.anonymise_v4([192, 168, 1, 1]);
        let shared = common_prefix_len(&a, &c);
        assert!((8..24).contains(&shared), "shared prefix was {}", shared);
    }

    #[test]
    fn prefixes_are_preserved_v6() {
        let cpn = test_instance();
        let mut x = [0u8; 16];
        x[..4].copy_from_slice(&[0x20, 0x01, 0x0d, 0xb8]);
        let mut y = x;
        y[15] = 0xff;
        let a = cpn.anonymise_v6(x);
        let b = cpn.anonymise_v6(y);
        assert!(common_prefix_len(&a, &b) >= 120);
    }
}
