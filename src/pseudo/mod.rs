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

//! The address pseudonymiser.
//!
//! This wraps the [`CryptoPan`](cryptopan::CryptoPan) primitive with
//! key derivation, a bounded result cache, and an atomic swap operation
//! for key rotation at runtime. Minimiser workers hold the read side of
//! the lock; reconfiguration takes the write side and installs a fresh
//! primitive and cache together.

mod cryptopan;

pub use cryptopan::CryptoPan;

use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;

use crate::metrics::Metrics;

////////////////////////////////////////////////////////////////////////
// THE PSEUDONYMISER                                                  //
////////////////////////////////////////////////////////////////////////

/// A shared, reconfigurable address pseudonymiser.
pub struct Pseudonymiser {
    state: RwLock<State>,
    metrics: Arc<Metrics>,
}

struct State {
    cryptopan: CryptoPan,

    /// Maps raw parsed addresses to their anonymised form. The outer
    /// lock is read-mostly; the inner mutex serialises cache recency
    /// updates.
    cache: Option<Mutex<LruCache<IpAddr, IpAddr>>>,
}

impl Pseudonymiser {
    /// Creates a new `Pseudonymiser` keyed by `passphrase` and `salt`.
    /// A `cache_entries` of zero disables the result cache.
    pub fn new(
        passphrase: &str,
        salt: &str,
        cache_entries: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let state = build_state(passphrase, salt, cache_entries)?;
        Ok(Self {
            state: RwLock::new(state),
            metrics,
        })
    }

    /// Rebuilds the primitive and cache from new key material and swaps
    /// them in atomically. In-flight `anonymise` calls complete against
    /// the old state.
    pub fn reconfigure(
        &self,
        passphrase: &str,
        salt: &str,
        cache_entries: usize,
    ) -> Result<(), Error> {
        // Derive the key outside the write lock; the KDF is slow by
        // construction.
        let fresh = build_state(passphrase, salt, cache_entries)?;
        *self.state.write().unwrap() = fresh;
        Ok(())
    }

    /// Anonymises the raw address octets in `raw`.
    ///
    /// On success, the returned octets are the anonymised address in
    /// its natural length (IPv4-mapped IPv6 input is unmapped, so it
    /// comes back as four octets). On any parse failure the result is a
    /// zeroed buffer of the input length and the flag is `false`; the
    /// caller is expected to continue with the zeroed address.
    pub fn anonymise(&self, raw: &[u8]) -> (Vec<u8>, bool) {
        let addr = match parse_address(raw) {
            Some(addr) => addr,
            None => return (vec![0; raw.len()], false),
        };

        let state = self.state.read().unwrap();

        if let Some(ref cache) = state.cache {
            if let Some(anonymised) = cache.lock().unwrap().get(&addr) {
                self.metrics.pseudo_cache_hit.inc();
                return (address_octets(*anonymised), true);
            }
        }

        let anonymised = match addr {
            IpAddr::V4(v4) => IpAddr::from(state.cryptopan.anonymise_v4(v4.octets())),
            IpAddr::V6(v6) => IpAddr::from(state.cryptopan.anonymise_v6(v6.octets())),
        };

        if let Some(ref cache) = state.cache {
            let mut cache = cache.lock().unwrap();
            let evicting = cache.len() == usize::from(cache.cap()) && !cache.contains(&addr);
            cache.put(addr, anonymised);
            if evicting {
                self.metrics.pseudo_cache_evicted.inc();
            }
        }

        (address_octets(anonymised), true)
    }
}

fn build_state(passphrase: &str, salt: &str, cache_entries: usize) -> Result<State, Error> {
    let key = derive_key(passphrase, salt)?;
    let cache = NonZeroUsize::new(cache_entries)
        .map(|entries| Mutex::new(LruCache::new(entries)));
    Ok(State {
        cryptopan: CryptoPan::new(&key),
        cache,
    })
}

/// Parses raw address octets, unmapping IPv4-mapped IPv6 addresses to
/// their native IPv4 form.
fn parse_address(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            let v6 = std::net::Ipv6Addr::from(octets);
            Some(match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::from(v4),
                None => IpAddr::from(v6),
            })
        }
        _ => None,
    }
}

fn address_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

////////////////////////////////////////////////////////////////////////
// KEY DERIVATION                                                     //
////////////////////////////////////////////////////////////////////////

/// Derives the 32-byte Crypto-PAn key from the operator-supplied
/// passphrase and salt with argon2id (time = 1, memory = 64 MiB,
/// parallelism = 4). The passphrase can be of any length; the KDF
/// always yields the 32 bytes the AES construction expects.
fn derive_key(passphrase: &str, salt: &str) -> Result<[u8; 32], Error> {
    let params =
        argon2::Params::new(64 * 1024, 1, 4, Some(32)).map_err(Error::Kdf)?;
    let kdf = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = [0u8; 32];
    kdf.hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key)
        .map_err(Error::Kdf)?;
    Ok(key)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for pseudonymiser construction.
#[derive(Debug)]
pub enum Error {
    /// Key derivation failed (e.g. a salt shorter than the KDF's
    /// minimum).
    Kdf(argon2::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Kdf(err) => write!(f, "key derivation failed: {}", err),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
