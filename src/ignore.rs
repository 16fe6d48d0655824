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

//! The client-address ignore set.
//!
//! Operators can list IP prefixes whose clients must not contribute to
//! any output. The set is rebuilt from its file and swapped in
//! atomically, both at startup and on live reload.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::RwLock;

use ipnet::IpNet;
use log::info;

////////////////////////////////////////////////////////////////////////
// THE IGNORE SET                                                     //
////////////////////////////////////////////////////////////////////////

/// The verdict of an ignore-set membership check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The record may proceed.
    Allowed,

    /// The client address is in the ignore set.
    Ignored,

    /// An ignore set is active but the client address failed to parse.
    /// Treated as ignored, conservatively.
    ParseFailure,
}

/// A reloadable set of ignored client IP prefixes.
///
/// An empty set allows everything without parsing the address; a
/// non-empty set conservatively treats unparseable addresses as
/// ignored.
pub struct IgnoreSet {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// `None` when no prefixes are configured.
    prefixes: Option<Vec<IpNet>>,
    num_prefixes: u64,
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IgnoreSet {
    /// Creates a new, empty `IgnoreSet`.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Rebuilds the set from `path` and swaps it in. A `path` of `None`
    /// clears the set. Empty lines and `#` comments are skipped; every
    /// other line must be a CIDR prefix. On error the previous set is
    /// left in place.
    pub fn load(&self, path: Option<&Path>) -> Result<(), Error> {
        let path = match path {
            Some(path) => path,
            None => {
                *self.inner.write().unwrap() = Inner::default();
                return Ok(());
            }
        };

        let file = File::open(path).map_err(Error::Io)?;
        let mut prefixes = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let prefix: IpNet = line
                .parse()
                .map_err(|_| Error::BadPrefix(line.to_owned()))?;
            prefixes.push(prefix);
        }

        let num_prefixes = prefixes.len() as u64;
        let inner = Inner {
            prefixes: if prefixes.is_empty() {
                None
            } else {
                Some(prefixes)
            },
            num_prefixes,
        };
        let loaded = inner.prefixes.is_some();
        *self.inner.write().unwrap() = inner;

        if loaded {
            info!(
                "client ignore list loaded from {} ({} prefixes)",
                path.display(),
                num_prefixes,
            );
        } else {
            info!(
                "client ignore list {} is empty, no clients will be ignored",
                path.display(),
            );
        }
        Ok(())
    }

    /// Checks the raw client address octets against the set.
    pub fn check(&self, raw: &[u8]) -> Verdict {
        let inner = self.inner.read().unwrap();
        let prefixes = match inner.prefixes {
            Some(ref prefixes) => prefixes,
            None => return Verdict::Allowed,
        };

        let addr = match parse_address(raw) {
            Some(addr) => addr,
            None => return Verdict::ParseFailure,
        };

        if prefixes.iter().any(|prefix| prefix.contains(&addr)) {
            Verdict::Ignored
        } else {
            Verdict::Allowed
        }
    }

    /// Returns the number of prefixes currently loaded.
    pub fn num_prefixes(&self) -> u64 {
        self.inner.read().unwrap().num_prefixes
    }
}

/// Parses raw address octets, unmapping IPv4-mapped IPv6 addresses so
/// that a v4 prefix also matches clients arriving over mapped sockets.
fn parse_address(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            let v6 = Ipv6Addr::from(octets);
            Some(match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::from(v4),
                None => IpAddr::from(v6),
            })
        }
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for ignore-set loading.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BadPrefix(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "unable to read the ignore list: {}", err),
            Self::BadPrefix(line) => write!(f, "invalid ignored prefix '{}'", line),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
