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

//! Implementation of the [`Rcode`] type.

use std::fmt;

////////////////////////////////////////////////////////////////////////
// RCODES                                                             //
////////////////////////////////////////////////////////////////////////

/// The RCODE of a response header, as the histogram sees it.
///
/// [RFC 1035 § 4.1.1] defines the RCODE field as a four-bit result
/// code. The minimiser never acts on individual result codes beyond
/// incrementing a counter, and the histogram distinguishes exactly
/// three of them (`ok_count`, `nx_count`, `fail_count`) with a shared
/// bucket for the rest, so this type classifies rather than
/// enumerates: the three counted codes get variants of their own and
/// every other value lands in [`Rcode::Other`], which keeps the raw
/// code for logging.
///
/// EDNS(0) extended RCODEs live in the OPT pseudo-RR, which the
/// minimiser does not decode; only the header's four bits are
/// classified.
///
/// [RFC 1035 § 4.1.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Rcode {
    /// NOERROR (0): the query succeeded.
    NoError,

    /// NXDOMAIN (3): the name does not exist.
    NxDomain,

    /// SERVFAIL (2): the server failed to answer.
    ServFail,

    /// Any other result code, with its four-bit value.
    Other(u8),
}

impl From<u8> for Rcode {
    fn from(value: u8) -> Self {
        // Callers extract the value from the header's flag word; only
        // the low four bits are the RCODE.
        match value & 0xf {
            0 => Self::NoError,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoError => f.write_str("NOERROR"),
            Self::NxDomain => f.write_str("NXDOMAIN"),
            Self::ServFail => f.write_str("SERVFAIL"),
            Self::Other(value) => write!(f, "RCODE{}", value),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
