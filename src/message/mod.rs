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

//! DNS message header and question parsing.
//!
//! The minimiser decodes only the parts of a DNS message that the
//! analytics need: the header (for the QR bit and the RCODE) and the
//! first entry of the question section (for the QNAME, QTYPE, and
//! QCLASS). Everything past the question section is deliberately left
//! untouched.

mod rcode;
mod reader;

pub use rcode::Rcode;
pub use reader::{Error, Reader};

use std::fmt;

use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// HEADER                                                             //
////////////////////////////////////////////////////////////////////////

/// The fixed twelve-octet DNS message header ([RFC 1035 § 4.1.1]).
///
/// [RFC 1035 § 4.1.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub id: u16,

    /// The complete sixteen-bit flag field (QR, Opcode, AA, TC, RD, RA,
    /// Z, and RCODE).
    pub flags: u16,

    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Returns whether the QR bit is set (i.e., whether this is a
    /// response).
    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Returns the RCODE field of the header, classified.
    pub fn rcode(&self) -> Rcode {
        Rcode::from((self.flags & 0xf) as u8)
    }
}

////////////////////////////////////////////////////////////////////////
// QUESTION                                                           //
////////////////////////////////////////////////////////////////////////

/// An entry of a DNS message's question section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub name: Name,
    pub qtype: Qtype,
    pub qclass: Qclass,
}

/// The QTYPE of a DNS question.
///
/// A QTYPE is represented on the wire as an unsigned 16-bit integer.
/// Hence this is basically a wrapper around `u16`, with constants for
/// the types the histogram counters distinguish.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Qtype(pub u16);

impl Qtype {
    pub const A: Qtype = Qtype(1);
    pub const NS: Qtype = Qtype(2);
    pub const MX: Qtype = Qtype(15);
    pub const AAAA: Qtype = Qtype(28);
}

impl From<Qtype> for u16 {
    fn from(qtype: Qtype) -> Self {
        qtype.0
    }
}

impl fmt::Display for Qtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::A => f.write_str("A"),
            Self::NS => f.write_str("NS"),
            Self::MX => f.write_str("MX"),
            Self::AAAA => f.write_str("AAAA"),
            Self(value) => write!(f, "TYPE{}", value),
        }
    }
}

/// The QCLASS of a DNS question.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Qclass(pub u16);

impl Qclass {
    pub const IN: Qclass = Qclass(1);
}

impl From<Qclass> for u16 {
    fn from(qclass: Qclass) -> Self {
        qclass.0
    }
}

impl fmt::Display for Qclass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self(value) => write!(f, "CLASS{}", value),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// MESSAGE-LEVEL CONVENIENCE                                          //
////////////////////////////////////////////////////////////////////////

/// Parses the header and first question of the DNS message in `octets`.
///
/// Fails if the message is truncated, if the question section is empty,
/// or if the question name is not a valid domain name.
pub fn parse_header_and_question(octets: &[u8]) -> Result<(Header, Question), Error> {
    let mut reader = Reader::new(octets);
    let header = reader.read_header()?;
    if header.qdcount == 0 {
        return Err(Error::NoQuestion);
    }
    let question = reader.read_question()?;
    Ok((header, question))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
