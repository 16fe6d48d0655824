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

//! Implementation of the [`Reader`] for parsing DNS messages.

use std::fmt;

use super::{Header, Qclass, Qtype, Question};
use crate::name::{self, Name};

/// The maximum number of compression pointers followed while reading a
/// single name. Since every pointer must point strictly backwards, this
/// is already bounded by the message size; the explicit limit merely
/// keeps pathological messages cheap to reject.
const MAX_POINTERS: usize = 64;

////////////////////////////////////////////////////////////////////////
// READER                                                             //
////////////////////////////////////////////////////////////////////////

/// A reader to parse DNS messages.
///
/// A `Reader` wraps a buffer containing a DNS message and maintains a
/// cursor into it. Data is read from the message through the `read_*`
/// methods, which advance the cursor on success.
pub struct Reader<'a> {
    octets: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new `Reader` over `octets` with the cursor at the
    /// start of the message.
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, cursor: 0 }
    }

    /// Reads the twelve-octet message header.
    pub fn read_header(&mut self) -> Result<Header, Error> {
        Ok(Header {
            id: self.read_u16()?,
            flags: self.read_u16()?,
            qdcount: self.read_u16()?,
            ancount: self.read_u16()?,
            nscount: self.read_u16()?,
            arcount: self.read_u16()?,
        })
    }

    /// Reads a question section entry at the cursor.
    pub fn read_question(&mut self) -> Result<Question, Error> {
        let name = self.read_name()?;
        let qtype = Qtype(self.read_u16()?);
        let qclass = Qclass(self.read_u16()?);
        Ok(Question {
            name,
            qtype,
            qclass,
        })
    }

    /// Reads a (possibly compressed) domain name at the cursor.
    ///
    /// Compression pointers ([RFC 1035 § 4.1.4]) must point strictly
    /// backwards; after following a pointer, the cursor is left just
    /// past the pointer itself.
    ///
    /// [RFC 1035 § 4.1.4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
    fn read_name(&mut self) -> Result<Name, Error> {
        let mut raw_labels: Vec<&'a [u8]> = Vec::new();
        let mut pos = self.cursor;
        let mut cursor_after = None;
        let mut pointers = 0;

        loop {
            let len_octet = *self.octets.get(pos).ok_or(Error::UnexpectedEom)?;
            match len_octet & 0xc0 {
                0xc0 => {
                    let second = *self.octets.get(pos + 1).ok_or(Error::UnexpectedEom)?;
                    let target = ((len_octet & 0x3f) as usize) << 8 | second as usize;
                    if target >= pos {
                        return Err(Error::BadPointer);
                    }
                    pointers += 1;
                    if pointers > MAX_POINTERS {
                        return Err(Error::TooManyPointers);
                    }
                    cursor_after.get_or_insert(pos + 2);
                    pos = target;
                }
                0x00 => {
                    if len_octet == 0 {
                        cursor_after.get_or_insert(pos + 1);
                        break;
                    }
                    let len = len_octet as usize;
                    let start = pos + 1;
                    let label = self
                        .octets
                        .get(start..start + len)
                        .ok_or(Error::UnexpectedEom)?;
                    raw_labels.push(label);
                    pos = start + len;
                }
                _ => return Err(Error::BadLabelType),
            }
        }

        // cursor_after is always set by the time the loop breaks.
        self.cursor = cursor_after.unwrap_or(self.cursor);
        Name::try_from_raw_labels(&raw_labels).map_err(Error::BadName)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let octets = self
            .octets
            .get(self.cursor..self.cursor + 2)
            .ok_or(Error::UnexpectedEom)?;
        self.cursor += 2;
        Ok(u16::from_be_bytes([octets[0], octets[1]]))
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for DNS message parsing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The end of the message was reached mid-field.
    UnexpectedEom,

    /// A compression pointer does not point strictly backwards.
    BadPointer,

    /// Too many compression pointers were followed.
    TooManyPointers,

    /// A label began with the reserved `0b01`/`0b10` type bits.
    BadLabelType,

    /// The question name is not a valid domain name.
    BadName(name::Error),

    /// The question section is empty.
    NoQuestion,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEom => f.write_str("unexpected end of message"),
            Self::BadPointer => f.write_str("invalid compression pointer"),
            Self::TooManyPointers => f.write_str("too many compression pointers"),
            Self::BadLabelType => f.write_str("unknown label type"),
            Self::BadName(err) => write!(f, "invalid question name: {}", err),
            Self::NoQuestion => f.write_str("the question section is empty"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::parse_header_and_question;
    use super::*;

    /// A NOERROR response to `www.example.com. IN A` with one (unread)
    /// answer record.
    fn response_fixture() -> Vec<u8> {
        let mut octets = vec![
            0x12, 0x34, // ID
            0x81, 0x80, // QR=1, RD=1, RA=1, RCODE=0
            0x00, 0x01, // QDCOUNT
            0x00, 0x01, // ANCOUNT
            0x00, 0x00, // NSCOUNT
            0x00, 0x00, // ARCOUNT
        ];
        octets.extend_from_slice(b"\x03www\x07example\x03com\x00");
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE, QCLASS
        octets
    }

    #[test]
    fn parse_header_and_question_works() {
        let octets = response_fixture();
        let (header, question) = parse_header_and_question(&octets).unwrap();
        assert!(header.is_response());
        assert_eq!(header.ancount, 1);
        assert_eq!(question.name.as_str(), "www.example.com.");
        assert_eq!(question.qtype, Qtype::A);
        assert_eq!(question.qclass, Qclass::IN);
    }

    #[test]
    fn uppercase_names_are_lowercased() {
        let mut octets = response_fixture();
        octets[12..29].copy_from_slice(b"\x03WWW\x07EXAMPLE\x03COM\x00");
        let (_, question) = parse_header_and_question(&octets).unwrap();
        assert_eq!(question.name.as_str(), "www.example.com.");
    }

    #[test]
    fn compressed_names_are_followed() {
        // A contrived message whose question name is a pointer to a
        // name stored immediately after the header would be invalid (a
        // question is the first thing in a real message), so instead
        // append a second name that points back into the question.
        let mut octets = response_fixture();
        let start = octets.len();
        octets.extend_from_slice(b"\x04mail\xc0\x10"); // mail + pointer to "example.com."
        let mut reader = Reader::new(&octets);
        reader.cursor = start;
        let name = reader.read_name().unwrap();
        assert_eq!(name.as_str(), "mail.example.com.");
        assert_eq!(reader.cursor, octets.len());
    }

    #[test]
    fn forward_pointers_are_rejected() {
        let mut octets = response_fixture();
        let start = octets.len();
        octets.extend_from_slice(&[0xc0, 0xff]);
        let mut reader = Reader::new(&octets);
        reader.cursor = start;
        assert_eq!(reader.read_name(), Err(Error::BadPointer));
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let octets = response_fixture();
        assert_eq!(
            parse_header_and_question(&octets[..11]),
            Err(Error::UnexpectedEom),
        );
        assert_eq!(
            parse_header_and_question(&octets[..20]),
            Err(Error::UnexpectedEom),
        );
    }

    #[test]
    fn empty_question_sections_are_rejected() {
        let mut octets = response_fixture();
        octets[5] = 0; // QDCOUNT = 0
        assert_eq!(
            parse_header_and_question(&octets),
            Err(Error::NoQuestion),
        );
    }
}
