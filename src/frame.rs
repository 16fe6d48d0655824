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

//! The transaction record and its framed wire encoding.
//!
//! Resolvers deliver one [`TransactionRecord`] per observed DNS
//! transaction, framed as a 32-bit big-endian length prefix followed by
//! a versioned payload. The payload begins with a fixed part (version,
//! record kind, socket family, transport, and a presence bitmap) and is
//! followed by the optional fields announced in the bitmap, in bitmap
//! bit order.

use std::fmt;
use std::io::{self, Read, Write};

use serde::Serialize;

/// The wire format version understood by this decoder.
const FORMAT_VERSION: u8 = 1;

/// The maximum accepted frame payload length. Frames carry at most two
/// DNS messages (64 KiB each) plus small fixed metadata, so anything
/// near this bound is garbage.
pub const MAX_FRAME_LEN: u32 = 1 << 18;

////////////////////////////////////////////////////////////////////////
// TRANSACTION RECORDS                                                //
////////////////////////////////////////////////////////////////////////

/// One captured DNS transaction, as delivered by the resolver.
///
/// The query address/port describe the client side of the transaction
/// and the response address/port the server side, regardless of the
/// record kind. Until the record has passed through the pseudonymiser,
/// the address fields hold real client data and must be treated as
/// sensitive.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub kind: RecordKind,
    pub family: SocketFamily,
    pub transport: Transport,
    pub query_address: Option<Vec<u8>>,
    pub query_port: Option<u16>,
    pub response_address: Option<Vec<u8>>,
    pub response_port: Option<u16>,
    pub query_time_sec: Option<i64>,
    pub query_time_nsec: Option<u32>,
    pub response_time_sec: Option<i64>,
    pub response_time_nsec: Option<u32>,
    pub identity: Option<Vec<u8>>,
    pub query_message: Option<Vec<u8>>,
    pub response_message: Option<Vec<u8>>,
}

/// Whether a record describes the query or the response side of a
/// transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[default]
    Query,
    Response,
}

/// The address family of the transaction's socket.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketFamily {
    #[default]
    V4,
    V6,
}

/// The DNS transport of the transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Dot,
    Doh,
    Doq,
}

impl Transport {
    /// Returns the numeric tag written to session files.
    pub fn tag(self) -> u8 {
        match self {
            Self::Udp => 1,
            Self::Tcp => 2,
            Self::Dot => 3,
            Self::Doh => 4,
            Self::Doq => 5,
        }
    }
}

/// Presence bits of the payload bitmap, in field order.
mod presence {
    pub const QUERY_ADDRESS: u16 = 1 << 0;
    pub const QUERY_PORT: u16 = 1 << 1;
    pub const RESPONSE_ADDRESS: u16 = 1 << 2;
    pub const RESPONSE_PORT: u16 = 1 << 3;
    pub const QUERY_TIME: u16 = 1 << 4;
    pub const RESPONSE_TIME: u16 = 1 << 5;
    pub const IDENTITY: u16 = 1 << 6;
    pub const QUERY_MESSAGE: u16 = 1 << 7;
    pub const RESPONSE_MESSAGE: u16 = 1 << 8;

    pub const ALL: u16 = (1 << 9) - 1;
}

impl TransactionRecord {
    /// Decodes a frame payload into a `TransactionRecord`.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = PayloadReader {
            octets: payload,
            cursor: 0,
        };

        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnknownVersion(version));
        }

        let kind = match reader.read_u8()? {
            1 => RecordKind::Query,
            2 => RecordKind::Response,
            value => return Err(Error::UnknownKind(value)),
        };
        let family = match reader.read_u8()? {
            1 => SocketFamily::V4,
            2 => SocketFamily::V6,
            value => return Err(Error::UnknownFamily(value)),
        };
        let transport = match reader.read_u8()? {
            1 => Transport::Udp,
            2 => Transport::Tcp,
            3 => Transport::Dot,
            4 => Transport::Doh,
            5 => Transport::Doq,
            value => return Err(Error::UnknownTransport(value)),
        };
        let bitmap = reader.read_u16()?;
        if bitmap & !presence::ALL != 0 {
            return Err(Error::UnknownPresenceBits(bitmap));
        }

        let mut record = Self {
            kind,
            family,
            transport,
            ..Self::default()
        };
        if bitmap & presence::QUERY_ADDRESS != 0 {
            record.query_address = Some(reader.read_short_octets()?);
        }
        if bitmap & presence::QUERY_PORT != 0 {
            record.query_port = Some(reader.read_u16()?);
        }
        if bitmap & presence::RESPONSE_ADDRESS != 0 {
            record.response_address = Some(reader.read_short_octets()?);
        }
        if bitmap & presence::RESPONSE_PORT != 0 {
            record.response_port = Some(reader.read_u16()?);
        }
        if bitmap & presence::QUERY_TIME != 0 {
            record.query_time_sec = Some(reader.read_i64()?);
            record.query_time_nsec = Some(reader.read_u32()?);
        }
        if bitmap & presence::RESPONSE_TIME != 0 {
            record.response_time_sec = Some(reader.read_i64()?);
            record.response_time_nsec = Some(reader.read_u32()?);
        }
        if bitmap & presence::IDENTITY != 0 {
            record.identity = Some(reader.read_long_octets()?);
        }
        if bitmap & presence::QUERY_MESSAGE != 0 {
            record.query_message = Some(reader.read_long_octets()?);
        }
        if bitmap & presence::RESPONSE_MESSAGE != 0 {
            record.response_message = Some(reader.read_long_octets()?);
        }
        if reader.cursor != payload.len() {
            return Err(Error::TrailingOctets);
        }
        Ok(record)
    }

    /// Encodes the record into a frame payload (without the length
    /// prefix). The inverse of [`TransactionRecord::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut bitmap = 0u16;
        if self.query_address.is_some() {
            bitmap |= presence::QUERY_ADDRESS;
        }
        if self.query_port.is_some() {
            bitmap |= presence::QUERY_PORT;
        }
        if self.response_address.is_some() {
            bitmap |= presence::RESPONSE_ADDRESS;
        }
        if self.response_port.is_some() {
            bitmap |= presence::RESPONSE_PORT;
        }
        if self.query_time_sec.is_some() {
            bitmap |= presence::QUERY_TIME;
        }
        if self.response_time_sec.is_some() {
            bitmap |= presence::RESPONSE_TIME;
        }
        if self.identity.is_some() {
            bitmap |= presence::IDENTITY;
        }
        if self.query_message.is_some() {
            bitmap |= presence::QUERY_MESSAGE;
        }
        if self.response_message.is_some() {
            bitmap |= presence::RESPONSE_MESSAGE;
        }

        let mut payload = Vec::with_capacity(64);
        payload.push(FORMAT_VERSION);
        payload.push(match self.kind {
            RecordKind::Query => 1,
            RecordKind::Response => 2,
        });
        payload.push(match self.family {
            SocketFamily::V4 => 1,
            SocketFamily::V6 => 2,
        });
        payload.push(self.transport.tag());
        payload.extend_from_slice(&bitmap.to_be_bytes());

        if let Some(ref octets) = self.query_address {
            payload.push(octets.len() as u8);
            payload.extend_from_slice(octets);
        }
        if let Some(port) = self.query_port {
            payload.extend_from_slice(&port.to_be_bytes());
        }
        if let Some(ref octets) = self.response_address {
            payload.push(octets.len() as u8);
            payload.extend_from_slice(octets);
        }
        if let Some(port) = self.response_port {
            payload.extend_from_slice(&port.to_be_bytes());
        }
        if let Some(sec) = self.query_time_sec {
            payload.extend_from_slice(&sec.to_be_bytes());
            payload.extend_from_slice(&self.query_time_nsec.unwrap_or(0).to_be_bytes());
        }
        if let Some(sec) = self.response_time_sec {
            payload.extend_from_slice(&sec.to_be_bytes());
            payload.extend_from_slice(&self.response_time_nsec.unwrap_or(0).to_be_bytes());
        }
        for octets in [&self.identity, &self.query_message, &self.response_message]
            .into_iter()
            .flatten()
        {
            payload.extend_from_slice(&(octets.len() as u16).to_be_bytes());
            payload.extend_from_slice(octets);
        }

        payload
    }
}

/// A cursor over a frame payload.
struct PayloadReader<'a> {
    octets: &'a [u8],
    cursor: usize,
}

impl PayloadReader<'_> {
    fn read_u8(&mut self) -> Result<u8, Error> {
        let octet = *self.octets.get(self.cursor).ok_or(Error::UnexpectedEof)?;
        self.cursor += 1;
        Ok(octet)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let octets = self
            .octets
            .get(self.cursor..self.cursor + N)
            .ok_or(Error::UnexpectedEof)?;
        self.cursor += N;
        Ok(octets.try_into().unwrap())
    }

    /// Reads an octet string with a one-octet length prefix (used for
    /// addresses).
    fn read_short_octets(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u8()? as usize;
        self.read_octets(len)
    }

    /// Reads an octet string with a two-octet length prefix (used for
    /// identities and DNS messages).
    fn read_long_octets(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u16()? as usize;
        self.read_octets(len)
    }

    fn read_octets(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let octets = self
            .octets
            .get(self.cursor..self.cursor + len)
            .ok_or(Error::UnexpectedEof)?;
        self.cursor += len;
        Ok(octets.to_vec())
    }
}

////////////////////////////////////////////////////////////////////////
// STREAM FRAMING                                                     //
////////////////////////////////////////////////////////////////////////

/// Reads one length-prefixed frame payload from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before any prefix
/// octet). An EOF in the middle of a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, Error> {
    let mut prefix = [0u8; 4];
    match reader.read(&mut prefix[..1]) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(err) => return Err(Error::Io(err)),
    }
    reader.read_exact(&mut prefix[1..]).map_err(Error::Io)?;

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(Error::Io)?;
    Ok(Some(payload))
}

/// Writes one length-prefixed frame payload to `writer`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for frame decoding and stream framing.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    FrameTooLarge(u32),
    UnexpectedEof,
    UnknownVersion(u8),
    UnknownKind(u8),
    UnknownFamily(u8),
    UnknownTransport(u8),
    UnknownPresenceBits(u16),
    TrailingOctets,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::FrameTooLarge(len) => write!(f, "frame length {} exceeds the limit", len),
            Self::UnexpectedEof => f.write_str("unexpected end of frame"),
            Self::UnknownVersion(v) => write!(f, "unknown frame format version {}", v),
            Self::UnknownKind(v) => write!(f, "unknown record kind {}", v),
            Self::UnknownFamily(v) => write!(f, "unknown socket family {}", v),
            Self::UnknownTransport(v) => write!(f, "unknown transport {}", v),
            Self::UnknownPresenceBits(bits) => {
                write!(f, "unknown presence bits in bitmap {:#06x}", bits)
            }
            Self::TrailingOctets => f.write_str("trailing octets after the last field"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    pub(crate) fn response_record() -> TransactionRecord {
        TransactionRecord {
            kind: RecordKind::Response,
            family: SocketFamily::V4,
            transport: Transport::Udp,
            query_address: Some(vec![192, 0, 2, 7]),
            query_port: Some(54321),
            response_address: Some(vec![198, 51, 100, 1]),
            response_port: Some(53),
            response_time_sec: Some(1_700_000_000),
            response_time_nsec: Some(250_000_000),
            identity: Some(b"resolver-1".to_vec()),
            response_message: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            ..TransactionRecord::default()
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let record = response_record();
        let decoded = TransactionRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);

        let minimal = TransactionRecord {
            kind: RecordKind::Query,
            family: SocketFamily::V6,
            transport: Transport::Tcp,
            ..TransactionRecord::default()
        };
        let decoded = TransactionRecord::decode(&minimal.encode()).unwrap();
        assert_eq!(decoded, minimal);
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let payload = response_record().encode();
        for len in 0..payload.len() {
            assert!(TransactionRecord::decode(&payload[..len]).is_err());
        }
    }

    #[test]
    fn unknown_fixed_fields_are_rejected() {
        let mut payload = response_record().encode();
        payload[0] = 99;
        assert!(matches!(
            TransactionRecord::decode(&payload),
            Err(Error::UnknownVersion(99)),
        ));

        let mut payload = response_record().encode();
        payload[3] = 77;
        assert!(matches!(
            TransactionRecord::decode(&payload),
            Err(Error::UnknownTransport(77)),
        ));
    }

    #[test]
    fn trailing_octets_are_rejected() {
        let mut payload = response_record().encode();
        payload.push(0);
        assert!(matches!(
            TransactionRecord::decode(&payload),
            Err(Error::TrailingOctets),
        ));
    }

    #[test]
    fn stream_framing_round_trips() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"first").unwrap();
        write_frame(&mut stream, b"second").unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"second");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = Cursor::new(stream);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(Error::FrameTooLarge(_)),
        ));
    }
}
