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

//! The new-qname event schema.
//!
//! A new-qname event announces the first observation of a previously
//! unseen domain name. Events are serialised to JSON and signed before
//! publication; the timestamp is truncated to the minute so events do
//! not leak precise observation times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Header, Question};

/// The event schema version.
const EVENT_VERSION: u32 = 0;

/// The event type tag.
const EVENT_TYPE: &str = "new_qname";

////////////////////////////////////////////////////////////////////////
// EVENTS                                                             //
////////////////////////////////////////////////////////////////////////

/// A serialisable new-qname event.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NewQnameEvent {
    pub version: u32,

    #[serde(rename = "type")]
    pub event_type: String,

    /// The observation time, truncated to the start of its minute.
    pub timestamp: DateTime<Utc>,

    /// The observed name, lowercased and dot-terminated.
    pub qname: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub qtype: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub qclass: Option<u16>,

    /// The full sixteen-bit flag field of the response header
    /// (QR/Opcode/AA/TC/RD/RA/Z/RCODE).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u16>,

    /// The RDLENGTH of the first answer record. The minimiser does not
    /// decode past the question section, so it never sets this; the
    /// field exists for schema compatibility with richer producers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdlength: Option<u16>,

    pub initiator: Initiator,
}

/// Who initiated the transaction the event was derived from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Client,
    Resolver,
}

impl NewQnameEvent {
    /// Builds an event from a response's header and question.
    /// `timestamp` must already be truncated to the minute.
    pub fn new(header: &Header, question: &Question, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: EVENT_VERSION,
            event_type: EVENT_TYPE.to_owned(),
            timestamp,
            qname: question.name.as_str().to_owned(),
            qtype: Some(question.qtype.into()),
            qclass: Some(question.qclass.into()),
            flags: Some(header.flags),
            rdlength: None,
            initiator: Initiator::Client,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::message::{Qclass, Qtype};

    #[test]
    fn events_serialise_to_the_expected_json() {
        let header = Header {
            id: 1,
            flags: 0x8180,
            qdcount: 1,
            ancount: 1,
            nscount: 0,
            arcount: 0,
        };
        let question = Question {
            name: "www.known.example.".parse().unwrap(),
            qtype: Qtype::A,
            qclass: Qclass::IN,
        };
        let timestamp = Utc.with_ymd_and_hms(2023, 11, 29, 13, 50, 0).unwrap();
        let event = NewQnameEvent::new(&header, &question, timestamp);

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["version"], 0);
        assert_eq!(json["type"], "new_qname");
        assert_eq!(json["qname"], "www.known.example.");
        assert_eq!(json["qtype"], 1);
        assert_eq!(json["qclass"], 1);
        assert_eq!(json["flags"], 0x8180);
        assert_eq!(json["initiator"], "client");
        assert_eq!(json["timestamp"], "2023-11-29T13:50:00Z");
        assert!(json.get("rdlength").is_none());
    }

    #[test]
    fn events_round_trip_through_json() {
        let header = Header {
            id: 1,
            flags: 0x8183,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        };
        let question = Question {
            name: "a.example.".parse().unwrap(),
            qtype: Qtype::AAAA,
            qclass: Qclass::IN,
        };
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = NewQnameEvent::new(&header, &question, timestamp);
        let reparsed: NewQnameEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(reparsed, event);
    }
}
