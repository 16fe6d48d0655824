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

//! Implementation of the [`Name`] structure for domain names.

use std::fmt;
use std::str::FromStr;

/// The maximum number of labels in a domain name.
const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
pub(crate) const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A domain name in canonical presentation form.
///
/// A `Name` stores the lowercased, dot-terminated presentation form of
/// a domain name (`"www.example.com."`; the root is `"."`) together
/// with the byte offset of each label within that text. The whole
/// pipeline keys on this form: it is the lookup key into the well-known
/// dictionary, the key of the first-seen set, and the `qname` of
/// published events.
///
/// Label bytes that are not printable (or that would be ambiguous in
/// presentation form, namely `.` and `\`) are escaped using the
/// RFC 1035 § 5.1 conventions (`\.`, `\\`, `\DDD`), so the presentation
/// form is always valid UTF-8 and round-trips through [`FromStr`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Name {
    text: String,

    /// The byte offset of the start of each label in `text`. Empty for
    /// the root name.
    label_starts: Vec<u16>,
}

impl Name {
    /// Returns the root name, `"."`.
    pub fn root() -> Self {
        Self {
            text: String::from("."),
            label_starts: Vec::new(),
        }
    }

    /// Constructs a `Name` from raw (wire-format) labels, in the order
    /// they appear on the wire (most specific first). The labels are
    /// validated, lowercased, and escaped.
    pub fn try_from_raw_labels<L>(raw_labels: &[L]) -> Result<Self, Error>
    where
        L: AsRef<[u8]>,
    {
        if raw_labels.is_empty() {
            return Ok(Self::root());
        }
        if raw_labels.len() > MAX_N_LABELS {
            return Err(Error::TooManyLabels);
        }

        // The wire length is the sum of each label's length octet and
        // content, plus the final null octet.
        let mut wire_len = 1;
        let mut text = String::new();
        let mut label_starts = Vec::with_capacity(raw_labels.len());
        for raw in raw_labels {
            let raw = raw.as_ref();
            if raw.is_empty() {
                return Err(Error::EmptyLabel);
            }
            if raw.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            wire_len += 1 + raw.len();
            label_starts.push(text.len() as u16);
            push_escaped_label(&mut text, raw);
            text.push('.');
        }
        if wire_len > MAX_WIRE_LEN {
            return Err(Error::NameTooLong);
        }

        Ok(Self { text, label_starts })
    }

    /// Returns the presentation form of the `Name`.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the number of labels in the `Name`. The root name has
    /// zero labels.
    pub fn num_labels(&self) -> usize {
        self.label_starts.len()
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.label_starts.is_empty()
    }

    /// Returns an iterator over the labels of the `Name` in
    /// presentation form, most specific first.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        (0..self.num_labels()).map(|i| self.label(i))
    }

    /// Returns label `i` in presentation form.
    pub fn label(&self, i: usize) -> &str {
        let start = self.label_starts[i] as usize;
        let end = match self.label_starts.get(i + 1) {
            Some(next) => *next as usize - 1,
            None => self.text.len() - 1,
        };
        &self.text[start..end]
    }

    /// Returns an iterator over the dot-prefixed proper suffixes of the
    /// `Name`, longest first. For `"www.example.com."` this yields
    /// `".example.com."` and then `".com."`; the bare root suffix `"."`
    /// is not included.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.label_starts
            .iter()
            .skip(1)
            .map(|start| &self.text[*start as usize - 1..])
    }

    /// Returns the labels of the `Name` reversed (deepest first) and
    /// bounded to at most `max_len` entries.
    ///
    /// If the name has more labels than `max_len`, the deepest labels
    /// occupy their own entries and the surplus leading labels are
    /// joined with dots (deepest of them first) into the final entry.
    /// The root name yields no entries.
    pub fn reverse_labels_bounded(&self, max_len: usize) -> Vec<String> {
        let n = self.num_labels();
        if n == 0 || max_len == 0 {
            return Vec::new();
        }

        let mut reversed = Vec::with_capacity(n.min(max_len));
        let surplus = n.saturating_sub(max_len);

        for i in (surplus + 1..n).rev() {
            reversed.push(self.label(i).to_owned());
        }

        if surplus == 0 {
            reversed.push(self.label(0).to_owned());
        } else {
            let mut joined = String::new();
            for i in (0..=surplus).rev() {
                if !joined.is_empty() {
                    joined.push('.');
                }
                joined.push_str(self.label(i));
            }
            reversed.push(joined);
        }

        reversed
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Appends `raw` to `text` in presentation form: ASCII letters are
/// lowercased, `.` and `\` are backslash-escaped, and bytes outside the
/// printable ASCII range become `\DDD` escapes.
fn push_escaped_label(text: &mut String, raw: &[u8]) {
    for &octet in raw {
        match octet {
            b'.' => text.push_str("\\."),
            b'\\' => text.push_str("\\\\"),
            b'A'..=b'Z' => text.push(octet.to_ascii_lowercase() as char),
            0x21..=0x7e => text.push(octet as char),
            _ => {
                text.push('\\');
                text.push_str(&format!("{:03}", octet));
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// PARSING FROM PRESENTATION FORM                                     //
////////////////////////////////////////////////////////////////////////

impl FromStr for Name {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(Error::Empty);
        }
        if text == "." {
            return Ok(Self::root());
        }

        let mut raw_labels: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        let mut octets = text.bytes();
        let mut saw_trailing_dot = false;
        while let Some(octet) = octets.next() {
            match octet {
                b'.' => {
                    if current.is_empty() {
                        return Err(Error::EmptyLabel);
                    }
                    raw_labels.push(std::mem::take(&mut current));
                    saw_trailing_dot = true;
                    continue;
                }
                b'\\' => match octets.next() {
                    Some(d @ b'0'..=b'9') => {
                        // A \DDD escape: exactly three decimal digits.
                        let (d2, d3) = match (octets.next(), octets.next()) {
                            (Some(d2 @ b'0'..=b'9'), Some(d3 @ b'0'..=b'9')) => (d2, d3),
                            _ => return Err(Error::BadEscape),
                        };
                        let value = (d - b'0') as u32 * 100
                            + (d2 - b'0') as u32 * 10
                            + (d3 - b'0') as u32;
                        if value > 255 {
                            return Err(Error::BadEscape);
                        }
                        current.push(value as u8);
                    }
                    Some(escaped) => current.push(escaped),
                    None => return Err(Error::BadEscape),
                },
                _ => current.push(octet),
            }
            saw_trailing_dot = false;
        }

        // Accept both "example.com." and "example.com".
        if !saw_trailing_dot {
            if current.is_empty() {
                return Err(Error::EmptyLabel);
            }
            raw_labels.push(current);
        }

        Self::try_from_raw_labels(&raw_labels)
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for the construction of [`Name`]s.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Empty,
    EmptyLabel,
    LabelTooLong,
    NameTooLong,
    TooManyLabels,
    BadEscape,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("the name is empty"),
            Self::EmptyLabel => f.write_str("the name contains an empty label"),
            Self::LabelTooLong => f.write_str("the name contains a label longer than 63 octets"),
            Self::NameTooLong => f.write_str("the name exceeds 255 octets on the wire"),
            Self::TooManyLabels => f.write_str("the name contains too many labels"),
            Self::BadEscape => f.write_str("the name contains an invalid escape sequence"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
