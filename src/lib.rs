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

//! The dnscrub DNS telemetry minimiser.
//!
//! dnscrub ingests a stream of DNS transaction records captured at a
//! resolver, pseudonymises client and server addresses, classifies
//! each record against a curated list of well-known domains, and emits
//! three privacy-preserving output streams:
//!
//! * per-minute histogram files of well-known-domain activity,
//!   uploaded over signed HTTP ([`sender`]);
//! * one-off new-qname events for never-before-seen names, signed and
//!   published over MQTT ([`publish`]);
//! * per-minute session files of truncated transaction metadata
//!   ([`output`]).
//!
//! The pipeline is a set of threads connected by bounded channels: the
//! frame [`input`] listeners feed the [`minimiser`] workers, which
//! dispatch classified records to the single-threaded aggregation
//! [`collector`]; writers and senders consume the collector's
//! per-minute snapshots. See the `dnscrubd` binary for the wiring.

pub mod cleaner;
pub mod collector;
pub mod dictionary;
pub mod events;
pub mod frame;
pub mod hll;
pub mod httpsig;
pub mod ignore;
pub mod input;
pub mod message;
pub mod metrics;
pub mod minimiser;
pub mod name;
pub mod output;
pub mod pseudo;
pub mod publish;
pub mod seen;
pub mod sender;
pub mod thread;
pub mod tls;
pub mod tracker;
pub mod util;
pub mod watcher;
