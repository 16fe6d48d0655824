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

//! The minimiser workers.
//!
//! Workers pull raw frames off the shared input queue and do the
//! per-record work: decode, filter, pseudonymise, parse the DNS
//! question, classify against the well-known dictionary, and dispatch
//! to the collector, the first-seen tracker, and the session stream.
//! Workers are independent; the input queue is their only
//! synchronisation point. A failed record is logged and skipped, never
//! fatal.

use std::fs::File;
use std::io::Write;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use log::{debug, error, info};

use crate::events::NewQnameEvent;
use crate::frame::{RecordKind, SocketFamily, TransactionRecord};
use crate::ignore::{IgnoreSet, Verdict};
use crate::message;
use crate::metrics::Metrics;
use crate::output::{SessionRow, LABEL_SLOTS};
use crate::pseudo::Pseudonymiser;
use crate::seen::SeenNames;
use crate::thread::ShutdownToken;
use crate::tracker::{DomainTracker, Update};
use crate::util::truncate_to_minute;

////////////////////////////////////////////////////////////////////////
// WORKER CONTEXT                                                     //
////////////////////////////////////////////////////////////////////////

/// The shared components every worker needs. One instance is built at
/// startup and shared by reference; nothing here points back at its
/// owner.
pub struct WorkerContext {
    pub metrics: Arc<Metrics>,
    pub pseudonymiser: Arc<Pseudonymiser>,
    pub ignore: Arc<IgnoreSet>,
    pub tracker: Arc<DomainTracker>,
    pub seen: Arc<SeenNames>,

    /// The debug capture sink. Records written here are
    /// pre-pseudonymisation and sensitive; the file is only opened on
    /// explicit operator request.
    pub capture: Option<Mutex<File>>,

    pub session_files_disabled: bool,
    pub publisher_enabled: bool,
}

/// The per-worker channel ends.
pub struct WorkerChannels {
    pub frames: Receiver<Vec<u8>>,
    pub updates: Sender<Update>,
    pub sessions: Sender<SessionRow>,
    pub new_qnames: Sender<NewQnameEvent>,
}

////////////////////////////////////////////////////////////////////////
// THE WORKER LOOP                                                    //
////////////////////////////////////////////////////////////////////////

/// Runs one minimiser worker until shutdown or input exhaustion.
pub fn run_minimiser(
    id: usize,
    context: Arc<WorkerContext>,
    channels: WorkerChannels,
    token: ShutdownToken,
) {
    info!("minimiser worker {} starting", id);
    loop {
        select! {
            recv(channels.frames) -> frame => match frame {
                Ok(frame) => process_frame(id, &context, &channels, &frame),
                Err(_) => break,
            },
            recv(token.receiver()) -> _ => break,
        }
    }
    info!("minimiser worker {} exiting", id);
}

/// Processes one raw frame. Every early return is a skipped record.
fn process_frame(
    id: usize,
    context: &WorkerContext,
    channels: &WorkerChannels,
    frame: &[u8],
) {
    context.metrics.processed_frames.inc();

    let mut record = match TransactionRecord::decode(frame) {
        Ok(record) => record,
        Err(err) => {
            error!("worker {}: unable to decode a frame: {}", id, err);
            return;
        }
    };

    // Only response records feed analytics.
    if record.kind == RecordKind::Query {
        return;
    }

    if let Some(ref capture) = context.capture {
        write_capture(capture, &record);
    }

    match context
        .ignore
        .check(record.query_address.as_deref().unwrap_or(&[]))
    {
        Verdict::Allowed => {}
        Verdict::Ignored => {
            context.metrics.ignored_client.inc();
            return;
        }
        Verdict::ParseFailure => {
            error!(
                "worker {}: unable to parse the client address for ignore \
                 checking, dropping the record to be safe",
                id,
            );
            context.metrics.ignored_client_error.inc();
            return;
        }
    }

    // Keep the original client octets for cardinality classification.
    // They are sensitive; they are hashed into the update and never
    // retained beyond this function.
    let real_client = record.query_address.clone();

    pseudonymise_record(context, &mut record);

    let wire = match record.response_message {
        Some(ref wire) => wire,
        None => {
            error!("worker {}: response record without a response message", id);
            return;
        }
    };
    let (header, question) = match message::parse_header_and_question(wire) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!("worker {}: unable to parse the DNS message: {}", id, err);
            return;
        }
    };

    // All outward timestamps are truncated to the minute.
    let truncated = truncate_to_minute(response_time(&record));

    if let Some(hit) = context.tracker.lookup(&question.name) {
        let update = Update::new(hit, &question, header.rcode(), real_client.as_deref());
        // A blocking send propagates backpressure to the input queue.
        if channels.updates.send(update).is_err() {
            debug!("worker {}: the collector is gone", id);
        }
        return;
    }

    if !context.seen.seen(&question.name) && context.publisher_enabled {
        let event = NewQnameEvent::new(&header, &question, truncated);
        match channels.new_qnames.try_send(event) {
            Ok(()) => context.metrics.new_qname_queued.inc(),
            Err(TrySendError::Full(_)) => context.metrics.new_qname_discarded.inc(),
            Err(TrySendError::Disconnected(_)) => {
                context.metrics.new_qname_discarded.inc();
            }
        }
    }

    if !context.session_files_disabled {
        let row = build_session_row(&record, &question, truncated);
        if channels.sessions.send(row).is_err() {
            debug!("worker {}: the collector is gone", id);
        }
    }
}

/// Pseudonymises both address fields in place.
fn pseudonymise_record(context: &WorkerContext, record: &mut TransactionRecord) {
    for address in [&mut record.query_address, &mut record.response_address] {
        if let Some(octets) = address.as_mut() {
            let (anonymised, ok) = context.pseudonymiser.anonymise(octets);
            if !ok {
                error!("unable to pseudonymise an address, using a zeroed one");
            }
            *octets = anonymised;
        }
    }
}

/// Returns the record's response timestamp, falling back to the
/// current time when the resolver did not provide one.
fn response_time(record: &TransactionRecord) -> DateTime<Utc> {
    record
        .response_time_sec
        .and_then(|sec| {
            DateTime::from_timestamp(sec, record.response_time_nsec.unwrap_or(0))
        })
        .unwrap_or_else(Utc::now)
}

/// Appends the (sensitive, pre-pseudonymisation) record to the debug
/// capture sink as a JSON line. The sink is deliberately unbuffered so
/// it tracks the live traffic while debugging.
fn write_capture(capture: &Mutex<File>, record: &TransactionRecord) {
    let mut file = capture.lock().unwrap();
    let result = serde_json::to_writer(&mut *file, record)
        .map_err(std::io::Error::from)
        .and_then(|_| file.write_all(b"\n"));
    if let Err(err) = result {
        error!("unable to write to the debug capture file: {}", err);
    }
}

////////////////////////////////////////////////////////////////////////
// SESSION ROWS                                                       //
////////////////////////////////////////////////////////////////////////

/// Builds the session row for one (already pseudonymised) response.
fn build_session_row(
    record: &TransactionRecord,
    question: &message::Question,
    truncated: DateTime<Utc>,
) -> SessionRow {
    let mut row = SessionRow {
        source_port: record.query_port.map(i32::from),
        dest_port: record.response_port.map(i32::from),
        dns_protocol: Some(i32::from(record.transport.tag())),
        response_time: Some(truncated.timestamp_micros()),
        response_message: record.response_message.clone(),
        server_id: record.identity.clone(),
        ..SessionRow::default()
    };

    for (slot, label) in row
        .labels
        .iter_mut()
        .zip(question.name.reverse_labels_bounded(LABEL_SLOTS))
    {
        *slot = Some(label);
    }

    match record.family {
        SocketFamily::V4 => {
            row.source_ipv4 = record.query_address.as_deref().and_then(address_v4_bits);
            row.dest_ipv4 = record.response_address.as_deref().and_then(address_v4_bits);
        }
        SocketFamily::V6 => {
            if let Some((network, host)) =
                record.query_address.as_deref().and_then(address_v6_halves)
            {
                row.source_ipv6_network = Some(network);
                row.source_ipv6_host = Some(host);
            }
            if let Some((network, host)) = record
                .response_address
                .as_deref()
                .and_then(address_v6_halves)
            {
                row.dest_ipv6_network = Some(network);
                row.dest_ipv6_host = Some(host);
            }
        }
    }

    row
}

/// Interprets address octets as an IPv4 address (unmapping
/// IPv4-mapped IPv6) and returns its 32 bits.
fn address_v4_bits(octets: &[u8]) -> Option<i32> {
    let v4: [u8; 4] = match octets.len() {
        4 => octets.try_into().ok()?,
        16 => {
            let v6 = Ipv6Addr::from(<[u8; 16]>::try_from(octets).ok()?);
            v6.to_ipv4_mapped()?.octets()
        }
        _ => return None,
    };
    Some(u32::from_be_bytes(v4) as i32)
}

/// Splits IPv6 address octets into their network and host halves.
fn address_v6_halves(octets: &[u8]) -> Option<(i64, i64)> {
    let octets: [u8; 16] = octets.try_into().ok()?;
    let network = u64::from_be_bytes(octets[..8].try_into().ok()?);
    let host = u64::from_be_bytes(octets[8..].try_into().ok()?);
    Some((network as i64, host as i64))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;
    use crate::dictionary::{write_dictionary_file, Dictionary};
    use crate::frame::Transport;
    use crate::message::{Qclass, Qtype};

    struct Pipeline {
        _dir: tempfile::TempDir,
        context: Arc<WorkerContext>,
        frame_tx: Sender<Vec<u8>>,
        update_rx: Receiver<Update>,
        session_rx: Receiver<SessionRow>,
        new_qname_rx: Receiver<NewQnameEvent>,
        channels: Option<WorkerChannels>,
    }

    fn pipeline(new_qname_buffer: usize) -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        let dict_path = dir.path().join("domains.fst");
        write_dictionary_file(&dict_path, &[(".known.example.", 7)]);
        let dictionary = Dictionary::load(&dict_path).unwrap();
        let metrics = Metrics::for_tests();

        let context = Arc::new(WorkerContext {
            metrics: metrics.clone(),
            pseudonymiser: Arc::new(
                Pseudonymiser::new("test-passphrase", "test-salt", 16, metrics).unwrap(),
            ),
            ignore: Arc::new(IgnoreSet::new()),
            tracker: Arc::new(DomainTracker::new(dictionary, dict_path)),
            seen: Arc::new(
                SeenNames::open(
                    &dir.path().join("seen"),
                    16,
                    Metrics::for_tests(),
                )
                .unwrap(),
            ),
            capture: None,
            session_files_disabled: false,
            publisher_enabled: true,
        });

        let (frame_tx, frame_rx) = bounded(32);
        let (update_tx, update_rx) = bounded(128);
        let (session_tx, session_rx) = bounded(128);
        let (new_qname_tx, new_qname_rx) = bounded(new_qname_buffer);

        Pipeline {
            _dir: dir,
            context,
            frame_tx,
            update_rx,
            session_rx,
            new_qname_rx,
            channels: Some(WorkerChannels {
                frames: frame_rx,
                updates: update_tx,
                sessions: session_tx,
                new_qnames: new_qname_tx,
            }),
        }
    }

    fn response_message(name: &str, rcode: u8) -> Vec<u8> {
        let parsed: crate::name::Name = name.parse().unwrap();
        let mut octets = vec![
            0x12, 0x34, 0x81, rcode, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in parsed.labels() {
            octets.push(label.len() as u8);
            octets.extend_from_slice(label.as_bytes());
        }
        octets.push(0);
        octets.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
        octets
    }

    fn response_record(name: &str) -> TransactionRecord {
        TransactionRecord {
            kind: RecordKind::Response,
            family: SocketFamily::V4,
            transport: Transport::Udp,
            query_address: Some(vec![192, 0, 2, 7]),
            query_port: Some(54321),
            response_address: Some(vec![198, 51, 100, 1]),
            response_port: Some(53),
            response_time_sec: Some(1_700_000_123),
            response_time_nsec: Some(0),
            response_message: Some(response_message(name, 0x80)),
            ..TransactionRecord::default()
        }
    }

    fn process(pipeline: &Pipeline, record: &TransactionRecord) {
        let channels = pipeline.channels.as_ref().unwrap();
        process_frame(0, &pipeline.context, channels, &record.encode());
    }

    #[test]
    fn well_known_responses_produce_only_an_update() {
        let pipeline = pipeline(8);
        process(&pipeline, &response_record("www.known.example."));

        let update = pipeline.update_rx.try_recv().unwrap();
        assert_eq!(update.index, 7);
        assert!(update.suffix_match);
        assert_eq!(update.counters.ok, 1);
        assert_eq!(update.counters.a, 1);
        assert!(update.client_is_v4);

        assert!(pipeline.session_rx.try_recv().is_err());
        assert!(pipeline.new_qname_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_names_produce_one_event_and_a_session_row() {
        let pipeline = pipeline(8);
        let record = response_record("fresh.other.example.");
        process(&pipeline, &record);
        process(&pipeline, &record);

        // Only the first observation produces an event.
        let event = pipeline.new_qname_rx.try_recv().unwrap();
        assert_eq!(event.qname, "fresh.other.example.");
        assert!(pipeline.new_qname_rx.try_recv().is_err());

        // Both responses produce session rows with pseudonymised
        // addresses and truncated timestamps.
        let row = pipeline.session_rx.try_recv().unwrap();
        assert!(row.source_ipv4.is_some());
        assert_ne!(
            row.source_ipv4,
            Some(u32::from_be_bytes([192, 0, 2, 7]) as i32),
        );
        assert_eq!(row.response_time, Some(1_700_000_100_000_000));
        assert_eq!(row.labels[0].as_deref(), Some("example"));
        assert_eq!(row.labels[2].as_deref(), Some("fresh"));
        assert!(pipeline.session_rx.try_recv().is_ok());
        assert!(pipeline.update_rx.try_recv().is_err());
    }

    #[test]
    fn queries_are_skipped() {
        let pipeline = pipeline(8);
        let mut record = response_record("www.known.example.");
        record.kind = RecordKind::Query;
        process(&pipeline, &record);

        assert_eq!(pipeline.context.metrics.processed_frames.get(), 1);
        assert!(pipeline.update_rx.try_recv().is_err());
        assert!(pipeline.session_rx.try_recv().is_err());
    }

    #[test]
    fn ignored_clients_are_dropped() {
        let pipeline = pipeline(8);
        let list = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(list.path(), "192.0.2.0/24\n").unwrap();
        pipeline.context.ignore.load(Some(list.path())).unwrap();

        process(&pipeline, &response_record("www.known.example."));
        assert_eq!(pipeline.context.metrics.ignored_client.get(), 1);
        assert!(pipeline.update_rx.try_recv().is_err());

        // A record with an unparseable client address is dropped
        // conservatively while the ignore set is active.
        let mut record = response_record("www.known.example.");
        record.query_address = Some(vec![1, 2, 3]);
        process(&pipeline, &record);
        assert_eq!(pipeline.context.metrics.ignored_client_error.get(), 1);
        assert!(pipeline.update_rx.try_recv().is_err());
    }

    #[test]
    fn a_saturated_event_channel_discards_but_keeps_flowing() {
        let pipeline = pipeline(1);
        process(&pipeline, &response_record("first.other.example."));
        process(&pipeline, &response_record("second.other.example."));

        assert_eq!(pipeline.context.metrics.new_qname_queued.get(), 1);
        assert_eq!(pipeline.context.metrics.new_qname_discarded.get(), 1);

        // Session rows were unaffected by the discard.
        assert!(pipeline.session_rx.try_recv().is_ok());
        assert!(pipeline.session_rx.try_recv().is_ok());
    }

    #[test]
    fn malformed_frames_and_messages_are_skipped() {
        let pipeline = pipeline(8);
        let channels = pipeline.channels.as_ref().unwrap();
        process_frame(0, &pipeline.context, channels, b"garbage");

        let mut record = response_record("www.known.example.");
        record.response_message = Some(vec![1, 2, 3]);
        process(&pipeline, &record);

        assert_eq!(pipeline.context.metrics.processed_frames.get(), 2);
        assert!(pipeline.update_rx.try_recv().is_err());
        assert!(pipeline.session_rx.try_recv().is_err());
    }

    #[test]
    fn workers_exit_when_the_input_closes() {
        let mut pipeline = pipeline(8);
        let channels = pipeline.channels.take().unwrap();
        let context = pipeline.context.clone();
        let (_trigger, token) = crate::thread::shutdown_channel();
        let handle = std::thread::spawn(move || run_minimiser(0, context, channels, token));

        pipeline
            .frame_tx
            .send(response_record("www.known.example.").encode())
            .unwrap();
        let update = pipeline
            .update_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(update.index, 7);

        drop(pipeline.frame_tx);
        handle.join().unwrap();
    }
}
