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

//! The aggregation collector.
//!
//! The collector is the only thread that mutates histogram state. It
//! selects over three inputs (session records, well-known-domain
//! updates, and a minute-boundary tick) plus a stop signal. Because
//! all inputs share one selection point, counter arithmetic is
//! serialised and the tick handler runs strictly between updates, so a
//! snapshot at time T observes every update whose send returned before
//! the tick at T, and every record lands in exactly one window.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{after, never, select, Receiver, Sender};
use log::{error, info};

use crate::dictionary::{self, Dictionary};
use crate::hll::Sketch;
use crate::output::SessionRow;
use crate::tracker::{Counters, DomainTracker, Update};
use crate::util::until_next_minute;

/// Histogram status bit: the entry matched the dictionary exactly.
pub const STATUS_WELL_KNOWN_EXACT: u64 = 1;

/// Histogram status bit: the entry matched a suffix entry.
pub const STATUS_WELL_KNOWN_WILDCARD: u64 = 1 << 1;

////////////////////////////////////////////////////////////////////////
// HISTOGRAM STATE                                                    //
////////////////////////////////////////////////////////////////////////

/// The per-domain, per-window aggregate.
pub struct HistogramEntry {
    pub counters: Counters,

    /// Set once, when the entry is created for the window.
    pub status_bits: u64,

    pub v4_clients: Sketch,
    pub v6_clients: Sketch,
}

impl HistogramEntry {
    fn new(suffix_match: bool) -> Self {
        Self {
            counters: Counters::default(),
            status_bits: if suffix_match {
                STATUS_WELL_KNOWN_WILDCARD
            } else {
                STATUS_WELL_KNOWN_EXACT
            },
            v4_clients: Sketch::new(),
            v6_clients: Sketch::new(),
        }
    }
}

/// One rotated window of histogram state, on its way to the writer.
pub struct Snapshot {
    pub entries: HashMap<u64, HistogramEntry>,

    /// The dictionary revision the entry indices refer to.
    pub dictionary: Arc<Dictionary>,

    /// Whether the rotation installed a new dictionary revision. When
    /// set, the writer is the last user of `dictionary` and releases it
    /// after its final lookup.
    pub dictionary_rotated: bool,

    pub rotation_time: DateTime<Utc>,
}

/// One rotated window of session records, on its way to the writer.
pub struct SessionBatch {
    pub sessions: Vec<SessionRow>,
    pub rotation_time: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////
// THE COLLECTOR                                                      //
////////////////////////////////////////////////////////////////////////

/// The channels connecting the collector to the rest of the pipeline.
pub struct CollectorChannels {
    pub session_rx: Receiver<SessionRow>,
    pub update_rx: Receiver<Update>,
    pub retry_tx: Sender<Update>,

    /// Fired (by dropping the sender) after the minimiser workers have
    /// been joined.
    pub stop_rx: Receiver<()>,

    pub session_writer_tx: Sender<SessionBatch>,
    pub histogram_writer_tx: Sender<Snapshot>,
}

/// The collector's state. All methods are called from its single
/// thread.
pub struct Collector {
    tracker: Arc<DomainTracker>,
    entries: HashMap<u64, HistogramEntry>,
    sessions: Vec<SessionRow>,
    session_dirty: bool,
}

impl Collector {
    /// Creates a new `Collector` over `tracker`.
    pub fn new(tracker: Arc<DomainTracker>) -> Self {
        Self {
            tracker,
            entries: HashMap::new(),
            sessions: Vec::new(),
            session_dirty: false,
        }
    }

    /// Records one session row into the current window.
    pub fn handle_session(&mut self, row: SessionRow) {
        self.sessions.push(row);
        self.session_dirty = true;
    }

    /// Accumulates one update into the current window.
    ///
    /// An update created against a rotated-away revision is forwarded
    /// to the retryer instead; with no retry channel (shutdown), it is
    /// dropped.
    pub fn handle_update(&mut self, update: Update, retry_tx: Option<&Sender<Update>>) {
        if update.revision != self.tracker.revision() {
            match retry_tx {
                Some(retry_tx) => {
                    if retry_tx.send(update).is_err() {
                        error!("unable to forward a stale update to the retryer");
                    }
                }
                None => info!("discarding a stale update during shutdown"),
            }
            return;
        }

        let entry = self
            .entries
            .entry(update.index)
            .or_insert_with(|| HistogramEntry::new(update.suffix_match));
        entry.counters.add(&update.counters);

        if let Some(hash) = update.client_hash {
            if update.client_is_v4 {
                entry.v4_clients.add_raw(hash);
            } else {
                entry.v6_clients.add_raw(hash);
            }
        }
    }

    /// Closes the current window at `now`: packages the session slice
    /// (if dirty) and detaches the histogram map together with the
    /// current dictionary.
    ///
    /// On a rotation error the histogram state is left in place to be
    /// retried at the next tick, matching the tracker, which has not
    /// been rotated either.
    pub fn rotate(
        &mut self,
        now: DateTime<Utc>,
    ) -> (
        Option<SessionBatch>,
        Result<Option<Snapshot>, dictionary::Error>,
    ) {
        let batch = if self.session_dirty {
            self.session_dirty = false;
            Some(SessionBatch {
                sessions: mem::take(&mut self.sessions),
                rotation_time: now,
            })
        } else {
            None
        };

        let snapshot = match self.tracker.rotate() {
            Ok(rotated) => {
                let entries = mem::take(&mut self.entries);
                if entries.is_empty() {
                    // Nothing to write; if the dictionary was rotated,
                    // dropping the detached revision here releases it.
                    Ok(None)
                } else {
                    Ok(Some(Snapshot {
                        entries,
                        dictionary: rotated.dictionary,
                        dictionary_rotated: rotated.rotated,
                        rotation_time: now,
                    }))
                }
            }
            Err(err) => Err(err),
        };

        (batch, snapshot)
    }

    /// Runs the collector loop until shutdown completes.
    ///
    /// The loop ends when the update channel disconnects, which happens
    /// only after (1) the workers have been joined, (2) the stop signal
    /// has closed the retry channel, and (3) the retryer has drained
    /// and exited. Dropping the writer channels on return lets the
    /// writers drain and exit in turn.
    pub fn run(mut self, channels: CollectorChannels) {
        let CollectorChannels {
            mut session_rx,
            update_rx,
            retry_tx,
            mut stop_rx,
            session_writer_tx,
            histogram_writer_tx,
        } = channels;
        let mut retry_tx = Some(retry_tx);
        let mut minute = after(until_next_minute());

        loop {
            select! {
                recv(session_rx) -> msg => match msg {
                    Ok(row) => self.handle_session(row),
                    Err(_) => session_rx = never(),
                },
                recv(update_rx) -> msg => match msg {
                    Ok(update) => self.handle_update(update, retry_tx.as_ref()),
                    Err(_) => break,
                },
                recv(minute) -> _ => {
                    minute = after(until_next_minute());
                    let now = Utc::now();
                    let (batch, snapshot) = self.rotate(now);
                    if let Some(batch) = batch {
                        if session_writer_tx.send(batch).is_err() {
                            error!("the session writer is gone, dropping a batch");
                        }
                    }
                    match snapshot {
                        Ok(Some(snapshot)) => {
                            if histogram_writer_tx.send(snapshot).is_err() {
                                error!("the histogram writer is gone, dropping a snapshot");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => error!("unable to rotate the histogram map: {}", err),
                    }
                },
                recv(stop_rx) -> _ => {
                    // Closing the retry channel tells the retryer to
                    // drain; once it exits, the update channel
                    // disconnects and the loop above breaks.
                    info!("collector: stopping the update retryer");
                    retry_tx = None;
                    stop_rx = never();
                },
            }
        }

        info!("collector exiting");
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::dictionary::write_dictionary_file;
    use crate::message::{Qclass, Qtype, Question, Rcode};
    use crate::name::Name;

    fn collector_with(entries: &[(&str, u64)]) -> (tempfile::TempDir, Collector) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.fst");
        write_dictionary_file(&path, entries);
        let dictionary = Dictionary::load(&path).unwrap();
        let tracker = Arc::new(DomainTracker::new(dictionary, path));
        (dir, Collector::new(tracker))
    }

    fn update_for(collector: &Collector, name: &str, client: Option<&[u8]>) -> Update {
        let name: Name = name.parse().unwrap();
        let hit = collector.tracker.lookup(&name).unwrap();
        let question = Question {
            name,
            qtype: Qtype::A,
            qclass: Qclass::IN,
        };
        Update::new(hit, &question, Rcode::NoError, client)
    }

    #[test]
    fn minute_straddling_records_land_in_two_windows() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);

        for _ in 0..3 {
            let update = update_for(&collector, "www.known.example.", None);
            collector.handle_update(update, None);
        }
        let (_, snapshot) = collector.rotate(Utc::now());
        let snapshot = snapshot.unwrap().unwrap();
        assert_eq!(snapshot.entries[&7].counters.ok, 3);

        for _ in 0..2 {
            let update = update_for(&collector, "www.known.example.", None);
            collector.handle_update(update, None);
        }
        let (_, snapshot) = collector.rotate(Utc::now());
        let snapshot = snapshot.unwrap().unwrap();
        assert_eq!(snapshot.entries[&7].counters.ok, 2);
        assert_eq!(snapshot.entries[&7].counters.a, 2);
    }

    #[test]
    fn empty_windows_produce_no_snapshot() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);
        let (_, snapshot) = collector.rotate(Utc::now());
        assert!(snapshot.unwrap().is_none());
    }

    #[test]
    fn status_bits_are_set_once_on_creation() {
        let (_dir, mut collector) =
            collector_with(&[("www.known.example.", 7), (".known.example.", 7)]);

        let exact = update_for(&collector, "www.known.example.", None);
        assert!(!exact.suffix_match);
        collector.handle_update(exact, None);

        // A later suffix-match update for the same index must not
        // change the bit set at creation.
        let suffix = update_for(&collector, "deep.known.example.", None);
        assert!(suffix.suffix_match);
        assert_eq!(suffix.index, 7);
        collector.handle_update(suffix, None);

        let (_, snapshot) = collector.rotate(Utc::now());
        let snapshot = snapshot.unwrap().unwrap();
        assert_eq!(snapshot.entries[&7].status_bits, STATUS_WELL_KNOWN_EXACT);
        assert_eq!(snapshot.entries[&7].counters.ok, 2);
    }

    #[test]
    fn client_hashes_feed_the_right_sketch() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);

        let v4 = update_for(&collector, "www.known.example.", Some(&[192, 0, 2, 7]));
        collector.handle_update(v4, None);

        let mut v6_octets = [0u8; 16];
        v6_octets[0] = 0x20;
        let v6 = update_for(&collector, "www.known.example.", Some(&v6_octets));
        collector.handle_update(v6, None);

        let (_, snapshot) = collector.rotate(Utc::now());
        let snapshot = snapshot.unwrap().unwrap();
        let entry = &snapshot.entries[&7];
        assert!(!entry.v4_clients.is_empty());
        assert!(!entry.v6_clients.is_empty());
        let estimate = entry.v4_clients.estimate();
        assert!((0.5..1.5).contains(&estimate));
    }

    #[test]
    fn stale_updates_are_routed_to_the_retryer() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);

        let mut update = update_for(&collector, "www.known.example.", None);
        update.revision = SystemTime::UNIX_EPOCH;
        let (retry_tx, retry_rx) = unbounded();
        collector.handle_update(update, Some(&retry_tx));

        assert!(retry_rx.try_recv().is_ok());
        let (_, snapshot) = collector.rotate(Utc::now());
        assert!(snapshot.unwrap().is_none());
    }

    #[test]
    fn stale_updates_are_dropped_without_a_retry_channel() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);
        let mut update = update_for(&collector, "www.known.example.", None);
        update.revision = SystemTime::UNIX_EPOCH;
        collector.handle_update(update, None);
        let (_, snapshot) = collector.rotate(Utc::now());
        assert!(snapshot.unwrap().is_none());
    }

    #[test]
    fn session_batches_follow_the_dirty_flag() {
        let (_dir, mut collector) = collector_with(&[("www.known.example.", 7)]);

        let (batch, _) = collector.rotate(Utc::now());
        assert!(batch.is_none());

        collector.handle_session(SessionRow::default());
        collector.handle_session(SessionRow::default());
        let now = Utc::now();
        let (batch, _) = collector.rotate(now);
        let batch = batch.unwrap();
        assert_eq!(batch.sessions.len(), 2);
        assert_eq!(batch.rotation_time, now);

        let (batch, _) = collector.rotate(Utc::now());
        assert!(batch.is_none());
    }
}
