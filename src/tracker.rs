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

//! The well-known-domain tracker.
//!
//! The tracker owns the current dictionary revision behind a
//! reader/writer lock. Minimiser workers take the read side for
//! lookups; the collector's once-a-minute rotation takes the write side
//! to swap in a freshly loaded dictionary when the file on disk has
//! changed.
//!
//! The tracker holds no counter state: lookups produce [`Update`]
//! messages that are accumulated serially by the collector. An update
//! created against a revision that has since been rotated away is
//! re-looked-up by the retryer ([`run_retryer`]) under the current
//! revision, a bounded number of times.

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};

use crate::dictionary::{self, Dictionary};
use crate::hll;
use crate::message::{Qclass, Qtype, Question, Rcode};
use crate::name::Name;

/// How many times a stale update is re-looked-up before it is dropped.
pub const RETRY_LIMIT: u32 = 10;

////////////////////////////////////////////////////////////////////////
// THE TRACKER                                                        //
////////////////////////////////////////////////////////////////////////

/// The shared dictionary revision with rotation support.
pub struct DomainTracker {
    state: RwLock<TrackerState>,
    path: PathBuf,
}

struct TrackerState {
    dictionary: Arc<Dictionary>,
    revision: SystemTime,
}

/// The result of a successful tracker lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Hit {
    pub index: u64,

    /// Whether the match was on a dot-prefixed suffix entry rather than
    /// the exact name.
    pub suffix_match: bool,

    /// The revision (dictionary modification time) observed at lookup.
    pub revision: SystemTime,
}

/// The dictionary detached by a rotation.
pub struct RotatedDictionary {
    pub dictionary: Arc<Dictionary>,

    /// Whether a new dictionary revision was installed during this
    /// rotation. When set, the receiver of the detached dictionary is
    /// the last user and releases it after its final lookup.
    pub rotated: bool,
}

impl DomainTracker {
    /// Creates a new tracker over an already loaded dictionary.
    /// `path` is re-checked on every rotation.
    pub fn new(dictionary: Dictionary, path: PathBuf) -> Self {
        let revision = dictionary.mtime();
        Self {
            state: RwLock::new(TrackerState {
                dictionary: Arc::new(dictionary),
                revision,
            }),
            path,
        }
    }

    /// Looks up `name` under the current revision.
    ///
    /// The exact name is tried first; on a miss, the dot-prefixed
    /// suffix tails are tried from the longest down (`".example.com."`
    /// before `".com."`), so the longest matching tail wins.
    pub fn lookup(&self, name: &Name) -> Option<Hit> {
        let state = self.state.read().unwrap();

        if let Some(index) = state.dictionary.index_of(name.as_str()) {
            return Some(Hit {
                index,
                suffix_match: false,
                revision: state.revision,
            });
        }

        for suffix in name.suffixes() {
            if let Some(index) = state.dictionary.index_of(suffix) {
                return Some(Hit {
                    index,
                    suffix_match: true,
                    revision: state.revision,
                });
            }
        }

        None
    }

    /// Returns the current revision.
    pub fn revision(&self) -> SystemTime {
        self.state.read().unwrap().revision
    }

    /// Rotates the tracker: if the dictionary file's modification time
    /// differs from the tracked revision, the new file is loaded and
    /// installed; either way, the previously current dictionary is
    /// detached and returned.
    pub fn rotate(&self) -> Result<RotatedDictionary, dictionary::Error> {
        let mtime = std::fs::File::open(&self.path)
            .and_then(|file| file.metadata())
            .and_then(|metadata| metadata.modified())
            .map_err(dictionary::Error::Io)?;

        // Load the replacement outside the write lock; loading may be
        // slow and lookups can proceed against the old revision until
        // the swap.
        let replacement = if mtime != self.revision() {
            let fresh = Dictionary::load(&self.path)?;
            info!(
                "dictionary file changed, loaded new revision ({} entries)",
                fresh.len(),
            );
            Some(fresh)
        } else {
            None
        };

        let mut state = self.state.write().unwrap();
        let rotated = replacement.is_some();
        let detached = match replacement {
            Some(fresh) => {
                let revision = fresh.mtime();
                let old = std::mem::replace(&mut state.dictionary, Arc::new(fresh));
                state.revision = revision;
                old
            }
            None => state.dictionary.clone(),
        };

        Ok(RotatedDictionary {
            dictionary: detached,
            rotated,
        })
    }
}

////////////////////////////////////////////////////////////////////////
// UPDATES                                                            //
////////////////////////////////////////////////////////////////////////

/// Per-type, per-rcode, and class counters carried by an update and
/// accumulated into a histogram entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub a: u64,
    pub aaaa: u64,
    pub mx: u64,
    pub ns: u64,
    pub other_type: u64,
    pub non_in: u64,
    pub ok: u64,
    pub nx: u64,
    pub fail: u64,
    pub other_rcode: u64,
}

impl Counters {
    /// Derives the counter increments for one response with the given
    /// header and question fields.
    pub fn for_response(rcode: Rcode, qtype: Qtype, qclass: Qclass) -> Self {
        let mut counters = Self::default();

        match rcode {
            Rcode::NoError => counters.ok = 1,
            Rcode::NxDomain => counters.nx = 1,
            Rcode::ServFail => counters.fail = 1,
            Rcode::Other(_) => counters.other_rcode = 1,
        }

        if qclass == Qclass::IN {
            match qtype {
                Qtype::A => counters.a = 1,
                Qtype::AAAA => counters.aaaa = 1,
                Qtype::MX => counters.mx = 1,
                Qtype::NS => counters.ns = 1,
                _ => counters.other_type = 1,
            }
        } else {
            counters.non_in = 1;
        }

        counters
    }

    /// Adds `other` into `self` field-wise.
    pub fn add(&mut self, other: &Counters) {
        self.a += other.a;
        self.aaaa += other.aaaa;
        self.mx += other.mx;
        self.ns += other.ns;
        self.other_type += other.other_type;
        self.non_in += other.non_in;
        self.ok += other.ok;
        self.nx += other.nx;
        self.fail += other.fail;
        self.other_rcode += other.other_rcode;
    }
}

/// One well-known-domain hit on its way to the collector.
#[derive(Clone, Debug)]
pub struct Update {
    pub index: u64,
    pub suffix_match: bool,

    /// The revision observed at lookup; the collector routes the update
    /// to the retryer if this no longer matches.
    pub revision: SystemTime,

    /// The question name, kept for stale-revision re-lookup.
    pub qname: Name,

    pub counters: Counters,

    /// A 64-bit hash of the original (pre-pseudonymisation) client
    /// address octets, if they parsed.
    pub client_hash: Option<u64>,

    /// Whether the original client address is IPv4 (after unmapping).
    pub client_is_v4: bool,

    retries: u32,
}

impl Update {
    /// Builds an update for one response. `client` is the original
    /// (pre-pseudonymisation) client address octets; it is hashed here
    /// and not retained.
    pub fn new(hit: Hit, question: &Question, rcode: Rcode, client: Option<&[u8]>) -> Self {
        let (client_hash, client_is_v4) = match client {
            Some(octets) if octets.len() == 4 => (Some(hll::hash_address(octets)), true),
            Some(octets) if octets.len() == 16 => {
                let v6 = Ipv6Addr::from(<[u8; 16]>::try_from(octets).unwrap());
                (Some(hll::hash_address(octets)), v6.to_ipv4_mapped().is_some())
            }
            _ => (None, false),
        };

        Self {
            index: hit.index,
            suffix_match: hit.suffix_match,
            revision: hit.revision,
            qname: question.name.clone(),
            counters: Counters::for_response(rcode, question.qtype, question.qclass),
            client_hash,
            client_is_v4,
            retries: 0,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE RETRYER                                                        //
////////////////////////////////////////////////////////////////////////

/// Re-looks-up updates whose revision was rotated away. Runs until the
/// retry channel closes; refreshed updates are re-emitted on
/// `update_tx`, and names absent from the current revision are dropped.
pub fn run_retryer(
    tracker: Arc<DomainTracker>,
    retry_rx: Receiver<Update>,
    update_tx: Sender<Update>,
) {
    for mut update in retry_rx.iter() {
        update.retries += 1;
        if update.retries >= RETRY_LIMIT {
            info!(
                "dropping stale update for {}: retry limit reached",
                update.qname,
            );
            continue;
        }

        match tracker.lookup(&update.qname) {
            Some(hit) => {
                update.index = hit.index;
                update.suffix_match = hit.suffix_match;
                update.revision = hit.revision;
                debug!(
                    "re-emitting refreshed update for {} (retry {})",
                    update.qname, update.retries,
                );
                if update_tx.send(update).is_err() {
                    break;
                }
            }
            None => {
                debug!(
                    "dropping stale update for {}: not in the current dictionary",
                    update.qname,
                );
            }
        }
    }
    info!("update retryer exiting");
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::dictionary::write_dictionary_file;

    fn tracker_with(entries: &[(&str, u64)]) -> (tempfile::TempDir, Arc<DomainTracker>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.fst");
        write_dictionary_file(&path, entries);
        let dictionary = Dictionary::load(&path).unwrap();
        (dir, Arc::new(DomainTracker::new(dictionary, path)))
    }

    fn question(name: &str) -> Question {
        Question {
            name: name.parse().unwrap(),
            qtype: Qtype::A,
            qclass: Qclass::IN,
        }
    }

    #[test]
    fn exact_match_beats_suffix_match() {
        let (_dir, tracker) =
            tracker_with(&[("www.known.example.", 1), (".example.", 2)]);
        let name: Name = "www.known.example.".parse().unwrap();
        let hit = tracker.lookup(&name).unwrap();
        assert_eq!(hit.index, 1);
        assert!(!hit.suffix_match);
    }

    #[test]
    fn longest_suffix_wins() {
        let (_dir, tracker) =
            tracker_with(&[(".known.example.", 1), (".example.", 2)]);
        let name: Name = "www.known.example.".parse().unwrap();
        let hit = tracker.lookup(&name).unwrap();
        assert_eq!(hit.index, 1);
        assert!(hit.suffix_match);

        let name: Name = "www.other.example.".parse().unwrap();
        let hit = tracker.lookup(&name).unwrap();
        assert_eq!(hit.index, 2);
        assert!(hit.suffix_match);
    }

    #[test]
    fn misses_return_none() {
        let (_dir, tracker) = tracker_with(&[(".example.", 2)]);
        let name: Name = "www.example.net.".parse().unwrap();
        assert!(tracker.lookup(&name).is_none());
    }

    #[test]
    fn rotation_without_file_change_keeps_the_revision() {
        let (_dir, tracker) = tracker_with(&[(".example.", 2)]);
        let revision = tracker.revision();
        let rotated = tracker.rotate().unwrap();
        assert!(!rotated.rotated);
        assert_eq!(tracker.revision(), revision);
    }

    #[test]
    fn rotation_picks_up_a_changed_file() {
        let (dir, tracker) = tracker_with(&[("old.example.", 1)]);
        let old_revision = tracker.revision();

        // Rewrite the dictionary with a different mtime.
        let path = dir.path().join("domains.fst");
        write_dictionary_file(&path, &[("new.example.", 5)]);
        let future = SystemTime::now() + std::time::Duration::from_secs(10);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(future).unwrap();

        let rotated = tracker.rotate().unwrap();
        assert!(rotated.rotated);
        assert_ne!(tracker.revision(), old_revision);

        // The detached dictionary is the old revision; the tracker now
        // serves the new one.
        let wanted: HashSet<u64> = [1].into_iter().collect();
        assert_eq!(
            rotated.dictionary.names_for(&wanted).get(&1).map(String::as_str),
            Some("old.example."),
        );
        let name: Name = "new.example.".parse().unwrap();
        assert_eq!(tracker.lookup(&name).unwrap().index, 5);
    }

    #[test]
    fn counters_follow_rcode_and_question() {
        let c = Counters::for_response(Rcode::NoError, Qtype::A, Qclass::IN);
        assert_eq!((c.ok, c.a), (1, 1));

        let c = Counters::for_response(Rcode::NxDomain, Qtype::AAAA, Qclass::IN);
        assert_eq!((c.nx, c.aaaa), (1, 1));

        let c = Counters::for_response(Rcode::ServFail, Qtype(16), Qclass::IN);
        assert_eq!((c.fail, c.other_type), (1, 1));

        // REFUSED (5) with a non-IN class.
        let c = Counters::for_response(Rcode::from(5), Qtype::A, Qclass(3));
        assert_eq!((c.other_rcode, c.non_in, c.a), (1, 1, 0));

        // NXRRSET (8) is deliberately not counted as NX; only NXDOMAIN
        // is.
        let c = Counters::for_response(Rcode::from(8), Qtype::A, Qclass::IN);
        assert_eq!((c.nx, c.other_rcode), (0, 1));
    }

    #[test]
    fn updates_classify_the_client_family() {
        let (_dir, tracker) = tracker_with(&[("www.known.example.", 1)]);
        let name: Name = "www.known.example.".parse().unwrap();
        let hit = tracker.lookup(&name).unwrap();
        let question = question("www.known.example.");

        let update = Update::new(hit, &question, Rcode::NoError, Some(&[192, 0, 2, 7]));
        assert!(update.client_is_v4);
        assert!(update.client_hash.is_some());

        let mut mapped = [0u8; 16];
        mapped[10] = 0xff;
        mapped[11] = 0xff;
        mapped[12..].copy_from_slice(&[192, 0, 2, 7]);
        let update = Update::new(hit, &question, Rcode::NoError, Some(&mapped));
        assert!(update.client_is_v4);

        let mut v6 = [0u8; 16];
        v6[0] = 0x20;
        let update = Update::new(hit, &question, Rcode::NoError, Some(&v6));
        assert!(!update.client_is_v4);

        let update = Update::new(hit, &question, Rcode::NoError, Some(&[1, 2, 3]));
        assert!(update.client_hash.is_none());
    }

    #[test]
    fn retryer_refreshes_or_drops_stale_updates() {
        let (dir, tracker) = tracker_with(&[("kept.example.", 1), ("dropped.example.", 2)]);
        let stale_revision = tracker.revision();

        // Rotate to a revision that keeps one name and drops the other.
        let path = dir.path().join("domains.fst");
        write_dictionary_file(&path, &[("kept.example.", 9)]);
        let future = SystemTime::now() + std::time::Duration::from_secs(10);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(future).unwrap();
        tracker.rotate().unwrap();

        let (retry_tx, retry_rx) = unbounded();
        let (update_tx, update_rx) = unbounded();

        let stale_hit = Hit {
            index: 1,
            suffix_match: false,
            revision: stale_revision,
        };
        retry_tx
            .send(Update::new(
                stale_hit,
                &question("kept.example."),
                Rcode::NoError,
                None,
            ))
            .unwrap();
        let stale_hit = Hit {
            index: 2,
            suffix_match: false,
            revision: stale_revision,
        };
        retry_tx
            .send(Update::new(
                stale_hit,
                &question("dropped.example."),
                Rcode::NoError,
                None,
            ))
            .unwrap();
        drop(retry_tx);

        run_retryer(tracker.clone(), retry_rx, update_tx);

        let refreshed = update_rx.recv().unwrap();
        assert_eq!(refreshed.index, 9);
        assert_eq!(refreshed.revision, tracker.revision());
        assert!(update_rx.recv().is_err());
    }

    #[test]
    fn retryer_honours_the_retry_limit() {
        let (_dir, tracker) = tracker_with(&[("kept.example.", 1)]);
        let (retry_tx, retry_rx) = unbounded();
        let (update_tx, update_rx) = unbounded();

        let hit = tracker
            .lookup(&"kept.example.".parse().unwrap())
            .unwrap();
        let mut update = Update::new(hit, &question("kept.example."), Rcode::NoError, None);
        update.retries = RETRY_LIMIT - 1;
        retry_tx.send(update).unwrap();
        drop(retry_tx);

        run_retryer(tracker, retry_rx, update_tx);
        assert!(update_rx.recv().is_err());
    }
}
