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

//! The first-seen name tracker.
//!
//! Names that are not on the well-known list trigger a one-off
//! new-qname event the first time they are observed in the deployment's
//! history. The tracker is a two-tier set: a bounded in-memory recency
//! cache in front of a durable on-disk set (keys only, empty values).
//!
//! The cache probe and the durable insert are deliberately not atomic:
//! two workers racing on the same fresh name may both see "new", and at
//! most one duplicate event per such race is tolerated. The duplicate
//! durable insert is idempotent.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::error;
use lru::LruCache;

use crate::metrics::Metrics;
use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// THE TRACKER                                                        //
////////////////////////////////////////////////////////////////////////

/// The two-tier first-seen name set.
pub struct SeenNames {
    cache: Mutex<LruCache<Box<str>, ()>>,
    db: sled::Db,
    metrics: Arc<Metrics>,
}

impl SeenNames {
    /// Opens (or creates) the durable set under `dir` with a recency
    /// cache of `cache_entries` names.
    pub fn open(
        dir: &Path,
        cache_entries: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let db = sled::open(dir).map_err(Error::Store)?;
        let cache_entries =
            NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::new(1).unwrap());
        Ok(Self {
            cache: Mutex::new(LruCache::new(cache_entries)),
            db,
            metrics,
        })
    }

    /// Returns `true` if `name` has been observed before since the
    /// durable set's creation; otherwise records it and returns
    /// `false`.
    pub fn seen(&self, name: &Name) -> bool {
        let key = name.as_str();

        {
            let mut cache = self.cache.lock().unwrap();
            if cache.get(key).is_some() {
                // A hit refreshes the entry's recency.
                return true;
            }
            let evicting = cache.len() == usize::from(cache.cap());
            cache.put(Box::from(key), ());
            if evicting {
                self.metrics.seen_cache_evicted.inc();
            }
        }

        // Not in the cache; consult the durable set.
        match self.db.get(key.as_bytes()) {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(err) => {
                error!("unable to probe the first-seen store: {}", err);
                return false;
            }
        }

        // A fresh name: record it durably before reporting it as new.
        let result = self
            .db
            .insert(key.as_bytes(), &[])
            .and_then(|_| self.db.flush());
        if let Err(err) = result {
            error!("unable to record a first-seen name: {}", err);
        }
        false
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for opening the first-seen store.
#[derive(Debug)]
pub enum Error {
    Store(sled::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "unable to open the first-seen store: {}", err),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tracker(dir: &Path, cache_entries: usize) -> SeenNames {
        SeenNames::open(dir, cache_entries, Metrics::for_tests()).unwrap()
    }

    #[test]
    fn first_observation_is_new_second_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open_tracker(dir.path(), 16);
        let name: Name = "www.example.com.".parse().unwrap();
        assert!(!tracker.seen(&name));
        assert!(tracker.seen(&name));
    }

    #[test]
    fn names_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let name: Name = "persistent.example.com.".parse().unwrap();
        {
            let tracker = open_tracker(dir.path(), 16);
            assert!(!tracker.seen(&name));
        }
        let tracker = open_tracker(dir.path(), 16);
        assert!(tracker.seen(&name));
    }

    #[test]
    fn cache_evictions_fall_through_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open_tracker(dir.path(), 2);
        let names: Vec<Name> = (0..5)
            .map(|i| format!("name{}.example.com.", i).parse().unwrap())
            .collect();
        for name in &names {
            assert!(!tracker.seen(name));
        }
        // All five were recorded durably even though the cache only
        // holds two.
        for name in &names {
            assert!(tracker.seen(name));
        }
        assert!(tracker.metrics.seen_cache_evicted.get() > 0);
    }

    #[test]
    fn distinct_names_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open_tracker(dir.path(), 16);
        let a: Name = "a.example.com.".parse().unwrap();
        let b: Name = "b.example.com.".parse().unwrap();
        assert!(!tracker.seen(&a));
        assert!(!tracker.seen(&b));
    }
}
