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

//! The well-known-domain dictionary.
//!
//! The dictionary is an immutable finite-state transducer file
//! ([`fst`]) mapping dot-terminated lowercase names (and dot-prefixed
//! suffix entries like `".example."`) to stable integer indices. It is
//! memory-mapped, so lookups touch only the pages they need, and a
//! revision is identified by the file's modification time.
//!
//! Index-to-name resolution is only needed once per rotation window
//! (when the histogram file is written), so it is implemented as a
//! single streaming pass collecting exactly the indices the caller
//! asks for, rather than keeping a reverse table in memory.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use fst::{Map, Streamer};
use memmap2::Mmap;

////////////////////////////////////////////////////////////////////////
// THE DICTIONARY                                                     //
////////////////////////////////////////////////////////////////////////

/// One immutable revision of the well-known-domain dictionary.
pub struct Dictionary {
    map: Map<Mmap>,
    mtime: SystemTime,
}

impl Dictionary {
    /// Loads the dictionary file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(Error::Io)?;
        let mtime = file
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map_err(Error::Io)?;

        // SAFETY: the mapping is only unsound if the underlying file is
        // truncated while mapped. Dictionary files are replaced by
        // atomic rename, never modified in place.
        let mmap = unsafe { Mmap::map(&file).map_err(Error::Io)? };
        let map = Map::new(mmap).map_err(Error::Fst)?;
        Ok(Self { map, mtime })
    }

    /// Returns the modification time of the loaded file, which
    /// identifies this revision.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Looks up `key` exactly, returning its index.
    pub fn index_of(&self, key: &str) -> Option<u64> {
        self.map.get(key.as_bytes())
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Resolves `indices` back to their names in one streaming pass.
    /// Indices that are absent from the dictionary are simply missing
    /// from the result.
    pub fn names_for(&self, indices: &HashSet<u64>) -> HashMap<u64, String> {
        let mut names = HashMap::with_capacity(indices.len());
        let mut stream = self.map.stream();
        while let Some((key, index)) = stream.next() {
            if indices.contains(&index) {
                if let Ok(name) = std::str::from_utf8(key) {
                    names.insert(index, name.to_owned());
                }
                if names.len() == indices.len() {
                    break;
                }
            }
        }
        names
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for dictionary loading.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Fst(fst::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "unable to read the dictionary file: {}", err),
            Self::Fst(err) => write!(f, "invalid dictionary file: {}", err),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TEST SUPPORT                                                       //
////////////////////////////////////////////////////////////////////////

/// Builds a dictionary file at `path` from `(name, index)` entries.
/// Entries need not be sorted.
#[cfg(test)]
pub fn write_dictionary_file(path: &Path, entries: &[(&str, u64)]) {
    let mut sorted: Vec<(&str, u64)> = entries.to_vec();
    sorted.sort_by_key(|(name, _)| *name);
    let mut builder = fst::MapBuilder::memory();
    for (name, index) in sorted {
        builder.insert(name, index).unwrap();
    }
    // Dictionary files are replaced by atomic rename, never modified in
    // place (see the safety comment on `Dictionary::load`), so this
    // test helper must do the same rather than truncating in place.
    let tmp_path = path.with_extension("fst.tmp");
    std::fs::write(&tmp_path, builder.into_inner().unwrap()).unwrap();
    std::fs::rename(&tmp_path, path).unwrap();
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_reverse_resolution_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.fst");
        write_dictionary_file(
            &path,
            &[
                ("www.known.example.", 3),
                (".example.", 7),
                ("other.test.", 11),
            ],
        );

        let dictionary = Dictionary::load(&path).unwrap();
        assert_eq!(dictionary.len(), 3);
        assert_eq!(dictionary.index_of("www.known.example."), Some(3));
        assert_eq!(dictionary.index_of(".example."), Some(7));
        assert_eq!(dictionary.index_of("unknown.example."), None);

        let wanted: HashSet<u64> = [7, 11].into_iter().collect();
        let names = dictionary.names_for(&wanted);
        assert_eq!(names.get(&7).map(String::as_str), Some(".example."));
        assert_eq!(names.get(&11).map(String::as_str), Some("other.test."));

        let wanted: HashSet<u64> = [99].into_iter().collect();
        assert!(dictionary.names_for(&wanted).is_empty());
    }

    #[test]
    fn mtime_identifies_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.fst");
        write_dictionary_file(&path, &[("a.example.", 0)]);
        let first = Dictionary::load(&path).unwrap();
        assert_eq!(
            first.mtime(),
            std::fs::metadata(&path).unwrap().modified().unwrap(),
        );
    }
}
