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

//! The configuration file watcher.
//!
//! Watches the parent directories of registered files and invokes the
//! registered callback when a file settles. Editors typically produce
//! bursts of create/write events for a single save (and often replace
//! the file, changing its inode), so events are debounced per path:
//! each event re-arms a 100 ms timer and the callback runs only when no
//! further event arrives within that window.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded};
use log::{debug, error, info};
use notify::{EventKind, RecursiveMode, Watcher};

use crate::thread::ShutdownToken;

/// How long a file must stay quiet before its callback runs.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// A reload callback for one watched file.
pub type Callback = Box<dyn Fn() + Send>;

////////////////////////////////////////////////////////////////////////
// THE WATCHER                                                        //
////////////////////////////////////////////////////////////////////////

/// Watches the given files and runs their callbacks on settled changes
/// until shutdown.
pub fn run_watcher(
    registrations: Vec<(PathBuf, Callback)>,
    token: ShutdownToken,
) -> Result<(), Error> {
    let (event_tx, event_rx) = unbounded();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })
    .map_err(Error::Watch)?;

    let mut callbacks: HashMap<PathBuf, Callback> = HashMap::new();
    for (path, callback) in registrations {
        // Event paths arrive canonicalised, so register the canonical
        // form. Watching the parent directory (rather than the file
        // itself) keeps the watch alive across editors that replace the
        // file. Adding the same directory twice is fine.
        let path = path.canonicalize().unwrap_or(path);
        let dir = path.parent().ok_or(Error::NoParent)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(Error::Watch)?;
        info!("watching {} for changes", path.display());
        callbacks.insert(path, callback);
    }

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        let timeout = pending
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        select! {
            recv(event_rx) -> event => match event {
                Ok(Ok(event)) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_),
                    ) {
                        continue;
                    }
                    for path in event.paths {
                        if callbacks.contains_key(&path) {
                            pending.insert(path, Instant::now() + DEBOUNCE);
                        } else {
                            debug!(
                                "ignoring event for unregistered file {}",
                                path.display(),
                            );
                        }
                    }
                }
                Ok(Err(err)) => error!("file watcher error: {}", err),
                Err(_) => break,
            },
            recv(token.receiver()) -> _ => break,
            default(timeout) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    info!("reacting to a change of {}", path.display());
                    if let Some(callback) = callbacks.get(&path) {
                        callback();
                    }
                }
            },
        }
    }

    info!("config watcher exiting");
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for watcher setup.
#[derive(Debug)]
pub enum Error {
    Watch(notify::Error),

    /// A registered path has no parent directory to watch.
    NoParent,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Watch(err) => write!(f, "unable to set up the file watcher: {}", err),
            Self::NoParent => f.write_str("a watched path has no parent directory"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
