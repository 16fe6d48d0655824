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

//! The sent-file disk cleaner.
//!
//! Uploaded histogram files rest in the "sent" directory so operators
//! can inspect recent uploads; the cleaner sweeps that directory once a
//! minute and deletes files older than the retention window.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{select, tick};
use log::{error, info};

use crate::output;
use crate::thread::ShutdownToken;

/// How often the sent directory is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long sent files are retained.
const RETENTION: Duration = Duration::from_secs(12 * 60 * 60);

////////////////////////////////////////////////////////////////////////
// THE CLEANER                                                        //
////////////////////////////////////////////////////////////////////////

/// Sweeps the sent directory every minute until shutdown.
pub fn run_cleaner(sent_dir: PathBuf, token: ShutdownToken) {
    info!("disk cleaner starting");
    let ticker = tick(SWEEP_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => sweep(&sent_dir, RETENTION),
            recv(token.receiver()) -> _ => break,
        }
    }
    info!("disk cleaner exiting");
}

/// One sweep: delete histogram files whose modification time is older
/// than `retention`.
fn sweep(sent_dir: &Path, retention: Duration) {
    let entries = match fs::read_dir(sent_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Nothing has been uploaded yet.
            return;
        }
        Err(err) => {
            error!("unable to read the sent directory: {}", err);
            return;
        }
    };

    let now = SystemTime::now();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                error!("unable to read a sent directory entry: {}", err);
                continue;
            }
        };
        let file_name = entry.file_name();
        match file_name.to_str() {
            Some(name) if output::is_histogram_file_name(name) => {}
            _ => continue,
        }

        let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                error!(
                    "unable to stat sent file {}: {}",
                    entry.path().display(),
                    err,
                );
                continue;
            }
        };

        let expired = now
            .duration_since(modified)
            .map_or(false, |age| age > retention);
        if expired {
            let path = entry.path();
            info!("removing expired sent file {}", path.display());
            if let Err(err) = fs::remove_file(&path) {
                error!("unable to remove {}: {}", path.display(), err);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const HISTOGRAM_NAME: &str =
        "dns_histogram-2023-11-29T13-50-00Z_2023-11-29T13-51-00Z.parquet";

    #[test]
    fn expired_histogram_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(HISTOGRAM_NAME);
        fs::write(&old, b"x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(60 * 60);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        sweep(dir.path(), Duration::from_secs(30 * 60));
        assert!(!old.exists());
    }

    #[test]
    fn fresh_and_foreign_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join(HISTOGRAM_NAME);
        fs::write(&fresh, b"x").unwrap();
        let foreign = dir.path().join("notes.txt");
        fs::write(&foreign, b"x").unwrap();
        let old_foreign = dir.path().join("dns_session_block-old.parquet.bak");
        fs::write(&old_foreign, b"x").unwrap();

        sweep(dir.path(), Duration::from_secs(30 * 60));
        assert!(fresh.exists());
        assert!(foreign.exists());
        assert!(old_foreign.exists());
    }

    #[test]
    fn missing_directories_are_tolerated() {
        sweep(Path::new("/nonexistent/sent"), RETENTION);
    }
}
