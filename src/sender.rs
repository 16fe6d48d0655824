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

//! The histogram upload sender.
//!
//! Every ten seconds the sender sweeps the outbox directory for
//! finished histogram files, uploads each over signed HTTP, and moves
//! uploaded files into the "sent" directory. A file that fails to
//! upload (any non-201 status, or a transport error) simply stays in
//! the outbox for the next sweep, which gives the outbox/sent pair
//! at-least-once upload semantics.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{select, tick};
use log::{error, info};

use crate::httpsig::RequestSigner;
use crate::output;
use crate::thread::ShutdownToken;
use crate::tls;

/// How often the outbox is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// The content type of the uploaded files.
const CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// The upload path under the receiver's base URL.
const UPLOAD_PATH: &str = "/api/v1/aggregate/histogram";

////////////////////////////////////////////////////////////////////////
// THE SENDER                                                         //
////////////////////////////////////////////////////////////////////////

/// Configuration for the histogram sender.
pub struct SenderConfig {
    /// The receiver's base URL.
    pub url: String,
    pub signing_key_file: PathBuf,
    pub signing_key_id: String,
    pub ca_file: Option<PathBuf>,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
}

/// The histogram upload client.
pub struct HistogramSender {
    agent: ureq::Agent,
    url: String,
    signer: RequestSigner,
}

impl HistogramSender {
    /// Builds the sender: loads the signing key, assembles the mutual
    /// TLS client, and derives the upload URL.
    pub fn new(config: &SenderConfig) -> Result<Self, Error> {
        let signer = RequestSigner::from_pem_file(
            &config.signing_key_file,
            config.signing_key_id.clone(),
        )
        .map_err(Error::Signer)?;

        let tls_config = tls::client_config(
            config.ca_file.as_deref(),
            &config.client_cert_file,
            &config.client_key_file,
        )
        .map_err(Error::Tls)?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(10))
            .tls_config(Arc::new(tls_config))
            .build();

        let url = format!("{}{}", config.url.trim_end_matches('/'), UPLOAD_PATH);
        Ok(Self { agent, url, signer })
    }

    /// Uploads one histogram file covering the window starting at
    /// `start` and lasting `minutes`.
    pub fn send(&self, path: &Path, start: DateTime<Utc>, minutes: i64) -> Result<(), Error> {
        let body = fs::read(path).map_err(Error::Io)?;
        let digest = RequestSigner::content_digest(&body);
        let created = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let headers = self.signer.sign(CONTENT_TYPE, body.len() as u64, &digest, created);
        let interval = format!(
            "{}/PT{}M",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            minutes,
        );

        info!("uploading {} to {}", path.display(), self.url);
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", CONTENT_TYPE)
            .set("Content-Length", &body.len().to_string())
            .set("Content-Digest", &digest)
            .set("Aggregate-Interval", &interval)
            .set("Signature-Input", &headers.signature_input)
            .set("Signature", &headers.signature)
            .send_bytes(&body);

        match response {
            Ok(response) if response.status() == 201 => {
                // A Location header may be relative to the receiver.
                let location = response.header("Location").unwrap_or("");
                info!("uploaded {} (location: {})", path.display(), location);
                Ok(())
            }
            Ok(response) => Err(Error::UnexpectedStatus(response.status())),
            Err(ureq::Error::Status(status, _)) => Err(Error::UnexpectedStatus(status)),
            Err(err) => Err(Error::Transport(Box::new(err))),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE SWEEP LOOP                                                     //
////////////////////////////////////////////////////////////////////////

/// Sweeps the outbox every ten seconds until shutdown.
pub fn run_sender(
    sender: HistogramSender,
    outbox_dir: PathBuf,
    sent_dir: PathBuf,
    token: ShutdownToken,
) {
    info!("histogram sender starting");
    let ticker = tick(SWEEP_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => sweep_outbox(&sender, &outbox_dir, &sent_dir),
            recv(token.receiver()) -> _ => break,
        }
    }
    info!("histogram sender exiting");
}

/// One sweep: upload every finished histogram file and move successes
/// into the sent directory.
fn sweep_outbox(sender: &HistogramSender, outbox_dir: &Path, sent_dir: &Path) {
    let entries = match fs::read_dir(outbox_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Nothing has been written yet.
            return;
        }
        Err(err) => {
            error!("unable to read the outbox directory: {}", err);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                error!("unable to read an outbox entry: {}", err);
                continue;
            }
        };
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(name) if output::is_histogram_file_name(name) => name,
            _ => continue,
        };

        let (start, stop) = match output::timestamps_from_file_name(name) {
            Ok(window) => window,
            Err(err) => {
                error!("skipping outbox file: {}", err);
                continue;
            }
        };
        let minutes = (stop - start).num_minutes().max(1);

        let path = entry.path();
        if let Err(err) = sender.send(&path, start, minutes) {
            error!("unable to upload {}: {}", path.display(), err);
            continue;
        }
        if let Err(err) = output::rename_file(&path, &sent_dir.join(name)) {
            error!("unable to move {} to the sent directory: {}", path.display(), err);
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for histogram uploads.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Signer(crate::httpsig::Error),
    Tls(tls::Error),
    Transport(Box<ureq::Error>),
    UnexpectedStatus(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Signer(err) => write!(f, "{}", err),
            Self::Tls(err) => write!(f, "{}", err),
            Self::Transport(err) => write!(f, "transport error: {}", err),
            Self::UnexpectedStatus(status) => {
                write!(f, "unexpected status code: {}", status)
            }
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn aggregate_interval_format_matches_the_receiver_contract() {
        let start = Utc.with_ymd_and_hms(2023, 11, 29, 13, 50, 0).unwrap();
        let interval = format!(
            "{}/PT{}M",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            1,
        );
        assert_eq!(interval, "2023-11-29T13:50:00Z/PT1M");
    }

    #[test]
    fn upload_url_is_joined_without_duplicate_slashes() {
        for base in ["https://aggrec.test", "https://aggrec.test/"] {
            let url = format!("{}{}", base.trim_end_matches('/'), UPLOAD_PATH);
            assert_eq!(url, "https://aggrec.test/api/v1/aggregate/histogram");
        }
    }
}
