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

//! The new-qname publisher.
//!
//! Events arrive on a bounded channel, are serialised to JSON, signed
//! as a compact JWS (ES256) with a configured key id, and published to
//! the broker topic at QoS 0 over mutual TLS 1.3.
//!
//! At QoS 0 the broker sends no acknowledgement, so there is no reason
//! code to inspect on the publish path; where the protocol does surface
//! reason codes (acknowledged QoS levels), 0 ("success") and 16 ("no
//! matching subscribers") both count as success.
//!
//! With a spool directory configured, signed messages are written to
//! disk (tmp + rename, so the drainer never sees a partial file) and a
//! drain pass publishes and deletes them in name order; events then
//! survive broker outages and restarts. Without a spool, publishes are
//! handed to the client library, which queues them until the connection
//! is up.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, error, info};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};

use crate::events::NewQnameEvent;
use crate::output;
use crate::tls;

/// How often the spool directory is drained.
const SPOOL_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

////////////////////////////////////////////////////////////////////////
// CONFIGURATION                                                      //
////////////////////////////////////////////////////////////////////////

/// Configuration for the publisher.
pub struct PublisherConfig {
    /// The broker URL, `mqtts://host:port`.
    pub server: String,
    pub client_id: String,
    pub topic: String,
    pub keepalive_secs: u16,
    pub signing_key_file: PathBuf,
    pub signing_key_id: String,
    pub ca_file: Option<PathBuf>,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,

    /// When set, signed messages are spooled to this directory instead
    /// of being published inline.
    pub queue_dir: Option<PathBuf>,
}

////////////////////////////////////////////////////////////////////////
// EVENT SIGNING                                                      //
////////////////////////////////////////////////////////////////////////

/// Signs events as compact JWS (ES256) with a fixed key id.
pub struct EventSigner {
    key: EncodingKey,
    header: Header,
}

impl EventSigner {
    /// Loads the signing key from a PEM file (SEC1 or PKCS#8).
    pub fn from_pem_file(path: &Path, key_id: String) -> Result<Self, Error> {
        let pem = fs::read(path).map_err(Error::Io)?;
        let key = EncodingKey::from_ec_pem(&pem).map_err(Error::BadKey)?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key_id);
        Ok(Self { key, header })
    }

    /// Signs one event, returning the compact JWS serialisation.
    pub fn sign(&self, event: &NewQnameEvent) -> Result<String, Error> {
        jsonwebtoken::encode(&self.header, event, &self.key).map_err(Error::Signing)
    }
}

////////////////////////////////////////////////////////////////////////
// THE PUBLISHER                                                      //
////////////////////////////////////////////////////////////////////////

/// Runs the publisher until the event channel closes.
///
/// A separate driver thread polls the client's connection iterator (it
/// must be polled for any progress, including reconnects); the driver
/// is joined after a clean disconnect.
pub fn run_publisher(
    events: Receiver<NewQnameEvent>,
    config: PublisherConfig,
    signer: EventSigner,
) {
    info!("new-qname publisher starting");

    let (host, port) = match split_server(&config.server) {
        Ok(parts) => parts,
        Err(err) => {
            error!("unable to parse the broker URL: {}", err);
            return;
        }
    };

    let tls_config = match tls::client_config(
        config.ca_file.as_deref(),
        &config.client_cert_file,
        &config.client_key_file,
    ) {
        Ok(tls_config) => tls_config,
        Err(err) => {
            error!("unable to build the broker TLS configuration: {}", err);
            return;
        }
    };

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.keepalive_secs)));
    options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
        tls_config,
    ))));

    let (client, mut connection) = Client::new(options, 10);

    // The driver keeps the connection alive and logs what happens on
    // it. `disconnecting` quiets the error logging once we have asked
    // for the disconnect ourselves.
    let disconnecting = Arc::new(AtomicBool::new(false));
    let driver_flag = disconnecting.clone();
    let driver = thread::spawn(move || {
        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("broker connection up"),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    error!("broker requested disconnect");
                }
                Ok(_) => {}
                Err(err) => {
                    if driver_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("broker connection error: {}", err);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        info!("broker connection driver exiting");
    });

    let mut spool = config
        .queue_dir
        .as_ref()
        .map(|dir| Spool::new(dir.clone()));

    // The main publish loop: one event at a time until the channel
    // closes. With a spool, events are persisted and drained on a
    // timer; without one, they are handed straight to the client.
    loop {
        let event = match spool.as_mut() {
            Some(spool) => match events.recv_timeout(SPOOL_DRAIN_INTERVAL) {
                Ok(event) => {
                    spool.drain(&client, &config.topic);
                    Some(event)
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    spool.drain(&client, &config.topic);
                    continue;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => None,
            },
            None => events.recv().ok(),
        };
        let event = match event {
            Some(event) => event,
            None => break,
        };

        let signed = match signer.sign(&event) {
            Ok(signed) => signed,
            Err(err) => {
                error!("unable to sign a new-qname event: {}", err);
                continue;
            }
        };

        match spool.as_mut() {
            Some(spool) => spool.enqueue(signed.as_bytes()),
            None => {
                if let Err(err) = client.publish(
                    config.topic.as_str(),
                    QoS::AtMostOnce,
                    false,
                    signed.into_bytes(),
                ) {
                    error!("unable to publish a new-qname event: {}", err);
                }
            }
        }
    }

    // Final drain, then a clean disconnect.
    if let Some(spool) = spool.as_mut() {
        spool.drain(&client, &config.topic);
    }
    disconnecting.store(true, Ordering::Relaxed);
    if let Err(err) = client.disconnect() {
        error!("unable to disconnect from the broker: {}", err);
    }
    if driver.join().is_err() {
        error!("broker connection driver panicked");
    }
    info!("new-qname publisher exiting");
}

/// Splits an `mqtts://host:port` URL into host and port.
fn split_server(server: &str) -> Result<(String, u16), Error> {
    let rest = server
        .strip_prefix("mqtts://")
        .or_else(|| server.strip_prefix("ssl://"))
        .ok_or_else(|| Error::BadServer(server.to_owned()))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::BadServer(server.to_owned()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::BadServer(server.to_owned()))?;
    if host.is_empty() {
        return Err(Error::BadServer(server.to_owned()));
    }
    Ok((host.to_owned(), port))
}

////////////////////////////////////////////////////////////////////////
// THE SPOOL                                                          //
////////////////////////////////////////////////////////////////////////

/// A disk spool of signed messages awaiting publication.
///
/// Messages are written as `<sequence>.jws` via a temporary name and an
/// atomic rename. Draining publishes files in name order and deletes
/// each one after a successful hand-off to the client.
struct Spool {
    dir: PathBuf,
    sequence: u64,
}

impl Spool {
    fn new(dir: PathBuf) -> Self {
        // Resume numbering after the largest spooled sequence so
        // ordering survives a restart.
        let sequence = fs::read_dir(&dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()?
                    .strip_suffix(".jws")?
                    .parse::<u64>()
                    .ok()
            })
            .max()
            .map_or(0, |max| max + 1);
        Self { dir, sequence }
    }

    fn enqueue(&mut self, signed: &[u8]) {
        let name = format!("{:020}.jws", self.sequence);
        self.sequence += 1;
        let tmp = self.dir.join(format!("{}.tmp", name));
        let dest = self.dir.join(name);

        let result = fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(&tmp, signed))
            .map_err(output::Error::Io)
            .and_then(|_| output::rename_file(&tmp, &dest));
        if let Err(err) = result {
            error!("unable to spool a new-qname event: {}", err);
            let _ = fs::remove_file(&tmp);
        }
    }

    fn drain(&mut self, client: &Client, topic: &str) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".jws"))
            .collect();
        names.sort_unstable();

        for name in names {
            let path = self.dir.join(&name);
            let payload = match fs::read(&path) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("unable to read spooled event {}: {}", path.display(), err);
                    continue;
                }
            };
            if let Err(err) = client.publish(topic, QoS::AtMostOnce, false, payload) {
                // The client's queue is full or closed; retry on the
                // next drain pass.
                debug!("spool drain paused: {}", err);
                return;
            }
            if let Err(err) = fs::remove_file(&path) {
                error!("unable to remove spooled event {}: {}", path.display(), err);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for the publisher.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BadKey(jsonwebtoken::errors::Error),
    Signing(jsonwebtoken::errors::Error),
    BadServer(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "unable to read the signing key: {}", err),
            Self::BadKey(err) => write!(f, "invalid EC signing key: {}", err),
            Self::Signing(err) => write!(f, "JWS signing failed: {}", err),
            Self::BadServer(server) => write!(f, "invalid broker URL '{}'", server),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::TimeZone;
    use chrono::Utc;
    use p256::pkcs8::EncodePrivateKey;

    use super::*;
    use crate::message::{Qclass, Qtype, Question};

    fn test_signer() -> (tempfile::TempDir, EventSigner) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqtt-key.pem");
        let secret = p256::SecretKey::from_slice(&[11u8; 32]).unwrap();
        let pem = secret.to_pkcs8_pem(Default::default()).unwrap();
        fs::write(&path, pem.as_bytes()).unwrap();
        let signer = EventSigner::from_pem_file(&path, "mqtt-key".to_owned()).unwrap();
        (dir, signer)
    }

    fn test_event() -> NewQnameEvent {
        let header = crate::message::Header {
            id: 1,
            flags: 0x8180,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        };
        let question = Question {
            name: "fresh.example.".parse().unwrap(),
            qtype: Qtype::A,
            qclass: Qclass::IN,
        };
        let timestamp = Utc.with_ymd_and_hms(2023, 11, 29, 13, 50, 0).unwrap();
        NewQnameEvent::new(&header, &question, timestamp)
    }

    #[test]
    fn signed_events_are_compact_jws_with_kid() {
        let (_dir, signer) = test_signer();
        let jws = signer.sign(&test_event()).unwrap();

        let parts: Vec<&str> = jws.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], "mqtt-key");

        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(payload["qname"], "fresh.example.");
        assert_eq!(payload["type"], "new_qname");
    }

    #[test]
    fn server_urls_are_split() {
        assert_eq!(
            split_server("mqtts://broker.test:8883").unwrap(),
            ("broker.test".to_owned(), 8883),
        );
        assert!(split_server("broker.test:8883").is_err());
        assert!(split_server("mqtts://broker.test").is_err());
        assert!(split_server("mqtts://:8883").is_err());
    }

    #[test]
    fn spool_names_are_ordered_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = Spool::new(dir.path().to_path_buf());
        spool.enqueue(b"first");
        spool.enqueue(b"second");

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0] < names[1]);
        assert!(names[0].ends_with(".jws"));

        // A fresh spool over the same directory continues numbering.
        let resumed = Spool::new(dir.path().to_path_buf());
        assert_eq!(resumed.sequence, 2);
    }
}
