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

//! Frame input listeners.
//!
//! Exactly one input is active: a local socket, a plain TCP listener,
//! or a TLS 1.3 TCP listener (optionally requiring verified client
//! certificates). Each accepted connection gets its own reader thread
//! that decodes length-prefixed frames and pushes them onto the
//! bounded frame channel; a full channel therefore back-pressures the
//! sending resolver.
//!
//! Listeners poll for shutdown between accepts, and readers use a
//! receive timeout so they notice shutdown within a bounded time even
//! on an idle connection. A receive timeout never desynchronises the
//! frame stream: partial reads are resumed, not discarded.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{error, info};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::frame;
use crate::thread::{ShutdownToken, ThreadGroup};
use crate::tls;

/// The receive timeout on connection sockets. Bounds both how long a
/// stalled peer can hold a partial frame and how long shutdown can be
/// delayed by an idle connection.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long listeners sleep between accept polls.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

////////////////////////////////////////////////////////////////////////
// CONFIGURATION                                                      //
////////////////////////////////////////////////////////////////////////

/// The selected frame input.
pub enum InputConfig {
    /// A local (Unix domain) socket at the given path.
    Unix(PathBuf),

    /// A plain TCP listener at the given address.
    Tcp(String),

    /// A TLS 1.3 TCP listener.
    Tls {
        addr: String,
        cert_file: PathBuf,
        key_file: PathBuf,

        /// When set, clients must present a certificate verified
        /// against this CA.
        client_ca_file: Option<PathBuf>,
    },
}

/// Binds the configured input and starts its listener thread.
pub fn start_input(
    config: InputConfig,
    frames: Sender<Vec<u8>>,
    group: &Arc<ThreadGroup>,
    token: ShutdownToken,
) -> Result<(), Error> {
    match config {
        InputConfig::Unix(path) => {
            // A leftover socket file from a previous run would make the
            // bind fail.
            if path.exists() {
                fs::remove_file(&path).map_err(Error::Io)?;
            }
            let listener = UnixListener::bind(&path).map_err(Error::Io)?;
            listener.set_nonblocking(true).map_err(Error::Io)?;
            info!("frame input listening on local socket {}", path.display());
            start_unix(listener, frames, group, token)
        }
        InputConfig::Tcp(addr) => {
            let listener = TcpListener::bind(&addr).map_err(Error::Io)?;
            info!("frame input listening on tcp {}", addr);
            start_tcp(listener, None, frames, group, token)
        }
        InputConfig::Tls {
            addr,
            cert_file,
            key_file,
            client_ca_file,
        } => {
            let tls_config =
                tls::server_config(&cert_file, &key_file, client_ca_file.as_deref())
                    .map_err(Error::Tls)?;
            let listener = TcpListener::bind(&addr).map_err(Error::Io)?;
            info!("frame input listening on tls {}", addr);
            start_tcp(listener, Some(Arc::new(tls_config)), frames, group, token)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// LISTENERS                                                          //
////////////////////////////////////////////////////////////////////////

/// Starts the accept loop for a TCP listener, with or without TLS.
pub(crate) fn start_tcp(
    listener: TcpListener,
    tls_config: Option<Arc<ServerConfig>>,
    frames: Sender<Vec<u8>>,
    group: &Arc<ThreadGroup>,
    token: ShutdownToken,
) -> Result<(), Error> {
    listener.set_nonblocking(true).map_err(Error::Io)?;
    let accept_group = group.clone();
    group
        .start("frame listener", move || loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let peer = peer.to_string();
                    if let Err(err) = prepare_stream(&stream) {
                        error!("unable to prepare a connection from {}: {}", peer, err);
                        continue;
                    }
                    let frames = frames.clone();
                    let reader_token = token.clone();
                    let tls_config = tls_config.clone();
                    let result = accept_group.start("frame reader", move || {
                        match tls_config {
                            Some(tls_config) => {
                                let conn = match ServerConnection::new(tls_config) {
                                    Ok(conn) => conn,
                                    Err(err) => {
                                        error!("unable to begin TLS with {}: {}", peer, err);
                                        return;
                                    }
                                };
                                let stream = StreamOwned::new(conn, stream);
                                run_connection(stream, &frames, &reader_token, &peer);
                            }
                            None => run_connection(stream, &frames, &reader_token, &peer),
                        }
                    });
                    if result.is_err() {
                        // The group is shutting down.
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if token.is_cancelled() {
                        info!("frame listener exiting");
                        return;
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!("frame listener accept failed: {}", err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        })
        .map_err(Error::Thread)
}

/// Starts the accept loop for a Unix socket listener.
fn start_unix(
    listener: UnixListener,
    frames: Sender<Vec<u8>>,
    group: &Arc<ThreadGroup>,
    token: ShutdownToken,
) -> Result<(), Error> {
    let accept_group = group.clone();
    group
        .start("frame listener", move || loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    let prepared = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_read_timeout(Some(RECEIVE_TIMEOUT)));
                    if let Err(err) = prepared {
                        error!("unable to prepare a local connection: {}", err);
                        continue;
                    }
                    let frames = frames.clone();
                    let reader_token = token.clone();
                    let result = accept_group.start("frame reader", move || {
                        run_connection(stream, &frames, &reader_token, "local socket");
                    });
                    if result.is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if token.is_cancelled() {
                        info!("frame listener exiting");
                        return;
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!("frame listener accept failed: {}", err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        })
        .map_err(Error::Thread)
}

/// Accepted TCP streams inherit the listener's non-blocking mode; put
/// them back into blocking mode with a receive timeout.
fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(RECEIVE_TIMEOUT))
}

////////////////////////////////////////////////////////////////////////
// CONNECTION READERS                                                 //
////////////////////////////////////////////////////////////////////////

/// The outcome of filling a buffer from the stream.
enum Fill {
    Full,
    CleanEof,
    Shutdown,
}

/// Reads frames from one connection until EOF, error, or shutdown.
fn run_connection<R: Read>(
    mut stream: R,
    frames: &Sender<Vec<u8>>,
    token: &ShutdownToken,
    peer: &str,
) {
    info!("frame connection from {}", peer);
    loop {
        let mut prefix = [0u8; 4];
        match read_full(&mut stream, &mut prefix, token, true) {
            Ok(Fill::Full) => {}
            Ok(Fill::CleanEof) => {
                info!("frame connection from {} closed", peer);
                return;
            }
            Ok(Fill::Shutdown) => return,
            Err(err) => {
                error!("frame connection from {} failed: {}", peer, err);
                return;
            }
        }

        let len = u32::from_be_bytes(prefix);
        if len > frame::MAX_FRAME_LEN {
            error!(
                "frame connection from {} sent an oversized frame ({} octets)",
                peer, len,
            );
            return;
        }

        let mut payload = vec![0u8; len as usize];
        match read_full(&mut stream, &mut payload, token, false) {
            Ok(Fill::Full) => {}
            Ok(Fill::CleanEof) => unreachable!(),
            Ok(Fill::Shutdown) => return,
            Err(err) => {
                error!("frame connection from {} failed: {}", peer, err);
                return;
            }
        }

        // A blocking send propagates backpressure to the peer.
        if frames.send(payload).is_err() {
            return;
        }
    }
}

/// Fills `buf` from the stream, resuming across receive timeouts.
///
/// With `eof_ok`, an EOF before the first octet is a clean end of
/// stream; an EOF mid-buffer is always an error.
fn read_full<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    token: &ShutdownToken,
    eof_ok: bool,
) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 && eof_ok {
                    return Ok(Fill::CleanEof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            Ok(n) => filled += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut,
                ) =>
            {
                if token.is_cancelled() {
                    return Ok(Fill::Shutdown);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(Fill::Full)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for input setup.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Tls(tls::Error),
    Thread(crate::thread::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "unable to bind the frame input: {}", err),
            Self::Tls(err) => write!(f, "{}", err),
            Self::Thread(err) => write!(f, "unable to start the frame listener: {}", err),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crossbeam_channel::bounded;

    use super::*;
    use crate::thread::shutdown_channel;

    #[test]
    fn tcp_frames_reach_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, frame_rx) = bounded(32);
        let (trigger, token) = shutdown_channel();
        let group = ThreadGroup::new();
        start_tcp(listener, None, frame_tx, &group, token).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        frame::write_frame(&mut stream, b"one").unwrap();
        frame::write_frame(&mut stream, b"two").unwrap();
        stream.flush().unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(frame_rx.recv_timeout(timeout).unwrap(), b"one");
        assert_eq!(frame_rx.recv_timeout(timeout).unwrap(), b"two");

        drop(stream);
        trigger.fire();
        group.shut_down();
        group.await_shutdown();
    }

    #[test]
    fn unix_frames_reach_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.sock");
        let (frame_tx, frame_rx) = bounded(32);
        let (trigger, token) = shutdown_channel();
        let group = ThreadGroup::new();
        start_input(InputConfig::Unix(path.clone()), frame_tx, &group, token).unwrap();

        let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
        frame::write_frame(&mut stream, b"hello").unwrap();
        stream.flush().unwrap();

        assert_eq!(
            frame_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"hello",
        );

        drop(stream);
        trigger.fire();
        group.shut_down();
        group.await_shutdown();
    }

    #[test]
    fn oversized_frames_close_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, frame_rx) = bounded(32);
        let (trigger, token) = shutdown_channel();
        let group = ThreadGroup::new();
        start_tcp(listener, None, frame_tx, &group, token).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(&(frame::MAX_FRAME_LEN + 1).to_be_bytes())
            .unwrap();
        stream.flush().unwrap();

        assert!(frame_rx
            .recv_timeout(Duration::from_millis(500))
            .is_err());

        trigger.fire();
        group.shut_down();
        group.await_shutdown();
    }
}
