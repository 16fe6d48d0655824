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

//! Shared TLS configuration builders.
//!
//! All three TLS surfaces (the frame input listener, the histogram
//! upload client, and the broker connection) speak TLS 1.3 only and
//! authenticate with X.509 certificates; this module centralises the
//! PEM loading and rustls config assembly.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// The only protocol version any of our TLS endpoints accept.
static TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

////////////////////////////////////////////////////////////////////////
// PEM LOADING                                                        //
////////////////////////////////////////////////////////////////////////

/// Loads all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(File::open(path).map_err(Error::Io)?);
    let certs: Result<Vec<_>, io::Error> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::NoCertificates);
    }
    Ok(certs)
}

/// Loads the first private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(File::open(path).map_err(Error::Io)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::Io)?
        .ok_or(Error::NoPrivateKey)
}

/// Builds a root store from a CA file, or from the system's native
/// roots when no file is configured.
pub fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(Error::Tls)?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().map_err(Error::Io)? {
                // Individual unparseable system certificates are not
                // our problem; skip them.
                let _ = roots.add(cert);
            }
        }
    }
    Ok(roots)
}

////////////////////////////////////////////////////////////////////////
// CONFIG ASSEMBLY                                                    //
////////////////////////////////////////////////////////////////////////

/// Builds a TLS 1.3 client config with mandatory client-certificate
/// authentication. `ca_file` of `None` trusts the system roots.
pub fn client_config(
    ca_file: Option<&Path>,
    cert_file: &Path,
    key_file: &Path,
) -> Result<ClientConfig, Error> {
    let roots = root_store(ca_file)?;
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    ClientConfig::builder_with_protocol_versions(TLS_VERSIONS)
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(Error::Tls)
}

/// Builds a TLS 1.3 server config. With a `client_ca_file`, clients
/// must present a certificate verified against it.
pub fn server_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca_file: Option<&Path>,
) -> Result<ServerConfig, Error> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let builder = ServerConfig::builder_with_protocol_versions(TLS_VERSIONS);
    let config = match client_ca_file {
        Some(ca_file) => {
            let roots = root_store(Some(ca_file))?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|err| Error::ClientVerifier(err.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key),
    };
    config.map_err(Error::Tls)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for TLS configuration.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Tls(rustls::Error),
    NoCertificates,
    NoPrivateKey,
    ClientVerifier(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "unable to read TLS material: {}", err),
            Self::Tls(err) => write!(f, "TLS configuration error: {}", err),
            Self::NoCertificates => f.write_str("the PEM file contains no certificates"),
            Self::NoPrivateKey => f.write_str("the PEM file contains no private key"),
            Self::ClientVerifier(err) => {
                write!(f, "unable to build the client verifier: {}", err)
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
    use std::fs;

    use super::*;

    #[test]
    fn missing_files_error_out() {
        assert!(matches!(
            load_certs(Path::new("/nonexistent/cert.pem")),
            Err(Error::Io(_)),
        ));
        assert!(matches!(
            load_key(Path::new("/nonexistent/key.pem")),
            Err(Error::Io(_)),
        ));
    }

    #[test]
    fn empty_pem_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "").unwrap();
        assert!(matches!(load_certs(&path), Err(Error::NoCertificates)));
        assert!(matches!(load_key(&path), Err(Error::NoPrivateKey)));
    }
}
