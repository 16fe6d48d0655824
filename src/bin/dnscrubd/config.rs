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

//! Implements the minimiser configuration file.
//!
//! The configuration is a TOML file with kebab-case keys. Selected
//! secret-bearing keys can also be supplied through the environment
//! (`DNSCRUB_CRYPTOPAN_KEY`, `DNSCRUB_CRYPTOPAN_KEY_SALT`), which
//! keeps them out of files on shared systems.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use dnscrub::input::InputConfig;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the configuration from the file given by `path`, applying
/// environment overrides, and validates it.
pub fn load(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&raw).context("failed to parse the configuration file")?;

    if let Ok(key) = env::var("DNSCRUB_CRYPTOPAN_KEY") {
        config.cryptopan_key = Some(key);
    }
    if let Ok(salt) = env::var("DNSCRUB_CRYPTOPAN_KEY_SALT") {
        config.cryptopan_key_salt = salt;
    }

    config.validate()?;
    Ok(config)
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// The pseudonymisation passphrase. Required; refusing to start
    /// without it beats silently emitting raw addresses.
    pub cryptopan_key: Option<String>,

    #[serde(default = "default_cryptopan_key_salt")]
    pub cryptopan_key_salt: String,

    #[serde(default = "default_cryptopan_address_entries")]
    pub cryptopan_address_entries: usize,

    pub data_dir: PathBuf,

    /// The well-known-domain dictionary file.
    pub well_known_domains: PathBuf,

    pub ignored_client_ip_file: Option<PathBuf>,

    #[serde(default = "default_qname_seen_entries")]
    pub qname_seen_entries: usize,

    #[serde(default = "default_new_qname_buffer")]
    pub new_qname_buffer: usize,

    /// The number of minimiser workers; zero means one per available
    /// CPU.
    #[serde(default)]
    pub minimiser_workers: usize,

    #[serde(default)]
    pub disable_session_files: bool,

    #[serde(default)]
    pub disable_histogram_sender: bool,

    #[serde(default)]
    pub disable_mqtt: bool,

    pub http_url: Option<String>,
    pub http_signing_key_id: Option<String>,
    pub http_signing_key_file: Option<PathBuf>,
    pub http_ca_file: Option<PathBuf>,
    pub http_client_cert_file: Option<PathBuf>,
    pub http_client_key_file: Option<PathBuf>,

    pub mqtt_server: Option<String>,
    pub mqtt_client_id: Option<String>,
    pub mqtt_topic: Option<String>,
    #[serde(default = "default_mqtt_keepalive")]
    pub mqtt_keepalive: u16,
    pub mqtt_signing_key_id: Option<String>,
    pub mqtt_signing_key_file: Option<PathBuf>,
    pub mqtt_ca_file: Option<PathBuf>,
    pub mqtt_client_cert_file: Option<PathBuf>,
    pub mqtt_client_key_file: Option<PathBuf>,
    pub mqtt_queue_dir: Option<PathBuf>,

    pub input_unix: Option<PathBuf>,
    pub input_tcp: Option<String>,
    pub input_tls: Option<String>,
    pub input_tls_cert_file: Option<PathBuf>,
    pub input_tls_key_file: Option<PathBuf>,
    pub input_tls_client_ca_file: Option<PathBuf>,

    /// When set, every decoded record is appended here before
    /// pseudonymisation. Sensitive; debugging only.
    pub debug_capture_file: Option<PathBuf>,
}

fn default_cryptopan_key_salt() -> String {
    "dnscrub-salt".to_owned()
}

fn default_cryptopan_address_entries() -> usize {
    10_000
}

fn default_qname_seen_entries() -> usize {
    100_000
}

fn default_new_qname_buffer() -> usize {
    1_000
}

fn default_mqtt_keepalive() -> u16 {
    30
}

////////////////////////////////////////////////////////////////////////
// VALIDATION                                                         //
////////////////////////////////////////////////////////////////////////

impl Config {
    /// Checks cross-field requirements that serde cannot express.
    fn validate(&self) -> Result<()> {
        if self.cryptopan_key.as_deref().unwrap_or("").is_empty() {
            bail!("the required setting 'cryptopan-key' is missing");
        }

        let inputs = [
            self.input_unix.is_some(),
            self.input_tcp.is_some(),
            self.input_tls.is_some(),
        ];
        if inputs.iter().filter(|&&set| set).count() != 1 {
            bail!("exactly one of 'input-unix', 'input-tcp', and 'input-tls' must be set");
        }
        if self.input_tls.is_some()
            && (self.input_tls_cert_file.is_none() || self.input_tls_key_file.is_none())
        {
            bail!("'input-tls' requires 'input-tls-cert-file' and 'input-tls-key-file'");
        }

        if !self.disable_histogram_sender {
            for (key, set) in [
                ("http-url", self.http_url.is_some()),
                ("http-signing-key-id", self.http_signing_key_id.is_some()),
                ("http-signing-key-file", self.http_signing_key_file.is_some()),
                (
                    "http-client-cert-file",
                    self.http_client_cert_file.is_some(),
                ),
                ("http-client-key-file", self.http_client_key_file.is_some()),
            ] {
                if !set {
                    bail!(
                        "'{}' is required unless 'disable-histogram-sender' is set",
                        key,
                    );
                }
            }
        }

        if !self.disable_mqtt {
            for (key, set) in [
                ("mqtt-server", self.mqtt_server.is_some()),
                ("mqtt-client-id", self.mqtt_client_id.is_some()),
                ("mqtt-topic", self.mqtt_topic.is_some()),
                ("mqtt-signing-key-id", self.mqtt_signing_key_id.is_some()),
                ("mqtt-signing-key-file", self.mqtt_signing_key_file.is_some()),
                (
                    "mqtt-client-cert-file",
                    self.mqtt_client_cert_file.is_some(),
                ),
                ("mqtt-client-key-file", self.mqtt_client_key_file.is_some()),
            ] {
                if !set {
                    bail!("'{}' is required unless 'disable-mqtt' is set", key);
                }
            }
        }

        Ok(())
    }

    /// Returns the configured input.
    pub fn input(&self) -> InputConfig {
        if let Some(ref path) = self.input_unix {
            InputConfig::Unix(path.clone())
        } else if let Some(ref addr) = self.input_tcp {
            InputConfig::Tcp(addr.clone())
        } else {
            // Validation guarantees the remaining case.
            InputConfig::Tls {
                addr: self.input_tls.clone().unwrap_or_default(),
                cert_file: self.input_tls_cert_file.clone().unwrap_or_default(),
                key_file: self.input_tls_key_file.clone().unwrap_or_default(),
                client_ca_file: self.input_tls_client_ca_file.clone(),
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

    fn minimal() -> String {
        r#"
            cryptopan-key = "secret"
            data-dir = "/var/lib/dnscrub"
            well-known-domains = "/etc/dnscrub/domains.fst"
            input-unix = "/run/dnscrub/input.sock"
            disable-histogram-sender = true
            disable-mqtt = true
        "#
        .to_owned()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(&minimal()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cryptopan_address_entries, 10_000);
        assert_eq!(config.new_qname_buffer, 1_000);
        assert_eq!(config.mqtt_keepalive, 30);
        assert!(matches!(config.input(), InputConfig::Unix(_)));
    }

    #[test]
    fn missing_cryptopan_key_is_fatal() {
        let raw = minimal().replace("cryptopan-key = \"secret\"", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn exactly_one_input_is_enforced() {
        let raw = format!("{}\ninput-tcp = \"127.0.0.1:5353\"", minimal());
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());

        let raw = minimal().replace("input-unix = \"/run/dnscrub/input.sock\"", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_outputs_require_their_settings() {
        let raw = minimal().replace("disable-mqtt = true", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());

        let raw = minimal().replace("disable-histogram-sender = true", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{}\nunknown-key = 1", minimal());
        assert!(toml::from_str::<Config>(&raw).is_err());
    }
}
