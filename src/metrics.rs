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

//! Pipeline metrics and the local metrics listener.
//!
//! Counters live in a per-instance registry (rather than the global
//! default one) so that tests can build as many pipelines as they like
//! without duplicate-registration panics. All counters are lock-free
//! atomics; incrementing them on the record hot path is cheap.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use log::{error, info};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::events::NewQnameEvent;
use crate::thread::ShutdownToken;

/// The address the metrics listener binds. Deliberately loopback-only.
pub const LISTEN_ADDR: &str = "127.0.0.1:2112";

////////////////////////////////////////////////////////////////////////
// METRICS                                                            //
////////////////////////////////////////////////////////////////////////

/// The pipeline's counters and gauges.
pub struct Metrics {
    registry: Registry,

    /// Frames taken off the input queue, whether or not they decoded.
    pub processed_frames: IntCounter,

    /// Records dropped because the client address is in the ignore set.
    pub ignored_client: IntCounter,

    /// Records dropped because the client address failed to parse while
    /// an ignore set was active. Should stay at zero.
    pub ignored_client_error: IntCounter,

    /// Hits in the pseudonymiser's address cache.
    pub pseudo_cache_hit: IntCounter,

    /// Evictions from the pseudonymiser's address cache.
    pub pseudo_cache_evicted: IntCounter,

    /// Evictions from the first-seen recency cache.
    pub seen_cache_evicted: IntCounter,

    /// New-qname events handed to the publisher channel.
    pub new_qname_queued: IntCounter,

    /// New-qname events dropped because the publisher channel was full.
    pub new_qname_discarded: IntCounter,

    /// The current depth of the publisher channel.
    pub new_qname_channel_len: IntGauge,
}

impl Metrics {
    /// Creates a new `Metrics` with its own registry.
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        let processed_frames = counter!(
            "dnscrub_processed_frames_total",
            "The total number of processed transaction frames"
        );
        let ignored_client = counter!(
            "dnscrub_ignored_client_total",
            "The total number of records dropped because of an ignored client IP"
        );
        let ignored_client_error = counter!(
            "dnscrub_ignored_client_error_total",
            "The total number of records dropped because the client IP failed to parse, should always be 0"
        );
        let pseudo_cache_hit = counter!(
            "dnscrub_pseudo_cache_hit_total",
            "The total number of hits in the pseudonymiser address cache"
        );
        let pseudo_cache_evicted = counter!(
            "dnscrub_pseudo_cache_evicted_total",
            "The total number of evictions from the pseudonymiser address cache"
        );
        let seen_cache_evicted = counter!(
            "dnscrub_seen_cache_evicted_total",
            "The total number of evictions from the first-seen recency cache"
        );
        let new_qname_queued = counter!(
            "dnscrub_new_qname_queued_total",
            "The total number of queued new-qname events"
        );
        let new_qname_discarded = counter!(
            "dnscrub_new_qname_discarded_total",
            "The total number of discarded new-qname events"
        );

        let new_qname_channel_len = IntGauge::new(
            "dnscrub_new_qname_channel_len",
            "The number of new-qname events in the publisher channel buffer",
        )?;
        registry.register(Box::new(new_qname_channel_len.clone()))?;

        Ok(Arc::new(Self {
            registry,
            processed_frames,
            ignored_client,
            ignored_client_error,
            pseudo_cache_hit,
            pseudo_cache_evicted,
            seen_cache_evicted,
            new_qname_queued,
            new_qname_discarded,
            new_qname_channel_len,
        }))
    }

    /// Creates a throwaway `Metrics` for use in tests.
    #[cfg(test)]
    pub fn for_tests() -> Arc<Self> {
        Self::new().unwrap()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("unable to encode metrics: {}", err);
        }
        buffer
    }
}

////////////////////////////////////////////////////////////////////////
// THE LISTENER                                                       //
////////////////////////////////////////////////////////////////////////

/// Serves `/metrics` over HTTP on `addr`. This loop never returns on
/// its own; it is run on a detached thread and dies with the process.
pub fn run_exporter(metrics: Arc<Metrics>, addr: &str) {
    let server = match tiny_http::Server::http(addr) {
        Ok(server) => server,
        Err(err) => {
            error!("metrics listener failed to bind {}: {}", addr, err);
            return;
        }
    };
    info!("metrics listener on http://{}/metrics", addr);

    for request in server.incoming_requests() {
        let response = if request.url() == "/metrics" {
            tiny_http::Response::from_data(metrics.encode())
        } else {
            tiny_http::Response::from_string("not found").with_status_code(404)
        };
        if let Err(err) = request.respond(response) {
            error!("metrics listener failed to respond: {}", err);
        }
    }
}

/// Samples the depth of the new-qname publisher channel into its gauge
/// once per second.
pub fn run_channel_monitor(
    metrics: Arc<Metrics>,
    channel: Receiver<NewQnameEvent>,
    token: ShutdownToken,
) {
    let ticker = tick(Duration::from_secs(1));
    loop {
        select! {
            recv(ticker) -> _ => {
                metrics.new_qname_channel_len.set(channel.len() as i64);
            }
            recv(token.receiver()) -> _ => break,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
