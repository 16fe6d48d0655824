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

//! Implements the `run` command (i.e., running the minimiser).

use std::fmt::Write;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use env_logger::Env;
use log::{error, info};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use dnscrub::collector::{Collector, CollectorChannels};
use dnscrub::dictionary::Dictionary;
use dnscrub::ignore::IgnoreSet;
use dnscrub::metrics::{self, Metrics};
use dnscrub::minimiser::{self, WorkerChannels, WorkerContext};
use dnscrub::output;
use dnscrub::pseudo::Pseudonymiser;
use dnscrub::publish::{self, EventSigner, PublisherConfig};
use dnscrub::seen::SeenNames;
use dnscrub::sender::{HistogramSender, SenderConfig};
use dnscrub::thread::{shutdown_channel, ThreadGroup};
use dnscrub::tracker::{self, DomainTracker};
use dnscrub::{cleaner, input, watcher};

use crate::args::RunArgs;
use crate::config::{self, Config};

/// Runs the minimiser.
pub fn run(args: RunArgs) {
    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::init_from_env(Env::new().default_filter_or(default_level));

    if let Err(e) = try_running(args) {
        let mut message = String::from("Failed to run:");
        for (i, cause) in e.chain().enumerate() {
            write!(message, "\n[{}] {}", i + 1, cause).unwrap();
        }
        message.push_str("\nExiting with failure.");
        error!("{}", message);
        process::exit(1);
    }
    info!("Exiting with success.");
}

fn try_running(run_args: RunArgs) -> Result<()> {
    info!(
        "dnscrub daemon v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    info!(
        "Loading the configuration from {}.",
        run_args.config_file.display(),
    );
    let config =
        config::load(&run_args.config_file).context("failed to load the configuration")?;

    let metrics = Metrics::new().context("failed to set up metrics")?;

    // The core components. All of these are fatal on error: running
    // without the pseudonymiser key or the dictionary would defeat the
    // point of the tool.
    let pseudonymiser = Arc::new(
        Pseudonymiser::new(
            config.cryptopan_key.as_deref().unwrap_or(""),
            &config.cryptopan_key_salt,
            config.cryptopan_address_entries,
            metrics.clone(),
        )
        .context("failed to set up the pseudonymiser")?,
    );

    let ignore = Arc::new(IgnoreSet::new());
    ignore
        .load(config.ignored_client_ip_file.as_deref())
        .context("failed to load the client ignore list")?;

    let seen = Arc::new(
        SeenNames::open(
            &config.data_dir.join("seen"),
            config.qname_seen_entries,
            metrics.clone(),
        )
        .context("failed to open the first-seen store")?,
    );

    let dictionary = Dictionary::load(&config.well_known_domains)
        .context("failed to load the well-known-domain dictionary")?;
    info!(
        "Loaded the well-known-domain dictionary ({} entries).",
        dictionary.len(),
    );
    let tracker = Arc::new(DomainTracker::new(
        dictionary,
        config.well_known_domains.clone(),
    ));

    let capture = match config.debug_capture_file {
        Some(ref path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .context("failed to open the debug capture file")?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    // The pipeline channels. New-qname sends are non-blocking (drop
    // and count); update and session sends block so that backpressure
    // reaches the input queue.
    let (frame_tx, frame_rx) = bounded::<Vec<u8>>(32);
    let (update_tx, update_rx) = bounded(10_000);
    let (retry_tx, retry_rx) = bounded(10_000);
    let (session_tx, session_rx) = bounded(100);
    let (session_writer_tx, session_writer_rx) = bounded(100);
    let (histogram_writer_tx, histogram_writer_rx) = bounded(100);
    let (new_qname_tx, new_qname_rx) = bounded(config.new_qname_buffer);
    let (collector_stop_tx, collector_stop_rx) = bounded::<()>(0);

    let (trigger, token) = shutdown_channel();
    let group = ThreadGroup::new();
    let worker_group = ThreadGroup::new();

    // The metrics listener runs detached: it blocks in accept and dies
    // with the process.
    {
        let metrics = metrics.clone();
        thread::Builder::new()
            .name("metrics listener".to_owned())
            .spawn(move || metrics::run_exporter(metrics, metrics::LISTEN_ADDR))
            .context("failed to start the metrics listener")?;
    }
    {
        let metrics = metrics.clone();
        let channel = new_qname_rx.clone();
        let token = token.clone();
        group
            .start("channel monitor", move || {
                metrics::run_channel_monitor(metrics, channel, token)
            })
            .context("failed to start the channel monitor")?;
    }

    // Histogram files go to an outbox, move to "sent" on upload, and
    // are removed by the cleaner once they expire.
    let outbox_dir = config
        .data_dir
        .join("parquet")
        .join("histograms")
        .join("outbox");
    let sent_dir = config
        .data_dir
        .join("parquet")
        .join("histograms")
        .join("sent");

    {
        let data_dir = config.data_dir.clone();
        group
            .start("session writer", move || {
                output::run_session_writer(session_writer_rx, data_dir)
            })
            .context("failed to start the session writer")?;
    }
    {
        let outbox_dir = outbox_dir.clone();
        group
            .start("histogram writer", move || {
                output::run_histogram_writer(histogram_writer_rx, outbox_dir)
            })
            .context("failed to start the histogram writer")?;
    }

    if !config.disable_histogram_sender {
        let sender = HistogramSender::new(&sender_config(&config))
            .context("failed to set up the histogram sender")?;
        let outbox_dir = outbox_dir.clone();
        let sent_dir = sent_dir.clone();
        let token = token.clone();
        group
            .start("histogram sender", move || {
                dnscrub::sender::run_sender(sender, outbox_dir, sent_dir, token)
            })
            .context("failed to start the histogram sender")?;
    }

    if !config.disable_mqtt {
        let signer = EventSigner::from_pem_file(
            config
                .mqtt_signing_key_file
                .as_deref()
                .unwrap_or_else(|| std::path::Path::new("")),
            config.mqtt_signing_key_id.clone().unwrap_or_default(),
        )
        .context("failed to load the MQTT signing key")?;
        let publisher_config = publisher_config(&config);
        let events = new_qname_rx.clone();
        group
            .start("new-qname publisher", move || {
                publish::run_publisher(events, publisher_config, signer)
            })
            .context("failed to start the new-qname publisher")?;
    }

    {
        let sent_dir = sent_dir.clone();
        let token = token.clone();
        group
            .start("disk cleaner", move || cleaner::run_cleaner(sent_dir, token))
            .context("failed to start the disk cleaner")?;
    }

    // Live reload: the ignore list rebuilds from its own file; a
    // change of the configuration file re-derives the pseudonymiser
    // key.
    {
        let registrations = watcher_registrations(
            &config,
            &run_args.config_file,
            ignore.clone(),
            pseudonymiser.clone(),
        );
        let token = token.clone();
        group
            .start("config watcher", move || {
                if let Err(err) = watcher::run_watcher(registrations, token) {
                    error!("config watcher failed: {}", err);
                }
            })
            .context("failed to start the config watcher")?;
    }

    {
        let tracker = tracker.clone();
        let update_tx = update_tx.clone();
        group
            .start("update retryer", move || {
                tracker::run_retryer(tracker, retry_rx, update_tx)
            })
            .context("failed to start the update retryer")?;
    }
    {
        let collector = Collector::new(tracker.clone());
        let channels = CollectorChannels {
            session_rx,
            update_rx,
            retry_tx,
            stop_rx: collector_stop_rx,
            session_writer_tx,
            histogram_writer_tx,
        };
        group
            .start("collector", move || collector.run(channels))
            .context("failed to start the collector")?;
    }

    // The minimiser workers.
    let worker_context = Arc::new(WorkerContext {
        metrics,
        pseudonymiser,
        ignore,
        tracker,
        seen,
        capture,
        session_files_disabled: config.disable_session_files,
        publisher_enabled: !config.disable_mqtt,
    });
    let num_workers = if config.minimiser_workers > 0 {
        config.minimiser_workers
    } else {
        thread::available_parallelism().map_or(1, usize::from)
    };
    for id in 0..num_workers {
        info!("Starting minimiser worker {}.", id);
        let context = worker_context.clone();
        let channels = WorkerChannels {
            frames: frame_rx.clone(),
            updates: update_tx.clone(),
            sessions: session_tx.clone(),
            new_qnames: new_qname_tx.clone(),
        };
        let token = token.clone();
        worker_group
            .start(format!("minimiser {}", id), move || {
                minimiser::run_minimiser(id, context, channels, token)
            })
            .context("failed to start a minimiser worker")?;
    }

    // Only the workers (and the retryer, which has its own clone) may
    // hold pipeline senders from here on; otherwise the drain protocol
    // below never completes.
    drop(update_tx);
    drop(session_tx);
    drop(new_qname_tx);

    input::start_input(config.input(), frame_tx, &group, token.clone())
        .context("failed to start the frame input")?;

    // Wait for termination signals.
    let mut signals = set_up_signal_handling().context("failed to set up signal handling")?;
    info!("Set-up is complete; the pipeline is running.");
    for signal in signals.forever() {
        match signal {
            s @ (SIGINT | SIGTERM) => {
                let name = match s {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    _ => unreachable!(),
                };
                info!("Received {}; shutting down.", name);
                break;
            }
            _ => unreachable!(),
        }
    }

    // The drain protocol: cancel everything and join the workers
    // first, then let the collector stop its retryer and drain into
    // the writers, then wait for the remaining threads.
    trigger.fire();
    worker_group.shut_down();
    worker_group.await_shutdown();
    info!("Minimiser workers joined; stopping the collector.");
    drop(collector_stop_tx);
    group.shut_down();
    group.await_shutdown();
    info!("Shutdown complete.");
    Ok(())
}

fn sender_config(config: &Config) -> SenderConfig {
    SenderConfig {
        url: config.http_url.clone().unwrap_or_default(),
        signing_key_file: config.http_signing_key_file.clone().unwrap_or_default(),
        signing_key_id: config.http_signing_key_id.clone().unwrap_or_default(),
        ca_file: config.http_ca_file.clone(),
        client_cert_file: config.http_client_cert_file.clone().unwrap_or_default(),
        client_key_file: config.http_client_key_file.clone().unwrap_or_default(),
    }
}

fn publisher_config(config: &Config) -> PublisherConfig {
    PublisherConfig {
        server: config.mqtt_server.clone().unwrap_or_default(),
        client_id: config.mqtt_client_id.clone().unwrap_or_default(),
        topic: config.mqtt_topic.clone().unwrap_or_default(),
        keepalive_secs: config.mqtt_keepalive,
        signing_key_file: config.mqtt_signing_key_file.clone().unwrap_or_default(),
        signing_key_id: config.mqtt_signing_key_id.clone().unwrap_or_default(),
        ca_file: config.mqtt_ca_file.clone(),
        client_cert_file: config.mqtt_client_cert_file.clone().unwrap_or_default(),
        client_key_file: config.mqtt_client_key_file.clone().unwrap_or_default(),
        queue_dir: config.mqtt_queue_dir.clone(),
    }
}

/// Builds the live-reload registrations for the config watcher.
fn watcher_registrations(
    config: &Config,
    config_file: &std::path::Path,
    ignore: Arc<IgnoreSet>,
    pseudonymiser: Arc<Pseudonymiser>,
) -> Vec<(PathBuf, watcher::Callback)> {
    let mut registrations: Vec<(PathBuf, watcher::Callback)> = Vec::new();

    if let Some(ref path) = config.ignored_client_ip_file {
        let path_cloned = path.clone();
        let reload_path = path.clone();
        registrations.push((
            path_cloned,
            Box::new(move || {
                if let Err(err) = ignore.load(Some(&reload_path)) {
                    error!("unable to reload the client ignore list: {}", err);
                }
            }),
        ));
    }

    let config_path = config_file.to_path_buf();
    let reload_path = config_path.clone();
    registrations.push((
        config_path,
        Box::new(move || match config::load(&reload_path) {
            Ok(fresh) => {
                let result = pseudonymiser.reconfigure(
                    fresh.cryptopan_key.as_deref().unwrap_or(""),
                    &fresh.cryptopan_key_salt,
                    fresh.cryptopan_address_entries,
                );
                match result {
                    Ok(()) => info!("pseudonymiser rebuilt from the updated configuration"),
                    Err(err) => error!("unable to rebuild the pseudonymiser: {}", err),
                }
            }
            Err(err) => error!("ignoring an invalid configuration update: {}", err),
        }),
    ));

    registrations
}

fn set_up_signal_handling() -> Result<Signals> {
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // This sets up signal handlers to exit immediately if a second
    // termination signal arrives before the process finishes shutting
    // down gracefully.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(term_signals).map_err(|e| e.into())
}
