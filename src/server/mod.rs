//! Broker server: one classifier subprocess, two worker threads.
//!
//! `uplink` receives client commands and writes sequence data plus sentinel
//! records into the classifier's stdin; `demux` reads the classifier's
//! stdout, recovers session boundaries from the sentinel echoes, and pushes
//! results back to the session owner. The two threads share nothing but the
//! [`SessionBroker`] and the subprocess pipes.

mod broker;
mod classifier;
mod demux;
mod uplink;

pub use broker::{Phase, SessionBroker, SessionView};

use crate::config::ServerConfig;
use anyhow::{anyhow, Context, Result};
use demux::{Demuxer, TcpDownlink};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;
use uplink::UplinkHandler;

pub struct Server {
    config: ServerConfig,
}

/// Running server; dropping it (via [`ServerHandle::terminate`] or
/// [`ServerHandle::wait`]) kills and reaps the classifier.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    uplink_addr: SocketAddr,
    uplink_thread: JoinHandle<Result<()>>,
    demux_thread: JoinHandle<Result<()>>,
    _classifier: classifier::Classifier,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Launch the classifier, block until it signals readiness, then bind
    /// the uplink endpoint and start both workers. The ordering matters:
    /// no client request is accepted before the classifier can take data.
    pub fn start(self) -> Result<ServerHandle> {
        let config = self.config;
        let (classifier, input, output) = classifier::spawn(&config)?;

        let listener = uplink::bind(&config.uplink_addr())?;
        let uplink_addr = listener.local_addr().context("uplink local address")?;
        info!(%uplink_addr, results = %config.results_addr(), "server ready");

        let shutdown = Arc::new(AtomicBool::new(false));
        let broker = Arc::new(SessionBroker::new());

        let uplink = UplinkHandler::new(
            listener,
            Arc::clone(&broker),
            input,
            Arc::clone(&shutdown),
            config.filler_records,
        );
        let downlink = TcpDownlink::new(config.results_addr());
        let demuxer = Demuxer::new(
            broker,
            output,
            downlink,
            Arc::clone(&shutdown),
            Duration::from_secs(config.drain_timeout_secs),
        );

        let uplink_thread = thread::Builder::new()
            .name("uplink".to_string())
            .spawn(move || uplink.run())
            .context("spawn uplink thread")?;
        let demux_thread = thread::Builder::new()
            .name("demux".to_string())
            .spawn(move || demuxer.run())
            .context("spawn demux thread")?;

        Ok(ServerHandle {
            shutdown,
            uplink_addr,
            uplink_thread,
            demux_thread,
            _classifier: classifier,
        })
    }
}

impl ServerHandle {
    /// Actual uplink address; useful when configured with port 0.
    pub fn uplink_addr(&self) -> SocketAddr {
        self.uplink_addr
    }

    /// Block until the demuxer stops (shutdown requested, or a fault it
    /// cannot recover from), then wind down the uplink and the classifier.
    pub fn wait(self) -> Result<()> {
        let demux_result = join_worker(self.demux_thread, "demux");
        self.shutdown.store(true, Ordering::Relaxed);
        let uplink_result = join_worker(self.uplink_thread, "uplink");
        demux_result.and(uplink_result)
    }

    /// Stop both workers and kill the classifier.
    pub fn terminate(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wait()
    }
}

fn join_worker(handle: JoinHandle<Result<()>>, name: &str) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} thread panicked"))?
}
