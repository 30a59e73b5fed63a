//! Command-line parsing and validation helpers.

mod validation;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_UPLINK_PORT: u16 = 5555;
pub const DEFAULT_RESULTS_PORT: u16 = 5556;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_FILLER_RECORDS: usize = 40;
pub const DEFAULT_CHUNK_BYTES: usize = 100_000;

fn default_threads() -> usize {
    num_cpus::get()
}

/// CLI options for k2mux. Validated values keep the classifier subprocess
/// and the wire protocol safe from nonsense settings.
#[derive(Debug, Parser, Clone)]
#[command(
    name = "k2mux",
    about = "Session-multiplexing broker for a shared kraken2 classifier process",
    version
)]
pub struct Cli {
    /// Verbose logging of debug information
    #[arg(long, global = true)]
    pub debug: bool,

    /// Minimal logging; warnings only
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", env = "K2MUX_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the broker server in front of one classifier process
    Server(ServerConfig),
    /// Stream a FASTQ file through a running server
    Client(ClientConfig),
}

#[derive(Debug, Args, Clone)]
pub struct ServerConfig {
    /// Path to the kraken2 database directory
    pub database: PathBuf,

    /// Address to bind/serve on
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    /// Uplink port clients send requests to (0 picks an ephemeral port)
    #[arg(long, default_value_t = DEFAULT_UPLINK_PORT)]
    pub port: u16,

    /// Port the session owner's receiver listens on for results
    #[arg(long = "results-port", default_value_t = DEFAULT_RESULTS_PORT)]
    pub results_port: u16,

    /// Path to the kraken2 binary
    #[arg(long = "k2-binary", default_value = "kraken2")]
    pub k2_binary: String,

    /// Full classifier command line, replacing the kraken2 invocation
    #[arg(long = "classifier-cmd", env = "K2MUX_CLASSIFIER_CMD")]
    pub classifier_cmd: Option<String>,

    /// Worker threads for the classifier
    #[arg(long, default_value_t = default_threads())]
    pub threads: usize,

    /// Records the classifier buffers before writing results
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Inert records written after the end sentinel to force the
    /// classifier to flush its output buffer
    #[arg(long = "filler-records", default_value_t = DEFAULT_FILLER_RECORDS)]
    pub filler_records: usize,

    /// Substring of the classifier stderr line that signals readiness
    #[arg(long = "ready-marker", default_value = "done")]
    pub ready_marker: String,

    /// Seconds to wait for classifier readiness (database load)
    #[arg(long = "startup-timeout-secs", default_value_t = 600)]
    pub startup_timeout_secs: u64,

    /// Seconds to wait for the end sentinel echo after a session finishes
    #[arg(long = "drain-timeout-secs", default_value_t = 60)]
    pub drain_timeout_secs: u64,

    /// Write a kraken2 report file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Write classified reads to this file
    #[arg(long = "classified-out")]
    pub classified_out: Option<PathBuf>,

    /// Write unclassified reads to this file
    #[arg(long = "unclassified-out")]
    pub unclassified_out: Option<PathBuf>,
}

impl ServerConfig {
    pub fn uplink_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn results_addr(&self) -> String {
        format!("{}:{}", self.address, self.results_port)
    }
}

#[derive(Debug, Args, Clone)]
pub struct ClientConfig {
    /// Input FASTQ file
    pub fastq: PathBuf,

    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    /// Server uplink port
    #[arg(long, default_value_t = DEFAULT_UPLINK_PORT)]
    pub port: u16,

    /// Local port to receive results on
    #[arg(long = "results-port", default_value_t = DEFAULT_RESULTS_PORT)]
    pub results_port: u16,

    /// Sample identifier reported to the server
    #[arg(long = "sample-id", default_value = "no_sample")]
    pub sample_id: String,

    /// Bytes per submitted chunk
    #[arg(long = "chunk-bytes", default_value_t = DEFAULT_CHUNK_BYTES)]
    pub chunk_bytes: usize,

    /// Write results here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Seconds to keep retrying while the server is busy
    #[arg(long = "acquire-timeout-secs", default_value_t = 600)]
    pub acquire_timeout_secs: u64,
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn results_addr(&self) -> String {
        format!("{}:{}", self.address, self.results_port)
    }
}
