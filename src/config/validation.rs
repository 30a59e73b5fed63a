use super::{Cli, ClientConfig, Command, ServerConfig};
use anyhow::{bail, Result};
use clap::Parser;

const MAX_CHUNK_BYTES: usize = 10 * 1024 * 1024;

impl Cli {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let cli = Self::parse();
        cli.validate()?;
        Ok(cli)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debug && self.quiet {
            bail!("--debug and --quiet are mutually exclusive");
        }
        match &self.command {
            Command::Server(config) => config.validate(),
            Command::Client(config) => config.validate(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("--threads must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        if self.filler_records < self.batch_size {
            bail!(
                "--filler-records ({}) must be at least --batch-size ({}), \
                 or the end sentinel can sit in the classifier's batch buffer forever",
                self.filler_records,
                self.batch_size
            );
        }
        if self.port != 0 && self.port == self.results_port {
            bail!("--port and --results-port must differ, got {}", self.port);
        }
        if self.ready_marker.is_empty() {
            bail!("--ready-marker must not be empty");
        }
        if self.startup_timeout_secs == 0 {
            bail!("--startup-timeout-secs must be at least 1");
        }
        if self.drain_timeout_secs == 0 {
            bail!("--drain-timeout-secs must be at least 1");
        }
        if self.classifier_cmd.is_none() && !self.database.is_dir() {
            bail!(
                "database directory does not exist: {}",
                self.database.display()
            );
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_bytes == 0 || self.chunk_bytes > MAX_CHUNK_BYTES {
            bail!(
                "--chunk-bytes must be between 1 and {MAX_CHUNK_BYTES}, got {}",
                self.chunk_bytes
            );
        }
        if self.port == self.results_port {
            bail!("--port and --results-port must differ, got {}", self.port);
        }
        if self.sample_id.is_empty() {
            bail!("--sample-id must not be empty");
        }
        if self.acquire_timeout_secs == 0 {
            bail!("--acquire-timeout-secs must be at least 1");
        }
        Ok(())
    }
}
