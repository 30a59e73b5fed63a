use anyhow::{Context, Result};
use k2mux::config::{Cli, Command};
use k2mux::{init_tracing, Client, Server};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::Duration;
use tracing::info;

fn main() -> Result<()> {
    let cli = Cli::parse_args()?;
    init_tracing(cli.debug, cli.quiet, cli.log_json);

    match cli.command {
        Command::Server(config) => {
            let handle = Server::new(config).start()?;
            handle.wait()
        }
        Command::Client(config) => run_client(config),
    }
}

fn run_client(config: k2mux::config::ClientConfig) -> Result<()> {
    let client = Client::new(
        config.server_addr(),
        config.results_addr(),
        config.sample_id.clone(),
    )
    .chunk_bytes(config.chunk_bytes)
    .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

    let results = client.process_fastq(&config.fastq)?;

    let mut writer: BufWriter<Box<dyn Write>> = match &config.out {
        Some(path) => BufWriter::new(Box::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => BufWriter::new(Box::new(io::stdout())),
    };

    let mut fragments = 0usize;
    for fragment in results {
        let fragment = fragment?;
        writer.write_all(fragment.as_bytes())?;
        writer.flush()?;
        fragments += 1;
    }
    info!(sample = %config.sample_id, fragments, "all results received");
    Ok(())
}
