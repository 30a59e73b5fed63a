//! Classifier subprocess handle: launch, readiness gating, pipe ownership.
//!
//! The classifier is spawned once for the server's lifetime. Its stdin is
//! handed to the uplink thread as [`ClassifierInput`] (the only writer) and
//! its stdout is pumped by a dedicated reader thread into a bounded channel
//! consumed by the demuxer as [`ClassifierOutput`] (the only reader). The
//! channel indirection is what lets the demuxer observe shutdown flags and
//! drain deadlines instead of parking forever in a blocking pipe read.
//! stderr is drained for the process lifetime and watched for the readiness
//! marker the classifier prints once its database is loaded.

use crate::config::ServerConfig;
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const STDOUT_CHUNK_BYTES: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Owns the child process; killing and reaping happen on drop.
pub struct Classifier {
    child: Child,
}

/// Write half of the classifier pipe pair. Held by the uplink thread.
pub struct ClassifierInput {
    stdin: ChildStdin,
}

/// Read half of the classifier pipe pair. Held by the demuxer thread.
pub struct ClassifierOutput {
    rx: Receiver<Vec<u8>>,
}

/// Outcome of waiting for the next stdout chunk.
pub enum ChunkResult {
    Chunk(Vec<u8>),
    Timeout,
    /// stdout reached end-of-file: the classifier is gone.
    Closed,
}

/// Launch the classifier and block until it signals readiness on stderr.
pub fn spawn(config: &ServerConfig) -> Result<(Classifier, ClassifierInput, ClassifierOutput)> {
    let argv = build_command(config)?;
    info!(command = %argv.join(" "), "launching classifier");

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("launch classifier: {}", argv[0]))?;

    let stdin = child.stdin.take().context("classifier stdin unavailable")?;
    let stdout = child.stdout.take().context("classifier stdout unavailable")?;
    let stderr = child.stderr.take().context("classifier stderr unavailable")?;

    let (ready_tx, ready_rx) = bounded(1);
    spawn_stderr_thread(stderr, config.ready_marker.clone(), ready_tx)?;

    let (out_tx, out_rx) = bounded(OUTPUT_CHANNEL_CAPACITY);
    spawn_stdout_thread(stdout, out_tx)?;

    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    info!("waiting for classifier readiness (database load)");
    match ready_rx.recv_timeout(startup_timeout) {
        Ok(()) => info!("classifier ready"),
        Err(RecvTimeoutError::Timeout) => {
            let _ = child.kill();
            let _ = child.wait();
            bail!(
                "classifier did not signal readiness within {}s (marker {:?} on stderr)",
                config.startup_timeout_secs,
                config.ready_marker
            );
        }
        Err(RecvTimeoutError::Disconnected) => {
            let status = child.wait().context("reap classifier")?;
            bail!("classifier exited during startup with {status}");
        }
    }

    Ok((
        Classifier { child },
        ClassifierInput { stdin },
        ClassifierOutput { rx: out_rx },
    ))
}

/// Build the classifier argv.
///
/// `--classifier-cmd` replaces the whole command line; otherwise a kraken2
/// invocation is assembled. `stdbuf -oL` plus `--unbuffered-output` keep the
/// subprocess's own stdio buffering from sitting on result lines, and
/// `/dev/fd/0` makes kraken2 stream records from its stdin.
fn build_command(config: &ServerConfig) -> Result<Vec<String>> {
    if let Some(raw) = &config.classifier_cmd {
        let argv = shell_words::split(raw)
            .with_context(|| format!("parse --classifier-cmd: {raw}"))?;
        if argv.is_empty() {
            bail!("--classifier-cmd is empty");
        }
        return Ok(argv);
    }

    let mut argv = vec![
        "stdbuf".to_string(),
        "-oL".to_string(),
        config.k2_binary.clone(),
    ];
    if let Some(report) = &config.report {
        argv.push("--report".to_string());
        argv.push(report.display().to_string());
    }
    if let Some(path) = &config.classified_out {
        argv.push("--classified-out".to_string());
        argv.push(path.display().to_string());
    }
    if let Some(path) = &config.unclassified_out {
        argv.push("--unclassified-out".to_string());
        argv.push(path.display().to_string());
    }
    argv.extend([
        "--unbuffered-output".to_string(),
        "--db".to_string(),
        config.database.display().to_string(),
        "--threads".to_string(),
        config.threads.to_string(),
        "--batch-size".to_string(),
        config.batch_size.to_string(),
        "/dev/fd/0".to_string(),
    ]);
    Ok(argv)
}

/// Drain classifier stderr for the process lifetime, signalling readiness
/// once the marker line appears.
fn spawn_stderr_thread(stderr: ChildStderr, marker: String, ready_tx: Sender<()>) -> Result<()> {
    thread::Builder::new()
        .name("classifier-stderr".to_string())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            let mut ready_tx = Some(ready_tx);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                debug!(target: "classifier", "{line}");
                if ready_tx.is_some() && line.contains(&marker) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            debug!("classifier stderr closed");
        })
        .context("spawn classifier stderr thread")?;
    Ok(())
}

/// Pump classifier stdout into the demuxer channel in bounded chunks.
fn spawn_stdout_thread(mut stdout: ChildStdout, tx: Sender<Vec<u8>>) -> Result<()> {
    thread::Builder::new()
        .name("classifier-stdout".to_string())
        .spawn(move || {
            let mut buffer = [0u8; STDOUT_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("classifier stdout read failed: {err}");
                        break;
                    }
                }
            }
            debug!("classifier stdout closed");
        })
        .context("spawn classifier stdout thread")?;
    Ok(())
}

impl ClassifierInput {
    /// Write records verbatim and flush, so the classifier's input-side
    /// latency is bounded by its own buffering, not ours.
    pub fn write_records(&mut self, data: &str) -> Result<()> {
        self.stdin
            .write_all(data.as_bytes())
            .and_then(|()| self.stdin.flush())
            .context("write to classifier stdin")
    }
}

impl ClassifierOutput {
    pub fn recv_chunk(&self, timeout: Duration) -> ChunkResult {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => ChunkResult::Chunk(chunk),
            Err(RecvTimeoutError::Timeout) => ChunkResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => ChunkResult::Closed,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!("classifier already exited with {status}"),
            Ok(None) => {
                if let Err(err) = self.child.kill() {
                    warn!("failed to kill classifier: {err}");
                }
                let _ = self.child.wait();
            }
            Err(err) => warn!("failed to poll classifier exit: {err}"),
        }
    }
}
