//! Downlink demuxer: segments the classifier's output stream by sentinel
//! echoes and relays each session's result lines to its owner.
//!
//! Per session the demuxer runs three phases:
//! 1. sync: discard lines (leftover filler from the previous session) until
//!    the START echo appears;
//! 2. stream: forward complete result lines as fragments, suppressing any
//!    sentinel/filler echo;
//! 3. drain: once the broker marks the session DRAINING, keep forwarding
//!    until the END echo, bounded by the drain timeout, then push DONE and
//!    release the session.
//!
//! Output chunks arrive with no line alignment, so a partial trailing line
//! is buffered across reads ([`LineBuffer`]); a sentinel split over two
//! reads is reassembled before it is examined.

use crate::protocol::{read_message, write_message, Reply, ResultEvent};
use crate::sentinel::{marker_of, Marker};
use crate::server::broker::SessionBroker;
use crate::server::classifier::{ChunkResult, ClassifierOutput};
use anyhow::{bail, Context, Result};
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: usize = 150;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where demuxed fragments go. The TCP downlink is the production
/// implementation; tests drive the demuxer with an in-memory sink.
pub trait FragmentSink {
    fn send_fragment(&mut self, token: &str, data: &str) -> Result<()>;
    fn send_done(&mut self, token: &str) -> Result<()>;
    fn send_failed(&mut self, token: &str, message: &str) -> Result<()>;
}

enum SessionEnd {
    Completed,
    Shutdown,
    /// The receiver went away mid-session. If the END echo was not yet
    /// consumed, this session's remaining output must still be read through
    /// it so the next session starts on a clean stream.
    SinkFailed {
        error: anyhow::Error,
        end_seen: bool,
    },
}

enum ChunkOutcome {
    Chunk(Vec<u8>),
    Shutdown,
}

enum Sync {
    Synced,
    Shutdown,
}

pub struct Demuxer<S: FragmentSink> {
    broker: Arc<SessionBroker>,
    output: ClassifierOutput,
    sink: S,
    shutdown: Arc<AtomicBool>,
    drain_timeout: Duration,
    lines: LineBuffer,
    drain_deadline: Option<Instant>,
}

impl<S: FragmentSink> Demuxer<S> {
    pub fn new(
        broker: Arc<SessionBroker>,
        output: ClassifierOutput,
        sink: S,
        shutdown: Arc<AtomicBool>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            output,
            sink,
            shutdown,
            drain_timeout,
            lines: LineBuffer::new(),
            drain_deadline: None,
        }
    }

    /// Serve sessions until shutdown. Returns an error only for faults the
    /// server cannot recover from (classifier death, a missing END echo).
    pub fn run(mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            let Some(session) = self.broker.wait_for_session(POLL_INTERVAL) else {
                continue;
            };
            let token = session.token.clone();
            info!(sample = %session.sample_id, "session opened; scanning for start sentinel");
            match self.run_session(&token) {
                Ok(SessionEnd::Completed) => {
                    info!(sample = %session.sample_id, "session complete")
                }
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::SinkFailed { error, end_seen }) => {
                    warn!("downlink failed mid-session: {error:#}");
                    if end_seen {
                        let _ = self.broker.release(&token);
                    } else {
                        self.resync_until_end(&token)?;
                    }
                }
                Err(err) => {
                    warn!("session aborted: {err:#}");
                    if let Err(send_err) = self.sink.send_failed(&token, &format!("{err:#}")) {
                        debug!("could not deliver failure event: {send_err:#}");
                    }
                    let _ = self.broker.release(&token);
                    return Err(err);
                }
            }
        }
        info!("demuxer exiting");
        Ok(())
    }

    fn run_session(&mut self, token: &str) -> Result<SessionEnd> {
        self.drain_deadline = None;

        match self.sync_to_start(token)? {
            Sync::Shutdown => return Ok(SessionEnd::Shutdown),
            Sync::Synced => {}
        }

        let mut batch = String::new();
        loop {
            while let Some(line) = self.lines.next_line() {
                match marker_of(&line) {
                    None => {
                        batch.push_str(&line);
                        batch.push('\n');
                    }
                    Some(Marker::End) => {
                        debug!("end sentinel echo found");
                        if !batch.is_empty() {
                            if let Err(error) = self.sink.send_fragment(token, &batch) {
                                return Ok(SessionEnd::SinkFailed {
                                    error,
                                    end_seen: true,
                                });
                            }
                        }
                        if let Err(error) = self.sink.send_done(token) {
                            return Ok(SessionEnd::SinkFailed {
                                error,
                                end_seen: true,
                            });
                        }
                        self.broker
                            .release(token)
                            .context("release session after done")?;
                        return Ok(SessionEnd::Completed);
                    }
                    Some(Marker::Start) => warn!("unexpected start echo mid-session, suppressed"),
                    Some(Marker::Filler) => debug!("filler echo mid-session, suppressed"),
                }
            }

            // Nothing complete left to examine: flush what we have so
            // results stream promptly, then wait for more output.
            if !batch.is_empty() {
                if let Err(error) = self.sink.send_fragment(token, &batch) {
                    return Ok(SessionEnd::SinkFailed {
                        error,
                        end_seen: false,
                    });
                }
                batch.clear();
            }
            match self.next_chunk(token)? {
                ChunkOutcome::Shutdown => return Ok(SessionEnd::Shutdown),
                ChunkOutcome::Chunk(chunk) => self.lines.extend(&chunk),
            }
        }
    }

    /// Phase 1: consume lines until the START echo. Everything before it is
    /// residue from an earlier session's flush padding.
    fn sync_to_start(&mut self, token: &str) -> Result<Sync> {
        loop {
            while let Some(line) = self.lines.next_line() {
                match marker_of(&line) {
                    Some(Marker::Start) => return Ok(Sync::Synced),
                    _ => debug!("discarding pre-session line"),
                }
            }
            match self.next_chunk(token)? {
                ChunkOutcome::Shutdown => return Ok(Sync::Shutdown),
                ChunkOutcome::Chunk(chunk) => self.lines.extend(&chunk),
            }
        }
    }

    /// After a downlink failure, keep consuming (and dropping) this
    /// session's output through the END echo so the next session starts on
    /// a clean stream, then free the broker.
    fn resync_until_end(&mut self, token: &str) -> Result<()> {
        loop {
            while let Some(line) = self.lines.next_line() {
                if marker_of(&line) == Some(Marker::End) {
                    let _ = self.broker.release(token);
                    return Ok(());
                }
            }
            match self.next_chunk(token)? {
                ChunkOutcome::Shutdown => return Ok(()),
                ChunkOutcome::Chunk(chunk) => self.lines.extend(&chunk),
            }
        }
    }

    /// Wait for the next stdout chunk, honoring shutdown and, once the
    /// session is draining, the END-echo deadline.
    fn next_chunk(&mut self, token: &str) -> Result<ChunkOutcome> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(ChunkOutcome::Shutdown);
            }
            if self.drain_deadline.is_none() && self.broker.is_draining(token) {
                self.drain_deadline = Some(Instant::now() + self.drain_timeout);
            }
            if let Some(deadline) = self.drain_deadline {
                if Instant::now() >= deadline {
                    bail!(
                        "end sentinel not observed within {}s of finish; classifier wedged or filler count too low",
                        self.drain_timeout.as_secs()
                    );
                }
            }
            match self.output.recv_chunk(POLL_INTERVAL) {
                ChunkResult::Chunk(chunk) => return Ok(ChunkOutcome::Chunk(chunk)),
                ChunkResult::Timeout => continue,
                ChunkResult::Closed => bail!("classifier output stream ended unexpectedly"),
            }
        }
    }
}

/// Reassembles the classifier's chunked output into complete lines,
/// carrying a partial trailing line across reads.
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Remove and return the next complete line, without its newline.
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
    }
}

/// Production sink: per-session TCP connection to the results receiver,
/// one event pushed at a time, each acknowledged before the next.
pub struct TcpDownlink {
    addr: String,
    conn: Option<DownlinkConn>,
}

struct DownlinkConn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpDownlink {
    pub fn new(addr: String) -> Self {
        Self { addr, conn: None }
    }

    fn push(&mut self, event: &ResultEvent, terminal: bool) -> Result<()> {
        if self.conn.is_none() {
            let stream = self.connect_with_retry()?;
            stream
                .set_read_timeout(Some(ACK_TIMEOUT))
                .context("set downlink ack timeout")?;
            let reader = BufReader::new(stream.try_clone().context("clone downlink stream")?);
            self.conn = Some(DownlinkConn { stream, reader });
        }
        let Some(conn) = self.conn.as_mut() else {
            bail!("downlink connection unavailable");
        };
        let result = exchange(conn, event);
        if result.is_err() || terminal {
            self.conn = None;
        }
        result
    }

    /// The receiver binds its endpoint only after its session is granted,
    /// so the first connect usually races it; retry with a short delay.
    fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if attempt == 0 {
                        debug!("results receiver not up yet at {}: {err}", self.addr);
                    }
                    last_err = Some(err);
                }
            }
            thread::sleep(CONNECT_RETRY_DELAY);
        }
        match last_err {
            Some(err) => bail!("could not connect to results receiver at {}: {err}", self.addr),
            None => bail!("could not connect to results receiver at {}", self.addr),
        }
    }
}

fn exchange(conn: &mut DownlinkConn, event: &ResultEvent) -> Result<()> {
    write_message(&mut conn.stream, event)?;
    match read_message::<Reply, _>(&mut conn.reader)? {
        Some(Reply::Ok) => Ok(()),
        Some(other) => bail!("unexpected downlink ack: {other:?}"),
        None => bail!("receiver closed connection before acknowledging"),
    }
}

impl FragmentSink for TcpDownlink {
    fn send_fragment(&mut self, token: &str, data: &str) -> Result<()> {
        self.push(
            &ResultEvent::Fragment {
                token: token.to_string(),
                data: data.to_string(),
            },
            false,
        )
    }

    fn send_done(&mut self, token: &str) -> Result<()> {
        self.push(
            &ResultEvent::Done {
                token: token.to_string(),
            },
            true,
        )
    }

    fn send_failed(&mut self, token: &str, message: &str) -> Result<()> {
        self.push(
            &ResultEvent::Failed {
                token: token.to_string(),
                message: message.to_string(),
            },
            true,
        )
    }
}
