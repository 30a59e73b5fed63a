//! Client: stream a FASTQ file through the broker and receive results.
//!
//! `process_fastq` claims a session (retrying while the server is busy),
//! binds the results endpoint, and hands the file to a background sender
//! thread that submits one bounded chunk at a time, each blocked on its
//! acknowledgement. The returned [`ResultStream`] is a lazy iterator over
//! result fragments that ends when the server's DONE event arrives.
//!
//! Chunking is boundary-oblivious: the server forwards bytes verbatim and
//! in order, so a FASTQ record split across two chunks is reassembled
//! inside the classifier's stdin stream.

use crate::protocol::{self, write_message, Reply, Request, ResultEvent};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_CHUNK_BYTES: usize = 100_000;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);
const BIND_ATTEMPTS: usize = 240;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const EVENT_POLL: Duration = Duration::from_millis(500);

pub struct Client {
    server_addr: String,
    results_addr: String,
    sample_id: String,
    chunk_bytes: usize,
    acquire_timeout: Duration,
}

impl Client {
    pub fn new(
        server_addr: impl Into<String>,
        results_addr: impl Into<String>,
        sample_id: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            results_addr: results_addr.into(),
            sample_id: sample_id.into(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Claim a session, start feeding `fastq`, and return the lazy stream
    /// of result fragments.
    pub fn process_fastq(&self, fastq: &Path) -> Result<ResultStream> {
        let token = self.acquire()?;
        info!(sample = %self.sample_id, "session granted");

        // Bind only after the grant: while another client's session runs,
        // that client owns the results port.
        let listener = bind_results_listener(&self.results_addr)?;

        let (status_tx, status_rx) = bounded(1);
        let server_addr = self.server_addr.clone();
        let sender_token = token.clone();
        let path = fastq.to_path_buf();
        let chunk_bytes = self.chunk_bytes;
        thread::Builder::new()
            .name("k2mux-sender".to_string())
            .spawn(move || {
                let result = send_worker(&server_addr, &sender_token, &path, chunk_bytes);
                if let Err(err) = &result {
                    warn!("sender failed: {err:#}");
                }
                let _ = status_tx.send(result);
            })
            .context("spawn sender thread")?;

        Ok(ResultStream {
            listener,
            conn: None,
            token,
            sender_status: status_rx,
            sender_result: None,
            finished: false,
        })
    }

    /// Ask for the session until granted or the deadline passes. `busy` is
    /// the expected contended outcome, not an error; transport errors are
    /// also retried since the server may still be loading its database.
    fn acquire(&self) -> Result<String> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut logged_wait = false;
        loop {
            let request = Request::Acquire {
                sample_id: self.sample_id.clone(),
            };
            match protocol::request(&self.server_addr, &request) {
                Ok(Reply::Granted { token }) => return Ok(token),
                Ok(Reply::Busy) => {
                    if !logged_wait {
                        info!(sample = %self.sample_id, "server busy; waiting for session");
                        logged_wait = true;
                    }
                }
                Ok(other) => bail!("unexpected reply to acquire: {other:?}"),
                Err(err) => debug!("acquire attempt failed: {err:#}"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "could not acquire a session within {}s",
                    self.acquire_timeout.as_secs()
                );
            }
            thread::sleep(ACQUIRE_RETRY_DELAY);
        }
    }
}

/// Feed the file to the server in bounded chunks, one outstanding chunk at
/// a time, then finish the session.
fn send_worker(server_addr: &str, token: &str, path: &Path, chunk_bytes: usize) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let data = String::from_utf8(buf[..n].to_vec())
            .context("input file is not valid UTF-8 text")?;
        let submit = Request::Submit {
            token: token.to_string(),
            data,
        };
        match protocol::request(server_addr, &submit)? {
            Reply::Ok => {}
            Reply::Rejected { message } => bail!("server rejected chunk: {message}"),
            other => bail!("unexpected reply to submit: {other:?}"),
        }
    }
    let finish = Request::Finish {
        token: token.to_string(),
    };
    match protocol::request(server_addr, &finish)? {
        Reply::Ok => {
            debug!("all chunks sent, session finished");
            Ok(())
        }
        Reply::Rejected { message } => bail!("server rejected finish: {message}"),
        other => bail!("unexpected reply to finish: {other:?}"),
    }
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read input file"),
        }
    }
}

/// The results port frees only once the previous session's receiver drops
/// it, so a bind conflict here is the normal handover race.
fn bind_results_listener(addr: &str) -> Result<TcpListener> {
    let mut last_err = None;
    for attempt in 0..BIND_ATTEMPTS {
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .context("set results listener nonblocking")?;
                return Ok(listener);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                if attempt == 0 {
                    debug!("results endpoint {addr} in use; waiting for previous receiver");
                }
                last_err = Some(err);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("bind results endpoint {addr}"))
            }
        }
        thread::sleep(BIND_RETRY_DELAY);
    }
    match last_err {
        Some(err) => bail!("results endpoint {addr} still in use: {err}"),
        None => bail!("could not bind results endpoint {addr}"),
    }
}

/// Lazy, finite, non-restartable stream of result fragments for one
/// session. Yields `Ok(fragment)` per NOT-DONE push and ends after DONE;
/// a server-side failure or a dead sender surfaces as one final `Err`.
pub struct ResultStream {
    listener: TcpListener,
    conn: Option<EventConn>,
    token: String,
    sender_status: Receiver<Result<()>>,
    sender_result: Option<Result<()>>,
    finished: bool,
}

struct EventConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Iterator for ResultStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            // A failed sender means no DONE is coming; report rather than hang.
            if let Some(err) = self.take_sender_error() {
                self.finished = true;
                return Some(Err(err));
            }

            if self.conn.is_none() {
                match self.listener.accept() {
                    Ok((stream, _peer)) => match EventConn::new(stream) {
                        Ok(conn) => self.conn = Some(conn),
                        Err(err) => {
                            self.finished = true;
                            return Some(Err(err));
                        }
                    },
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                        continue;
                    }
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(err).context("accept results connection"));
                    }
                }
            }

            match self.poll_event() {
                Ok(Some(ResultEvent::Fragment { token, data })) => {
                    if token != self.token {
                        warn!("fragment for unexpected token {token}, dropping");
                        continue;
                    }
                    return Some(Ok(data));
                }
                Ok(Some(ResultEvent::Done { .. })) => {
                    debug!("done event received");
                    self.finished = true;
                    return None;
                }
                Ok(Some(ResultEvent::Failed { message, .. })) => {
                    self.finished = true;
                    return Some(Err(anyhow!("session failed on server: {message}")));
                }
                Ok(None) => continue,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl ResultStream {
    pub fn token(&self) -> &str {
        &self.token
    }

    fn take_sender_error(&mut self) -> Option<anyhow::Error> {
        if self.sender_result.is_none() {
            match self.sender_status.try_recv() {
                Ok(result) => self.sender_result = Some(result),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        if matches!(self.sender_result, Some(Err(_))) {
            if let Some(Err(err)) = self.sender_result.take() {
                return Some(err);
            }
        }
        None
    }

    /// Read and acknowledge the next event, or `None` on a poll tick.
    fn poll_event(&mut self) -> Result<Option<ResultEvent>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        let Some(line) = conn.poll_line()? else {
            return Ok(None);
        };
        let event: ResultEvent = serde_json::from_str(line.trim())
            .with_context(|| format!("decode result event: {line}"))?;
        write_message(&mut conn.stream, &Reply::Ok)?;
        Ok(Some(event))
    }
}

impl EventConn {
    fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_nonblocking(false)
            .context("set results connection blocking")?;
        stream
            .set_read_timeout(Some(EVENT_POLL))
            .context("set results read timeout")?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    /// Next complete line, buffering partial reads across poll timeouts so
    /// an event split by the timeout is never lost.
    fn poll_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned()));
            }
            let mut scratch = [0u8; 4096];
            match self.stream.read(&mut scratch) {
                Ok(0) => bail!("server closed results connection before done"),
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read results connection"),
            }
        }
    }
}
