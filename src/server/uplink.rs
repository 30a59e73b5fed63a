//! Uplink handler: accepts client requests and feeds the classifier.
//!
//! One request per connection, answered synchronously, all on this single
//! thread, so broker transitions and classifier stdin writes are serialized
//! without any extra locking. The accept loop polls so it can notice the
//! shutdown flag (the reference design polled its socket the same way).

use crate::protocol::{read_message, write_message, Reply, Request};
use crate::sentinel;
use crate::server::broker::SessionBroker;
use crate::server::classifier::ClassifierInput;
use anyhow::{Context, Result};
use std::io::{BufReader, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind the uplink endpoint. A bind failure here is fatal at startup.
pub fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .with_context(|| format!("bind uplink endpoint {addr} (port already in use?)"))
}

pub struct UplinkHandler {
    listener: TcpListener,
    broker: Arc<SessionBroker>,
    input: ClassifierInput,
    shutdown: Arc<AtomicBool>,
    filler_records: usize,
}

impl UplinkHandler {
    pub fn new(
        listener: TcpListener,
        broker: Arc<SessionBroker>,
        input: ClassifierInput,
        shutdown: Arc<AtomicBool>,
        filler_records: usize,
    ) -> Self {
        Self {
            listener,
            broker,
            input,
            shutdown,
            filler_records,
        }
    }

    pub fn run(mut self) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .context("set uplink listener nonblocking")?;
        info!("uplink accepting requests");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.serve_connection(stream) {
                        warn!("request from {peer} failed: {err:#}");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => warn!("uplink accept failed: {err}"),
            }
        }
        info!("uplink exiting");
        Ok(())
    }

    fn serve_connection(&mut self, stream: TcpStream) -> Result<()> {
        stream
            .set_nonblocking(false)
            .context("set uplink connection blocking")?;
        stream
            .set_read_timeout(Some(REQUEST_TIMEOUT))
            .context("set uplink request timeout")?;
        let mut reader = BufReader::new(stream.try_clone().context("clone uplink stream")?);
        let mut stream = stream;

        let request = match read_message::<Request, _>(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                // Malformed or unknown command: reject it, don't die on it.
                let reply = Reply::Rejected {
                    message: format!("{err:#}"),
                };
                let _ = write_message(&mut stream, &reply);
                return Err(err);
            }
        };
        let reply = self.dispatch(request);
        write_message(&mut stream, &reply)
    }

    fn dispatch(&mut self, request: Request) -> Reply {
        match request {
            Request::Acquire { sample_id } => self.handle_acquire(&sample_id),
            Request::Submit { token, data } => self.handle_submit(&token, &data),
            Request::Finish { token } => self.handle_finish(&token),
        }
    }

    fn handle_acquire(&mut self, sample_id: &str) -> Reply {
        let Some(token) = self.broker.acquire(sample_id) else {
            debug!(sample = sample_id, "acquire refused; another session holds the classifier");
            return Reply::Busy;
        };
        // The start sentinel goes in before the grant is answered, so the
        // demuxer's sync phase has a boundary to find ahead of any data.
        if let Err(err) = self.input.write_records(&sentinel::start_record()) {
            warn!("failed to write start sentinel: {err:#}");
            let _ = self.broker.release(&token);
            return Reply::Rejected {
                message: format!("{err:#}"),
            };
        }
        info!(sample = sample_id, "session granted");
        Reply::Granted { token }
    }

    fn handle_submit(&mut self, token: &str, data: &str) -> Reply {
        if let Err(err) = self.broker.expect_active(token) {
            debug!("submit rejected: {err}");
            return Reply::Rejected {
                message: err.to_string(),
            };
        }
        match self.input.write_records(data) {
            Ok(()) => Reply::Ok,
            Err(err) => {
                warn!("failed to forward chunk: {err:#}");
                Reply::Rejected {
                    message: format!("{err:#}"),
                }
            }
        }
    }

    fn handle_finish(&mut self, token: &str) -> Reply {
        if let Err(err) = self.broker.begin_drain(token) {
            debug!("finish rejected: {err}");
            return Reply::Rejected {
                message: err.to_string(),
            };
        }
        let mut tail = sentinel::end_record();
        tail.push_str(&sentinel::filler_records(self.filler_records));
        match self.input.write_records(&tail) {
            Ok(()) => {
                info!(fillers = self.filler_records, "end sentinel and flush padding written");
                Reply::Ok
            }
            Err(err) => {
                warn!("failed to write end sentinel: {err:#}");
                Reply::Rejected {
                    message: format!("{err:#}"),
                }
            }
        }
    }
}
