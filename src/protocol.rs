//! Wire protocol between clients and the broker server.
//!
//! Both channels speak newline-delimited JSON over TCP. Each message is one
//! serde-tagged object per line:
//! - Uplink requests (client → server): `{"cmd": "...", ...}`, answered by a
//!   `{"reply": "..."}` object on the same connection.
//! - Downlink events (server → receiver): `{"event": "...", ...}`, each
//!   acknowledged by the receiver with `{"reply": "ok"}` before the next
//!   event is pushed.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

/// Commands a client sends on the uplink channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Request {
    /// Ask for exclusive use of the classifier.
    #[serde(rename = "acquire")]
    Acquire { sample_id: String },

    /// Forward one chunk of sequence data for the current session.
    #[serde(rename = "submit")]
    Submit { token: String, data: String },

    /// All data for the current session has been sent.
    #[serde(rename = "finish")]
    Finish { token: String },
}

/// Synchronous answers on the uplink channel, and the downlink ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply")]
pub enum Reply {
    /// Session granted; all further requests must carry this token.
    #[serde(rename = "granted")]
    Granted { token: String },

    /// Another session is active; retry with backoff.
    #[serde(rename = "busy")]
    Busy,

    #[serde(rename = "ok")]
    Ok,

    /// Protocol violation or server-side failure; the request had no effect.
    #[serde(rename = "rejected")]
    Rejected { message: String },
}

/// Messages the server pushes to the session owner's receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ResultEvent {
    /// An ordered slice of classifier output; more will follow.
    #[serde(rename = "fragment")]
    Fragment { token: String, data: String },

    /// No more data will follow for this session.
    #[serde(rename = "done")]
    Done { token: String },

    /// The session was torn down by a server-side failure.
    #[serde(rename = "failed")]
    Failed { token: String, message: String },
}

/// Serialize `msg` as one JSON line and flush it to the peer.
pub fn write_message<T: Serialize>(stream: &mut TcpStream, msg: &T) -> Result<()> {
    let mut line = serde_json::to_string(msg).context("encode wire message")?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .and_then(|()| stream.flush())
        .context("write wire message")?;
    Ok(())
}

/// Read the next JSON line from the peer.
///
/// Returns `None` once the peer has closed the connection. Blank lines are
/// skipped; a line that fails to decode is an error (the sender is broken).
pub fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).context("read wire message")?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let msg = serde_json::from_str(trimmed)
            .with_context(|| format!("decode wire message: {trimmed}"))?;
        return Ok(Some(msg));
    }
}

/// One uplink exchange: connect, send `request`, read the reply, disconnect.
///
/// The uplink is strictly request/response with one outstanding request, so
/// a fresh connection per exchange keeps the server side trivially serial.
pub fn request(addr: &str, request: &Request) -> Result<Reply> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("connect to server at {addr}"))?;
    write_message(&mut stream, request)?;
    let mut reader = BufReader::new(stream);
    read_message(&mut reader)?.context("server closed connection without replying")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_are_stable() {
        let encoded = serde_json::to_string(&Request::Acquire {
            sample_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(encoded, r#"{"cmd":"acquire","sample_id":"s1"}"#);

        let decoded: Request =
            serde_json::from_str(r#"{"cmd":"submit","token":"t","data":"@r\nT\n+\n!\n"}"#).unwrap();
        match decoded {
            Request::Submit { token, data } => {
                assert_eq!(token, "t");
                assert!(data.starts_with("@r\n"));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_fails_to_decode() {
        let result = serde_json::from_str::<Request>(r#"{"cmd":"reboot"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn read_message_skips_blank_lines_and_detects_eof() {
        let mut input = std::io::Cursor::new(b"\n  \n{\"reply\":\"busy\"}\n".to_vec());
        let reply: Option<Reply> = read_message(&mut input).unwrap();
        assert!(matches!(reply, Some(Reply::Busy)));
        let eof: Option<Reply> = read_message(&mut input).unwrap();
        assert!(eof.is_none());
    }
}
