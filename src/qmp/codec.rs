//! Line framing and wire message model for QMP.
//!
//! QMP is newline-delimited JSON over a unix socket. Inbound lines are
//! copied into fresh owned buffers before crossing task boundaries;
//! outbound commands are a single JSON object terminated by `\n`.

use std::io::{self, IoSlice};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Peer version and capabilities, published once from the greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QmpVersion {
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Micro version number.
    pub micro: u32,
    /// QMP capability strings advertised by the peer.
    pub capabilities: Vec<String>,
}

impl QmpVersion {
    /// Whether the peer is at least version `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }

    /// Whether the peer is exactly version `major.minor`.
    pub fn is(&self, major: u32, minor: u32) -> bool {
        self.major == major && self.minor == minor
    }
}

/// An asynchronous event emitted by the peer.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpEvent {
    /// Event name, eg `DEVICE_DELETED`.
    #[serde(rename = "event")]
    pub name: String,
    /// Event payload, if any.
    #[serde(default)]
    pub data: Option<Value>,
    /// Peer-supplied timestamp, if any.
    #[serde(default)]
    pub timestamp: Option<QmpTimestamp>,
}

/// Timestamp attached to an event by the peer.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QmpTimestamp {
    /// Seconds since the epoch.
    pub seconds: u64,
    /// Microseconds within the second.
    pub microseconds: u64,
}

impl From<QmpTimestamp> for SystemTime {
    fn from(value: QmpTimestamp) -> Self {
        UNIX_EPOCH + Duration::from_secs(value.seconds) + Duration::from_micros(value.microseconds)
    }
}

/// A command response: the peer's `return` value or raw `error` object.
#[derive(Debug)]
pub(crate) enum Response {
    Ok(Value),
    Err(Value),
}

/// Any single inbound protocol line, classified by its top-level key.
#[derive(Debug)]
pub(crate) enum Message {
    Greeting(QmpVersion),
    Event(QmpEvent),
    Response(Response),
}

#[derive(Deserialize)]
struct Greeting {
    #[serde(rename = "QMP")]
    qmp: GreetingFields,
}

#[derive(Deserialize)]
struct GreetingFields {
    version: GreetingVersion,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct GreetingVersion {
    qemu: VersionTriple,
}

#[derive(Deserialize)]
struct VersionTriple {
    micro: u32,
    minor: u32,
    major: u32,
}

#[derive(Serialize)]
struct Command<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Map<String, Value>>,
}

/// Classify one inbound line.
pub(crate) fn parse_message(line: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Error::Framing(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::Framing(format!("not a JSON object: {line}")))?;

    if object.contains_key("QMP") {
        let greeting: Greeting = serde_json::from_value(value.clone())
            .map_err(|e| Error::Framing(format!("malformed greeting: {e}")))?;
        return Ok(Message::Greeting(QmpVersion {
            major: greeting.qmp.version.qemu.major,
            minor: greeting.qmp.version.qemu.minor,
            micro: greeting.qmp.version.qemu.micro,
            capabilities: greeting.qmp.capabilities,
        }));
    }
    if object.contains_key("event") {
        let event: QmpEvent = serde_json::from_value(value)
            .map_err(|e| Error::Framing(format!("malformed event: {e}")))?;
        return Ok(Message::Event(event));
    }
    if let Some(ret) = object.get("return") {
        return Ok(Message::Response(Response::Ok(ret.clone())));
    }
    if let Some(err) = object.get("error") {
        return Ok(Message::Response(Response::Err(err.clone())));
    }

    Err(Error::Framing(format!("unrecognized message: {line}")))
}

/// Extract the human-readable description from a raw peer error object.
///
/// Falls back to rendering the whole object when `desc` is missing.
pub(crate) fn error_desc(error: &Value) -> String {
    match error.get("desc").and_then(Value::as_str) {
        Some(desc) => desc.to_string(),
        None => error.to_string(),
    }
}

/// Serialize an outbound command, without the trailing newline.
pub(crate) fn encode_command(
    name: &str,
    arguments: Option<&Map<String, Value>>,
) -> Result<Vec<u8>> {
    serde_json::to_vec(&Command {
        execute: name,
        arguments,
    })
    .map_err(|e| Error::Framing(e.to_string()))
}

/// Framed reader/writer over the QMP connection.
///
/// Owned exclusively by the session task. Lines longer than `max_line`
/// terminate the session with a framing error.
pub(crate) struct LineCodec {
    reader: BufReader<UnixStream>,
    /// Bytes of a line whose terminator has not arrived yet. Lives here,
    /// not in the read future: the session select loop may drop that
    /// future between polls and no consumed byte may be lost with it.
    partial: Vec<u8>,
    max_line: usize,
}

impl LineCodec {
    pub(crate) fn new(stream: UnixStream, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(stream),
            partial: Vec::new(),
            max_line,
        }
    }

    /// Read the next newline-terminated line into a fresh buffer.
    ///
    /// Returns `Ok(None)` on a clean EOF at a line boundary. Cancel-safe.
    pub(crate) async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Framing("connection closed mid-line".to_string()));
            }

            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if self.partial.len() + pos > self.max_line {
                        return Err(Error::Framing(format!(
                            "line exceeds maximum length {}",
                            self.max_line
                        )));
                    }
                    self.partial.extend_from_slice(&buf[..pos]);
                    self.reader.consume(pos + 1);
                    // Hand the line off as an owned buffer; the next
                    // line starts from scratch
                    let line = std::mem::take(&mut self.partial);
                    return String::from_utf8(line)
                        .map(Some)
                        .map_err(|_| Error::Framing("line is not valid UTF-8".to_string()));
                }
                None => {
                    let n = buf.len();
                    if self.partial.len() + n > self.max_line {
                        return Err(Error::Framing(format!(
                            "line exceeds maximum length {}",
                            self.max_line
                        )));
                    }
                    self.partial.extend_from_slice(buf);
                    self.reader.consume(n);
                }
            }
        }
    }

    /// Write `payload` plus the line terminator.
    pub(crate) async fn write_line(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(payload).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Write `payload` plus the line terminator, attaching `fd` as
    /// SCM_RIGHTS ancillary data on the first byte.
    ///
    /// The initial send combines payload and ancillary data in a single
    /// sendmsg(2) so the peer receives the descriptor atomically with the
    /// command.
    pub(crate) async fn write_line_with_fd(&mut self, payload: &[u8], fd: RawFd) -> Result<()> {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.extend_from_slice(payload);
        buf.push(b'\n');

        let stream = self.reader.get_ref();
        let raw = stream.as_raw_fd();
        let mut written = 0;
        while written < buf.len() {
            let n = stream
                .async_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(&buf[written..])];
                    let fds = [fd];
                    let cmsgs = [ControlMessage::ScmRights(&fds)];
                    let cmsgs: &[ControlMessage] = if written == 0 { &cmsgs } else { &[] };
                    sendmsg::<UnixAddr>(raw, &iov, cmsgs, MsgFlags::empty(), None)
                        .map_err(|e| io::Error::from_raw_os_error(e as i32))
                })
                .await?;
            written += n;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_greeting() {
        let line = r#"{"QMP":{"version":{"qemu":{"micro":50,"minor":6,"major":2},"package":""},"capabilities":["one","two"]}}"#;
        match parse_message(line).unwrap() {
            Message::Greeting(version) => {
                assert_eq!(version.major, 2);
                assert_eq!(version.minor, 6);
                assert_eq!(version.micro, 50);
                assert_eq!(version.capabilities, ["one", "two"]);
            }
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_event() {
        let line = r#"{"event":"DEVICE_DELETED","data":{"device":"virtio0"},"timestamp":{"seconds":1352167040,"microseconds":123556}}"#;
        match parse_message(line).unwrap() {
            Message::Event(event) => {
                assert_eq!(event.name, "DEVICE_DELETED");
                assert_eq!(event.data.unwrap()["device"], "virtio0");
                let ts = event.timestamp.unwrap();
                let expected = UNIX_EPOCH
                    + Duration::from_secs(1352167040)
                    + Duration::from_micros(123556);
                assert_eq!(SystemTime::from(ts), expected);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_responses() {
        match parse_message(r#"{"return":{}}"#).unwrap() {
            Message::Response(Response::Ok(v)) => assert!(v.as_object().unwrap().is_empty()),
            other => panic!("expected success response, got {other:?}"),
        }
        match parse_message(r#"{"error":{"class":"GenericError","desc":"oops"}}"#).unwrap() {
            Message::Response(Response::Err(e)) => assert_eq!(error_desc(&e), "oops"),
            other => panic!("expected error response, got {other:?}"),
        }
    }

    // An error object without desc surfaces the whole object
    #[test]
    fn test_error_desc_missing() {
        let err: Value = serde_json::from_str(r#"{"class":"GenericError"}"#).unwrap();
        assert_eq!(error_desc(&err), r#"{"class":"GenericError"}"#);
    }

    #[test]
    fn test_parse_garbage_is_framing_error() {
        assert!(matches!(parse_message("not json"), Err(Error::Framing(_))));
        assert!(matches!(parse_message(r#"{"x":1}"#), Err(Error::Framing(_))));
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command("qmp_capabilities", None).unwrap();
        assert_eq!(encoded, br#"{"execute":"qmp_capabilities"}"#);

        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from("device_X"));
        let encoded = encode_command("device_del", Some(&arguments)).unwrap();
        assert_eq!(
            encoded,
            br#"{"execute":"device_del","arguments":{"id":"device_X"}}"#
        );
    }

    #[tokio::test]
    async fn test_read_line_fresh_buffers() {
        let (client, mut peer) = UnixStream::pair().unwrap();
        let mut codec = LineCodec::new(client, 1024);

        peer.write_all(b"first\nsecond\n").await.unwrap();
        let first = codec.read_line().await.unwrap().unwrap();
        let second = codec.read_line().await.unwrap().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");

        drop(peer);
        assert!(codec.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_overflow() {
        let (client, mut peer) = UnixStream::pair().unwrap();
        let mut codec = LineCodec::new(client, 8);

        peer.write_all(b"0123456789abcdef\n").await.unwrap();
        assert!(matches!(
            codec.read_line().await,
            Err(Error::Framing(_))
        ));
    }
}
