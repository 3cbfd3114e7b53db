use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use qemuctl::qmp::{QmpConfig, QmpSession, QmpVersion};

// A greeting as QEMU 2.6.50 sends it
pub const GREETING_2_6_50: &str = r#"{"QMP":{"version":{"qemu":{"micro":50,"minor":6,"major":2},"package":""},"capabilities":["one","two"]}}"#;

// Render a greeting for an arbitrary peer version
pub fn greeting(major: u32, minor: u32, micro: u32) -> String {
    format!(
        r#"{{"QMP":{{"version":{{"qemu":{{"micro":{micro},"minor":{minor},"major":{major}}},"package":""}},"capabilities":[]}}}}"#
    )
}

/// In-process stand-in for QEMU's side of the QMP socket.
///
/// Tests drive it explicitly: read what the client wrote, reply with
/// canned lines. Reading with a plain buffered reader means SCM_RIGHTS
/// ancillary data is silently dropped, which is fine for these tests.
pub struct MockPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockPeer {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one newline-terminated line, without the terminator.
    pub async fn recv_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(anyhow!("peer connection closed"));
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    /// Read one line and parse it as JSON.
    pub async fn recv_json(&mut self) -> Result<Value> {
        let line = self.recv_line().await?;
        serde_json::from_str(&line).with_context(|| format!("client sent invalid JSON: {line}"))
    }

    /// Reply `{"return":{}}` to the command most recently read.
    pub async fn reply_ok(&mut self) -> Result<()> {
        self.send_line(r#"{"return":{}}"#).await
    }

    /// Assert that the client writes nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        match tokio::time::timeout(window, self.recv_line()).await {
            Err(_) => Ok(()),
            Ok(Ok(line)) => Err(anyhow!("expected silence, client sent: {line}")),
            Ok(Err(e)) => Err(anyhow!("expected silence, connection failed: {e}")),
        }
    }
}

/// Set up a session against a mock peer reporting version `major.minor`.
pub async fn start_session(major: u32, minor: u32) -> Result<(QmpSession, QmpVersion, MockPeer)> {
    start_session_with_greeting(&greeting(major, minor, 0)).await
}

/// Set up a session whose peer sends `greeting` verbatim.
pub async fn start_session_with_greeting(
    greeting: &str,
) -> Result<(QmpSession, QmpVersion, MockPeer)> {
    let (client, server) = UnixStream::pair()?;
    let mut peer = MockPeer::new(server);
    peer.send_line(greeting).await?;

    let (session, version) = QmpSession::start(client, QmpConfig::default()).await?;
    Ok((session, version, peer))
}
