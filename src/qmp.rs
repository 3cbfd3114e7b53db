use std::future::Future;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde_json::{Map, Value};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::error::{Error, Result};

mod codec;
mod commands;
mod session;

pub use codec::{QmpEvent, QmpTimestamp, QmpVersion};
pub use commands::{
    BlockdevCache, CpuInfo, CpuInfoFast, CpuProperties, DeviceAddOptions, HotpluggableCpu,
    MemoryDevice, MemoryDeviceData, MigrationRam, MigrationStatus, NetDeviceAddOptions,
    SchemaInfo, StatusInfo, VirtioTransport,
};

use codec::{LineCodec, Message};
use session::{EventFilter, QmpCommand};

/// Default cap on the length of a single inbound protocol line.
const DEFAULT_MAX_LINE: usize = 1024 * 1024;

/// Depth of the submission channel. Kept minimal so submitters park
/// until the session task actually takes their command.
const SUBMISSION_DEPTH: usize = 1;

/// Session tunables.
#[derive(Debug, Clone)]
pub struct QmpConfig {
    /// Maximum accepted length of one inbound line, in bytes. Longer
    /// lines terminate the session with a framing error.
    pub max_line: usize,
}

impl Default for QmpConfig {
    fn default() -> Self {
        Self {
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

/// A live QMP session.
///
/// The session owns the connection through a background task; this
/// handle is cheap to share and all methods take `&self`. Commands
/// submitted concurrently are written to the peer strictly in
/// submission order, one in flight at a time.
#[derive(Debug)]
pub struct QmpSession {
    cmd_tx: mpsc::Sender<QmpCommand>,
    version: QmpVersion,
    disconnect_rx: watch::Receiver<bool>,
    events: Mutex<Option<mpsc::UnboundedReceiver<QmpEvent>>>,
    shutdown: Arc<Notify>,
}

impl QmpSession {
    /// Dial the QMP unix socket at `path` and perform the handshake.
    pub async fn connect<P: AsRef<Path>>(path: P, config: QmpConfig) -> Result<(Self, QmpVersion)> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(Error::Dial)?;
        Self::start(stream, config).await
    }

    /// Perform the QMP handshake over an established connection and
    /// start the session task.
    ///
    /// Consumes lines until the peer's greeting arrives; anything
    /// received before it (stray events, noise) is discarded. Returns
    /// [`Error::NoGreeting`] if the peer closes first.
    ///
    /// The returned version is also available through
    /// [`QmpSession::version`]. Note QEMU requires `qmp_capabilities`
    /// before it accepts any other command.
    pub async fn start(stream: UnixStream, config: QmpConfig) -> Result<(Self, QmpVersion)> {
        let mut codec = LineCodec::new(stream, config.max_line);

        let version = loop {
            match codec.read_line().await? {
                None => return Err(Error::NoGreeting),
                Some(line) => match codec::parse_message(&line) {
                    Ok(Message::Greeting(version)) => break version,
                    Ok(_) => debug!("discarding pre-greeting message: {line}"),
                    Err(e) => debug!("discarding unparseable pre-greeting line: {e}"),
                },
            }
        };
        debug!(
            "QMP greeting: version {}.{}.{}",
            version.major, version.minor, version.micro
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(SUBMISSION_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(session::run(
            codec,
            cmd_rx,
            event_tx,
            disconnect_tx,
            Arc::clone(&shutdown),
        ));

        let session = Self {
            cmd_tx,
            version: version.clone(),
            disconnect_rx,
            events: Mutex::new(Some(event_rx)),
            shutdown,
        };
        Ok((session, version))
    }

    /// The peer's version and capabilities, from the greeting.
    pub fn version(&self) -> &QmpVersion {
        &self.version
    }

    /// Take the event receiver.
    ///
    /// There is a single subscriber slot; the first call returns the
    /// receiver, later calls return `None`. The channel closes when the
    /// session tears down.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<QmpEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Ask the session to drain and close.
    ///
    /// Outstanding commands fail with [`Error::LoopExiting`]; the
    /// disconnect signal fires once teardown completes.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Wait until the session has disconnected.
    ///
    /// Resolves exactly once per session, for any number of waiters,
    /// whether teardown was requested or caused by the peer.
    pub async fn disconnected(&self) {
        let mut rx = self.disconnect_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Execute an arbitrary command with raw JSON arguments.
    ///
    /// Escape hatch for verbs without a typed wrapper. `arguments` must
    /// be a JSON object when present. Returns the peer's `return` value
    /// unchanged.
    pub async fn execute_raw(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let arguments = match arguments {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(Error::InvalidConfig(format!(
                    "command arguments must be an object, got: {other}"
                )))
            }
        };
        self.execute(name, arguments, None, None).await
    }

    /// Submit one command and wait for its reply.
    pub(crate) async fn execute(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        oob_fd: Option<RawFd>,
        filter: Option<EventFilter>,
    ) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = QmpCommand {
            name: name.to_string(),
            arguments,
            oob_fd,
            filter,
            reply: reply_tx,
        };

        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::LoopExiting)?;

        match reply_rx.await {
            Ok(result) => result,
            // Session dropped the reply sink while draining
            Err(_) => Err(Error::LoopExiting),
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Cancelled`].
///
/// Dropping the inner future is the cancellation mechanism: a command
/// abandoned this way is unqueued (or its response drained) by the
/// session without disturbing other submissions.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled),
    }
}
