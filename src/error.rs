use std::io;

/// Errors reported by the launcher and the QMP client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration failed structural validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The hypervisor process could not be spawned.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// Binary we attempted to execute.
        binary: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// The hypervisor exited with a non-zero status.
    ///
    /// `stderr` is whatever the child printed, verbatim.
    #[error("qemu exited with {code:?}: {stderr}")]
    QemuFailed {
        /// Exit code, if the child exited normally.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// Connecting to the QMP socket failed.
    #[error("failed to dial QMP socket: {0}")]
    Dial(#[source] io::Error),

    /// A protocol line was oversized or not valid JSON.
    #[error("QMP framing error: {0}")]
    Framing(String),

    /// The peer closed the connection before sending a greeting.
    #[error("no QMP greeting received")]
    NoGreeting,

    /// The peer rejected a command. Carries the peer's `desc` verbatim.
    #[error("QMP error: {0}")]
    Peer(String),

    /// The caller's deadline expired or the call was cancelled.
    #[error("command cancelled")]
    Cancelled,

    /// The session is draining or closed; no more commands are accepted.
    #[error("QMP loop exiting")]
    LoopExiting,

    /// The requested behaviour is not supported by the peer's version.
    #[error("peer version {major}.{minor} does not support {feature}")]
    UnsupportedVersion {
        /// Peer major version.
        major: u32,
        /// Peer minor version.
        minor: u32,
        /// Human description of the gated behaviour.
        feature: &'static str,
    },

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
