use std::ffi::OsString;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};

use itertools::Itertools;
use log::{debug, log_enabled, Level};

use crate::config::VmConfig;
use crate::error::{Error, Result};

pub mod args;

/// Default hypervisor binary when [`VmConfig::path`] is empty.
///
/// Note this is only correct on x86-64 hosts; callers elsewhere must
/// configure an explicit path.
const DEFAULT_QEMU_BINARY: &str = "qemu-system-x86_64";

/// Result of a completed launch.
#[derive(Debug)]
pub struct LaunchOutput {
    /// Everything the child printed to stderr.
    pub stderr: String,
    /// The child's exit status.
    pub status: ExitStatus,
}

/// Represents a single QEMU instance.
///
/// Construction builds the command line; [`Qemu::run`] spawns the
/// hypervisor and blocks until it exits. Signalling the child and
/// sequencing the launch against a QMP connection are caller concerns.
pub struct Qemu {
    binary: String,
    args: Vec<OsString>,
    extra_fds: Vec<RawFd>,
}

impl Qemu {
    /// Construct a QEMU instance from `config`.
    ///
    /// Does not run anything yet.
    pub fn new(config: &VmConfig) -> Result<Self> {
        config.validate()?;

        let binary = if config.path.is_empty() {
            DEFAULT_QEMU_BINARY.to_string()
        } else {
            config.path.clone()
        };

        Ok(Self {
            binary,
            args: args::cmdline(config),
            extra_fds: config.extra_fds.clone(),
        })
    }

    /// The argument vector the hypervisor will be started with.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Launch the hypervisor and wait for it to exit.
    ///
    /// The child's stderr is captured; on non-zero exit it is surfaced
    /// verbatim in [`Error::QemuFailed`]. Extra file descriptors from the
    /// config are installed as descriptors `3..3+N` in list order.
    pub fn run(self) -> Result<LaunchOutput> {
        if log_enabled!(Level::Debug) {
            let args = self.args.iter().map(|a| a.to_string_lossy()).join(" ");
            debug!("qemu invocation: {} {}", self.binary, args);
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let fds = self.extra_fds.clone();
        if !fds.is_empty() {
            // Only async-signal-safe calls are allowed after the fork
            // (fcntl, dup2, close), so the staging buffer is allocated
            // here and the pushes below stay within capacity. Sources are
            // lifted above the target range first: a source sitting in a
            // target slot must not be clobbered while still needed. dup2
            // clears O_CLOEXEC on the installed copy.
            let mut staged: Vec<RawFd> = Vec::with_capacity(fds.len());
            unsafe {
                cmd.pre_exec(move || {
                    let os_err = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

                    let base = 3 + fds.len() as RawFd;
                    staged.clear();
                    for fd in &fds {
                        let dup = nix::fcntl::fcntl(*fd, nix::fcntl::FcntlArg::F_DUPFD(base))
                            .map_err(os_err)?;
                        staged.push(dup);
                    }
                    for (i, fd) in staged.iter().enumerate() {
                        nix::unistd::dup2(*fd, 3 + i as RawFd).map_err(os_err)?;
                        nix::unistd::close(*fd).map_err(os_err)?;
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let mut stderr = String::new();
        // unwrap() should never fail b/c we are capturing stderr
        child
            .stderr
            .take()
            .unwrap()
            .read_to_string(&mut stderr)?;
        let status = child.wait()?;

        if !status.success() {
            return Err(Error::QemuFailed {
                code: status.code(),
                stderr,
            });
        }

        Ok(LaunchOutput { stderr, status })
    }
}
