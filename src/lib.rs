#![deny(missing_docs)]
//! Launch QEMU virtual machines and control them over QMP.
//!
//! The crate has two halves with a deliberately narrow coupling:
//!
//! * [`Qemu`](qemu::Qemu) turns a [`VmConfig`](config::VmConfig) into a
//!   command line and runs the hypervisor to completion.
//! * [`QmpSession`](qmp::QmpSession) speaks the QEMU Machine Protocol
//!   over the unix socket the config pointed QEMU at.
//!
//! The launcher knows nothing about QMP; a higher level owner starts the
//! VM, waits for the control socket, and dials the session.

/// Typed VM configuration.
pub mod config;
/// Error types.
pub mod error;
/// Launching the hypervisor.
pub mod qemu;
/// The QMP client.
pub mod qmp;

pub use crate::config::*;
pub use crate::error::*;
