use std::os::unix::io::RawFd;
use std::vec::Vec;

use serde_derive::Deserialize;

use crate::error::{Error, Result};

/// Machine type and accelerator for the VM.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Machine {
    /// QEMU machine type (eg `pc`, `q35`).
    #[serde(default, rename = "type")]
    pub machine_type: String,
    /// Machine acceleration option (eg `kvm`).
    ///
    /// Empty means no `accel=` suboption is emitted.
    #[serde(default)]
    pub acceleration: String,
}

/// Guest CPU topology.
///
/// A zero value means "unspecified" and the corresponding suboption is
/// omitted from the command line. If `cpus` is zero, `-smp` is omitted
/// entirely.
#[derive(Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Smp {
    /// Number of vCPUs available at boot.
    #[serde(default)]
    pub cpus: u32,
    /// Cores per socket.
    #[serde(default)]
    pub cores: u32,
    /// Threads per core.
    #[serde(default)]
    pub threads: u32,
    /// Number of sockets.
    #[serde(default)]
    pub sockets: u32,
}

/// Guest memory sizing.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Memory {
    /// Amount of RAM, as a QEMU-parsable string like `256M` or `4G`.
    ///
    /// Empty means `-m` is omitted entirely.
    #[serde(default)]
    pub size: String,
    /// Number of hotpluggable memory slots. Zero means unspecified.
    #[serde(default)]
    pub slots: u32,
    /// Maximum memory after hotplug, same format as `size`.
    #[serde(default)]
    pub max: String,
}

/// Guest kernel image and command line.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Kernel {
    /// Path to the kernel image on the host. Empty means no `-kernel`.
    #[serde(default)]
    pub path: String,
    /// Kernel command line, passed through `-append`.
    #[serde(default)]
    pub params: String,
}

/// Guest real-time clock configuration.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Rtc {
    /// RTC base (eg `utc`). Empty means `-rtc` is omitted entirely.
    #[serde(default)]
    pub base: String,
    /// RTC clock source (eg `host`).
    #[serde(default)]
    pub clock: String,
    /// Drift fix mode (eg `slew`).
    #[serde(default)]
    pub drift_fix: String,
}

/// Host-side QMP control socket.
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct QmpSocket {
    /// Socket transport. Only `unix` is supported.
    ///
    /// Default: unix
    #[serde(default = "QmpSocket::default_transport", rename = "type")]
    pub transport: String,
    /// Path of the unix socket on the host.
    #[serde(default)]
    pub name: String,
    /// Whether QEMU should listen on the socket.
    #[serde(default)]
    pub server: bool,
    /// Whether QEMU should boot without waiting for a client.
    ///
    /// Only meaningful (and only emitted) together with `server`.
    #[serde(default)]
    pub nowait: bool,
}

impl QmpSocket {
    fn default_transport() -> String {
        "unix".into()
    }
}

impl Default for QmpSocket {
    fn default() -> Self {
        Self {
            transport: Self::default_transport(),
            name: String::new(),
            server: false,
            nowait: false,
        }
    }
}

/// A generic guest device.
///
/// Only the suboptions this stack actually uses are modelled; anything
/// more exotic goes through [`VmConfig::char_devices`] as an opaque
/// backend string.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Device {
    /// Device driver (eg `virtio-9p-pci`, `nvdimm`).
    #[serde(default, rename = "type")]
    pub driver: String,
    /// Device identifier.
    #[serde(default)]
    pub id: String,
    /// Memory backend object this device maps (eg for NVDIMM).
    #[serde(default)]
    pub memdev: String,
    /// Filesystem device backing this device.
    #[serde(default)]
    pub fsdev: String,
    /// Guest mount tag. Only valid together with `fsdev`.
    #[serde(default)]
    pub mount_tag: String,
    /// Character device backing this device.
    #[serde(default)]
    pub chardev: String,
}

/// A QEMU object (eg a memory backend).
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct Object {
    /// Object type (eg `memory-backend-file`).
    #[serde(default, rename = "type")]
    pub object_type: String,
    /// Object identifier.
    #[serde(default)]
    pub id: String,
    /// Backing file path, for file-backed memory objects.
    #[serde(default)]
    pub mem_path: String,
    /// Object size in bytes. Zero means unspecified.
    #[serde(default)]
    pub size: u64,
}

/// A host filesystem export.
#[derive(Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct FsDevice {
    /// Filesystem driver (eg `local`).
    #[serde(default, rename = "type")]
    pub driver: String,
    /// Export identifier, referenced by a [`Device`]'s `fsdev`.
    #[serde(default)]
    pub id: String,
    /// Host path being exported.
    #[serde(default)]
    pub path: String,
    /// Security model (eg `none`, `mapped`).
    #[serde(default)]
    pub security_model: String,
}

/// Full description of a VM to launch.
///
/// Immutable for the duration of a launch. Fields left at their zero
/// value (empty string, zero, empty list) cause the corresponding flag
/// to be omitted from the command line.
#[derive(Deserialize, Clone, Default, Debug)]
pub struct VmConfig {
    /// Path to the hypervisor binary.
    ///
    /// Defaults to `qemu-system-x86_64` when empty. Callers on non-x86
    /// hosts must set this explicitly.
    #[serde(default)]
    pub path: String,
    /// Guest name, passed through `-name`.
    #[serde(default)]
    pub name: String,
    /// Guest UUID.
    #[serde(default)]
    pub uuid: String,
    /// CPU model (eg `host`). Opaque to this crate.
    #[serde(default)]
    pub cpu_model: String,
    /// Machine type and accelerator.
    #[serde(default)]
    pub machine: Machine,
    /// QMP control socket.
    #[serde(default)]
    pub qmp_socket: Option<QmpSocket>,
    /// Guest memory.
    #[serde(default)]
    pub memory: Memory,
    /// Guest CPU topology.
    #[serde(default)]
    pub smp: Smp,
    /// Guest RTC.
    #[serde(default)]
    pub rtc: Rtc,
    /// Guest kernel.
    #[serde(default)]
    pub kernel: Kernel,
    /// Guest devices, in emission order.
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Character devices, already in QEMU backend syntax.
    #[serde(default)]
    pub char_devices: Vec<String>,
    /// QEMU objects, in emission order.
    #[serde(default)]
    pub objects: Vec<Object>,
    /// Host filesystem exports, in emission order.
    #[serde(default)]
    pub fs_devices: Vec<FsDevice>,
    /// A single `-global` parameter (eg `kvm-pit.lost_tick_policy=discard`).
    #[serde(default)]
    pub global_param: String,
    /// VGA mode (eg `none`, `std`).
    #[serde(default)]
    pub vga: String,
    /// Extra open file descriptors to inherit.
    ///
    /// The child sees these as descriptors `3..3+N`, in list order. They
    /// are borrowed: the caller must keep them open until the launch
    /// completes.
    #[serde(skip)]
    pub extra_fds: Vec<RawFd>,
}

impl VmConfig {
    /// Validate the statically known configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if let Some(qmp) = &self.qmp_socket {
            if qmp.transport != "unix" {
                return Err(Error::InvalidConfig(format!(
                    "unsupported QMP socket transport '{}'",
                    qmp.transport
                )));
            }
            if qmp.name.is_empty() {
                return Err(Error::InvalidConfig("QMP socket has empty path".into()));
            }
        }

        for (idx, device) in self.devices.iter().enumerate() {
            if device.driver.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "device index={idx} has no driver"
                )));
            }
            if !device.mount_tag.is_empty() && device.fsdev.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "device '{}' has mount_tag without fsdev",
                    device.id
                )));
            }
        }

        for object in &self.objects {
            if object.object_type.is_empty() || object.id.is_empty() {
                return Err(Error::InvalidConfig(
                    "object must have a type and an id".into(),
                ));
            }
        }

        for fsdev in &self.fs_devices {
            if fsdev.driver.is_empty() || fsdev.id.is_empty() {
                return Err(Error::InvalidConfig(
                    "fsdev must have a type and an id".into(),
                ));
            }
        }

        Ok(())
    }
}
