//! Typed wrappers for the QMP verbs used by the runtime.
//!
//! Each wrapper builds the argument map, applies the peer-version and
//! driver-family rules, optionally arms an event filter, and decodes the
//! `return` value. Version-dependent argument shapes live here, never in
//! the codec.

use log::warn;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::qmp::session::EventFilter;
use crate::qmp::QmpSession;

/// Drivers accepted for SCSI device hotplug.
const SCSI_DRIVERS: &[&str] = &["scsi-hd", "scsi-cd", "scsi-disk"];

/// CPU drivers that must not receive `socket-id`/`thread-id`.
const CPU_DRIVERS_WITHOUT_TOPOLOGY: &[&str] = &["host-s390x-cpu", "host-ppc64-cpu"];

/// CPU driver eligible for `die-id` (host x86, peer 4.1+).
const CPU_DRIVER_X86: &str = "host-x86_64-cpu";

/// Virtio device transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VirtioTransport {
    /// PCI transport: `bus=`, optional `addr=`/`romfile=`/`disable-modern`.
    #[default]
    Pci,
    /// CCW transport (s390x): the bus is addressed with `devno=`.
    Ccw,
}

/// Cache tuning for a hotplugged block device. Requires peer 2.9+.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockdevCache {
    /// Bypass the host page cache.
    pub direct: bool,
    /// Ignore flush requests.
    pub no_flush: bool,
}

/// Options for `device_add` of a generic (block or vhost-user) device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceAddOptions<'a> {
    /// Device driver, eg `virtio-blk-pci`.
    pub driver: &'a str,
    /// Device id.
    pub id: &'a str,
    /// Backing blockdev id (`drive=`). Empty to skip.
    pub drive: &'a str,
    /// Backing chardev id (`chardev=`), for vhost-user devices.
    pub chardev: &'a str,
    /// Bus to attach to (`devno=` on CCW).
    pub bus: &'a str,
    /// PCI slot address.
    pub addr: &'a str,
    /// Option ROM file. PCI only.
    pub romfile: &'a str,
    /// Device transport.
    pub transport: VirtioTransport,
    /// Allow concurrent writers. Only emitted at peer 2.10+.
    pub share_rw: bool,
    /// Suppress virtio 1.0 (PCI only).
    pub disable_modern: bool,
}

/// Options for `device_add` of a virtio network device.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDeviceAddOptions<'a> {
    /// Backing netdev id.
    pub netdev_id: &'a str,
    /// Device id.
    pub id: &'a str,
    /// Guest MAC address. Empty to let QEMU pick.
    pub mac: &'a str,
    /// Bus to attach to (`devno=` on CCW).
    pub bus: &'a str,
    /// PCI slot address.
    pub addr: &'a str,
    /// Option ROM file. PCI only.
    pub romfile: &'a str,
    /// Number of queue pairs. Greater than zero enables multiqueue.
    pub queues: u32,
    /// Device transport.
    pub transport: VirtioTransport,
    /// Suppress virtio 1.0 (PCI only).
    pub disable_modern: bool,
}

/// Guest run state, from `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    /// Whether all vCPUs are runnable.
    pub running: bool,
    /// Whether vCPUs are in single-step mode.
    #[serde(default)]
    pub singlestep: bool,
    /// The run state of the system (eg `running`, `paused`).
    pub status: String,
}

/// One vCPU record from `query-cpus`.
#[derive(Debug, Clone, Deserialize)]
pub struct CpuInfo {
    /// CPU index.
    #[serde(rename = "CPU")]
    pub cpu: i64,
    /// Whether this is the current CPU.
    #[serde(default)]
    pub current: bool,
    /// Whether the CPU is halted.
    #[serde(default)]
    pub halted: bool,
    /// QOM path of the CPU object.
    #[serde(default, rename = "qom_path")]
    pub qom_path: Option<String>,
    /// Host thread running this vCPU.
    #[serde(default)]
    pub thread_id: Option<i64>,
}

/// One vCPU record from `query-cpus-fast`.
#[derive(Debug, Clone, Deserialize)]
pub struct CpuInfoFast {
    /// CPU index.
    #[serde(rename = "cpu-index")]
    pub cpu_index: i64,
    /// QOM path of the CPU object.
    #[serde(default, rename = "qom-path")]
    pub qom_path: Option<String>,
    /// Host thread running this vCPU.
    #[serde(default, rename = "thread-id")]
    pub thread_id: Option<i64>,
}

/// Topology slot of a hotpluggable CPU.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuProperties {
    /// NUMA node.
    #[serde(default, rename = "node-id")]
    pub node: Option<i64>,
    /// Socket.
    #[serde(default, rename = "socket-id")]
    pub socket: Option<i64>,
    /// Die. x86 only.
    #[serde(default, rename = "die-id")]
    pub die: Option<i64>,
    /// Core.
    #[serde(default, rename = "core-id")]
    pub core: Option<i64>,
    /// Thread.
    #[serde(default, rename = "thread-id")]
    pub thread: Option<i64>,
}

/// One record from `query-hotpluggable-cpus`.
#[derive(Debug, Clone, Deserialize)]
pub struct HotpluggableCpu {
    /// CPU object type to pass to `device_add`.
    #[serde(rename = "type")]
    pub cpu_type: String,
    /// Number of vCPUs this slot provides.
    #[serde(rename = "vcpus-count")]
    pub vcpus_count: i64,
    /// Topology properties for `device_add`.
    #[serde(rename = "props")]
    pub properties: CpuProperties,
    /// QOM path, present when the slot is occupied.
    #[serde(default, rename = "qom-path")]
    pub qom_path: Option<String>,
}

/// Payload of a memory device record.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryDeviceData {
    /// Device id.
    #[serde(default)]
    pub id: Option<String>,
    /// Mapped guest physical address.
    #[serde(default)]
    pub addr: u64,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Slot number.
    #[serde(default)]
    pub slot: i64,
    /// Backing memory object.
    #[serde(default)]
    pub memdev: Option<String>,
    /// Whether the device was hotplugged.
    #[serde(default)]
    pub hotplugged: bool,
    /// Whether the device may be hotplugged.
    #[serde(default)]
    pub hotpluggable: bool,
}

/// One record from `query-memory-devices`.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryDevice {
    /// Device kind (eg `dimm`, `nvdimm`).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Device details.
    pub data: MemoryDeviceData,
}

/// RAM transfer counters of an in-progress migration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrationRam {
    /// Total bytes to move.
    #[serde(default)]
    pub total: u64,
    /// Bytes still to move.
    #[serde(default)]
    pub remaining: u64,
    /// Bytes already moved.
    #[serde(default)]
    pub transferred: u64,
}

/// Result of `query-migrate`.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationStatus {
    /// Migration state (eg `active`, `completed`, `failed`).
    #[serde(default)]
    pub status: String,
    /// RAM counters, present while a migration is active.
    #[serde(default)]
    pub ram: Option<MigrationRam>,
}

/// One entry from `query-qmp-schema`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaInfo {
    /// Meta type of the entity (`command`, `event`, ...).
    #[serde(rename = "meta-type")]
    pub meta_type: String,
    /// Entity name.
    pub name: String,
}

fn insert_str(arguments: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        arguments.insert(key.to_string(), Value::from(value));
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Framing(format!("malformed return: {e}")))
}

impl QmpSession {
    /// Negotiate capabilities. QEMU requires this before any other
    /// command is accepted.
    pub async fn execute_qmp_capabilities(&self) -> Result<()> {
        self.execute("qmp_capabilities", None, None, None)
            .await
            .map(|_| ())
    }

    /// Pause guest execution.
    pub async fn execute_stop(&self) -> Result<()> {
        self.execute("stop", None, None, None).await.map(|_| ())
    }

    /// Resume guest execution.
    pub async fn execute_cont(&self) -> Result<()> {
        self.execute("cont", None, None, None).await.map(|_| ())
    }

    /// Terminate the hypervisor. The peer closes the connection shortly
    /// after replying.
    pub async fn execute_quit(&self) -> Result<()> {
        self.execute("quit", None, None, None).await.map(|_| ())
    }

    /// Reset the guest, as if the reset button were pressed.
    pub async fn execute_system_reset(&self) -> Result<()> {
        self.execute("system_reset", None, None, None)
            .await
            .map(|_| ())
    }

    /// Ask the guest to power down via ACPI.
    ///
    /// Completes only once the guest actually shut down, ie when the
    /// `SHUTDOWN` event arrives.
    pub async fn execute_system_powerdown(&self) -> Result<()> {
        let filter = EventFilter {
            name: "SHUTDOWN".to_string(),
            data_match: None,
        };
        self.execute("system_powerdown", None, None, Some(filter))
            .await
            .map(|_| ())
    }

    /// Attach a raw host block device as blockdev `blockdev_id`.
    ///
    /// The wire shape pivots on the peer version: before 2.8 the payload
    /// is wrapped in an `options` envelope and identified by `id`; from
    /// 2.8 on it is flat and identified by `node-name`. Cache tuning
    /// requires 2.9+.
    pub async fn execute_blockdev_add(
        &self,
        device: &str,
        blockdev_id: &str,
        read_only: bool,
        cache: Option<BlockdevCache>,
    ) -> Result<()> {
        let version = self.version();

        let mut blockdev = Map::new();
        blockdev.insert("driver".to_string(), Value::from("raw"));
        blockdev.insert("read-only".to_string(), Value::from(read_only));
        if version.at_least(2, 8) {
            blockdev.insert("node-name".to_string(), Value::from(blockdev_id));
        } else {
            blockdev.insert("id".to_string(), Value::from(blockdev_id));
        }

        if let Some(cache) = cache {
            if !version.at_least(2, 9) {
                return Err(Error::UnsupportedVersion {
                    major: version.major,
                    minor: version.minor,
                    feature: "blockdev cache options",
                });
            }
            let mut opts = Map::new();
            opts.insert("direct".to_string(), Value::from(cache.direct));
            opts.insert("no-flush".to_string(), Value::from(cache.no_flush));
            blockdev.insert("cache".to_string(), Value::Object(opts));
        }

        let mut file = Map::new();
        file.insert("driver".to_string(), Value::from("file"));
        file.insert("filename".to_string(), Value::from(device));
        blockdev.insert("file".to_string(), Value::Object(file));

        let arguments = if version.at_least(2, 8) {
            blockdev
        } else {
            let mut outer = Map::new();
            outer.insert("options".to_string(), Value::Object(blockdev));
            outer
        };

        self.execute("blockdev-add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Remove blockdev `blockdev_id`.
    ///
    /// Uses `x-blockdev-del` below peer 2.9 (keyed by `node-name` at
    /// exactly 2.8, `id` earlier) and `blockdev-del` from 2.9 on.
    pub async fn execute_blockdev_del(&self, blockdev_id: &str) -> Result<()> {
        let version = self.version();

        let (verb, key) = if version.at_least(2, 9) {
            ("blockdev-del", "node-name")
        } else if version.is(2, 8) {
            ("x-blockdev-del", "node-name")
        } else {
            ("x-blockdev-del", "id")
        };

        let mut arguments = Map::new();
        arguments.insert(key.to_string(), Value::from(blockdev_id));
        self.execute(verb, Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Hot-unplug device `dev_id`.
    ///
    /// Completes only once the matching `DEVICE_DELETED` event arrives,
    /// ie when the guest has actually released the device.
    pub async fn execute_device_del(&self, dev_id: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(dev_id));
        let filter = EventFilter {
            name: "DEVICE_DELETED".to_string(),
            data_match: Some(("device".to_string(), Value::from(dev_id))),
        };
        self.execute("device_del", Some(arguments), None, Some(filter))
            .await
            .map(|_| ())
    }

    /// Hot-plug a generic device.
    pub async fn execute_device_add(&self, options: DeviceAddOptions<'_>) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from(options.driver));
        insert_str(&mut arguments, "id", options.id);
        insert_str(&mut arguments, "drive", options.drive);
        insert_str(&mut arguments, "chardev", options.chardev);

        match options.transport {
            VirtioTransport::Ccw => {
                insert_str(&mut arguments, "devno", options.bus);
            }
            VirtioTransport::Pci => {
                insert_str(&mut arguments, "bus", options.bus);
                insert_str(&mut arguments, "addr", options.addr);
                insert_str(&mut arguments, "romfile", options.romfile);
                if options.disable_modern {
                    arguments.insert("disable-modern".to_string(), Value::from(true));
                }
            }
        }

        if options.share_rw && self.version().at_least(2, 10) {
            arguments.insert("share-rw".to_string(), Value::from("on"));
        }

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Hot-plug a SCSI device onto an existing SCSI controller.
    ///
    /// `driver` must be one of `scsi-hd`, `scsi-cd`, `scsi-disk`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_scsi_device_add(
        &self,
        blockdev_id: &str,
        dev_id: &str,
        driver: &str,
        bus: &str,
        scsi_id: Option<i64>,
        lun: Option<i64>,
        share_rw: bool,
        disable_modern: bool,
    ) -> Result<()> {
        if !SCSI_DRIVERS.contains(&driver) {
            return Err(Error::InvalidConfig(format!(
                "invalid SCSI driver '{driver}'"
            )));
        }

        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from(driver));
        arguments.insert("id".to_string(), Value::from(dev_id));
        arguments.insert("drive".to_string(), Value::from(blockdev_id));
        insert_str(&mut arguments, "bus", bus);
        if let Some(scsi_id) = scsi_id {
            arguments.insert("scsi-id".to_string(), Value::from(scsi_id));
        }
        if let Some(lun) = lun {
            arguments.insert("lun".to_string(), Value::from(lun));
        }
        if disable_modern {
            arguments.insert("disable-modern".to_string(), Value::from(true));
        }
        if share_rw && self.version().at_least(2, 10) {
            arguments.insert("share-rw".to_string(), Value::from("on"));
        }

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Hot-plug a virtio network device bound to an existing netdev.
    ///
    /// With more than zero queue pairs the device is put in multiqueue
    /// mode: `mq=on` and `vectors = 2*queues + 2` (one rx/tx vector per
    /// queue pair plus config and control).
    pub async fn execute_net_device_add(&self, options: NetDeviceAddOptions<'_>) -> Result<()> {
        let driver = match options.transport {
            VirtioTransport::Pci => "virtio-net-pci",
            VirtioTransport::Ccw => "virtio-net-ccw",
        };

        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from(driver));
        arguments.insert("netdev".to_string(), Value::from(options.netdev_id));
        insert_str(&mut arguments, "id", options.id);
        insert_str(&mut arguments, "mac", options.mac);

        match options.transport {
            VirtioTransport::Ccw => {
                insert_str(&mut arguments, "devno", options.bus);
            }
            VirtioTransport::Pci => {
                insert_str(&mut arguments, "bus", options.bus);
                insert_str(&mut arguments, "addr", options.addr);
                insert_str(&mut arguments, "romfile", options.romfile);
                if options.disable_modern {
                    arguments.insert("disable-modern".to_string(), Value::from(true));
                }
            }
        }

        if options.queues > 0 {
            arguments.insert("mq".to_string(), Value::from("on"));
            arguments.insert(
                "vectors".to_string(),
                Value::from(2 * options.queues + 2),
            );
        }

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Add a tap netdev backed by `ifname`.
    pub async fn execute_netdev_add(
        &self,
        netdev_type: &str,
        netdev_id: &str,
        ifname: &str,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("type".to_string(), Value::from(netdev_type));
        arguments.insert("id".to_string(), Value::from(netdev_id));
        arguments.insert("ifname".to_string(), Value::from(ifname));
        arguments.insert("script".to_string(), Value::from("no"));
        arguments.insert("downscript".to_string(), Value::from("no"));

        self.execute("netdev_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Add a netdev whose queues are pre-opened descriptors previously
    /// registered with [`QmpSession::execute_getfd`].
    pub async fn execute_netdev_add_by_fds(
        &self,
        netdev_type: &str,
        netdev_id: &str,
        fd_names: &[&str],
        vhost_fd_names: &[&str],
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("type".to_string(), Value::from(netdev_type));
        arguments.insert("id".to_string(), Value::from(netdev_id));
        arguments.insert("fds".to_string(), Value::from(fd_names.join(":")));
        if !vhost_fd_names.is_empty() {
            arguments.insert("vhost".to_string(), Value::from("on"));
            arguments.insert(
                "vhostfds".to_string(),
                Value::from(vhost_fd_names.join(":")),
            );
        }

        self.execute("netdev_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Remove netdev `netdev_id`.
    pub async fn execute_netdev_del(&self, netdev_id: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(netdev_id));
        self.execute("netdev_del", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Add a QEMU object with flattened properties.
    pub async fn execute_object_add(
        &self,
        qom_type: &str,
        id: &str,
        properties: Map<String, Value>,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("qom-type".to_string(), Value::from(qom_type));
        arguments.insert("id".to_string(), Value::from(id));
        arguments.extend(properties);

        self.execute("object-add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Remove object `id`.
    pub async fn execute_object_del(&self, id: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(id));
        self.execute("object-del", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Add a unix-socket character device backend.
    pub async fn execute_chardev_add_unix(
        &self,
        id: &str,
        path: &str,
        server: bool,
        wait: bool,
    ) -> Result<()> {
        let mut addr_data = Map::new();
        addr_data.insert("path".to_string(), Value::from(path));
        let mut addr = Map::new();
        addr.insert("type".to_string(), Value::from("unix"));
        addr.insert("data".to_string(), Value::Object(addr_data));

        let mut data = Map::new();
        data.insert("addr".to_string(), Value::Object(addr));
        data.insert("server".to_string(), Value::from(server));
        data.insert("wait".to_string(), Value::from(wait));

        let mut backend = Map::new();
        backend.insert("type".to_string(), Value::from("socket"));
        backend.insert("data".to_string(), Value::Object(data));

        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(id));
        arguments.insert("backend".to_string(), Value::Object(backend));

        self.execute("chardev-add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Remove character device `id`.
    pub async fn execute_chardev_remove(&self, id: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("id".to_string(), Value::from(id));
        self.execute("chardev-remove", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Register an open descriptor with the peer under `name`.
    ///
    /// The descriptor rides along the command as SCM_RIGHTS ancillary
    /// data, sent atomically with the payload.
    pub async fn execute_getfd(&self, name: &str, fd: std::os::unix::io::RawFd) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("fdname".to_string(), Value::from(name));
        self.execute("getfd", Some(arguments), Some(fd), None)
            .await
            .map(|_| ())
    }

    /// Resize the guest memory balloon to `bytes`.
    pub async fn execute_balloon(&self, bytes: u64) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("value".to_string(), Value::from(bytes));
        self.execute("balloon", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Start migrating the guest to `uri`.
    pub async fn execute_migrate(&self, uri: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("uri".to_string(), Value::from(uri));
        self.execute("migrate", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Prepare this instance to receive a migration on `uri`.
    pub async fn execute_migrate_incoming(&self, uri: &str) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("uri".to_string(), Value::from(uri));
        self.execute("migrate-incoming", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Query the state of the current migration.
    pub async fn query_migrate(&self) -> Result<MigrationStatus> {
        decode(self.execute("query-migrate", None, None, None).await?)
    }

    /// List CPU slots available for hotplug.
    pub async fn query_hotpluggable_cpus(&self) -> Result<Vec<HotpluggableCpu>> {
        decode(
            self.execute("query-hotpluggable-cpus", None, None, None)
                .await?,
        )
    }

    /// Hot-plug a vCPU into a topology slot.
    ///
    /// `socket-id` and `thread-id` are withheld from drivers that do not
    /// model them (s390x, ppc64 host CPUs); `die-id` is only meaningful
    /// for host x86 CPUs and peers 4.1+.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_cpu_device_add(
        &self,
        driver: &str,
        cpu_id: &str,
        socket_id: Option<i64>,
        die_id: Option<i64>,
        core_id: i64,
        thread_id: Option<i64>,
        romfile: &str,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from(driver));
        arguments.insert("id".to_string(), Value::from(cpu_id));
        arguments.insert("core-id".to_string(), Value::from(core_id));

        if !CPU_DRIVERS_WITHOUT_TOPOLOGY.contains(&driver) {
            if let Some(socket_id) = socket_id {
                arguments.insert("socket-id".to_string(), Value::from(socket_id));
            }
            if let Some(thread_id) = thread_id {
                arguments.insert("thread-id".to_string(), Value::from(thread_id));
            }
        }
        if let Some(die_id) = die_id {
            if driver == CPU_DRIVER_X86 && self.version().at_least(4, 1) {
                arguments.insert("die-id".to_string(), Value::from(die_id));
            }
        }
        insert_str(&mut arguments, "romfile", romfile);

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// List vCPUs.
    pub async fn query_cpus(&self) -> Result<Vec<CpuInfo>> {
        decode(self.execute("query-cpus", None, None, None).await?)
    }

    /// List vCPUs without interrupting the guest.
    pub async fn query_cpus_fast(&self) -> Result<Vec<CpuInfoFast>> {
        decode(self.execute("query-cpus-fast", None, None, None).await?)
    }

    /// List memory devices.
    pub async fn query_memory_devices(&self) -> Result<Vec<MemoryDevice>> {
        decode(
            self.execute("query-memory-devices", None, None, None)
                .await?,
        )
    }

    /// Query the guest run state.
    pub async fn query_status(&self) -> Result<StatusInfo> {
        decode(self.execute("query-status", None, None, None).await?)
    }

    /// List the commands and events the peer supports.
    pub async fn query_qmp_schema(&self) -> Result<Vec<SchemaInfo>> {
        decode(self.execute("query-qmp-schema", None, None, None).await?)
    }

    /// Read a QOM property.
    pub async fn qom_get(&self, path: &str, property: &str) -> Result<Value> {
        let mut arguments = Map::new();
        arguments.insert("path".to_string(), Value::from(path));
        arguments.insert("property".to_string(), Value::from(property));
        self.execute("qom-get", Some(arguments), None, None).await
    }

    /// Write a QOM property.
    pub async fn qom_set(&self, path: &str, property: &str, value: Value) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("path".to_string(), Value::from(path));
        arguments.insert("property".to_string(), Value::from(property));
        arguments.insert("value".to_string(), value);
        self.execute("qom-set", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Dump guest memory to `protocol` (eg `file:/tmp/dump`).
    pub async fn execute_dump_guest_memory(
        &self,
        protocol: &str,
        paging: bool,
        format: Option<&str>,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("protocol".to_string(), Value::from(protocol));
        arguments.insert("paging".to_string(), Value::from(paging));
        if let Some(format) = format {
            arguments.insert("format".to_string(), Value::from(format));
        }

        self.execute("dump-guest-memory", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Hot-plug `size` bytes of memory.
    ///
    /// Adds a memory backend object (file-backed when `mem_path` is
    /// non-empty) and a `pc-dimm` device mapping it. If the device add
    /// fails the backend object is rolled back.
    pub async fn execute_hotplug_memory(
        &self,
        id: &str,
        size: u64,
        mem_path: &str,
        share: bool,
    ) -> Result<()> {
        let qom_type = if mem_path.is_empty() {
            "memory-backend-ram"
        } else {
            "memory-backend-file"
        };
        let memdev_id = format!("mem{id}");

        let mut properties = Map::new();
        properties.insert("size".to_string(), Value::from(size));
        insert_str(&mut properties, "mem-path", mem_path);
        if share {
            properties.insert("share".to_string(), Value::from(true));
        }
        self.execute_object_add(qom_type, &memdev_id, properties)
            .await?;

        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from("pc-dimm"));
        arguments.insert("id".to_string(), Value::from(format!("dimm{id}")));
        arguments.insert("memdev".to_string(), Value::from(memdev_id.as_str()));
        let result = self
            .execute("device_add", Some(arguments), None, None)
            .await;

        if let Err(e) = result {
            if let Err(del_err) = self.execute_object_del(&memdev_id).await {
                warn!("failed to roll back memory backend {memdev_id}: {del_err}");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Hot-plug an NVDIMM backed by `mem_path`.
    pub async fn execute_nvdimm_device_add(
        &self,
        id: &str,
        mem_path: &str,
        size: u64,
        pmem: Option<bool>,
    ) -> Result<()> {
        let memdev_id = format!("nvdimmbackmem{id}");

        let mut properties = Map::new();
        properties.insert("mem-path".to_string(), Value::from(mem_path));
        properties.insert("size".to_string(), Value::from(size));
        properties.insert("share".to_string(), Value::from(true));
        if let Some(pmem) = pmem {
            properties.insert("pmem".to_string(), Value::from(pmem));
        }
        self.execute_object_add("memory-backend-file", &memdev_id, properties)
            .await?;

        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from("nvdimm"));
        arguments.insert("id".to_string(), Value::from(format!("nvdimm{id}")));
        arguments.insert("memdev".to_string(), Value::from(memdev_id));
        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Pass through the host PCI device at `bdf` via VFIO.
    pub async fn execute_vfio_device_add(
        &self,
        bdf: &str,
        id: &str,
        bus: &str,
        transport: VirtioTransport,
    ) -> Result<()> {
        let driver = match transport {
            VirtioTransport::Pci => "vfio-pci",
            VirtioTransport::Ccw => "vfio-ccw",
        };

        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from(driver));
        arguments.insert("host".to_string(), Value::from(bdf));
        insert_str(&mut arguments, "id", id);
        match transport {
            VirtioTransport::Ccw => insert_str(&mut arguments, "devno", bus),
            VirtioTransport::Pci => insert_str(&mut arguments, "bus", bus),
        }

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Pass through a mediated VFIO device by sysfs path.
    pub async fn execute_pci_vfio_mediated_device_add(
        &self,
        sysfsdev: &str,
        id: &str,
        addr: &str,
        bus: &str,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from("vfio-pci"));
        arguments.insert("sysfsdev".to_string(), Value::from(sysfsdev));
        insert_str(&mut arguments, "id", id);
        insert_str(&mut arguments, "addr", addr);
        insert_str(&mut arguments, "bus", bus);

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }

    /// Hot-plug a vhost-vsock device.
    ///
    /// `vhostfd` is the name of a descriptor previously registered with
    /// [`QmpSession::execute_getfd`].
    pub async fn execute_pci_vsock_add(
        &self,
        id: &str,
        guest_cid: u64,
        vhostfd: &str,
        disable_modern: bool,
    ) -> Result<()> {
        let mut arguments = Map::new();
        arguments.insert("driver".to_string(), Value::from("vhost-vsock-pci"));
        arguments.insert("id".to_string(), Value::from(id));
        arguments.insert("guest-cid".to_string(), Value::from(guest_cid));
        insert_str(&mut arguments, "vhostfd", vhostfd);
        if disable_modern {
            arguments.insert("disable-modern".to_string(), Value::from(true));
        }

        self.execute("device_add", Some(arguments), None, None)
            .await
            .map(|_| ())
    }
}
