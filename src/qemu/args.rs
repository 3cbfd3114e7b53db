//! Pure translation of a [`VmConfig`] into a hypervisor argument vector.
//!
//! Flag order and suboption order within a flag are fixed so that two
//! identical configs always produce identical command lines.

use std::ffi::OsString;

use crate::config::{Device, FsDevice, Kernel, Machine, Memory, Object, QmpSocket, Rtc, Smp, VmConfig};

fn machine_args(machine: &Machine) -> Vec<OsString> {
    if machine.machine_type.is_empty() {
        return Vec::new();
    }

    let mut arg = machine.machine_type.clone();
    if !machine.acceleration.is_empty() {
        arg.push_str(&format!(",accel={}", machine.acceleration));
    }

    vec!["-machine".into(), arg.into()]
}

fn qmp_args(qmp: &QmpSocket) -> Vec<OsString> {
    if qmp.name.is_empty() {
        return Vec::new();
    }

    let mut arg = format!("{}:{}", qmp.transport, qmp.name);
    if qmp.server {
        arg.push_str(",server");
        if qmp.nowait {
            arg.push_str(",nowait");
        }
    }

    vec!["-qmp".into(), arg.into()]
}

fn memory_args(memory: &Memory) -> Vec<OsString> {
    if memory.size.is_empty() {
        return Vec::new();
    }

    let mut arg = memory.size.clone();
    if memory.slots > 0 {
        arg.push_str(&format!(",slots={}", memory.slots));
    }
    if !memory.max.is_empty() {
        arg.push_str(&format!(",maxmem={}", memory.max));
    }

    vec!["-m".into(), arg.into()]
}

fn smp_args(smp: &Smp) -> Vec<OsString> {
    if smp.cpus == 0 {
        return Vec::new();
    }

    let mut arg = smp.cpus.to_string();
    if smp.cores > 0 {
        arg.push_str(&format!(",cores={}", smp.cores));
    }
    if smp.threads > 0 {
        arg.push_str(&format!(",threads={}", smp.threads));
    }
    if smp.sockets > 0 {
        arg.push_str(&format!(",sockets={}", smp.sockets));
    }

    vec!["-smp".into(), arg.into()]
}

fn device_args(device: &Device) -> Vec<OsString> {
    let mut arg = device.driver.clone();
    if !device.id.is_empty() {
        arg.push_str(&format!(",id={}", device.id));
    }
    if !device.memdev.is_empty() {
        arg.push_str(&format!(",memdev={}", device.memdev));
    }
    if !device.chardev.is_empty() {
        arg.push_str(&format!(",chardev={}", device.chardev));
    }
    if !device.fsdev.is_empty() {
        arg.push_str(&format!(",fsdev={}", device.fsdev));
        // mount_tag only makes sense for fs-backed devices
        if !device.mount_tag.is_empty() {
            arg.push_str(&format!(",mount_tag={}", device.mount_tag));
        }
    }

    vec!["-device".into(), arg.into()]
}

fn object_args(object: &Object) -> Vec<OsString> {
    let mut arg = object.object_type.clone();
    if !object.id.is_empty() {
        arg.push_str(&format!(",id={}", object.id));
    }
    if !object.mem_path.is_empty() {
        arg.push_str(&format!(",mem-path={}", object.mem_path));
    }
    if object.size > 0 {
        arg.push_str(&format!(",size={}", object.size));
    }

    vec!["-object".into(), arg.into()]
}

fn fsdev_args(fsdev: &FsDevice) -> Vec<OsString> {
    let mut arg = fsdev.driver.clone();
    if !fsdev.id.is_empty() {
        arg.push_str(&format!(",id={}", fsdev.id));
    }
    if !fsdev.path.is_empty() {
        arg.push_str(&format!(",path={}", fsdev.path));
    }
    if !fsdev.security_model.is_empty() {
        arg.push_str(&format!(",security-model={}", fsdev.security_model));
    }

    vec!["-fsdev".into(), arg.into()]
}

fn rtc_args(rtc: &Rtc) -> Vec<OsString> {
    if rtc.base.is_empty() {
        return Vec::new();
    }

    let mut arg = format!("base={}", rtc.base);
    if !rtc.drift_fix.is_empty() {
        arg.push_str(&format!(",driftfix={}", rtc.drift_fix));
    }
    if !rtc.clock.is_empty() {
        arg.push_str(&format!(",clock={}", rtc.clock));
    }

    vec!["-rtc".into(), arg.into()]
}

fn kernel_args(kernel: &Kernel) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if kernel.path.is_empty() {
        return args;
    }
    args.push("-kernel".into());
    args.push(kernel.path.clone().into());

    if !kernel.params.is_empty() {
        args.push("-append".into());
        args.push(kernel.params.clone().into());
    }

    args
}

/// Build the full hypervisor argument vector for `config`.
pub fn cmdline(config: &VmConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if !config.name.is_empty() {
        args.push("-name".into());
        args.push(config.name.clone().into());
    }
    if !config.uuid.is_empty() {
        args.push("-uuid".into());
        args.push(config.uuid.clone().into());
    }
    args.append(&mut machine_args(&config.machine));
    if !config.cpu_model.is_empty() {
        args.push("-cpu".into());
        args.push(config.cpu_model.clone().into());
    }
    if let Some(qmp) = &config.qmp_socket {
        args.append(&mut qmp_args(qmp));
    }
    args.append(&mut memory_args(&config.memory));
    args.append(&mut smp_args(&config.smp));
    for device in &config.devices {
        args.append(&mut device_args(device));
    }
    for chardev in &config.char_devices {
        args.push("-chardev".into());
        args.push(chardev.clone().into());
    }
    for fsdev in &config.fs_devices {
        args.append(&mut fsdev_args(fsdev));
    }
    for object in &config.objects {
        args.append(&mut object_args(object));
    }
    args.append(&mut rtc_args(&config.rtc));
    args.append(&mut kernel_args(&config.kernel));
    if !config.global_param.is_empty() {
        args.push("-global".into());
        args.push(config.global_param.clone().into());
    }
    if !config.vga.is_empty() {
        args.push("-vga".into());
        args.push(config.vga.clone().into());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn full_config() -> VmConfig {
        VmConfig {
            path: "/usr/bin/qemu-system-x86_64".into(),
            name: "guest0".into(),
            uuid: "a0b1c2d3-e4f5-0617-2839-4a5b6c7d8e9f".into(),
            cpu_model: "host".into(),
            machine: Machine {
                machine_type: "pc".into(),
                acceleration: "kvm".into(),
            },
            qmp_socket: Some(QmpSocket {
                transport: "unix".into(),
                name: "/tmp/qmp.sock".into(),
                server: true,
                nowait: true,
            }),
            memory: Memory {
                size: "2G".into(),
                slots: 2,
                max: "4G".into(),
            },
            smp: Smp {
                cpus: 2,
                cores: 1,
                threads: 1,
                sockets: 2,
            },
            rtc: Rtc {
                base: "utc".into(),
                clock: "host".into(),
                drift_fix: "slew".into(),
            },
            kernel: Kernel {
                path: "/boot/vmlinuz".into(),
                params: "root=/dev/vda rw".into(),
            },
            devices: vec![Device {
                driver: "virtio-9p-pci".into(),
                id: "dev0".into(),
                fsdev: "fs0".into(),
                mount_tag: "rootfs".into(),
                ..Default::default()
            }],
            char_devices: vec!["socket,id=ch0,path=/tmp/ch0.sock,server=on,wait=off".into()],
            objects: vec![Object {
                object_type: "memory-backend-file".into(),
                id: "mem0".into(),
                mem_path: "/dev/shm/mem0".into(),
                size: 1 << 30,
            }],
            fs_devices: vec![FsDevice {
                driver: "local".into(),
                id: "fs0".into(),
                path: "/srv/guest".into(),
                security_model: "none".into(),
            }],
            global_param: "kvm-pit.lost_tick_policy=discard".into(),
            vga: "none".into(),
            extra_fds: Vec::new(),
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_full_cmdline() {
        let expected = [
            "-name",
            "guest0",
            "-uuid",
            "a0b1c2d3-e4f5-0617-2839-4a5b6c7d8e9f",
            "-machine",
            "pc,accel=kvm",
            "-cpu",
            "host",
            "-qmp",
            "unix:/tmp/qmp.sock,server,nowait",
            "-m",
            "2G,slots=2,maxmem=4G",
            "-smp",
            "2,cores=1,threads=1,sockets=2",
            "-device",
            "virtio-9p-pci,id=dev0,fsdev=fs0,mount_tag=rootfs",
            "-chardev",
            "socket,id=ch0,path=/tmp/ch0.sock,server=on,wait=off",
            "-fsdev",
            "local,id=fs0,path=/srv/guest,security-model=none",
            "-object",
            "memory-backend-file,id=mem0,mem-path=/dev/shm/mem0,size=1073741824",
            "-rtc",
            "base=utc,driftfix=slew,clock=host",
            "-kernel",
            "/boot/vmlinuz",
            "-append",
            "root=/dev/vda rw",
            "-global",
            "kvm-pit.lost_tick_policy=discard",
            "-vga",
            "none",
        ];
        assert_eq!(strings(&cmdline(&full_config())), expected);
    }

    // Same config in, same argv out.
    #[test]
    fn test_cmdline_deterministic() {
        let config = full_config();
        assert_eq!(cmdline(&config), cmdline(&config));
    }

    #[rstest]
    #[case::name(|c: &mut VmConfig| c.name.clear(), "-name")]
    #[case::uuid(|c: &mut VmConfig| c.uuid.clear(), "-uuid")]
    #[case::machine(|c: &mut VmConfig| c.machine.machine_type.clear(), "-machine")]
    #[case::cpu(|c: &mut VmConfig| c.cpu_model.clear(), "-cpu")]
    #[case::qmp(|c: &mut VmConfig| c.qmp_socket = None, "-qmp")]
    #[case::memory(|c: &mut VmConfig| c.memory.size.clear(), "-m")]
    #[case::smp(|c: &mut VmConfig| c.smp.cpus = 0, "-smp")]
    #[case::device(|c: &mut VmConfig| c.devices.clear(), "-device")]
    #[case::chardev(|c: &mut VmConfig| c.char_devices.clear(), "-chardev")]
    #[case::fsdev(|c: &mut VmConfig| c.fs_devices.clear(), "-fsdev")]
    #[case::object(|c: &mut VmConfig| c.objects.clear(), "-object")]
    #[case::rtc(|c: &mut VmConfig| c.rtc.base.clear(), "-rtc")]
    #[case::kernel(|c: &mut VmConfig| c.kernel.path.clear(), "-kernel")]
    #[case::global(|c: &mut VmConfig| c.global_param.clear(), "-global")]
    #[case::vga(|c: &mut VmConfig| c.vga.clear(), "-vga")]
    fn test_flag_omitted(#[case] clear: fn(&mut VmConfig), #[case] flag: &str) {
        let mut config = full_config();
        clear(&mut config);

        let full = strings(&cmdline(&full_config()));
        let cleared = strings(&cmdline(&config));
        assert!(!cleared.contains(&flag.to_string()));

        // Everything unrelated to the cleared flag must be untouched
        let rest: Vec<&String> = full
            .iter()
            .enumerate()
            .filter(|(i, a)| {
                let owns_flag =
                    *a == flag || (*i > 0 && full[*i - 1] == flag && !a.starts_with('-'));
                // -kernel owns the -append pair as well
                let appended = flag == "-kernel"
                    && (*a == "-append" || (*i > 0 && full[*i - 1] == "-append"));
                !owns_flag && !appended
            })
            .map(|(_, a)| a)
            .collect();
        let got: Vec<&String> = cleared.iter().collect();
        assert_eq!(got, rest);
    }

    #[rstest]
    #[case::no_accel(
        Machine { machine_type: "q35".into(), acceleration: String::new() },
        "q35"
    )]
    #[case::accel(
        Machine { machine_type: "q35".into(), acceleration: "kvm".into() },
        "q35,accel=kvm"
    )]
    fn test_machine_value(#[case] machine: Machine, #[case] expected: &str) {
        let args = machine_args(&machine);
        assert_eq!(strings(&args), ["-machine", expected]);
    }

    #[rstest]
    #[case::plain(false, false, "unix:/run/q.sock")]
    #[case::server(true, false, "unix:/run/q.sock,server")]
    #[case::server_nowait(true, true, "unix:/run/q.sock,server,nowait")]
    // nowait without server is meaningless and must not be emitted
    #[case::nowait_only(false, true, "unix:/run/q.sock")]
    fn test_qmp_value(#[case] server: bool, #[case] nowait: bool, #[case] expected: &str) {
        let qmp = QmpSocket {
            transport: "unix".into(),
            name: "/run/q.sock".into(),
            server,
            nowait,
        };
        assert_eq!(strings(&qmp_args(&qmp)), ["-qmp", expected]);
    }

    #[test]
    fn test_device_without_fsdev_omits_mount_tag() {
        // mount_tag set but no fsdev: builder stays pure and just skips it
        // (validation rejects this combination before launch)
        let device = Device {
            driver: "virtio-9p-pci".into(),
            id: "dev0".into(),
            mount_tag: "tag".into(),
            ..Default::default()
        };
        assert_eq!(
            strings(&device_args(&device)),
            ["-device", "virtio-9p-pci,id=dev0"]
        );
    }

    #[test]
    fn test_object_zero_size_omitted() {
        let object = Object {
            object_type: "memory-backend-file".into(),
            id: "mem0".into(),
            mem_path: "/dev/shm/m".into(),
            size: 0,
        };
        assert_eq!(
            strings(&object_args(&object)),
            ["-object", "memory-backend-file,id=mem0,mem-path=/dev/shm/m"]
        );
    }

    #[test]
    fn test_kernel_without_params_has_no_append() {
        let kernel = Kernel {
            path: "/boot/vmlinuz".into(),
            params: String::new(),
        };
        assert_eq!(strings(&kernel_args(&kernel)), ["-kernel", "/boot/vmlinuz"]);
    }
}
