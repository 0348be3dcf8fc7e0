//! QEMU command-line construction
//!
//! Pure: no filesystem access, so the exact invocation can be tested and
//! printed (`sandvisor args`).
//!
//! ```text
//!   -machine q35|virt  -accel <native> -accel tcg  -m  -smp
//!   -drive <base image>,if=virtio,snapshot=on       (never written)
//!   -kernel/-initrd/-append  |  pflash code (ro) + pflash vars (session copy)
//!   -virtfs per mount        |  virtio-serial + chardev socket → 127.0.0.1:<port>
//!   -serial file:<session>/serial.log
//! ```

use std::path::Path;

use super::config::{Accel, LaunchOptions, TransportWiring};
use crate::protocol::{MountDescriptor, DEVICE_NAME};
use crate::runtime::{HostArch, RuntimeInfo};

/// QEMU option values use `,` as a separator; literal commas are doubled
fn escape(value: &str) -> String {
    value.replace(',', ",,")
}

fn path_opt(path: &Path) -> String {
    escape(&path.display().to_string())
}

fn image_format(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("qcow2") => "qcow2",
        _ => "raw",
    }
}

fn kernel_cmdline(arch: HostArch) -> &'static str {
    match arch {
        HostArch::X86_64 => "console=ttyS0 root=/dev/vda rw quiet panic=1",
        HostArch::Aarch64 => "console=ttyAMA0 root=/dev/vda rw quiet panic=1",
    }
}

/// Build the full argument list (without the binary itself)
///
/// # Arguments
/// * `runtime` - Resolved binary, image and boot assets
/// * `mounts` - Shared directories; ignored for socket wiring
/// * `options` - Per-session resources and wiring
pub fn build_hypervisor_args(
    runtime: &RuntimeInfo,
    mounts: &[MountDescriptor],
    options: &LaunchOptions,
) -> Vec<String> {
    let accel = options
        .accel
        .unwrap_or_else(|| Accel::detect(&runtime.platform));
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-name", &format!("sandvisor-{}", options.session_id)]);
    match runtime.platform.arch {
        HostArch::X86_64 => push(&["-machine", "q35"]),
        HostArch::Aarch64 => push(&["-machine", "virt"]),
    }
    push(&["-accel", accel.as_str()]);
    if accel != Accel::Tcg {
        push(&["-accel", "tcg"]);
    }
    let cpu = if accel.supports_host_cpu() { "host" } else { "max" };
    push(&["-cpu", cpu]);
    push(&["-m", &options.memory_mib.to_string()]);
    push(&["-smp", &options.cpus.to_string()]);
    push(&["-nodefaults", "-display", "none", "-monitor", "none"]);

    push(&[
        "-drive",
        &format!(
            "file={},if=virtio,format={},snapshot=on",
            path_opt(&runtime.disk_image),
            image_format(&runtime.disk_image)
        ),
    ]);

    match (&runtime.kernel, &runtime.initrd) {
        (Some(kernel), Some(initrd)) => {
            push(&["-kernel", &kernel.display().to_string()]);
            push(&["-initrd", &initrd.display().to_string()]);
            push(&["-append", kernel_cmdline(runtime.platform.arch)]);
        }
        _ => {
            if let Some(code) = &runtime.firmware_code {
                push(&[
                    "-drive",
                    &format!("if=pflash,format=raw,unit=0,readonly=on,file={}", path_opt(code)),
                ]);
                if let Some(vars) = &options.firmware_vars {
                    push(&[
                        "-drive",
                        &format!("if=pflash,format=raw,unit=1,file={}", path_opt(vars)),
                    ]);
                }
            }
        }
    }

    match &options.transport {
        TransportWiring::SharedDirs => {
            for mount in mounts {
                let tag = escape(&mount.tag);
                push(&[
                    "-virtfs",
                    &format!(
                        "local,path={},mount_tag={tag},security_model=mapped-xattr,id={tag}",
                        path_opt(&mount.host_path)
                    ),
                ]);
            }
        }
        TransportWiring::Socket { port } => {
            push(&["-device", "virtio-serial-pci,id=vser0"]);
            push(&[
                "-chardev",
                &format!("socket,id=ipc,host=127.0.0.1,port={port},reconnect=1"),
            ]);
            push(&[
                "-device",
                &format!("virtserialport,bus=vser0.0,chardev=ipc,name={DEVICE_NAME}"),
            ]);
        }
    }

    push(&["-serial", &format!("file:{}", options.serial_log().display())]);

    if options.network {
        push(&["-netdev", "user,id=net0"]);
        push(&["-device", "virtio-net-pci,netdev=net0"]);
    }

    args
}
