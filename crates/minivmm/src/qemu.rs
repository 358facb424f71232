//! QEMU argument construction and process launch.
//!
//! QEMU daemonizes itself (`-daemonize`), so a successful launch returns
//! once the guest is up and the QMP socket is listening; the supervisor
//! then records the VNC port over QMP.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec::Exec;
use crate::image;
use crate::network;
use crate::store::VmMetadata;

pub const QMP_SOCKET_FILE: &str = "qmp.socket";
pub const VNC_SOCKET_FILE: &str = "vnc.socket";

const AARCH64_EFI_FIRMWARE: &str = "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd";

pub fn qmp_socket_path(vm_dir: &Path) -> PathBuf {
    vm_dir.join(QMP_SOCKET_FILE)
}

pub fn vnc_socket_path(vm_dir: &Path) -> PathBuf {
    vm_dir.join(VNC_SOCKET_FILE)
}

fn drive_arg(path: &str) -> String {
    format!("file={path},if=virtio,cache=none,aio=threads,format=qcow2")
}

/// Build the QEMU argument vector for a VM, memory converted to MiB.
pub fn build_args(
    meta: &VmMetadata,
    vm_dir: &Path,
    no_kvm: bool,
    keyboard_layout: &str,
) -> Result<Vec<String>> {
    let memory_mib = image::size_to_mib(&meta.memory)?;
    let tap = network::tap_name(&meta.name);

    let mut args: Vec<String> = Vec::with_capacity(32);

    if !no_kvm {
        args.push("--enable-kvm".into());
        args.push("-cpu".into());
        args.push("host".into());
    }

    args.push("-drive".into());
    args.push(drive_arg(&meta.volume));
    for vol in &meta.extra_volumes {
        args.push("-drive".into());
        args.push(drive_arg(&vol.path));
    }

    if meta.arch == "aarch64" {
        args.push("-machine".into());
        args.push("virt".into());
        args.push("-bios".into());
        args.push(AARCH64_EFI_FIRMWARE.into());
    }

    args.push("-cdrom".into());
    args.push(meta.cloud_init_iso.clone());

    args.push("-net".into());
    args.push(format!("nic,model=virtio,macaddr={}", meta.mac_address));
    args.push("-net".into());
    args.push(format!(
        "tap,ifname={tap},script={},downscript={}",
        network::IFUP_SCRIPT,
        network::IFDOWN_SCRIPT
    ));

    args.push("-daemonize".into());
    args.push("-qmp".into());
    args.push(format!(
        "unix:{},server,nowait",
        qmp_socket_path(vm_dir).display()
    ));

    args.push("-m".into());
    args.push(memory_mib.to_string());
    args.push("-smp".into());
    args.push(format!("cpus={}", meta.cpu));

    args.push("-vnc".into());
    args.push(format!("unix:{}", vnc_socket_path(vm_dir).display()));
    args.push("-k".into());
    args.push(keyboard_layout.to_string());

    Ok(args)
}

/// Launch `qemu-system-<arch>`; returns once the process has daemonized.
pub async fn launch(
    exec: &Exec,
    meta: &VmMetadata,
    vm_dir: &Path,
    no_kvm: bool,
    keyboard_layout: &str,
) -> Result<()> {
    let mut argv = vec![format!("qemu-system-{}", meta.arch)];
    argv.extend(build_args(meta, vm_dir, no_kvm, keyboard_layout)?);
    exec.run(&argv).await?;
    Ok(())
}
