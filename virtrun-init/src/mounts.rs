//! Virtual file system mounts and `/dev` symlinks for the guest.

use std::path::Path;

use nix::mount::MsFlags;

/// One mount table entry.
struct MountPoint {
    /// Mount source, informational for most virtual file systems.
    source: &'static str,
    /// Target directory, created when missing.
    target: &'static str,
    /// File system type.
    fstype: &'static str,
    /// Mount flags.
    flags: MsFlags,
}

/// Mounts performed in order during early boot.
///
/// `devtmpfs` comes first so the console device nodes exist before
/// anything else logs. The tracing/bpf entries depend on kernel config
/// and are best-effort.
const MOUNTS: &[MountPoint] = &[
    MountPoint {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        flags: MsFlags::MS_NOSUID,
    },
    MountPoint {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC),
    },
    MountPoint {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC),
    },
    MountPoint {
        source: "tmpfs",
        target: "/run",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    },
    MountPoint {
        source: "tmpfs",
        target: "/tmp",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    },
    MountPoint {
        source: "tmpfs",
        target: "/dev/shm",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    },
    MountPoint {
        source: "bpf",
        target: "/sys/fs/bpf",
        fstype: "bpf",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC),
    },
    MountPoint {
        source: "debugfs",
        target: "/sys/kernel/debug",
        fstype: "debugfs",
        flags: MsFlags::empty(),
    },
    MountPoint {
        source: "tracefs",
        target: "/sys/kernel/tracing",
        fstype: "tracefs",
        flags: MsFlags::empty(),
    },
];

/// Symlinks every userland expects under `/dev`.
const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("/proc/self/fd/", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
    ("/proc/kcore", "/dev/core"),
    ("rtc0", "/dev/rtc"),
];

/// Mounts the table in order, logging failures and moving on.
pub fn mount_all() {
    for m in MOUNTS {
        let _ = std::fs::create_dir_all(m.target);
        if let Err(e) = nix::mount::mount(
            Some(m.source),
            m.target,
            Some(m.fstype),
            m.flags,
            None::<&str>,
        ) {
            eprintln!("virtrun-init: mount {} on {}: {e}", m.fstype, m.target);
        }
    }
}

/// Installs the customary `/dev` symlinks where not already present.
pub fn create_dev_symlinks() {
    for (target, link) in DEV_SYMLINKS {
        if !Path::new(link).exists() {
            let _ = std::os::unix::fs::symlink(target, link);
        }
    }
}
