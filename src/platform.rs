//! Boot-stage collaborator.
//!
//! The supervisor treats machine setup (mounting, restricted root, devices,
//! message bus, terminals) as opaque actions with a pass/fail outcome. The
//! outcome is logged and never changes what happens next.

use crate::error::{Error, Result};
use crate::process::ProcessLauncher;
use crate::status::{Status, StatusLog};
use async_trait::async_trait;
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Time given to the message bus to come up before boot continues.
const MESSAGE_BUS_SETTLE: Duration = Duration::from_secs(2);

/// Virtual filesystems mounted by the base runlevel: (source, target, fstype).
const VIRTUAL_FILESYSTEMS: &[(&str, &str, &str)] = &[
    ("proc", "/proc", "proc"),
    ("sysfs", "/sys", "sysfs"),
    ("devtmpfs", "/dev", "devtmpfs"),
    ("tmpfs", "/run", "tmpfs"),
    ("tmpfs", "/dev/shm", "tmpfs"),
];

/// Boot-stage actions of the base runlevel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootStage {
    MountVirtual,
    MountPersistent,
    EnterRestrictedRoot,
    InitDevices,
    StartMessageBus,
    SetupTerminals,
}

impl BootStage {
    /// Stages of runlevel 1, in execution order.
    pub const BASE_SEQUENCE: [BootStage; 6] = [
        BootStage::MountVirtual,
        BootStage::MountPersistent,
        BootStage::EnterRestrictedRoot,
        BootStage::InitDevices,
        BootStage::StartMessageBus,
        BootStage::SetupTerminals,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            BootStage::MountVirtual => "Mounting virtual filesystems",
            BootStage::MountPersistent => "Mounting filesystems from fstab",
            BootStage::EnterRestrictedRoot => "Entering restricted root",
            BootStage::InitDevices => "Initializing system devices",
            BootStage::StartMessageBus => "Starting message bus",
            BootStage::SetupTerminals => "Setting up terminals",
        }
    }
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Machine-level actions the supervisor invokes but does not interpret.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Run one boot stage.
    async fn run_stage(&self, stage: BootStage) -> Result<()>;

    /// Release what boot acquired (devices, restricted root, filesystems).
    async fn release(&self) -> Result<()>;

    /// Power the machine off.
    fn power_off(&self) -> Result<()>;
}

/// Platform backed by the running Linux system.
pub struct SystemPlatform {
    devices_script: PathBuf,
    fstab: PathBuf,
    allow_power_off: bool,
    in_restricted_root: AtomicBool,
    /// Shared with the supervisor so the reaper never steals a helper's exit
    launcher: Arc<ProcessLauncher>,
    status: Arc<StatusLog>,
}

impl SystemPlatform {
    pub fn new(
        devices_script: PathBuf,
        allow_power_off: bool,
        launcher: Arc<ProcessLauncher>,
        status: Arc<StatusLog>,
    ) -> Self {
        Self {
            devices_script,
            fstab: PathBuf::from("/etc/fstab"),
            allow_power_off,
            in_restricted_root: AtomicBool::new(false),
            launcher,
            status,
        }
    }

    /// Mount /proc, /sys, /dev, /run and /dev/shm.
    fn mount_virtual(&self) -> Result<()> {
        let mut failed = Vec::new();

        for (source, target, fstype) in VIRTUAL_FILESYSTEMS {
            match mount_fs(source, target, fstype, MsFlags::empty(), None) {
                Ok(()) => self.status.status(Status::Ok, *target),
                Err(e) => {
                    warn!(target = target, error = %e, "Failed to mount virtual filesystem");
                    self.status.status(Status::Failure, *target);
                    failed.push(*target);
                }
            }
        }

        stage_result(BootStage::MountVirtual, &failed)
    }

    /// Mount every entry of the fstab.
    async fn mount_persistent(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.fstab).map_err(|e| Error::BootStage {
            stage: BootStage::MountPersistent.to_string(),
            reason: format!("Failed to open {}: {}", self.fstab.display(), e),
        })?;

        let mut failed = Vec::new();
        for entry in parse_fstab(&content) {
            let outcome = if entry.mountpoint == "/" {
                mount_fs(
                    &entry.device,
                    "/",
                    &entry.fstype,
                    MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    Some(&entry.options),
                )
            } else if entry.fstype == "swap" {
                self.run("swapon", &[&entry.device]).await
            } else {
                if let Err(e) = std::fs::create_dir_all(&entry.mountpoint) {
                    warn!(mountpoint = %entry.mountpoint, error = %e, "Failed to create mountpoint");
                }
                self.run(
                    "mount",
                    &["-t", &entry.fstype, "-o", &entry.options, &entry.device, &entry.mountpoint],
                )
                .await
            };

            let label = if entry.mountpoint == "/" {
                "/ (remounted ro)".to_string()
            } else {
                entry.mountpoint.clone()
            };
            match outcome {
                Ok(()) => self.status.status(Status::Ok, label),
                Err(e) => {
                    warn!(device = %entry.device, error = %e, "Failed to mount fstab entry");
                    failed.push(entry.mountpoint);
                }
            }
        }

        let failed: Vec<&str> = failed.iter().map(String::as_str).collect();
        stage_result(BootStage::MountPersistent, &failed)
    }

    fn enter_restricted_root(&self) -> Result<()> {
        nix::unistd::chroot("/")?;
        nix::unistd::chdir("/")?;
        self.in_restricted_root.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_message_bus(&self) -> Result<()> {
        self.launcher
            .spawn_detached("exec /usr/bin/dbus-daemon --system --fork")
            .map(|_| ())
    }

    fn setup_terminals(&self) -> Result<()> {
        let mut failed = Vec::new();
        for tty in 1..=6 {
            let command = format!("exec /sbin/agetty -a root tty{} linux", tty);
            match self.launcher.spawn_detached(&command) {
                Ok(_) => self.status.status(Status::Ok, format!("tty{}", tty)),
                Err(e) => {
                    warn!(tty = tty, error = %e, "Failed to spawn terminal");
                    failed.push(tty);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::BootStage {
                stage: BootStage::SetupTerminals.to_string(),
                reason: format!("failed terminals: {:?}", failed),
            })
        }
    }

    async fn devices(&self, action: &str) -> Result<()> {
        let script = self.devices_script.to_string_lossy();
        self.run("/bin/sh", &[&script, action]).await
    }

    /// Run an external program to completion.
    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut command = format!("exec {}", shell_quote(program));
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }

        let pid = self.launcher.spawn(&command)?;
        let exit = self.launcher.wait(pid).await?;
        if exit.success() {
            Ok(())
        } else {
            Err(Error::BootStage {
                stage: program.to_string(),
                reason: format!("exited with {}", exit),
            })
        }
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn run_stage(&self, stage: BootStage) -> Result<()> {
        match stage {
            BootStage::MountVirtual => self.mount_virtual(),
            BootStage::MountPersistent => self.mount_persistent().await,
            BootStage::EnterRestrictedRoot => self.enter_restricted_root(),
            BootStage::InitDevices => self.devices("start").await,
            BootStage::StartMessageBus => {
                self.start_message_bus()?;
                tokio::time::sleep(MESSAGE_BUS_SETTLE).await;
                Ok(())
            }
            BootStage::SetupTerminals => self.setup_terminals(),
        }
    }

    async fn release(&self) -> Result<()> {
        self.status.status(Status::Info, "Shutting down devices");
        if let Err(e) = self.devices("stop").await {
            warn!(error = %e, "Device shutdown failed");
        }

        self.status.status(Status::Info, "Unmounting filesystems");
        if self.in_restricted_root.swap(false, Ordering::SeqCst) {
            info!("Leaving restricted root");
        }

        let unmounted = self.run("umount", &["-a", "-r"]).await;
        if let Err(e) = self.run("swapoff", &["-a"]).await {
            warn!(error = %e, "swapoff failed");
        }

        match unmounted {
            Ok(()) => {
                self.status.status(Status::Ok, "Filesystems unmounted");
                Ok(())
            }
            Err(e) => {
                self.status.status(Status::Failure, "Filesystems unmounted with errors");
                Err(e)
            }
        }
    }

    fn power_off(&self) -> Result<()> {
        // Flush filesystem buffers
        unsafe {
            libc::sync();
        }

        if !self.allow_power_off {
            info!("Not PID 1, skipping power-off");
            return Ok(());
        }

        reboot(RebootMode::RB_POWER_OFF)?;
        Ok(())
    }
}

/// One usable fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: String,
}

/// Parse fstab content, skipping comments, blank lines and short entries.
pub fn parse_fstab(content: &str) -> Vec<FstabEntry> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(FstabEntry {
                device: fields.next()?.to_string(),
                mountpoint: fields.next()?.to_string(),
                fstype: fields.next()?.to_string(),
                options: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// Mount a filesystem, creating the target directory when missing.
fn mount_fs(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let target_path = Path::new(target);
    if !target_path.exists() {
        std::fs::create_dir_all(target_path)?;
    }

    mount(Some(source), target, Some(fstype), flags, data)?;

    info!(
        source = source,
        target = target,
        fstype = fstype,
        "Mounted filesystem"
    );
    Ok(())
}

/// Quote a word for `sh -c`.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

fn stage_result(stage: BootStage, failed: &[&str]) -> Result<()> {
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::BootStage {
            stage: stage.to_string(),
            reason: format!("failed: {}", failed.join(", ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_fstab() {
        let content = "\
# <device> <dir> <type> <options> <dump> <pass>
/dev/sda1 / ext4 defaults 0 1

/dev/sda2 /home ext4 rw,noatime 0 2
/dev/sda3 none swap sw 0 0
broken line
";
        let entries = parse_fstab(content);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[1],
            FstabEntry {
                device: "/dev/sda2".to_string(),
                mountpoint: "/home".to_string(),
                fstype: "ext4".to_string(),
                options: "rw,noatime".to_string(),
            }
        );
        assert_eq!(entries[2].fstype, "swap");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dev/sda1"), "'/dev/sda1'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_devices_script_receives_action() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("rc devices");
        let out = dir.path().join("action");
        std::fs::write(&script, format!("echo \"$1\" > '{}'\n", out.display())).unwrap();

        let platform = SystemPlatform::new(
            script,
            false,
            Arc::new(ProcessLauncher::default()),
            Arc::new(StatusLog::console_only().quiet()),
        );
        platform.devices("stop").await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "stop\n");

        let err = platform.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, Error::BootStage { .. }));
    }

    #[test]
    fn test_base_sequence_order() {
        assert_eq!(BootStage::BASE_SEQUENCE[0], BootStage::MountVirtual);
        assert_eq!(BootStage::BASE_SEQUENCE[5], BootStage::SetupTerminals);
    }
}
