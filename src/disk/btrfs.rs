// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-place ext to btrfs conversion.
//!
//! Wraps btrfs-convert with the checks and bookkeeping around it: the device
//! must be unmounted and hold an ext2/3/4 filesystem, the filesystem is
//! force-checked first, and the filesystem table is pointed at the new UUID
//! afterwards. LUKS containers are opened for the duration of the conversion
//! and closed again on every path out.

use crate::{
    disk::fstab::{Fstab, FstabError},
    file::{write_if_changed, FileError},
    shell::{best_effort, require_cmd, Cmd, Shell, ShellError},
};

use std::{
    fs::{canonicalize, copy, read_to_string},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Conversion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    /// Block device holding the filesystem or its LUKS container.
    pub device: PathBuf,

    /// Mapper name for an opened LUKS container.
    pub luks_name: Option<String>,

    pub fstab: PathBuf,

    /// Table of mounted filesystems.
    pub mounts: PathBuf,
}

impl ConvertRequest {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            luks_name: None,
            fstab: "/etc/fstab".into(),
            mounts: "/proc/mounts".into(),
        }
    }

    fn mapper_name(&self) -> String {
        self.luks_name.clone().unwrap_or_else(|| {
            let base = self
                .device
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "device".into());
            format!("wrench-{base}")
        })
    }
}

/// Result of conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// Dry run, holds each planned step.
    Planned(Vec<String>),

    Converted {
        target: PathBuf,
        old_uuid: String,
        new_uuid: String,
        fstab_entries: usize,
    },
}

struct LuksGuard<'a> {
    shell: &'a dyn Shell,
    name: String,
}

impl Drop for LuksGuard<'_> {
    fn drop(&mut self) {
        info!("close LUKS container {}", self.name);
        best_effort(
            self.shell
                .silent(&Cmd::new("cryptsetup").args(["close", self.name.as_str()])),
            "failed to close LUKS container",
        );
    }
}

/// Convert ext filesystem on device to btrfs.
///
/// # Errors
///
/// - Return [`BtrfsError::Mounted`] if the filesystem is mounted.
/// - Return [`BtrfsError::NotExt`] if device does not hold ext2/3/4.
/// - Return [`BtrfsError::Shell`] if a tool is missing or fails.
/// - Return [`BtrfsError::Fstab`] if the filesystem table is malformed.
#[instrument(skip(shell), level = "debug")]
pub fn convert(shell: &dyn Shell, request: &ConvertRequest, dry_run: bool) -> Result<ConvertOutcome> {
    require_cmd(shell, &["blkid", "e2fsck", "btrfs-convert"])?;
    refuse_mounted(&request.mounts, &request.device)?;

    let is_luks = shell.have_cmd("cryptsetup")
        && shell
            .silent(&Cmd::new("cryptsetup").arg("isLuks").arg(&request.device))
            .is_ok();
    let mapper = request.mapper_name();
    let target = if is_luks {
        PathBuf::from("/dev/mapper").join(&mapper)
    } else {
        request.device.clone()
    };

    if dry_run {
        let mut plan = Vec::new();
        if is_luks {
            plan.push(format!("cryptsetup open {} {mapper}", request.device.display()));
        }
        plan.push(format!("e2fsck -fy {}", target.display()));
        plan.push(format!("btrfs-convert {}", target.display()));
        plan.push(format!(
            "point {} entries of {} at new UUID (backup {}.bak)",
            target.display(),
            request.fstab.display(),
            request.fstab.display()
        ));
        if is_luks {
            plan.push(format!("cryptsetup close {mapper}"));
        }
        for step in &plan {
            println!("{step}");
        }
        return Ok(ConvertOutcome::Planned(plan));
    }

    let _luks = if is_luks {
        info!("open LUKS container {} as {mapper}", request.device.display());
        let status = shell.interactive(
            &Cmd::new("cryptsetup")
                .arg("open")
                .arg(&request.device)
                .arg(&mapper),
        )?;
        if status != 0 {
            return Err(BtrfsError::LuksOpen(status));
        }
        let guard = LuksGuard {
            shell,
            name: mapper.clone(),
        };
        refuse_mounted(&request.mounts, &target)?;
        Some(guard)
    } else {
        None
    };

    let fs_type = blkid(shell, &target, "TYPE")?;
    if !matches!(fs_type.as_str(), "ext2" | "ext3" | "ext4") {
        return Err(BtrfsError::NotExt {
            device: target,
            found: fs_type,
        });
    }
    let old_uuid = blkid(shell, &target, "UUID")?;

    // INVARIANT: Exit status 1 means errors were found and corrected.
    info!("check {}", target.display());
    let status = shell.interactive(&Cmd::new("e2fsck").arg("-fy").arg(&target))?;
    if status > 1 {
        return Err(BtrfsError::Fsck(status));
    }

    info!("convert {} to btrfs", target.display());
    let status = shell.interactive(&Cmd::new("btrfs-convert").arg(&target))?;
    if status != 0 {
        return Err(BtrfsError::Convert(status));
    }

    let new_uuid = blkid(shell, &target, "UUID")?;
    let specs = fstab_specs(&target, &request.device, &old_uuid);
    let fstab_entries = rewrite_fstab(&request.fstab, &specs, &new_uuid)?;

    Ok(ConvertOutcome::Converted {
        target,
        old_uuid,
        new_uuid,
        fstab_entries,
    })
}

fn blkid(shell: &dyn Shell, device: &Path, tag: &str) -> Result<String> {
    let value = shell
        .output(
            &Cmd::new("blkid")
                .args(["-o", "value", "-s", tag])
                .arg(device),
        )?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(BtrfsError::NoTag {
            device: device.to_path_buf(),
            tag: tag.to_string(),
        });
    }

    Ok(value)
}

fn refuse_mounted(mounts: &Path, device: &Path) -> Result<()> {
    let table = match read_to_string(mounts) {
        Ok(table) => table,
        Err(err) => {
            warn!("cannot read {}: {err}", mounts.display());
            return Ok(());
        }
    };

    let wanted = canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mountpoint)) = (fields.next(), fields.next()) else {
            continue;
        };
        let source = Path::new(source);
        let resolved = canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
        if source == device || resolved == wanted {
            return Err(BtrfsError::Mounted {
                device: device.to_path_buf(),
                mountpoint: mountpoint.into(),
            });
        }
    }

    Ok(())
}

fn fstab_specs(target: &Path, device: &Path, old_uuid: &str) -> Vec<String> {
    let mut specs = vec![
        target.display().to_string(),
        format!("UUID={old_uuid}"),
        format!("/dev/disk/by-uuid/{old_uuid}"),
    ];
    if device != target {
        specs.push(device.display().to_string());
    }

    specs
}

fn rewrite_fstab(path: &Path, specs: &[String], new_uuid: &str) -> Result<usize> {
    let io_err = |err: std::io::Error| BtrfsError::FstabIo {
        source: err,
        path: path.to_path_buf(),
    };
    let mut fstab: Fstab = read_to_string(path).map_err(io_err)?.parse()?;
    let changed = fstab.retarget_btrfs(specs, new_uuid);
    if changed == 0 {
        warn!("no entry of {} refers to converted filesystem", path.display());
        return Ok(0);
    }

    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    copy(path, &backup).map_err(io_err)?;
    write_if_changed(path, fstab.to_string(), 0o644)?;
    info!("updated {changed} entries of {}", path.display());

    Ok(changed)
}

/// Btrfs conversion error types.
#[derive(Debug, thiserror::Error)]
pub enum BtrfsError {
    #[error("{:?} is mounted at {mountpoint}, unmount it first", device.display())]
    Mounted { device: PathBuf, mountpoint: String },

    #[error("{:?} holds {found}, not an ext filesystem", device.display())]
    NotExt { device: PathBuf, found: String },

    #[error("blkid reports no {tag} for {:?}", device.display())]
    NoTag { device: PathBuf, tag: String },

    #[error("cryptsetup open exited with {0}")]
    LuksOpen(i32),

    #[error("e2fsck exited with {0}, filesystem left unconverted")]
    Fsck(i32),

    #[error("btrfs-convert exited with {0}")]
    Convert(i32),

    #[error("failed to access {:?}", path.display())]
    FstabIo {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Fstab(#[from] FstabError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = BtrfsError> = std::result::Result<T, E>;
