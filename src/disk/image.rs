// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! OpenBSD raw disk image growth.
//!
//! Grows a raw image file, e.g., a VM disk, then attaches it as a vnd(4)
//! device to extend its label and filesystem. The device is always detached
//! again, whether growth succeeded or not. Images are never shrunk.

use crate::{
    disk::disklabel::{grow_script, Disklabel, DisklabelError},
    shell::{best_effort, require_cmd, Cmd, Shell, ShellError},
};

use std::{
    fs::{metadata, OpenOptions},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{info, instrument, warn};

/// Requested image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    /// Final size in bytes, e.g., "20G".
    Absolute(u64),

    /// Bytes to add, e.g., "+4G".
    Grow(u64),
}

impl SizeSpec {
    pub fn target(&self, current: u64) -> u64 {
        match self {
            Self::Absolute(size) => *size,
            Self::Grow(extra) => current.saturating_add(*extra),
        }
    }
}

impl FromStr for SizeSpec {
    type Err = ImageError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().strip_prefix('+') {
            Some(extra) => Ok(Self::Grow(parse_size(extra)?)),
            None => Ok(Self::Absolute(parse_size(text)?)),
        }
    }
}

/// Parse byte size with optional binary unit suffix, e.g., "512M".
///
/// # Errors
///
/// - Return [`ImageError::Size`] if text is no valid size.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let invalid = || ImageError::Size(text.to_string());
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let number: u64 = digits.parse().map_err(|_| invalid())?;

    let shift = match unit.to_ascii_uppercase().trim_end_matches(['B', 'I']) {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(invalid()),
    };

    number.checked_mul(1u64 << shift).ok_or_else(invalid)
}

/// What growing did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowReport {
    pub old_size: u64,
    pub new_size: u64,
    pub device: Option<String>,
    pub partition: Option<char>,
}

struct VndGuard<'a> {
    shell: &'a dyn Shell,
    device: String,
}

impl Drop for VndGuard<'_> {
    fn drop(&mut self) {
        best_effort(
            self.shell
                .silent(&Cmd::new("vnconfig").args(["-u", self.device.as_str()])),
            "failed to detach vnd device",
        );
    }
}

/// Grow image file, its last partition, and that partition's filesystem.
///
/// Dry run prints the plan and changes nothing.
///
/// # Errors
///
/// - Return [`ImageError::Shrink`] if requested size is below current size.
/// - Return [`ImageError::Io`] if image cannot be resized.
/// - Return [`ImageError::NoPartition`] if label has no growable partition.
/// - Return [`ImageError::Shell`] if any tool fails.
#[instrument(skip(shell), level = "debug")]
pub fn grow_image(shell: &dyn Shell, image: &Path, size: SizeSpec, dry_run: bool) -> Result<GrowReport> {
    let io_err = |err: std::io::Error| ImageError::Io {
        source: err,
        path: image.to_path_buf(),
    };
    let old_size = metadata(image).map_err(io_err)?.len();
    let new_size = size.target(old_size);
    if new_size < old_size {
        return Err(ImageError::Shrink {
            current: old_size,
            requested: new_size,
        });
    }

    let mut report = GrowReport {
        old_size,
        new_size,
        device: None,
        partition: None,
    };

    if dry_run {
        println!("truncate {} from {old_size} to {new_size} bytes", image.display());
        println!("vnconfig {}", image.display());
        println!("disklabel -E <vnd> (extend bounds, grow last partition)");
        println!("growfs -y /dev/r<vnd><part>");
        println!("fsck -y /dev/r<vnd><part>");
        return Ok(report);
    }

    require_cmd(shell, &["vnconfig", "disklabel", "growfs", "fsck"])?;

    if new_size == old_size {
        info!("{} already {new_size} bytes", image.display());
    } else {
        info!("grow {} to {new_size} bytes", image.display());
        OpenOptions::new()
            .write(true)
            .open(image)
            .and_then(|file| file.set_len(new_size))
            .map_err(io_err)?;
    }

    let device = shell
        .output(&Cmd::new("vnconfig").arg(image))?
        .trim()
        .to_string();
    if device.is_empty() {
        return Err(ImageError::NoDevice);
    }
    let guard = VndGuard {
        shell,
        device: device.clone(),
    };
    report.device = Some(device.clone());

    let label: Disklabel = shell
        .output(&Cmd::new("disklabel").arg(&guard.device))?
        .parse()?;
    let partition = label
        .last_partition()
        .ok_or_else(|| ImageError::NoPartition(device.clone()))?
        .letter;
    report.partition = Some(partition);

    if !label.can_grow() {
        warn!("{device} has no free space behind partition {partition}");
    }
    shell.silent(
        &Cmd::new("disklabel")
            .args(["-E", device.as_str()])
            .stdin(grow_script(partition)),
    )?;

    let raw = format!("/dev/r{device}{partition}");
    shell.silent(&Cmd::new("growfs").args(["-y", raw.as_str()]))?;
    shell.silent(&Cmd::new("fsck").args(["-y", raw.as_str()]))?;
    info!("grew {raw}");
    drop(guard);

    Ok(report)
}

/// Image growth error types.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid size {0:?}")]
    Size(String),

    #[error("refusing to shrink image from {current} to {requested} bytes")]
    Shrink { current: u64, requested: u64 },

    #[error("failed to resize {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("vnconfig reported no device")]
    NoDevice,

    #[error("no growable partition on {0}")]
    NoPartition(String),

    #[error(transparent)]
    Disklabel(#[from] DisklabelError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = ImageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeShell;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[test_case("4096", 4096; "bytes")]
    #[test_case("512K", 512 << 10; "kibibytes")]
    #[test_case("512M", 512 << 20; "mebibytes")]
    #[test_case("20G", 20 << 30; "gibibytes")]
    #[test_case("1TiB", 1 << 40; "long unit")]
    #[test]
    fn parse_sizes(input: &str, expect: u64) {
        pretty_assertions::assert_eq!(parse_size(input).ok(), Some(expect));
    }

    #[test]
    fn bad_sizes_are_rejected() {
        for input in ["", "G", "12Q", "-1G"] {
            assert!(parse_size(input).is_err(), "{input:?} was accepted");
        }
    }

    const LABEL: &str = indoc! {"
        total sectors: 8388608
        boundstart: 64
        boundend: 4194304
          a:          4194240               64  4.2BSD   2048 16384 12960 # /
          c:          8388608                0  unused
    "};

    #[sealed_test]
    fn grow_runs_label_and_filesystem_tools() -> anyhow::Result<()> {
        std::fs::write("disk.img", vec![0u8; 4096])?;
        let shell = FakeShell::new()
            .with_cmds(&["vnconfig", "disklabel", "growfs", "fsck"])
            .respond("vnconfig disk.img", "vnd0\n")
            .respond("disklabel vnd0", LABEL);

        let report = grow_image(&shell, Path::new("disk.img"), "+4K".parse()?, false)?;
        assert_eq!(report.new_size, 8192);
        assert_eq!(std::fs::metadata("disk.img")?.len(), 8192);

        let expect = vec![
            "vnconfig disk.img",
            "disklabel vnd0",
            "disklabel -E vnd0",
            "growfs -y /dev/rvnd0a",
            "fsck -y /dev/rvnd0a",
            "vnconfig -u vnd0",
        ];
        assert_eq!(shell.calls(), expect);

        Ok(())
    }

    #[sealed_test]
    fn device_is_detached_on_failure() -> anyhow::Result<()> {
        std::fs::write("disk.img", vec![0u8; 4096])?;
        let shell = FakeShell::new()
            .with_cmds(&["vnconfig", "disklabel", "growfs", "fsck"])
            .respond("vnconfig disk.img", "vnd1\n")
            .respond("disklabel vnd1", LABEL)
            .fail("growfs", "growfs: not a valid filesystem");

        let result = grow_image(&shell, Path::new("disk.img"), SizeSpec::Absolute(4096), false);
        assert!(matches!(result, Err(ImageError::Shell(_))));
        assert_eq!(shell.calls().last().map(String::as_str), Some("vnconfig -u vnd1"));

        Ok(())
    }

    #[sealed_test]
    fn shrinking_is_refused() -> anyhow::Result<()> {
        std::fs::write("disk.img", vec![0u8; 4096])?;
        let shell = FakeShell::new();

        let result = grow_image(&shell, Path::new("disk.img"), SizeSpec::Absolute(1024), false);
        assert!(matches!(
            result,
            Err(ImageError::Shrink {
                current: 4096,
                requested: 1024
            })
        ));
        assert_eq!(std::fs::metadata("disk.img")?.len(), 4096);

        Ok(())
    }
}
