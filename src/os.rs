// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Host operating system detection.
//!
//! Determine what kind of system wrench is running on, and which package
//! manager should be used to install packages on it. Linux distributions are
//! identified through `/etc/os-release`. OpenBSD does not ship that file, so
//! `uname -s` is used as a fallback.

use crate::shell::{Cmd, Shell, ShellError};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::Path,
    str::FromStr,
};
use tracing::{debug, instrument};

/// Default location of os-release file.
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Facts from os-release file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
    pub version_codename: Option<String>,
    pub pretty_name: Option<String>,
}

impl OsRelease {
    /// Detect host operating system.
    ///
    /// Reads os-release file at target path. If it does not exist, then the
    /// kernel name reported by `uname -s` becomes the ID.
    ///
    /// # Errors
    ///
    /// - Return [`OsError::Read`] if os-release file exists but cannot be read.
    /// - Return [`OsError::Shell`] if uname fallback fails.
    #[instrument(skip(shell, path), level = "debug")]
    pub fn detect(shell: &dyn Shell, path: impl AsRef<Path>) -> Result<Self> {
        match read_to_string(path.as_ref()) {
            Ok(content) => Ok(content.parse()?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no {}, falling back to uname", path.as_ref().display());
                let kernel = shell.output(&Cmd::new("uname").arg("-s"))?;
                Ok(Self {
                    id: kernel.trim().to_lowercase(),
                    pretty_name: Some(kernel.trim().to_string()),
                    ..Default::default()
                })
            }
            Err(err) => Err(OsError::Read {
                source: err,
                path: path.as_ref().display().to_string(),
            }),
        }
    }

    /// Check if system belongs to given family, e.g., "debian".
    pub fn is_like(&self, family: &str) -> bool {
        self.id == family || self.id_like.iter().any(|like| like == family)
    }

    pub fn is_debian_like(&self) -> bool {
        self.is_like("debian") || self.is_like("ubuntu")
    }

    pub fn is_fedora_like(&self) -> bool {
        self.is_like("fedora") || self.is_like("rhel")
    }

    pub fn is_openbsd(&self) -> bool {
        self.id == "openbsd"
    }

    /// Release codename, e.g., "bookworm".
    ///
    /// # Errors
    ///
    /// - Return [`OsError::NoCodename`] if the os-release file lacks one.
    pub fn codename(&self) -> Result<&str> {
        self.version_codename
            .as_deref()
            .filter(|codename| !codename.is_empty())
            .ok_or_else(|| OsError::NoCodename(self.id.clone()))
    }
}

impl FromStr for OsRelease {
    type Err = OsError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut release = OsRelease::default();
        for (number, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(OsError::Syntax { line: number + 1 })?;
            let value = unquote(value.trim());
            match key.trim() {
                "ID" => release.id = value.to_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value.split_whitespace().map(str::to_lowercase).collect()
                }
                "VERSION_ID" => release.version_id = Some(value.into()),
                "VERSION_CODENAME" => release.version_codename = Some(value.into()),
                "PRETTY_NAME" => release.pretty_name = Some(value.into()),
                _ => continue,
            }
        }

        Ok(release)
    }
}

impl Display for OsRelease {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "id: {}", self.id)?;
        if !self.id_like.is_empty() {
            writeln!(fmt, "id_like: {}", self.id_like.join(" "))?;
        }
        if let Some(version) = &self.version_id {
            writeln!(fmt, "version: {version}")?;
        }
        if let Some(codename) = &self.version_codename {
            writeln!(fmt, "codename: {codename}")?;
        }
        if let Some(name) = &self.pretty_name {
            writeln!(fmt, "name: {name}")?;
        }

        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }

    value
}

/// Package manager of host system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    RpmOstree,
    PkgAdd,
}

impl PackageManager {
    /// Pick package manager for host system.
    ///
    /// Image based Fedora variants like secureblue layer packages through
    /// rpm-ostree rather than dnf.
    ///
    /// # Errors
    ///
    /// - Return [`OsError::Unsupported`] if no known package manager fits.
    pub fn detect(shell: &dyn Shell, release: &OsRelease) -> Result<Self> {
        if release.is_debian_like() {
            Ok(Self::Apt)
        } else if release.is_fedora_like() && shell.have_cmd("rpm-ostree") {
            Ok(Self::RpmOstree)
        } else if release.is_fedora_like() {
            Ok(Self::Dnf)
        } else if release.is_openbsd() {
            Ok(Self::PkgAdd)
        } else {
            Err(OsError::Unsupported(release.id.clone()))
        }
    }

    /// Build non-interactive install command for listing of packages.
    pub fn install_cmd(&self, packages: &[String]) -> Cmd {
        let cmd = match self {
            Self::Apt => Cmd::new("apt-get")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .args(["install", "-y", "--no-install-recommends"]),
            Self::Dnf => Cmd::new("dnf").args(["install", "-y"]),
            Self::RpmOstree => Cmd::new("rpm-ostree").args(["install", "--idempotent", "-y"]),
            Self::PkgAdd => Cmd::new("pkg_add").arg("-I"),
        };

        cmd.args(packages)
    }

    /// Install packages through silent call.
    ///
    /// # Errors
    ///
    /// - Return [`OsError::Shell`] if installation fails.
    pub fn install_packages(&self, shell: &dyn Shell, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }

        shell.silent(&self.install_cmd(packages))?;
        Ok(())
    }
}

impl Display for PackageManager {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::RpmOstree => "rpm-ostree",
            Self::PkgAdd => "pkg_add",
        })
    }
}

/// Architecture name of running binary as Debian and Go spell it.
pub fn dpkg_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

/// Host detection error types.
#[derive(Debug, thiserror::Error)]
pub enum OsError {
    /// Os-release file exists but cannot be read.
    #[error("failed to read {path}")]
    Read {
        #[source]
        source: std::io::Error,
        path: String,
    },

    /// Os-release line is not a key-value pair.
    #[error("malformed os-release line {line}")]
    Syntax { line: usize },

    /// Release has no codename.
    #[error("{0} does not report a release codename")]
    NoCodename(String),

    /// No supported package manager.
    #[error("unsupported operating system {0:?}")]
    Unsupported(String),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = OsError> = std::result::Result<T, E>;
