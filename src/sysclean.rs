// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Apply OpenBSD sysclean reports.
//!
//! After a system upgrade, sysclean(8) reports files, users, and groups that
//! no longer belong to the base system or any installed package. Its report
//! lists one item per line:
//!
//! ```text
//! /usr/lib/libc.so.96.0
//! /usr/share/man/man3
//! @user _obsolete:*:600:600::0:0:Obsolete Daemon:/var/empty:/sbin/nologin
//! @group _obsolete:*:600:
//! ```
//!
//! Everything listed is removed, and nothing else. Directories are removed
//! with a non-recursive call only after the listed files below them are gone,
//! so a directory still holding unlisted content is left alone.

use crate::shell::{require_cmd, Cmd, Shell, ShellError};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{remove_dir, remove_file, symlink_metadata},
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    str::FromStr,
};
use tracing::{info, instrument, warn};

/// Single report entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Entry {
    Path(PathBuf),
    User(String),
    Group(String),
}

impl Display for Entry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Path(path) => write!(fmt, "{}", path.display()),
            Self::User(name) => write!(fmt, "@user {name}"),
            Self::Group(name) => write!(fmt, "@group {name}"),
        }
    }
}

/// Parsed sysclean report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub entries: Vec<Entry>,
}

impl FromStr for Report {
    type Err = SyscleanError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for (number, line) in data.lines().enumerate() {
            let line = line.trim_end();
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let syntax = |reason: &'static str| SyscleanError::Syntax {
                line: number + 1,
                reason,
            };

            let entry = if let Some(rest) = line.strip_prefix("@user") {
                Entry::User(account_name(rest).ok_or_else(|| syntax("missing user name"))?)
            } else if let Some(rest) = line.strip_prefix("@group") {
                Entry::Group(account_name(rest).ok_or_else(|| syntax("missing group name"))?)
            } else {
                // INVARIANT: Package annotation follows a tab, e.g., with "-p".
                let path = line.split('\t').next().unwrap_or(line);
                Entry::Path(checked_path(path).ok_or_else(|| syntax("not a clean absolute path"))?)
            };

            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }

        Ok(Self { entries })
    }
}

fn account_name(rest: &str) -> Option<String> {
    let rest = rest.strip_prefix(':').unwrap_or(rest).trim_start();
    let name = rest.split(':').next()?.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }

    Some(name.to_string())
}

fn checked_path(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return None;
    }

    let clean = path
        .components()
        .all(|component| matches!(component, Component::RootDir | Component::Normal(_)));
    if !clean || path == Path::new("/") {
        return None;
    }

    Some(path.to_path_buf())
}

/// Action taken for a report entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Removed(Entry),
    Skipped(Entry, String),
}

/// Apply report to system.
///
/// Paths are handled deepest first, then users, then groups. Dry run prints
/// each planned removal and changes nothing.
///
/// # Errors
///
/// - Return [`SyscleanError::Shell`] if userdel or groupdel are required but
///   missing.
#[instrument(skip(shell, report), level = "debug")]
pub fn apply(shell: &dyn Shell, report: &Report, dry_run: bool) -> Result<Vec<Action>> {
    let mut paths: Vec<&PathBuf> = Vec::new();
    let mut users: Vec<&String> = Vec::new();
    let mut groups: Vec<&String> = Vec::new();
    for entry in &report.entries {
        match entry {
            Entry::Path(path) => paths.push(path),
            Entry::User(name) => users.push(name),
            Entry::Group(name) => groups.push(name),
        }
    }

    // INVARIANT: Children before parents, so listed directories can empty out.
    paths.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });

    if dry_run {
        for path in &paths {
            println!("rm {}", path.display());
        }
        for user in &users {
            println!("userdel {user}");
        }
        for group in &groups {
            println!("groupdel {group}");
        }
        return Ok(Vec::new());
    }

    if !users.is_empty() {
        require_cmd(shell, &["userdel"])?;
    }
    if !groups.is_empty() {
        require_cmd(shell, &["groupdel"])?;
    }

    let mut actions = Vec::new();
    for path in paths {
        let entry = Entry::Path(path.clone());
        actions.push(match remove_path(path) {
            Ok(()) => {
                info!("removed {}", path.display());
                Action::Removed(entry)
            }
            Err(reason) => {
                warn!("skipped {}: {reason}", path.display());
                Action::Skipped(entry, reason)
            }
        });
    }

    for (program, names, make) in [
        ("userdel", &users, Entry::User as fn(String) -> Entry),
        ("groupdel", &groups, Entry::Group as fn(String) -> Entry),
    ] {
        for name in names.iter() {
            let entry = make(name.to_string());
            actions.push(match shell.silent(&Cmd::new(program).arg(name.as_str())) {
                Ok(()) => {
                    info!("removed {entry}");
                    Action::Removed(entry)
                }
                Err(err) => {
                    warn!("skipped {entry}: {err}");
                    Action::Skipped(entry, err.to_string())
                }
            });
        }
    }

    Ok(actions)
}

fn remove_path(path: &Path) -> std::result::Result<(), String> {
    let meta = match symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err("already gone".into()),
        Err(err) => return Err(err.to_string()),
    };

    let result = if meta.is_dir() {
        remove_dir(path)
    } else {
        remove_file(path)
    };

    result.map_err(|err| {
        if meta.is_dir() {
            format!("directory not removed: {err}")
        } else {
            err.to_string()
        }
    })
}

/// Sysclean report error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscleanError {
    #[error("malformed report line {line}: {reason}")]
    Syntax { line: usize, reason: &'static str },

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = SyscleanError> = std::result::Result<T, E>;
