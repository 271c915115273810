// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Filesystem table editing.
//!
//! Only entries that are explicitly changed get re-rendered. Comments, blank
//! lines, and the original column layout of every other entry survive a round
//! trip untouched.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Mount options only understood by the ext family.
const EXT_ONLY_OPTIONS: &[&str] = &[
    "user_xattr",
    "nouser_xattr",
    "delalloc",
    "nodelalloc",
    "dioread_lock",
    "dioread_nolock",
    "auto_da_alloc",
    "noauto_da_alloc",
    "noinit_itable",
    "nojournal_checksum",
];

const EXT_ONLY_PREFIXES: &[&str] = &[
    "errors=",
    "data=",
    "data_err=",
    "journal_",
    "barrier=",
    "stripe=",
    "resgid=",
    "resuid=",
    "sb=",
    "init_itable",
];

/// Single mount entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub file: String,
    pub vfstype: String,
    pub mntops: Vec<String>,
    pub freq: u32,
    pub passno: u32,
}

impl FstabEntry {
    /// Point entry at a converted btrfs filesystem.
    ///
    /// Ext-only mount options are dropped, falling back to "defaults" when
    /// nothing remains. Btrfs needs no boot-time fsck pass.
    pub fn retarget_btrfs(&mut self, uuid: &str) {
        self.spec = format!("UUID={uuid}");
        self.vfstype = "btrfs".into();
        self.mntops.retain(|option| !is_ext_only(option));
        if self.mntops.is_empty() {
            self.mntops.push("defaults".into());
        }
        self.passno = 0;
    }
}

fn is_ext_only(option: &str) -> bool {
    EXT_ONLY_OPTIONS.contains(&option)
        || EXT_ONLY_PREFIXES
            .iter()
            .any(|prefix| option.starts_with(prefix))
}

impl Display for FstabEntry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.spec,
            self.file,
            self.vfstype,
            self.mntops.join(","),
            self.freq,
            self.passno
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Verbatim(String),
    Entry {
        entry: FstabEntry,
        raw: Option<String>,
    },
}

/// Parsed filesystem table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fstab {
    lines: Vec<Line>,
}

impl Fstab {
    pub fn entries(&self) -> impl Iterator<Item = &FstabEntry> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { entry, .. } => Some(entry),
            Line::Verbatim(_) => None,
        })
    }

    /// Retarget every entry whose spec is listed to btrfs.
    ///
    /// Returns number of entries changed.
    pub fn retarget_btrfs(&mut self, specs: &[String], uuid: &str) -> usize {
        let mut changed = 0;
        for line in &mut self.lines {
            if let Line::Entry { entry, raw } = line {
                if specs.iter().any(|spec| *spec == entry.spec) {
                    entry.retarget_btrfs(uuid);
                    *raw = None;
                    changed += 1;
                }
            }
        }

        changed
    }
}

impl FromStr for Fstab {
    type Err = FstabError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut lines = Vec::new();
        for (number, line) in data.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Verbatim(line.to_string()));
                continue;
            }

            let syntax = || FstabError::Syntax { line: number + 1 };
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if !(4..=6).contains(&fields.len()) {
                return Err(syntax());
            }
            let number_at = |index: usize| -> Result<u32> {
                fields
                    .get(index)
                    .map_or(Ok(0), |field| field.parse().map_err(|_| syntax()))
            };

            let entry = FstabEntry {
                spec: fields[0].into(),
                file: fields[1].into(),
                vfstype: fields[2].into(),
                mntops: fields[3].split(',').map(String::from).collect(),
                freq: number_at(4)?,
                passno: number_at(5)?,
            };
            lines.push(Line::Entry {
                entry,
                raw: Some(line.to_string()),
            });
        }

        Ok(Self { lines })
    }
}

impl Display for Fstab {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for line in &self.lines {
            match line {
                Line::Verbatim(text) | Line::Entry { raw: Some(text), .. } => {
                    writeln!(fmt, "{text}")?
                }
                Line::Entry { entry, raw: None } => writeln!(fmt, "{entry}")?,
            }
        }

        Ok(())
    }
}

/// Filesystem table error types.
#[derive(Debug, thiserror::Error)]
pub enum FstabError {
    #[error("malformed fstab line {line}")]
    Syntax { line: usize },
}

/// Friendly result alias :3
type Result<T, E = FstabError> = std::result::Result<T, E>;
