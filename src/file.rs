// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent file writes.
//!
//! Generated system files are only ever replaced when their content actually
//! changes. Running the same operation twice leaves the file, and its mtime,
//! untouched the second time. Replacement goes through a temporary file in
//! the same directory followed by a rename, so readers never observe a half
//! written file.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read, set_permissions, Permissions},
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Result of comparing desired content with file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

impl WriteOutcome {
    pub fn is_changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl Display for WriteOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        })
    }
}

/// Determine what writing target content would do without writing it.
///
/// # Errors
///
/// - Return [`FileError::Read`] if existing file cannot be read.
pub fn compare(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<WriteOutcome> {
    match read(path.as_ref()) {
        Ok(current) if current == contents.as_ref() => Ok(WriteOutcome::Unchanged),
        Ok(_) => Ok(WriteOutcome::Updated),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(WriteOutcome::Created),
        Err(err) => Err(FileError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        }),
    }
}

/// Write content to file if and only if it differs.
///
/// Missing parent directories are created. New content gets permission bits
/// from `mode`.
///
/// # Errors
///
/// - Return [`FileError::Read`] if existing file cannot be read.
/// - Return [`FileError::Write`] if new content cannot be written.
pub fn write_if_changed(
    path: impl AsRef<Path>,
    contents: impl AsRef<[u8]>,
    mode: u32,
) -> Result<WriteOutcome> {
    let path = path.as_ref();
    let outcome = compare(path, contents.as_ref())?;
    if !outcome.is_changed() {
        return Ok(outcome);
    }

    let write_err = |err: std::io::Error| FileError::Write {
        source: err,
        path: path.to_path_buf(),
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    create_dir_all(dir).map_err(write_err)?;

    let mut staged = NamedTempFile::new_in(dir).map_err(write_err)?;
    staged.write_all(contents.as_ref()).map_err(write_err)?;
    set_permissions(staged.path(), Permissions::from_mode(mode)).map_err(write_err)?;
    staged.persist(path).map_err(|err| write_err(err.error))?;

    Ok(outcome)
}

/// File writing error types.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = FileError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test]
    fn second_write_is_unchanged() -> anyhow::Result<()> {
        assert_eq!(write_if_changed("etc/a.conf", "x=1\n", 0o644)?, WriteOutcome::Created);
        assert_eq!(write_if_changed("etc/a.conf", "x=1\n", 0o644)?, WriteOutcome::Unchanged);
        assert_eq!(write_if_changed("etc/a.conf", "x=2\n", 0o644)?, WriteOutcome::Updated);
        assert_eq!(std::fs::read_to_string("etc/a.conf")?, "x=2\n");

        let mode = std::fs::metadata("etc/a.conf")?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        Ok(())
    }

    #[sealed_test]
    fn compare_does_not_touch_disk() -> anyhow::Result<()> {
        assert_eq!(compare("b.conf", "y")?, WriteOutcome::Created);
        assert!(!Path::new("b.conf").exists());

        Ok(())
    }
}
