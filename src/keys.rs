// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! OpenPGP keyring management.
//!
//! APT verifies repositories against dedicated keyrings referenced through
//! the "Signed-By" field. Keys are fetched either from a URL or from a
//! keyserver, converted to the binary keyring format APT expects, optionally
//! checked against a known fingerprint, and only then placed into the keyring
//! directory. All OpenPGP work is delegated to gpg running against a throwaway
//! home directory, so the invoking user's own keyring is never touched.

use crate::{
    config::KeySource,
    file::{write_if_changed, FileError, WriteOutcome},
    shell::{require_cmd, Cmd, Shell, ShellError},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir, read, set_permissions, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tracing::{info, instrument};

const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP PUBLIC KEY BLOCK-----";

/// Key as listed by gpg.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub uids: Vec<String>,
}

impl Display for KeyInfo {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.fingerprint)?;
        for uid in &self.uids {
            write!(fmt, "\n    {uid}")?;
        }

        Ok(())
    }
}

impl Display for KeySource {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Url { url, .. } => write!(fmt, "{url}"),
            Self::Keyserver {
                keyserver,
                fingerprint,
            } => write!(fmt, "{fingerprint} at {keyserver}"),
        }
    }
}

/// Scratch space for gpg.
struct GpgWorkspace {
    dir: TempDir,
}

impl GpgWorkspace {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(KeyError::Workspace)?;
        let home = dir.path().join("gnupg");
        create_dir(&home).map_err(KeyError::Workspace)?;
        set_permissions(&home, Permissions::from_mode(0o700)).map_err(KeyError::Workspace)?;

        Ok(Self { dir })
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("gnupg")
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn gpg(&self, command: &str) -> Cmd {
        Cmd::new("gpg")
            .arg(command)
            .args(["--batch", "--yes", "--homedir"])
            .arg(self.home())
    }
}

/// Fetch key and install it as binary keyring.
///
/// Keyring file is only replaced if its content differs.
///
/// # Errors
///
/// - Return [`KeyError::Shell`] if curl or gpg fail, or are missing.
/// - Return [`KeyError::FingerprintMismatch`] if the fetched key does not
///   carry the expected fingerprint.
/// - Return [`KeyError::File`] if keyring cannot be written.
#[instrument(skip(shell), level = "debug")]
pub fn install_key(
    shell: &dyn Shell,
    source: &KeySource,
    keyring: &Path,
    dry_run: bool,
) -> Result<WriteOutcome> {
    if dry_run {
        info!("would install key {source} into {}", keyring.display());
        return Ok(WriteOutcome::Unchanged);
    }

    require_cmd(shell, &["gpg"])?;
    let workspace = GpgWorkspace::new()?;
    let fetched = workspace.file("key");

    match source {
        KeySource::Url { url, .. } => {
            require_cmd(shell, &["curl"])?;
            info!("download key {url}");
            shell.silent(
                &Cmd::new("curl")
                    .args(["-fsSL", "--retry", "5", "-o"])
                    .arg(&fetched)
                    .arg(url),
            )?;
        }
        KeySource::Keyserver {
            keyserver,
            fingerprint,
        } => {
            info!("receive key {fingerprint} from {keyserver}");
            shell.silent(
                &workspace
                    .gpg("--recv-keys")
                    .args(["--keyserver", keyserver.as_str(), fingerprint.as_str()]),
            )?;
            shell.silent(
                &workspace
                    .gpg("--export")
                    .arg("--output")
                    .arg(&fetched)
                    .arg(fingerprint),
            )?;
        }
    }

    let raw = read_key(&fetched)?;
    let binary = if is_armored(&raw) {
        let dearmored = workspace.file("key.gpg");
        shell.silent(
            &workspace
                .gpg("--dearmor")
                .arg("--output")
                .arg(&dearmored)
                .arg(&fetched),
        )?;
        dearmored
    } else {
        fetched
    };

    let keys = show_keys(shell, &workspace, &binary)?;
    if keys.is_empty() {
        return Err(KeyError::NoKeys(source.to_string()));
    }
    if let Some(expected) = source.fingerprint() {
        verify_fingerprint(&keys, expected)?;
    }

    let contents = read_key(&binary)?;
    let outcome = write_if_changed(keyring, contents, 0o644)?;
    info!("keyring {} {outcome}", keyring.display());

    Ok(outcome)
}

/// List keys in binary or armored keyring file.
///
/// # Errors
///
/// - Return [`KeyError::Shell`] if gpg fails.
pub fn list_keys(shell: &dyn Shell, keyring: &Path) -> Result<Vec<KeyInfo>> {
    require_cmd(shell, &["gpg"])?;
    let workspace = GpgWorkspace::new()?;
    show_keys(shell, &workspace, keyring)
}

fn show_keys(shell: &dyn Shell, workspace: &GpgWorkspace, path: &Path) -> Result<Vec<KeyInfo>> {
    let listing = shell.output(
        &workspace
            .gpg("--show-keys")
            .arg("--with-colons")
            .arg(path),
    )?;

    Ok(parse_colon_listing(&listing))
}

/// Parse gpg "--with-colons" listing.
///
/// Only primary key fingerprints are kept. The fingerprint record that
/// follows a subkey record belongs to the subkey.
pub fn parse_colon_listing(listing: &str) -> Vec<KeyInfo> {
    let mut keys: Vec<KeyInfo> = Vec::new();
    let mut expect_primary_fpr = false;

    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                keys.push(KeyInfo::default());
                expect_primary_fpr = true;
            }
            Some("sub") => expect_primary_fpr = false,
            Some("fpr") if expect_primary_fpr => {
                if let (Some(key), Some(fpr)) = (keys.last_mut(), fields.get(9)) {
                    key.fingerprint = fpr.to_string();
                }
                expect_primary_fpr = false;
            }
            Some("uid") => {
                if let (Some(key), Some(uid)) = (keys.last_mut(), fields.get(9)) {
                    key.uids.push(uid.to_string());
                }
            }
            _ => continue,
        }
    }

    keys
}

fn verify_fingerprint(keys: &[KeyInfo], expected: &str) -> Result<()> {
    let expected = normalize_fingerprint(expected);
    if keys
        .iter()
        .any(|key| normalize_fingerprint(&key.fingerprint) == expected)
    {
        return Ok(());
    }

    Err(KeyError::FingerprintMismatch {
        expected,
        found: keys.iter().map(|key| key.fingerprint.clone()).collect(),
    })
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
        .trim_start_matches("0X")
        .to_string()
}

fn is_armored(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(ARMOR_HEADER)
}

fn read_key(path: &Path) -> Result<Vec<u8>> {
    read(path).map_err(|err| KeyError::Read {
        source: err,
        path: path.to_path_buf(),
    })
}

/// Keyring management error types.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to prepare gpg workspace")]
    Workspace(#[source] std::io::Error),

    #[error("failed to read fetched key {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("no OpenPGP keys found in {0}")]
    NoKeys(String),

    #[error("expected key {expected}, found {found:?}")]
    FingerprintMismatch { expected: String, found: Vec<String> },

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    File(#[from] FileError),
}

/// Friendly result alias :3
type Result<T, E = KeyError> = std::result::Result<T, E>;
