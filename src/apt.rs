// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! APT repository management.
//!
//! Add third-party APT repositories the modern way: a dedicated keyring under
//! the keyrings directory, and a deb822 ".sources" file that references it
//! through "Signed-By". Adding the same repository again is a no-op, which
//! makes it safe to run from configuration management or cron.
//!
//! # See Also
//!
//! 1. [`source`]
//! 2. [`keys`](crate::keys)

pub mod source;

use crate::{
    apt::source::{parse_deb822, parse_one_line, render_sources, Deb822Source, SourceError},
    config::AptRepoConfig,
    file::{compare, write_if_changed, FileError, WriteOutcome},
    keys::{install_key, KeyError},
    os::{dpkg_arch, OsError, OsRelease},
    shell::{require_cmd, Cmd, Shell, ShellError},
};

use std::{
    fs::{read_dir, read_to_string, remove_file, rename},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Directories APT reads sources and keyrings from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptPaths {
    pub sources_dir: PathBuf,
    pub keyrings_dir: PathBuf,
}

impl AptPaths {
    pub fn sources_file(&self, name: &str) -> PathBuf {
        self.sources_dir.join(format!("{name}.sources"))
    }

    pub fn legacy_list_file(&self, name: &str) -> PathBuf {
        self.sources_dir.join(format!("{name}.list"))
    }

    pub fn keyring_file(&self, name: &str) -> PathBuf {
        self.keyrings_dir.join(format!("{name}.gpg"))
    }
}

/// Add APT repository.
///
/// Installs signing key, writes deb822 sources file, and drops a legacy list
/// file of the same name. Package lists are refreshed if and only if
/// something actually changed.
///
/// # Errors
///
/// - Return [`AptError::NotDebian`] if host is not Debian based.
/// - Return [`AptError::InvalidName`] if repository name is not a plain file
///   name.
/// - Return [`AptError::Key`] if signing key cannot be installed.
/// - Return [`AptError::Shell`] if apt-get fails.
#[instrument(skip(shell, release, repo, paths), fields(repo = %repo.name), level = "debug")]
pub fn add_repository(
    shell: &dyn Shell,
    release: &OsRelease,
    repo: &AptRepoConfig,
    paths: &AptPaths,
    dry_run: bool,
) -> Result<WriteOutcome> {
    if !release.is_debian_like() {
        return Err(AptError::NotDebian(release.id.clone()));
    }
    validate_name(&repo.name)?;

    let mut source = Deb822Source {
        types: repo.types.clone(),
        uris: repo.uris.clone(),
        suites: substitute(&repo.suites, release)?,
        components: repo.components.clone(),
        architectures: substitute(&repo.architectures, release)?,
        ..Default::default()
    };

    let mut key_changed = false;
    if let Some(key) = &repo.key {
        let keyring = paths.keyring_file(&repo.name);
        key_changed = install_key(shell, key, &keyring, dry_run)?.is_changed();
        source.signed_by = Some(keyring.display().to_string());
    }
    source.validate()?;

    let content = render_sources(&[source]);
    let sources_file = paths.sources_file(&repo.name);
    let legacy = paths.legacy_list_file(&repo.name);

    if dry_run {
        let outcome = compare(&sources_file, &content)?;
        info!("would write {} ({outcome}):\n{content}", sources_file.display());
        if legacy.exists() {
            info!("would remove {}", legacy.display());
        }
        return Ok(outcome);
    }

    let mut outcome = write_if_changed(&sources_file, &content, 0o644)?;
    info!("{} {outcome}", sources_file.display());

    if remove_legacy(&legacy)? {
        info!("removed legacy {}", legacy.display());
        if !outcome.is_changed() {
            outcome = WriteOutcome::Updated;
        }
    }

    if outcome.is_changed() || key_changed {
        refresh_package_lists(shell)?;
    } else {
        info!("repository {} already configured", repo.name);
    }

    Ok(outcome)
}

/// Convert legacy list file into deb822 sources file.
///
/// The list file is kept as "<name>.list.bak" so APT stops reading it.
///
/// # Errors
///
/// - Return [`AptError::Read`] if list file cannot be read.
/// - Return [`AptError::Source`] if list file is malformed.
#[instrument(skip(list_file), level = "debug")]
pub fn migrate(list_file: &Path, dry_run: bool) -> Result<PathBuf> {
    let data = read_to_string(list_file).map_err(|err| AptError::Read {
        source: err,
        path: list_file.to_path_buf(),
    })?;
    let sources = parse_one_line(&data)?;
    let target = list_file.with_extension("sources");
    let backup = list_file.with_extension("list.bak");
    let content = render_sources(&sources);

    if dry_run {
        info!("would convert {} into {}:\n{content}", list_file.display(), target.display());
        return Ok(target);
    }

    let outcome = write_if_changed(&target, &content, 0o644)?;
    info!("{} {outcome}", target.display());
    rename(list_file, &backup).map_err(|err| AptError::Write {
        source: err,
        path: backup.clone(),
    })?;
    info!("moved {} to {}", list_file.display(), backup.display());

    Ok(target)
}

/// List every source entry in sources directory.
///
/// Both deb822 and legacy list files are read, in file name order.
///
/// # Errors
///
/// - Return [`AptError::Read`] if directory or a file cannot be read.
/// - Return [`AptError::Source`] if a file is malformed.
pub fn list_sources(sources_dir: &Path) -> Result<Vec<(PathBuf, Vec<Deb822Source>)>> {
    let read_err = |err: std::io::Error| AptError::Read {
        source: err,
        path: sources_dir.to_path_buf(),
    };

    let mut files = read_dir(sources_dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(read_err)?;
    files.sort();

    let mut listing = Vec::new();
    for path in files {
        let parse: fn(&str) -> Result<Vec<Deb822Source>, SourceError> =
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("sources") => parse_deb822,
                Some("list") => parse_one_line,
                _ => continue,
            };
        let data = read_to_string(&path).map_err(|err| AptError::Read {
            source: err,
            path: path.clone(),
        })?;
        listing.push((path, parse(&data)?));
    }

    Ok(listing)
}

fn refresh_package_lists(shell: &dyn Shell) -> Result<()> {
    require_cmd(shell, &["apt-get"])?;
    info!("refresh package lists");
    shell.silent(
        &Cmd::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .arg("update"),
    )?;

    Ok(())
}

fn remove_legacy(path: &Path) -> Result<bool> {
    match remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AptError::Write {
            source: err,
            path: path.to_path_buf(),
        }),
    }
}

fn substitute(values: &[String], release: &OsRelease) -> Result<Vec<String>> {
    values
        .iter()
        .map(|value| -> Result<String> {
            let mut value = value.replace("{arch}", dpkg_arch());
            if value.contains("{codename}") {
                value = value.replace("{codename}", release.codename()?);
            }
            Ok(value)
        })
        .collect()
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AptError::InvalidName(name.to_string()))
    }
}

/// APT repository error types.
#[derive(Debug, thiserror::Error)]
pub enum AptError {
    #[error("APT repositories require a Debian based system, found {0:?}")]
    NotDebian(String),

    #[error("invalid repository name {0:?}")]
    InvalidName(String),

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

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Os(#[from] OsError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = AptError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::KeySource, shell::fake::FakeShell};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn bookworm() -> OsRelease {
        OsRelease {
            id: "debian".into(),
            version_codename: Some("bookworm".into()),
            ..Default::default()
        }
    }

    fn paths() -> AptPaths {
        AptPaths {
            sources_dir: "sources.list.d".into(),
            keyrings_dir: "keyrings".into(),
        }
    }

    fn repo() -> AptRepoConfig {
        AptRepoConfig {
            name: "example".into(),
            types: vec!["deb".into()],
            uris: vec!["https://apt.example.org/debian".into()],
            suites: vec!["{codename}".into()],
            components: vec!["main".into()],
            architectures: vec![],
            key: None,
        }
    }

    #[sealed_test]
    fn adding_repository_twice_is_idempotent() -> anyhow::Result<()> {
        let shell = FakeShell::new().with_cmds(&["apt-get"]);

        let first = add_repository(&shell, &bookworm(), &repo(), &paths(), false)?;
        assert_eq!(first, WriteOutcome::Created);
        let content = read_to_string("sources.list.d/example.sources")?;
        assert_eq!(
            content,
            indoc! {"
                Types: deb
                URIs: https://apt.example.org/debian
                Suites: bookworm
                Components: main
            "}
        );

        let second = add_repository(&shell, &bookworm(), &repo(), &paths(), false)?;
        assert_eq!(second, WriteOutcome::Unchanged);
        assert_eq!(read_to_string("sources.list.d/example.sources")?, content);

        // Package lists only refreshed for the first run.
        let updates = shell
            .calls()
            .iter()
            .filter(|call| call.starts_with("apt-get update"))
            .count();
        assert_eq!(updates, 1);

        Ok(())
    }

    #[sealed_test]
    fn legacy_list_is_replaced() -> anyhow::Result<()> {
        std::fs::create_dir("sources.list.d")?;
        std::fs::write(
            "sources.list.d/example.list",
            "deb https://apt.example.org/debian bookworm main\n",
        )?;
        let shell = FakeShell::new().with_cmds(&["apt-get"]);

        add_repository(&shell, &bookworm(), &repo(), &paths(), false)?;
        assert!(!Path::new("sources.list.d/example.list").exists());
        assert!(Path::new("sources.list.d/example.sources").exists());

        Ok(())
    }

    #[sealed_test]
    fn signed_by_points_at_keyring() -> anyhow::Result<()> {
        let shell = FakeShell::new()
            .with_cmds(&["apt-get", "curl", "gpg"])
            .respond("curl", "binary-key")
            .respond(
                "gpg --show-keys",
                "pub:-:4096:1:AAAA:0:::-:::scESC:\nfpr:::::::::ABCDEF:\n",
            );
        let mut repo = repo();
        repo.key = Some(KeySource::Url {
            url: "https://apt.example.org/key.gpg".into(),
            fingerprint: Some("abcdef".into()),
        });

        add_repository(&shell, &bookworm(), &repo, &paths(), false)?;
        let sources = parse_deb822(&read_to_string("sources.list.d/example.sources")?)?;
        assert_eq!(sources[0].signed_by.as_deref(), Some("keyrings/example.gpg"));
        assert_eq!(read_to_string("keyrings/example.gpg")?, "binary-key");

        Ok(())
    }

    #[sealed_test]
    fn dry_run_writes_nothing() -> anyhow::Result<()> {
        let shell = FakeShell::new().with_cmds(&["apt-get"]);
        let outcome = add_repository(&shell, &bookworm(), &repo(), &paths(), true)?;
        assert_eq!(outcome, WriteOutcome::Created);
        assert!(!Path::new("sources.list.d").exists());
        assert!(shell.calls().is_empty());

        Ok(())
    }

    #[sealed_test]
    fn dry_run_with_key_fetches_and_writes_nothing() -> anyhow::Result<()> {
        let shell = FakeShell::new().with_cmds(&["apt-get", "curl", "gpg"]);
        let mut repo = repo();
        repo.key = Some(KeySource::Keyserver {
            keyserver: "hkps://keys.openpgp.org".into(),
            fingerprint: "ABCDEF".into(),
        });

        let outcome = add_repository(&shell, &bookworm(), &repo, &paths(), true)?;
        assert_eq!(outcome, WriteOutcome::Created);
        assert!(!Path::new("sources.list.d").exists());
        assert!(!Path::new("keyrings").exists());
        assert!(!shell.called("apt-get update"));
        assert!(shell.calls().is_empty());

        Ok(())
    }

    #[test]
    fn non_debian_is_refused() {
        let fedora = OsRelease {
            id: "fedora".into(),
            ..Default::default()
        };
        let shell = FakeShell::new();
        let result = add_repository(&shell, &fedora, &repo(), &paths(), false);
        assert!(matches!(result, Err(AptError::NotDebian(_))));
    }

    #[test]
    fn path_like_names_are_refused() {
        let mut repo = repo();
        repo.name = "../../etc/passwd".into();
        let shell = FakeShell::new();
        let result = add_repository(&shell, &bookworm(), &repo, &paths(), false);
        assert!(matches!(result, Err(AptError::InvalidName(_))));
    }

    #[sealed_test]
    fn migrate_list_file() -> anyhow::Result<()> {
        std::fs::write(
            "old.list",
            "deb http://deb.debian.org/debian bookworm main\ndeb-src http://deb.debian.org/debian bookworm main\n",
        )?;

        let target = migrate(Path::new("old.list"), false)?;
        assert_eq!(target, PathBuf::from("old.sources"));
        assert!(Path::new("old.list.bak").exists());
        assert!(!Path::new("old.list").exists());
        assert_eq!(
            read_to_string("old.sources")?,
            indoc! {"
                Types: deb deb-src
                URIs: http://deb.debian.org/debian
                Suites: bookworm
                Components: main
            "}
        );

        let listing = list_sources(Path::new("."))?;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0, PathBuf::from("./old.sources"));

        Ok(())
    }
}
