// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Third-party release updater.
//!
//! Some software is better taken straight from upstream than from the
//! distribution, e.g., Go toolchains or tools that publish Debian packages on
//! GitHub. An update checks the latest upstream tag, compares it with the
//! version reported by the installed binary, and only downloads anything if
//! the two differ.

use crate::{
    config::{InstallMethod, ReleaseConfig, ReleaseSource},
    os::{dpkg_arch, PackageManager},
    shell::{best_effort, require_cmd, Cmd, Shell, ShellError},
};

use serde::Deserialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, remove_dir_all, remove_file, symlink_metadata},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

const GO_VERSION_URL: &str = "https://go.dev/VERSION?m=text";

/// Upstream release tag paired with its normalized version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Latest {
    pub tag: String,
    pub version: String,
}

/// Result of an update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Installed version matches latest release.
    UpToDate(String),

    /// Dry run found a newer release.
    WouldInstall {
        from: Option<String>,
        to: String,
    },

    /// Latest release was installed.
    Installed {
        from: Option<String>,
        to: String,
    },
}

impl Display for UpdateOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let from = |from: &Option<String>| from.clone().unwrap_or_else(|| "nothing".into());
        match self {
            Self::UpToDate(version) => write!(fmt, "up to date at {version}"),
            Self::WouldInstall { from: old, to } => {
                write!(fmt, "would update {} -> {to}", from(old))
            }
            Self::Installed { from: old, to } => write!(fmt, "updated {} -> {to}", from(old)),
        }
    }
}

/// Knobs for [`update`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Reinstall even when already up to date.
    pub force: bool,

    /// Stop after version comparison.
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
}

/// Extract version from free-form version output.
///
/// Takes the first whitespace separated word that starts with a digit after
/// dropping a "go" or "v" prefix, e.g., "go version go1.22.1 linux/amd64"
/// gives "1.22.1".
pub fn normalize_version(text: &str) -> Option<String> {
    text.split_whitespace().find_map(|word| {
        let word = word.trim_matches(|c: char| matches!(c, '(' | ')' | ',' | '"'));
        let word = word
            .strip_prefix("go")
            .or_else(|| word.strip_prefix('v'))
            .unwrap_or(word);
        if !word.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }

        let version: String = word
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let version = version.trim_end_matches('.');
        version.contains('.').then(|| version.to_string())
    })
}

/// Query upstream for latest release.
///
/// # Errors
///
/// - Return [`ReleaseError::Shell`] if curl fails.
/// - Return [`ReleaseError::Json`] if GitHub response is malformed.
/// - Return [`ReleaseError::NoVersion`] if tag carries no version.
#[instrument(skip(shell), level = "debug")]
pub fn latest(shell: &dyn Shell, source: &ReleaseSource) -> Result<Latest> {
    require_cmd(shell, &["curl"])?;
    let tag = match source {
        ReleaseSource::Go => {
            let body = shell.output(&curl().arg(GO_VERSION_URL))?;
            body.lines().next().unwrap_or_default().trim().to_string()
        }
        ReleaseSource::Github { repo } => {
            let body = shell.output(
                &curl()
                    .args(["-H", "Accept: application/vnd.github+json"])
                    .arg(format!("https://api.github.com/repos/{repo}/releases/latest")),
            )?;
            serde_json::from_str::<GithubRelease>(&body)?.tag_name
        }
    };

    let version = normalize_version(&tag).ok_or_else(|| ReleaseError::NoVersion(tag.clone()))?;
    Ok(Latest { tag, version })
}

fn curl() -> Cmd {
    Cmd::new("curl").args(["-fsSL", "--retry", "5"])
}

/// Ask installed binary for its version.
///
/// Missing program means nothing is installed. A failing version command is
/// treated the same way with a warning.
pub fn installed_version(shell: &dyn Shell, command: &[String]) -> Option<String> {
    let (program, args) = command.split_first()?;
    if !shell.have_cmd(program) {
        debug!("{program} not installed");
        return None;
    }

    let output = best_effort(
        shell.output(&Cmd::new(program).args(args)),
        "failed to query installed version",
    )?;
    normalize_version(&output)
}

/// Expand asset URL template.
pub fn asset_url(template: &str, latest: &Latest) -> String {
    template
        .replace("{version}", &latest.version)
        .replace("{tag}", &latest.tag)
        .replace("{arch}", dpkg_arch())
}

/// Bring release up to date.
///
/// When installed and latest versions agree, nothing is
/// downloaded unless forced.
///
/// # Errors
///
/// - Return [`ReleaseError::Shell`] if a download or installation step fails.
/// - Return [`ReleaseError::Io`] if old installation cannot be replaced.
#[instrument(skip(shell, release, package_manager), fields(name = %release.name), level = "debug")]
pub fn update(
    shell: &dyn Shell,
    release: &ReleaseConfig,
    package_manager: Option<PackageManager>,
    options: UpdateOptions,
) -> Result<UpdateOutcome> {
    let latest = latest(shell, &release.source)?;
    let installed = installed_version(shell, &release.version_command);
    info!(
        "{}: installed {}, latest {}",
        release.name,
        installed.as_deref().unwrap_or("nothing"),
        latest.version
    );

    if installed.as_deref() == Some(latest.version.as_str()) && !options.force {
        return Ok(UpdateOutcome::UpToDate(latest.version));
    }

    if options.dry_run {
        return Ok(UpdateOutcome::WouldInstall {
            from: installed,
            to: latest.version,
        });
    }

    if !release.packages.is_empty() {
        match package_manager {
            Some(pm) => {
                best_effort(
                    pm.install_packages(shell, &release.packages),
                    "failed to install dependencies",
                );
            }
            None => warn!("no package manager, skipping dependencies"),
        }
    }

    let workspace = tempfile::tempdir().map_err(|err| ReleaseError::Io {
        source: err,
        path: std::env::temp_dir(),
    })?;
    let url = asset_url(&release.asset, &latest);
    let asset = workspace.path().join(asset_file_name(&url));
    info!("download {url}");
    shell.silent(&curl().arg("-o").arg(&asset).arg(&url))?;

    match &release.install {
        InstallMethod::Tarball { dest, replace } => {
            require_cmd(shell, &["tar"])?;
            if let Some(replace) = replace {
                remove_path(replace)?;
            }
            create_dir_all(dest).map_err(|err| ReleaseError::Io {
                source: err,
                path: dest.clone(),
            })?;
            shell.silent(
                &Cmd::new("tar")
                    .arg("-C")
                    .arg(dest)
                    .arg("-xzf")
                    .arg(&asset),
            )?;
        }
        InstallMethod::Deb => {
            require_cmd(shell, &["apt-get"])?;
            shell.silent(
                &Cmd::new("apt-get")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .args(["install", "-y"])
                    .arg(&asset),
            )?;
        }
    }

    if let Some(now) = installed_version(shell, &release.version_command) {
        if now != latest.version {
            warn!("{} reports {now} after installing {}", release.name, latest.version);
        }
    }

    Ok(UpdateOutcome::Installed {
        from: installed,
        to: latest.version,
    })
}

fn asset_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|url| url.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("asset")
        .to_string()
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => remove_dir_all(path),
        Ok(_) => remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    result.map_err(|err| ReleaseError::Io {
        source: err,
        path: path.to_path_buf(),
    })?;
    info!("removed old installation {}", path.display());

    Ok(())
}

/// Release updater error types.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("release tag {0:?} carries no version")]
    NoVersion(String),

    #[error("malformed GitHub release response")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = ReleaseError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeShell;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[test_case("go version go1.22.1 linux/amd64", Some("1.22.1"); "go toolchain")]
    #[test_case("go1.23.0", Some("1.23.0"); "go tag")]
    #[test_case("v2.8.10", Some("2.8.10"); "github tag")]
    #[test_case("fastfetch 2.8.10 (x86_64)", Some("2.8.10"); "tool output")]
    #[test_case("Monero 'Fluorine Fermi' (v0.18.3.4-release)", Some("0.18.3.4"); "parenthesized")]
    #[test_case("version unknown", None; "no version")]
    #[test]
    fn extract_version(input: &str, expect: Option<&str>) {
        pretty_assertions::assert_eq!(normalize_version(input).as_deref(), expect);
    }

    fn go_release() -> ReleaseConfig {
        ReleaseConfig {
            name: "go".into(),
            source: ReleaseSource::Go,
            version_command: vec!["go".into(), "version".into()],
            asset: "https://go.dev/dl/{tag}.linux-{arch}.tar.gz".into(),
            install: InstallMethod::Tarball {
                dest: "usr/local".into(),
                replace: Some("usr/local/go".into()),
            },
            packages: vec![],
        }
    }

    #[test]
    fn up_to_date_skips_download() -> anyhow::Result<()> {
        let shell = FakeShell::new()
            .with_cmds(&["curl", "go", "tar"])
            .respond("curl -fsSL --retry 5 https://go.dev", "go1.22.1\ntime 2024-03-05\n")
            .respond("go version", "go version go1.22.1 linux/amd64\n");

        let outcome = update(&shell, &go_release(), None, UpdateOptions::default())?;
        assert_eq!(outcome, UpdateOutcome::UpToDate("1.22.1".into()));
        assert!(!shell.called("curl -fsSL --retry 5 -o"));
        assert!(!shell.called("tar"));

        Ok(())
    }

    #[test]
    fn dry_run_stops_after_compare() -> anyhow::Result<()> {
        let shell = FakeShell::new()
            .with_cmds(&["curl", "go"])
            .respond("curl -fsSL --retry 5 https://go.dev", "go1.23.0\n")
            .respond("go version", "go version go1.22.1 linux/amd64\n");
        let options = UpdateOptions {
            dry_run: true,
            ..Default::default()
        };

        let outcome = update(&shell, &go_release(), None, options)?;
        let expect = UpdateOutcome::WouldInstall {
            from: Some("1.22.1".into()),
            to: "1.23.0".into(),
        };
        assert_eq!(outcome, expect);
        assert_eq!(shell.calls().len(), 2);

        Ok(())
    }

    #[sealed_test]
    fn tarball_replaces_old_installation() -> anyhow::Result<()> {
        std::fs::create_dir_all("usr/local/go/bin")?;
        std::fs::write("usr/local/go/bin/stale", "")?;
        let shell = FakeShell::new()
            .with_cmds(&["curl", "tar"])
            .respond("curl -fsSL --retry 5 https://go.dev", "go1.23.0\n")
            .respond("curl -fsSL --retry 5 -o", "tarball");

        let outcome = update(&shell, &go_release(), None, UpdateOptions::default())?;
        let expect = UpdateOutcome::Installed {
            from: None,
            to: "1.23.0".into(),
        };
        assert_eq!(outcome, expect);
        assert!(!Path::new("usr/local/go").exists());

        let calls = shell.calls();
        let url = format!("https://go.dev/dl/go1.23.0.linux-{}.tar.gz", dpkg_arch());
        assert!(calls[1].ends_with(&url));
        assert!(calls[2].starts_with("tar -C usr/local -xzf "));

        Ok(())
    }

    #[test]
    fn github_deb_install() -> anyhow::Result<()> {
        let release = ReleaseConfig {
            name: "fastfetch".into(),
            source: ReleaseSource::Github {
                repo: "fastfetch-cli/fastfetch".into(),
            },
            version_command: vec!["fastfetch".into(), "--version".into()],
            asset: "https://example.com/{tag}/fastfetch-{version}.deb".into(),
            install: InstallMethod::Deb,
            packages: vec!["libc6".into()],
        };
        let shell = FakeShell::new()
            .with_cmds(&["curl", "apt-get", "fastfetch"])
            .respond(
                "curl -fsSL --retry 5 -H",
                r#"{"tag_name": "v2.9.0", "name": "2.9.0"}"#,
            )
            .respond("fastfetch --version", "fastfetch 2.8.10 (x86_64)\n");

        let outcome = update(
            &shell,
            &release,
            Some(PackageManager::Apt),
            UpdateOptions::default(),
        )?;
        let expect = UpdateOutcome::Installed {
            from: Some("2.8.10".into()),
            to: "2.9.0".into(),
        };
        assert_eq!(outcome, expect);
        assert!(shell.called("curl -fsSL --retry 5 -H 'Accept: application/vnd.github+json' https://api.github.com/repos/fastfetch-cli/fastfetch/releases/latest"));
        assert!(shell.called("apt-get install -y --no-install-recommends libc6"));
        assert!(shell.calls().iter().any(|call| call.starts_with("curl -fsSL --retry 5 -o")
            && call.ends_with("https://example.com/v2.9.0/fastfetch-2.9.0.deb")));
        assert!(shell.calls().iter().any(|call| call.starts_with("apt-get install -y /")
            && call.ends_with("fastfetch-2.9.0.deb")));

        Ok(())
    }

    #[test]
    fn force_reinstalls_current_version() -> anyhow::Result<()> {
        let shell = FakeShell::new()
            .with_cmds(&["curl", "go", "tar"])
            .respond("curl -fsSL --retry 5 https://go.dev", "go1.22.1\n")
            .respond("go version", "go version go1.22.1 linux/amd64\n");
        let mut release = go_release();
        release.install = InstallMethod::Tarball {
            dest: std::env::temp_dir(),
            replace: None,
        };
        let options = UpdateOptions {
            force: true,
            ..Default::default()
        };

        let outcome = update(&shell, &release, None, options)?;
        assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
        assert!(shell.called("tar"));

        Ok(())
    }
}
