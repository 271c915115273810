// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the wrench configuration file to simplify the
//! process of serialization and deserialization. Every section is optional.
//! A missing file is the same as an empty one, so wrench can be used ad hoc
//! from the command line without any configuration at all.
//!
//! # General Layout
//!
//! ```toml
//! [settings]
//! gh_user = "someone"
//! repo_slug = "someone.github.io"
//!
//! [logs]
//! dirs = ["/var/log"]
//! max_age_days = 14
//!
//! [[apt_repo]]
//! name = "docker"
//! uris = ["https://download.docker.com/linux/debian"]
//! suites = ["{codename}"]
//! components = ["stable"]
//! key = { url = "https://download.docker.com/linux/debian/gpg" }
//!
//! [[release]]
//! name = "go"
//! source = { kind = "go" }
//! version_command = ["/usr/local/go/bin/go", "version"]
//! asset = "https://go.dev/dl/{tag}.linux-{arch}.tar.gz"
//! install = { kind = "tarball", dest = "/usr/local", replace = "/usr/local/go" }
//! ```
//!
//! # Environment Overrides
//!
//! `DRY_RUN`, `GH_USER`, and `REPO_SLUG` override their counterparts in the
//! settings section, which keeps old cron entries working unchanged.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Complete configuration file.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub settings: Settings,

    /// Rotated log cleanup.
    pub logs: LogsConfig,

    /// APT repositories that can be added by name.
    #[serde(rename = "apt_repo", skip_serializing_if = "Vec::is_empty")]
    pub apt_repos: Vec<AptRepoConfig>,

    /// Third-party software kept up to date from upstream releases.
    #[serde(rename = "release", skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<ReleaseConfig>,

    /// Websites synced from Git.
    #[serde(rename = "site", skip_serializing_if = "Vec::is_empty")]
    pub sites: Vec<SiteConfig>,

    /// Systemd services installed from templates.
    #[serde(rename = "service", skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Load configuration file at target path.
    ///
    /// Missing file yields default configuration. Environment overrides are
    /// applied after parsing.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is not valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = match read_to_string(path.as_ref()) {
            Ok(data) => data.parse()?,
            Err(err) if err.kind() == ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(ConfigError::Read {
                    source: err,
                    path: path.as_ref().to_path_buf(),
                })
            }
        };
        config.settings.apply_env();

        Ok(config)
    }

    pub fn apt_repo(&self, name: &str) -> Result<&AptRepoConfig> {
        self.apt_repos
            .iter()
            .find(|repo| repo.name == name)
            .ok_or_else(|| ConfigError::NotFound("apt_repo", name.into()))
    }

    pub fn release(&self, name: &str) -> Result<&ReleaseConfig> {
        self.releases
            .iter()
            .find(|release| release.name == name)
            .ok_or_else(|| ConfigError::NotFound("release", name.into()))
    }

    pub fn site(&self, name: &str) -> Result<&SiteConfig> {
        self.sites
            .iter()
            .find(|site| site.name == name)
            .ok_or_else(|| ConfigError::NotFound("site", name.into()))
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .iter()
            .find(|service| service.name == name)
            .ok_or_else(|| ConfigError::NotFound("service", name.into()))
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let settings = &mut config.settings;
        settings.sources_dir = expand(&settings.sources_dir)?;
        settings.keyrings_dir = expand(&settings.keyrings_dir)?;
        settings.unit_dir = expand(&settings.unit_dir)?;
        if let Some(lock_dir) = &settings.lock_dir {
            settings.lock_dir = Some(expand(lock_dir)?);
        }
        for dir in &mut config.logs.dirs {
            *dir = expand(dir)?;
        }
        for release in &mut config.releases {
            if let InstallMethod::Tarball { dest, replace } = &mut release.install {
                *dest = expand(dest)?;
                if let Some(path) = replace {
                    *path = expand(path)?;
                }
            }
        }
        for site in &mut config.sites {
            site.checkout = site.checkout.as_deref().map(expand).transpose()?;
            site.docroot = expand(&site.docroot)?;
        }
        for service in &mut config.services {
            service.unit_template = expand(&service.unit_template)?;
            if let Some(config_file) = &mut service.config_file {
                config_file.template = expand(&config_file.template)?;
                config_file.path = expand(&config_file.path)?;
            }
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())?.into_owned(),
    ))
}

/// General settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Report what would be done without changing anything.
    pub dry_run: bool,

    /// GitHub account used to derive default site repository URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gh_user: Option<String>,

    /// Repository name used to derive default site repository URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_slug: Option<String>,

    /// Privilege escalation tools to try in order.
    pub escalators: Vec<String>,

    /// Directory to place lock directories in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,

    /// APT sources directory.
    pub sources_dir: PathBuf,

    /// Directory for APT signing keyrings.
    pub keyrings_dir: PathBuf,

    /// Directory for systemd unit files.
    pub unit_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dry_run: false,
            gh_user: None,
            repo_slug: None,
            escalators: vec!["sudo".into(), "doas".into(), "run0".into()],
            lock_dir: None,
            sources_dir: PathBuf::from("/etc/apt/sources.list.d"),
            keyrings_dir: PathBuf::from("/etc/apt/keyrings"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl Settings {
    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var("DRY_RUN") {
            self.dry_run = is_truthy(&value);
        }
        if let Ok(user) = env::var("GH_USER") {
            self.gh_user = Some(user);
        }
        if let Ok(slug) = env::var("REPO_SLUG") {
            self.repo_slug = Some(slug);
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Rotated log cleanup settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Directories to search recursively.
    pub dirs: Vec<PathBuf>,

    /// File name patterns of rotated logs.
    pub patterns: Vec<String>,

    /// Minimum age in days before a rotated log is removed.
    pub max_age_days: u64,

    /// Argument for `journalctl --vacuum-time`, e.g., "2weeks".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_vacuum: Option<String>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("/var/log")],
            patterns: ["*.gz", "*.xz", "*.old", "*.[0-9]", "*.[0-9].log"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_age_days: 7,
            journal_vacuum: None,
        }
    }
}

/// APT repository definition.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AptRepoConfig {
    /// Name of sources and keyring files.
    pub name: String,

    #[serde(default = "default_types")]
    pub types: Vec<String>,

    pub uris: Vec<String>,

    /// Suites, where "{codename}" expands to the host release codename.
    pub suites: Vec<String>,

    #[serde(default)]
    pub components: Vec<String>,

    /// Architectures, where "{arch}" expands to the host architecture.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,

    /// Signing key of repository.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeySource>,
}

fn default_types() -> Vec<String> {
    vec!["deb".into()]
}

/// Where to obtain an OpenPGP signing key from.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum KeySource {
    /// Download key file from URL, armored or binary.
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },

    /// Receive key from keyserver by fingerprint.
    Keyserver {
        keyserver: String,
        fingerprint: String,
    },
}

impl KeySource {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Url { fingerprint, .. } => fingerprint.as_deref(),
            Self::Keyserver { fingerprint, .. } => Some(fingerprint.as_str()),
        }
    }
}

/// Third-party release definition.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ReleaseConfig {
    pub name: String,

    /// Where to learn the latest released version.
    pub source: ReleaseSource,

    /// Command printing the installed version.
    pub version_command: Vec<String>,

    /// Download URL template with "{version}", "{tag}", and "{arch}".
    pub asset: String,

    /// How to install downloaded asset.
    pub install: InstallMethod,

    /// Packages needed before installation, installed best effort.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
}

/// Upstream release feed.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReleaseSource {
    /// Official Go release feed.
    Go,

    /// Latest GitHub release of "owner/repo".
    Github { repo: String },
}

/// Installation method for downloaded asset.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallMethod {
    /// Extract gzipped tarball into directory.
    Tarball {
        dest: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace: Option<PathBuf>,
    },

    /// Install Debian package through apt.
    Deb,
}

/// Website synced from Git.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub name: String,

    /// Repository URL. Derived from GH_USER and REPO_SLUG when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Local clone. Defaults to state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout: Option<PathBuf>,

    /// Directory served by web server.
    pub docroot: PathBuf,

    /// Command to run after deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_sync: Vec<String>,
}

fn default_branch() -> String {
    "main".into()
}

/// Systemd service installed from templates.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unit name without ".service" suffix.
    pub name: String,

    pub unit_template: PathBuf,

    /// Configuration file rendered along with unit, e.g., monerod.conf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<ConfigFile>,

    /// Template variables.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Templated configuration file.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConfigFile {
    pub template: PathBuf,
    pub path: PathBuf,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file exists but cannot be read.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Named entry missing from configuration.
    #[error("no {0} named {1:?} in configuration")]
    NotFound(&'static str, String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
