// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Website sync from Git.
//!
//! A __site__ is a Git repository whose working tree is published into a web
//! server's document root. A local checkout is kept between runs, so each sync
//! only fetches what changed. When the remote branch has not moved since the
//! last run, nothing is deployed at all.
//!
//! # Deployment
//!
//! The checkout is mirrored into the document root through rsync, excluding
//! the ".git" directory. Files deleted upstream are deleted from the document
//! root as well. An optional post-sync command runs afterwards, e.g., to
//! reload the web server.
//!
//! Syncs are meant to be triggered from cron, so the binary always runs them
//! under a lock directory.

use crate::{
    config::{Settings, SiteConfig},
    path::default_state_dir,
    shell::{require_cmd, Cmd, Shell, ShellError},
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config as GitConfig, FetchOptions, Oid, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Site with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub checkout: PathBuf,
    pub docroot: PathBuf,
    pub post_sync: Vec<String>,
}

impl Site {
    /// Fill in defaults of site configuration.
    ///
    /// Missing URL is derived from `GH_USER` and `REPO_SLUG` settings as a
    /// GitHub repository. Missing checkout lives in the state directory.
    ///
    /// # Errors
    ///
    /// - Return [`SiteError::NoUrl`] if URL cannot be derived.
    /// - Return [`SiteError::NoStateDir`] if checkout path cannot be derived.
    pub fn resolve(config: &SiteConfig, settings: &Settings) -> Result<Self> {
        let url = match (&config.url, &settings.gh_user, &settings.repo_slug) {
            (Some(url), _, _) => url.clone(),
            (None, Some(user), Some(slug)) => format!("https://github.com/{user}/{slug}.git"),
            _ => return Err(SiteError::NoUrl(config.name.clone())),
        };

        let checkout = match &config.checkout {
            Some(checkout) => checkout.clone(),
            None => default_state_dir()
                .map_err(|_| SiteError::NoStateDir)?
                .join("sites")
                .join(&config.name),
        };

        Ok(Self {
            name: config.name.clone(),
            url,
            branch: config.branch.clone(),
            checkout,
            docroot: config.docroot.clone(),
            post_sync: config.post_sync.clone(),
        })
    }

    /// Lock directory name for this site.
    pub fn lock_name(&self) -> String {
        format!("wrench-site-{}.lock", self.name)
    }
}

/// State of checkout after sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Fresh clone.
    Cloned(Oid),

    /// Remote branch moved.
    Updated { from: Option<Oid>, to: Oid },

    /// Remote branch did not move.
    Unchanged(Oid),

    /// Dry run, nothing touched.
    Skipped,
}

impl SyncOutcome {
    /// Whether the document root needs a new deployment.
    pub fn needs_deploy(&self) -> bool {
        matches!(self, Self::Cloned(_) | Self::Updated { .. })
    }

    /// Commit checked out after sync.
    pub fn head(&self) -> Option<Oid> {
        match self {
            Self::Cloned(oid) | Self::Unchanged(oid) | Self::Updated { to: oid, .. } => Some(*oid),
            Self::Skipped => None,
        }
    }
}

impl Display for SyncOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Cloned(oid) => write!(fmt, "cloned at {oid}"),
            Self::Updated { from: Some(from), to } => write!(fmt, "updated {from} -> {to}"),
            Self::Updated { from: None, to } => write!(fmt, "updated to {to}"),
            Self::Unchanged(oid) => write!(fmt, "unchanged at {oid}"),
            Self::Skipped => write!(fmt, "skipped"),
        }
    }
}

/// Sync site checkout and deploy it when it changed.
///
/// A checkout whose head was never deployed successfully, e.g., because rsync
/// or the post-sync command failed last time, is deployed again even if the
/// remote branch did not move.
///
/// # Errors
///
/// - Return [`SiteError::Git2`] if clone or fetch fail.
/// - Return [`SiteError::Shell`] if rsync or post-sync command fail.
/// - Return [`SiteError::Marker`] if deployment cannot be recorded.
#[instrument(skip(shell, site, bar), fields(name = %site.name), level = "debug")]
pub fn sync(shell: &dyn Shell, site: &Site, bar: ProgressBar, dry_run: bool) -> Result<SyncOutcome> {
    if dry_run {
        info!(
            "would sync {} ({}) into {}",
            site.url,
            site.branch,
            site.docroot.display()
        );
        return Ok(SyncOutcome::Skipped);
    }

    require_cmd(shell, &["rsync"])?;
    let outcome = update_checkout(&site.url, &site.branch, &site.checkout, bar)?;
    info!("{}: {outcome}", site.name);

    // INVARIANT: Document root only counts as current once deployment of
    // the checked out commit finished, so a failed deploy is retried.
    let head = outcome.head();
    let deployed = deployed_oid(&site.checkout);
    if !outcome.needs_deploy() && deployed == head {
        info!("{}: nothing to deploy", site.name);
        return Ok(outcome);
    }

    if !outcome.needs_deploy() {
        warn!("{}: last deployment did not finish, deploying again", site.name);
    }
    deploy(shell, site)?;
    if let Some(head) = head {
        record_deployed(&site.checkout, head)?;
    }

    Ok(outcome)
}

fn deployed_marker(checkout: &Path) -> PathBuf {
    checkout.join(".git").join("wrench-deployed")
}

/// Commit last deployed successfully from checkout.
pub fn deployed_oid(checkout: &Path) -> Option<Oid> {
    read_to_string(deployed_marker(checkout))
        .ok()
        .and_then(|oid| Oid::from_str(oid.trim()).ok())
}

fn record_deployed(checkout: &Path, oid: Oid) -> Result<()> {
    let marker = deployed_marker(checkout);
    write(&marker, format!("{oid}\n")).map_err(|err| SiteError::Marker {
        source: err,
        path: marker.clone(),
    })?;
    debug!("recorded deployment of {oid} in {}", marker.display());

    Ok(())
}

/// Mirror checkout into document root and run post-sync command.
///
/// # Errors
///
/// - Return [`SiteError::Docroot`] if document root cannot be created.
/// - Return [`SiteError::Shell`] if rsync or post-sync command fail.
pub fn deploy(shell: &dyn Shell, site: &Site) -> Result<()> {
    create_dir_all(&site.docroot).map_err(|err| SiteError::Docroot {
        source: err,
        path: site.docroot.clone(),
    })?;

    // INVARIANT: Trailing slashes make rsync copy directory contents.
    info!("deploy {} to {}", site.checkout.display(), site.docroot.display());
    shell.silent(
        &Cmd::new("rsync")
            .args(["-a", "--delete", "--exclude", ".git"])
            .arg(format!("{}/", site.checkout.display()))
            .arg(format!("{}/", site.docroot.display())),
    )?;

    if let Some((program, args)) = site.post_sync.split_first() {
        info!("run post-sync command {program}");
        shell.silent(&Cmd::new(program).args(args))?;
    }

    Ok(())
}

/// Clone repository, or fetch branch into existing clone.
///
/// Existing clone is force checked out to the remote branch tip, discarding
/// any local modification.
///
/// # Errors
///
/// - Return [`SiteError::Git2`] if libgit2 operations fail.
#[instrument(skip(url, checkout, bar), level = "debug")]
pub fn update_checkout(
    url: &str,
    branch: &str,
    checkout: &Path,
    bar: ProgressBar,
) -> Result<SyncOutcome> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let git_config = GitConfig::open_default()?;

    let outcome = if checkout.join(".git").exists() {
        fetch_and_checkout(
            checkout,
            branch,
            fetch_options(&authenticator, &git_config, &bar),
        )
    } else {
        info!("clone {url} into {}", checkout.display());
        if let Some(parent) = checkout.parent() {
            create_dir_all(parent).map_err(|err| SiteError::Docroot {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }
        RepoBuilder::new()
            .branch(branch)
            .fetch_options(fetch_options(&authenticator, &git_config, &bar))
            .clone(url, checkout)
            .map_err(SiteError::from)
            .and_then(|repository| head_oid(&repository))
            .map(SyncOutcome::Cloned)
    };
    bar.finish_and_clear();

    outcome
}

fn fetch_options<'a>(
    authenticator: &'a GitAuthenticator,
    git_config: &'a GitConfig,
    bar: &'a ProgressBar,
) -> FetchOptions<'a> {
    let mut throttle = Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(git_config));
    rc.transfer_progress(move |progress| {
        if throttle.elapsed() > Duration::from_millis(10) {
            throttle = Instant::now();
            bar.set_length(progress.total_objects() as u64);
            bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    fo
}

fn fetch_and_checkout(checkout: &Path, branch: &str, mut fo: FetchOptions<'_>) -> Result<SyncOutcome> {
    debug!("fetch {branch} into {}", checkout.display());
    let repository = Repository::open(checkout)?;
    let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
    repository
        .find_remote("origin")?
        .fetch(&[refspec.as_str()], Some(&mut fo), None)?;

    let target = repository.refname_to_id(&format!("refs/remotes/origin/{branch}"))?;
    let current = repository.head().ok().and_then(|head| head.target());
    let local_branch = format!("refs/heads/{branch}");
    let on_branch = repository
        .head()
        .ok()
        .and_then(|head| head.name().map(|name| name == local_branch))
        .unwrap_or(false);
    if current == Some(target) && on_branch {
        return Ok(SyncOutcome::Unchanged(target));
    }

    // INVARIANT: Remote tip always wins over local modifications.
    let commit = repository.find_commit(target)?;
    repository.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repository.reference(&local_branch, target, true, "wrench: sync site")?;
    repository.set_head(&local_branch)?;

    Ok(SyncOutcome::Updated {
        from: current,
        to: target,
    })
}

fn head_oid(repository: &Repository) -> Result<Oid> {
    repository
        .head()?
        .target()
        .ok_or_else(|| SiteError::NoHead(repository.path().to_path_buf()))
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Site sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    /// Neither URL nor GH_USER and REPO_SLUG are set.
    #[error("site {0:?} has no url, and GH_USER or REPO_SLUG is unset")]
    NoUrl(String),

    #[error("cannot determine state directory for site checkout")]
    NoStateDir,

    #[error("repository {:?} has no HEAD commit", .0.display())]
    NoHead(PathBuf),

    #[error("failed to create {:?}", path.display())]
    Docroot {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to record deployment in {:?}", path.display())]
    Marker {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = SiteError> = std::result::Result<T, E>;
