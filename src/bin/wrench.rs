// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use wrench::{
    apt::{self, AptPaths},
    config::{Config, KeySource},
    disk::{
        btrfs::{self, ConvertOutcome, ConvertRequest},
        image::{self, SizeSpec},
    },
    escalate::{self, Elevation},
    keys,
    lock::LockDir,
    logs,
    os::{dpkg_arch, OsRelease, PackageManager, OS_RELEASE_PATH},
    path::{default_config_path, default_lock_dir},
    release::{self, UpdateOptions},
    service,
    shell::{self, SystemShell},
    site::{self, Site},
    sysclean::{self, Report},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::ProgressBar;
use std::{
    io::{read_to_string, stdin},
    path::PathBuf,
    process::exit,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "wrench [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Report what would be done without changing anything.
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<i32> {
        let path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let config = Config::load(&path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?;
        let dry_run = self.dry_run || config.settings.dry_run;
        let ctx = Session { config, dry_run };

        match self.command {
            Command::Os => run_os(),
            Command::Config => run_config(&ctx),
            Command::Apt(opts) => run_apt(&ctx, opts),
            Command::Key(opts) => run_key(&ctx, opts),
            Command::Logs(opts) => run_logs(&ctx, opts),
            Command::Sysclean(opts) => run_sysclean(&ctx, opts),
            Command::Update(opts) => run_update(&ctx, opts),
            Command::Elevate(opts) => return run_elevate(&ctx, opts),
            Command::Site(opts) => run_site(ctx, opts).await,
            Command::Service(opts) => run_service(&ctx, opts),
            Command::Btrfs(opts) => run_btrfs(&ctx, opts),
            Command::Image(opts) => run_image(&ctx, opts),
        }?;

        Ok(0)
    }
}

/// Loaded configuration with command line overrides applied.
#[derive(Debug, Clone)]
struct Session {
    config: Config,
    dry_run: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show detected operating system facts.
    Os,

    /// Show effective configuration.
    Config,

    /// Manage APT repositories.
    #[command(subcommand)]
    Apt(AptCommand),

    /// Manage OpenPGP keyrings.
    #[command(subcommand)]
    Key(KeyCommand),

    /// Clean up rotated logs.
    #[command(subcommand)]
    Logs(LogsCommand),

    /// Apply OpenBSD sysclean report.
    #[command(override_usage = "wrench sysclean [options] <report>")]
    Sysclean(SyscleanOptions),

    /// Update third-party releases to latest upstream version.
    #[command(override_usage = "wrench update [options] <name>...")]
    Update(UpdateCliOptions),

    /// Run command as another user through sudo, doas, or run0.
    #[command(override_usage = "wrench elevate [options] -- <command>...")]
    Elevate(ElevateOptions),

    /// Sync websites from Git.
    #[command(subcommand)]
    Site(SiteCommand),

    /// Install systemd services from templates.
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Convert ext filesystems to btrfs.
    #[command(subcommand)]
    Btrfs(BtrfsCommand),

    /// Grow OpenBSD disk images.
    #[command(subcommand)]
    Image(ImageCommand),
}

#[derive(Debug, Clone, Subcommand)]
enum AptCommand {
    /// Add configured repository.
    Add {
        #[arg(value_name = "name")]
        name: String,
    },

    /// Convert legacy one-line list file to deb822.
    Migrate {
        #[arg(value_name = "list_file")]
        list_file: PathBuf,
    },

    /// List every source entry.
    List,
}

#[derive(Debug, Clone, Subcommand)]
enum KeyCommand {
    /// Fetch signing key into binary keyring.
    Fetch(KeyFetchOptions),

    /// List keys of keyring.
    List {
        #[arg(value_name = "keyring")]
        keyring: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct KeyFetchOptions {
    /// Keyring file to write.
    #[arg(value_name = "keyring")]
    pub keyring: PathBuf,

    /// Download key from URL.
    #[arg(short, long, value_name = "url", conflicts_with = "keyserver")]
    pub url: Option<String>,

    /// Receive key from keyserver, requires fingerprint.
    #[arg(short, long, value_name = "server", requires = "fingerprint")]
    pub keyserver: Option<String>,

    /// Expected key fingerprint.
    #[arg(short, long, value_name = "fingerprint")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum LogsCommand {
    /// Remove rotated logs older than maximum age.
    Clean {
        /// Override maximum age in days.
        #[arg(long, value_name = "days")]
        max_age_days: Option<u64>,

        /// Override directories to search.
        #[arg(long = "dir", value_name = "path")]
        dirs: Vec<PathBuf>,
    },
}

#[derive(Args, Clone, Debug)]
struct SyscleanOptions {
    /// Report file, or "-" for standard input.
    #[arg(value_name = "report")]
    pub report: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct UpdateCliOptions {
    /// Names of configured releases.
    #[arg(value_name = "name")]
    pub names: Vec<String>,

    /// Update every configured release.
    #[arg(short, long, conflicts_with = "names")]
    pub all: bool,

    /// Reinstall even when already up to date.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Clone, Debug)]
struct ElevateOptions {
    /// Run as user instead of root.
    #[arg(short, long, value_name = "user")]
    pub user: Option<String>,

    /// Preserve environment.
    #[arg(short = 'E', long)]
    pub preserve_env: bool,

    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "command"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum SiteCommand {
    /// Fetch site repository and deploy it when it changed.
    Sync {
        #[arg(value_name = "name")]
        name: String,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum ServiceCommand {
    /// Render, install, enable, and start service.
    Install {
        #[arg(value_name = "name")]
        name: String,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum BtrfsCommand {
    /// Convert unmounted ext2/3/4 filesystem in place.
    Convert {
        #[arg(value_name = "device")]
        device: PathBuf,

        /// Mapper name when device is a LUKS container.
        #[arg(long, value_name = "name")]
        luks_name: Option<String>,

        /// Filesystem table to update.
        #[arg(long, value_name = "path", default_value = "/etc/fstab")]
        fstab: PathBuf,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum ImageCommand {
    /// Grow image to size, e.g., "20G", or by size, e.g., "+4G".
    Grow {
        #[arg(value_name = "image")]
        image: PathBuf,

        #[arg(value_name = "size", allow_hyphen_values = true)]
        size: String,
    },
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run().await {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    Cli::parse().run().await
}

fn run_os() -> Result<()> {
    let shell = SystemShell;
    let release = OsRelease::detect(&shell, OS_RELEASE_PATH)?;
    print!("{release}");
    match PackageManager::detect(&shell, &release) {
        Ok(pm) => println!("package manager: {pm}"),
        Err(err) => warn!("{err}"),
    }
    println!("arch: {}", dpkg_arch());

    Ok(())
}

fn run_config(ctx: &Session) -> Result<()> {
    print!("{}", ctx.config);
    Ok(())
}

fn apt_paths(ctx: &Session) -> AptPaths {
    AptPaths {
        sources_dir: ctx.config.settings.sources_dir.clone(),
        keyrings_dir: ctx.config.settings.keyrings_dir.clone(),
    }
}

fn run_apt(ctx: &Session, opts: AptCommand) -> Result<()> {
    let shell = SystemShell;
    match opts {
        AptCommand::Add { name } => {
            let repo = ctx.config.apt_repo(&name)?;
            let release = OsRelease::detect(&shell, OS_RELEASE_PATH)?;
            let outcome =
                apt::add_repository(&shell, &release, repo, &apt_paths(ctx), ctx.dry_run)?;
            info!("repository {name}: {outcome}");
        }
        AptCommand::Migrate { list_file } => {
            let target = apt::migrate(&list_file, ctx.dry_run)?;
            info!("migrated to {}", target.display());
        }
        AptCommand::List => {
            for (path, sources) in apt::list_sources(&ctx.config.settings.sources_dir)? {
                println!("# {}", path.display());
                for source in sources {
                    println!("{source}");
                }
            }
        }
    }

    Ok(())
}

fn run_key(ctx: &Session, opts: KeyCommand) -> Result<()> {
    let shell = SystemShell;
    match opts {
        KeyCommand::Fetch(opts) => {
            let source = match (opts.url, opts.keyserver, opts.fingerprint) {
                (Some(url), None, fingerprint) => KeySource::Url { url, fingerprint },
                (None, Some(keyserver), Some(fingerprint)) => KeySource::Keyserver {
                    keyserver,
                    fingerprint,
                },
                _ => bail!("either --url or --keyserver with --fingerprint is required"),
            };
            let outcome = keys::install_key(&shell, &source, &opts.keyring, ctx.dry_run)?;
            info!("keyring {}: {outcome}", opts.keyring.display());
        }
        KeyCommand::List { keyring } => {
            for key in keys::list_keys(&shell, &keyring)? {
                println!("{key}");
            }
        }
    }

    Ok(())
}

fn run_logs(ctx: &Session, opts: LogsCommand) -> Result<()> {
    let LogsCommand::Clean { max_age_days, dirs } = opts;
    let mut config = ctx.config.logs.clone();
    if let Some(days) = max_age_days {
        config.max_age_days = days;
    }
    if !dirs.is_empty() {
        config.dirs = dirs;
    }

    let report = logs::clean_logs(&SystemShell, &config, ctx.dry_run)?;
    if !report.failed.is_empty() {
        bail!("failed to remove {} files", report.failed.len());
    }

    Ok(())
}

fn run_sysclean(ctx: &Session, opts: SyscleanOptions) -> Result<()> {
    let data = if opts.report.as_os_str() == "-" {
        read_to_string(stdin()).context("failed to read report from standard input")?
    } else {
        std::fs::read_to_string(&opts.report)
            .with_context(|| format!("failed to read report {}", opts.report.display()))?
    };
    let report: Report = data.parse()?;
    let actions = sysclean::apply(&SystemShell, &report, ctx.dry_run)?;
    if !ctx.dry_run {
        let removed = actions
            .iter()
            .filter(|action| matches!(action, sysclean::Action::Removed(_)))
            .count();
        info!("removed {removed} of {} entries", report.entries.len());
    }

    Ok(())
}

fn run_update(ctx: &Session, opts: UpdateCliOptions) -> Result<()> {
    let shell = SystemShell;
    let releases = if opts.all {
        ctx.config.releases.iter().collect::<Vec<_>>()
    } else if opts.names.is_empty() {
        bail!("name a release, or pass --all");
    } else {
        opts.names
            .iter()
            .map(|name| ctx.config.release(name))
            .collect::<Result<Vec<_>, _>>()?
    };

    let package_manager = OsRelease::detect(&shell, OS_RELEASE_PATH)
        .ok()
        .and_then(|release| PackageManager::detect(&shell, &release).ok());
    let options = UpdateOptions {
        force: opts.force,
        dry_run: ctx.dry_run,
    };

    let mut failed = Vec::new();
    for release in releases {
        match release::update(&shell, release, package_manager, options) {
            Ok(outcome) => info!("{}: {outcome}", release.name),
            Err(err) => {
                error!("{}: {:?}", release.name, anyhow::Error::from(err));
                failed.push(release.name.as_str());
            }
        }
    }
    if !failed.is_empty() {
        bail!("failed to update {}", failed.join(", "));
    }

    Ok(())
}

fn run_elevate(ctx: &Session, opts: ElevateOptions) -> Result<i32> {
    let request = Elevation {
        user: opts.user,
        preserve_env: opts.preserve_env,
        command: opts.command,
    };

    Ok(escalate::elevate(
        &SystemShell,
        &ctx.config.settings.escalators,
        &request,
    )?)
}

async fn run_site(ctx: Session, opts: SiteCommand) -> Result<()> {
    let SiteCommand::Sync { name } = opts;
    let site = Site::resolve(ctx.config.site(&name)?, &ctx.config.settings)?;
    let lock_dir = ctx
        .config
        .settings
        .lock_dir
        .clone()
        .unwrap_or_else(default_lock_dir);
    let lock = LockDir::new(lock_dir.join(site.lock_name()));

    // INVARIANT: Listen before the job starts, so no signal hits a default handler.
    let shutdown = shutdown_signal()?;
    let Some(guard) = lock.try_acquire()? else {
        return Ok(());
    };

    let own_group = match shell::lead_process_group() {
        Ok(()) => true,
        Err(err) => {
            warn!("cannot lead process group, interrupts will not stop child commands: {err}");
            false
        }
    };

    // INVARIANT: Lock lives exactly as long as the job, the job owns the guard.
    let dry_run = ctx.dry_run;
    let mut job = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        site::sync(&SystemShell, &site, ProgressBar::new(0), dry_run)
    });

    tokio::select! {
        result = &mut job => {
            let outcome = result.context("site sync task failed")??;
            info!("site {name}: {outcome}");
            Ok(())
        }
        () = shutdown => {
            warn!("interrupted, stopping site {name} sync");
            if own_group {
                shell::best_effort(shell::terminate_process_group(), "failed to stop child commands");
            }
            match job.await.context("site sync task failed")? {
                Ok(outcome) => info!("site {name}: {outcome}"),
                Err(err) => warn!("site {name}: {err}"),
            }
            bail!("site {name} sync interrupted, released lock {}", lock.path().display())
        }
    }
}

fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;

    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
    })
}

fn run_service(ctx: &Session, opts: ServiceCommand) -> Result<()> {
    let ServiceCommand::Install { name } = opts;
    let config = ctx.config.service(&name)?;
    let report = service::install(
        &SystemShell,
        config,
        &ctx.config.settings.unit_dir,
        ctx.dry_run,
    )?;
    if report.is_changed() {
        info!("service {name} installed");
    } else {
        info!("service {name} already up to date");
    }

    Ok(())
}

fn run_btrfs(ctx: &Session, opts: BtrfsCommand) -> Result<()> {
    let BtrfsCommand::Convert {
        device,
        luks_name,
        fstab,
    } = opts;
    let request = ConvertRequest {
        luks_name,
        fstab,
        ..ConvertRequest::new(device)
    };

    match btrfs::convert(&SystemShell, &request, ctx.dry_run)? {
        ConvertOutcome::Planned(_) => {}
        ConvertOutcome::Converted {
            target,
            old_uuid,
            new_uuid,
            fstab_entries,
        } => info!(
            "converted {} ({old_uuid} -> {new_uuid}), {fstab_entries} fstab entries updated",
            target.display()
        ),
    }

    Ok(())
}

fn run_image(ctx: &Session, opts: ImageCommand) -> Result<()> {
    let ImageCommand::Grow { image, size } = opts;
    let size: SizeSpec = size.parse()?;
    let report = image::grow_image(&SystemShell, &image, size, ctx.dry_run)?;
    if !ctx.dry_run {
        info!(
            "grew {} from {} to {} bytes",
            image.display(),
            report.old_size,
            report.new_size
        );
    }

    Ok(())
}
