// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use anyhow::{bail, Result};
use assert_cmd::{cargo::cargo_bin_cmd, Command};
use indoc::formatdoc;
use predicates::prelude::*;
use std::{
    env,
    fs::{create_dir_all, read_to_string, set_permissions, write, File, Permissions},
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{self, Stdio},
    thread::sleep,
    time::{Duration, Instant, SystemTime},
};
use tempfile::TempDir;

fn wrench(config: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("wrench");
    cmd.env_remove("DRY_RUN")
        .env_remove("GH_USER")
        .env_remove("REPO_SLUG")
        .env("RUST_LOG", "info")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn logs_clean_dry_run_lists_without_removing() -> Result<()> {
    let root = TempDir::new()?;
    let logs = root.path().join("log");
    create_dir_all(logs.join("nginx"))?;
    let old = logs.join("nginx/access.log.2.gz");
    let fresh = logs.join("nginx/access.log.1.gz");
    let live = logs.join("nginx/access.log");
    for path in [&old, &fresh, &live] {
        write(path, "GET /\n")?;
    }
    let month_ago = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
    File::options().write(true).open(&old)?.set_modified(month_ago)?;

    let config = root.path().join("config.toml");
    write(
        &config,
        formatdoc! {r#"
            [logs]
            dirs = [{logs:?}]
            max_age_days = 7
        "#},
    )?;

    wrench(&config)
        .args(["--dry-run", "logs", "clean"])
        .assert()
        .success()
        .stdout(predicate::str::contains("access.log.2.gz"))
        .stdout(predicate::str::contains("access.log.1.gz").not());
    assert!(old.exists());
    assert!(live.exists());

    Ok(())
}

#[test]
fn site_sync_skips_when_lock_is_held() -> Result<()> {
    let root = TempDir::new()?;
    let locks = root.path().join("locks");
    let checkout = root.path().join("checkout");
    let docroot = root.path().join("www");

    // INVARIANT: Lock owner must be alive, so record our own pid.
    let held = locks.join("wrench-site-blog.lock");
    create_dir_all(&held)?;
    write(held.join("pid"), std::process::id().to_string())?;

    let config = root.path().join("config.toml");
    write(
        &config,
        formatdoc! {r#"
            [settings]
            lock_dir = {locks:?}

            [[site]]
            name = "blog"
            url = "file:///nonexistent/blog.git"
            checkout = {checkout:?}
            docroot = {docroot:?}
        "#},
    )?;

    wrench(&config)
        .args(["site", "sync", "blog"])
        .assert()
        .success();
    assert!(held.join("pid").exists());
    assert!(!checkout.exists());
    assert!(!docroot.exists());

    Ok(())
}

#[test]
fn interrupted_site_sync_stops_deploy_before_unlocking() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let locks = root.path().join("locks");
    let checkout = root.path().join("checkout");
    let docroot = root.path().join("www");
    RepoFixture::new(&upstream)?.stage_and_commit("index.html", "<h1>hello</h1>\n")?;

    // INVARIANT: Stand-in rsync records its pid, then hangs until killed.
    let bin = root.path().join("bin");
    let started = root.path().join("rsync.pid");
    create_dir_all(&bin)?;
    let rsync = bin.join("rsync");
    write(&rsync, format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 60\n", started.display()))?;
    set_permissions(&rsync, Permissions::from_mode(0o755))?;
    let path = env::join_paths([bin.clone()].into_iter().chain(env::split_paths(
        &env::var_os("PATH").unwrap_or_default(),
    )))?;

    let config = root.path().join("config.toml");
    write(
        &config,
        formatdoc! {r#"
            [settings]
            lock_dir = {locks:?}

            [[site]]
            name = "blog"
            url = {upstream:?}
            checkout = {checkout:?}
            docroot = {docroot:?}
        "#},
    )?;

    let mut wrench = process::Command::new(env!("CARGO_BIN_EXE_wrench"))
        .env_remove("DRY_RUN")
        .env("PATH", path)
        .env("RUST_LOG", "info")
        .arg("--config")
        .arg(&config)
        .args(["site", "sync", "blog"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + Duration::from_secs(30);
    let rsync_pid = loop {
        if let Ok(pid) = read_to_string(&started) {
            if !pid.trim().is_empty() {
                break pid.trim().to_string();
            }
        }
        if Instant::now() > deadline {
            wrench.kill()?;
            bail!("stand-in rsync never started");
        }
        sleep(Duration::from_millis(50));
    };
    assert!(locks.join("wrench-site-blog.lock").exists());

    // SAFETY: kill has no memory safety preconditions.
    assert_eq!(unsafe { libc::kill(wrench.id() as libc::pid_t, libc::SIGTERM) }, 0);
    let status = wrench.wait()?;

    assert_eq!(status.code(), Some(1));
    assert!(!Path::new("/proc").join(&rsync_pid).exists());
    assert!(!locks.join("wrench-site-blog.lock").exists());

    Ok(())
}

#[test]
fn sysclean_dry_run_reads_report_from_stdin() -> Result<()> {
    let root = TempDir::new()?;
    let leftover = root.path().join("obsolete.conf");
    write(&leftover, "stale\n")?;
    let config = root.path().join("config.toml");

    wrench(&config)
        .args(["--dry-run", "sysclean", "-"])
        .write_stdin(format!("{}\n@user _obsolete:*:1001:1001::0:0:Obsolete:/var/empty:/sbin/nologin\n", leftover.display()))
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("rm {}", leftover.display())))
        .stdout(predicate::str::contains("userdel _obsolete"));
    assert!(leftover.exists());

    Ok(())
}

#[test]
fn unknown_site_fails() -> Result<()> {
    let root = TempDir::new()?;
    let config = root.path().join("config.toml");

    wrench(&config)
        .args(["site", "sync", "nope"])
        .assert()
        .failure()
        .code(1);

    Ok(())
}

#[test]
fn config_prints_defaults() -> Result<()> {
    let root = TempDir::new()?;
    let config = root.path().join("missing.toml");

    wrench(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[settings]"))
        .stdout(predicate::str::contains("max_age_days = 7"));

    Ok(())
}
