// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use anyhow::Result;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;
use std::{
    cell::{Cell, RefCell},
    fs::read_to_string,
    path::Path,
};
use tempfile::TempDir;
use wrench::{
    shell::{self, Cmd, Shell, ShellError},
    site::{deployed_oid, sync, update_checkout, Site, SyncOutcome},
};

#[test]
fn checkout_follows_remote_branch() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let checkout = root.path().join("state/sites/blog");
    let url = upstream.to_string_lossy().into_owned();

    let fixture = RepoFixture::new(&upstream)?;
    let first = fixture.stage_and_commit("index.html", "<h1>hello</h1>\n")?;

    let outcome = update_checkout(&url, "main", &checkout, ProgressBar::hidden())?;
    assert_eq!(outcome, SyncOutcome::Cloned(first));
    assert_eq!(read_to_string(checkout.join("index.html"))?, "<h1>hello</h1>\n");

    let outcome = update_checkout(&url, "main", &checkout, ProgressBar::hidden())?;
    assert_eq!(outcome, SyncOutcome::Unchanged(first));
    assert!(!outcome.needs_deploy());

    let second = fixture.stage_and_commit("index.html", "<h1>hello again</h1>\n")?;
    let outcome = update_checkout(&url, "main", &checkout, ProgressBar::hidden())?;
    assert_eq!(
        outcome,
        SyncOutcome::Updated {
            from: Some(first),
            to: second
        }
    );
    assert!(outcome.needs_deploy());
    assert_eq!(
        read_to_string(checkout.join("index.html"))?,
        "<h1>hello again</h1>\n"
    );

    Ok(())
}

#[test]
fn local_edits_are_overwritten() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let checkout = root.path().join("checkout");
    let url = upstream.to_string_lossy().into_owned();

    let fixture = RepoFixture::new(&upstream)?;
    fixture.stage_and_commit("index.html", "upstream\n")?;
    update_checkout(&url, "main", &checkout, ProgressBar::hidden())?;

    std::fs::write(checkout.join("index.html"), "local edit\n")?;
    let tip = fixture.stage_and_commit("about.html", "about\n")?;
    let outcome = update_checkout(&url, "main", &checkout, ProgressBar::hidden())?;

    assert!(outcome.needs_deploy());
    assert!(matches!(outcome, SyncOutcome::Updated { to, .. } if to == tip));
    assert_eq!(read_to_string(checkout.join("index.html"))?, "upstream\n");
    assert_eq!(read_to_string(checkout.join("about.html"))?, "about\n");

    Ok(())
}

/// Shell that fails rsync while told to, and records everything else.
#[derive(Default)]
struct FlakyRsync {
    broken: Cell<bool>,
    calls: RefCell<Vec<String>>,
}

impl Shell for FlakyRsync {
    fn have_cmd(&self, _name: &str) -> bool {
        true
    }

    fn output(&self, cmd: &Cmd) -> shell::Result<String> {
        self.silent(cmd).map(|_| String::new())
    }

    fn silent(&self, cmd: &Cmd) -> shell::Result<()> {
        self.calls.borrow_mut().push(cmd.to_string());
        if self.broken.get() && cmd.program() == "rsync" {
            return Err(ShellError::MissingCommand("rsync".into()));
        }

        Ok(())
    }

    fn interactive(&self, cmd: &Cmd) -> shell::Result<i32> {
        self.silent(cmd).map(|_| 0)
    }
}

fn blog(root: &Path, url: String) -> Site {
    Site {
        name: "blog".into(),
        url,
        branch: "main".into(),
        checkout: root.join("checkout"),
        docroot: root.join("www"),
        post_sync: vec![],
    }
}

#[test]
fn failed_deploy_is_retried_on_next_sync() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let fixture = RepoFixture::new(&upstream)?;
    let head = fixture.stage_and_commit("index.html", "<h1>hello</h1>\n")?;
    let site = blog(root.path(), upstream.to_string_lossy().into_owned());

    let shell = FlakyRsync::default();
    shell.broken.set(true);
    assert!(sync(&shell, &site, ProgressBar::hidden(), false).is_err());
    assert_eq!(deployed_oid(&site.checkout), None);

    shell.broken.set(false);
    shell.calls.borrow_mut().clear();
    let outcome = sync(&shell, &site, ProgressBar::hidden(), false)?;
    assert_eq!(outcome, SyncOutcome::Unchanged(head));
    assert_eq!(shell.calls.borrow().len(), 1);
    assert!(shell.calls.borrow()[0].starts_with("rsync -a --delete"));
    assert_eq!(deployed_oid(&site.checkout), Some(head));

    shell.calls.borrow_mut().clear();
    let outcome = sync(&shell, &site, ProgressBar::hidden(), false)?;
    assert_eq!(outcome, SyncOutcome::Unchanged(head));
    assert!(shell.calls.borrow().is_empty());

    Ok(())
}
