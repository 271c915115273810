// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Unix administration toolbox.
//!
//! Wrench bundles the small jobs every self-hosted box needs sooner or later:
//! adding APT repositories with pinned signing keys, keeping upstream releases
//! current, cleaning rotated logs, applying OpenBSD sysclean reports, syncing
//! a website from Git, installing templated systemd services, converting ext
//! filesystems to btrfs, and growing OpenBSD disk images.
//!
//! Every job is a short sequence of calls to the system tools that already do
//! the real work. The [`shell`] module puts those calls behind a trait, so
//! each job can be exercised without touching the host.

pub mod apt;
pub mod config;
pub mod disk;
pub mod escalate;
pub mod file;
pub mod keys;
pub mod lock;
pub mod logs;
pub mod os;
pub mod path;
pub mod release;
pub mod service;
pub mod shell;
pub mod site;
pub mod sysclean;
pub mod template;
