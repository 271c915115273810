// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Filesystem and disk image tooling.
//!
//! Two rarely run but easy to botch jobs live here: converting an ext
//! filesystem to btrfs on Linux, and growing an OpenBSD disk image. Neither
//! reimplements anything. Both only sequence the system tools that do the
//! real work, and keep the surrounding bookkeeping (filesystem table, disk
//! label) consistent.

pub mod btrfs;
pub mod disklabel;
pub mod fstab;
pub mod image;
