// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Rotated log cleanup.
//!
//! Log rotation leaves compressed and numbered copies of old logs behind,
//! e.g., "syslog.2.gz" or "auth.log.1". This module finds those leftovers by
//! file name pattern and age, and removes them. Active logs never match the
//! default patterns.

use crate::{
    config::LogsConfig,
    shell::{best_effort, Cmd, Shell},
};

use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use std::{
    fs::remove_file,
    path::PathBuf,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, instrument, warn};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Rotated log eligible for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
}

/// Summary of cleanup run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    /// Files removed, or that would be removed in a dry run.
    pub candidates: Vec<Candidate>,

    /// Files that could not be removed.
    pub failed: Vec<PathBuf>,
}

impl CleanReport {
    pub fn bytes(&self) -> u64 {
        self.candidates
            .iter()
            .filter(|candidate| !self.failed.contains(&candidate.path))
            .map(|candidate| candidate.size)
            .sum()
    }
}

/// Find rotated logs older than configured age.
///
/// Symbolic links are neither followed nor reported. Unreadable directory
/// entries are skipped with a warning.
///
/// # Errors
///
/// - Return [`LogsError::Pattern`] if a configured pattern is invalid.
pub fn find_candidates(config: &LogsConfig, now: SystemTime) -> Result<Vec<Candidate>> {
    let patterns = config
        .patterns
        .iter()
        .map(|pattern| Pattern::new(pattern))
        .collect::<Result<Vec<_>, _>>()?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let cutoff = now
        .checked_sub(Duration::from_secs(config.max_age_days * SECONDS_PER_DAY))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut candidates = Vec::new();
    for dir in &config.dirs {
        let walker = WalkBuilder::new(dir)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if !patterns
                .iter()
                .any(|pattern| pattern.matches_with(&name, options))
            {
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta.modified().unwrap_or(now);
            if modified > cutoff {
                debug!("{} is too recent", entry.path().display());
                continue;
            }

            candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                size: meta.len(),
            });
        }
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(candidates)
}

/// Remove rotated logs.
///
/// Dry run prints every candidate to stdout and removes nothing. Otherwise
/// each candidate is removed, and failures are reported without stopping the
/// run. Journal vacuuming is best effort.
///
/// # Errors
///
/// - Return [`LogsError::Pattern`] if a configured pattern is invalid.
#[instrument(skip(shell, config), level = "debug")]
pub fn clean_logs(shell: &dyn Shell, config: &LogsConfig, dry_run: bool) -> Result<CleanReport> {
    let candidates = find_candidates(config, SystemTime::now())?;
    let mut report = CleanReport {
        candidates,
        failed: Vec::new(),
    };

    if dry_run {
        for candidate in &report.candidates {
            println!("{}", candidate.path.display());
        }
        info!(
            "would remove {} files, {} bytes",
            report.candidates.len(),
            report.bytes()
        );
        return Ok(report);
    }

    for candidate in &report.candidates {
        match remove_file(&candidate.path) {
            Ok(()) => debug!("removed {}", candidate.path.display()),
            Err(err) => {
                warn!("failed to remove {}: {err}", candidate.path.display());
                report.failed.push(candidate.path.clone());
            }
        }
    }
    info!(
        "removed {} files, freed {} bytes",
        report.candidates.len() - report.failed.len(),
        report.bytes()
    );

    if let Some(age) = &config.journal_vacuum {
        if shell.have_cmd("journalctl") {
            best_effort(
                shell.silent(&Cmd::new("journalctl").arg(format!("--vacuum-time={age}"))),
                "journal vacuum failed",
            );
        } else {
            warn!("journalctl not found, skipping journal vacuum");
        }
    }

    Ok(report)
}

/// Log cleanup error types.
#[derive(Debug, thiserror::Error)]
pub enum LogsError {
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Friendly result alias :3
type Result<T, E = LogsError> = std::result::Result<T, E>;
