// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Privilege escalation shim.
//!
//! Hosts differ in how they grant root: Debian has sudo, OpenBSD has doas,
//! and recent systemd ships run0. Scripts should not care, so a single
//! request is translated to whichever tool is present.

use crate::shell::{Cmd, Shell, ShellError};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// Supported privilege escalation tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalator {
    Sudo,
    Doas,
    Run0,
}

impl Escalator {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Doas => "doas",
            Self::Run0 => "run0",
        }
    }

    /// Translate request into argument vector of this tool.
    pub fn command(&self, request: &Elevation) -> Cmd {
        let mut cmd = Cmd::new(self.program());
        match self {
            Self::Sudo => {
                if let Some(user) = &request.user {
                    cmd = cmd.args(["-u", user.as_str()]);
                }
                if request.preserve_env {
                    cmd = cmd.arg("-E");
                }
            }
            Self::Doas => {
                if let Some(user) = &request.user {
                    cmd = cmd.args(["-u", user.as_str()]);
                }
            }
            Self::Run0 => {
                if let Some(user) = &request.user {
                    cmd = cmd.arg(format!("--user={user}"));
                }
            }
        }

        cmd.arg("--").args(&request.command)
    }
}

impl FromStr for Escalator {
    type Err = EscalateError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sudo" => Ok(Self::Sudo),
            "doas" => Ok(Self::Doas),
            "run0" => Ok(Self::Run0),
            other => Err(EscalateError::Unknown(other.into())),
        }
    }
}

impl Display for Escalator {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.program())
    }
}

/// Command to run with elevated privileges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Elevation {
    /// Target user, root when absent.
    pub user: Option<String>,

    /// Keep caller environment.
    pub preserve_env: bool,

    pub command: Vec<String>,
}

/// Pick first available escalator.
///
/// Unknown names in the preference listing are skipped with a warning.
///
/// # Errors
///
/// - Return [`EscalateError::NoneAvailable`] if no listed tool is installed.
pub fn detect(shell: &dyn Shell, order: &[String]) -> Result<Escalator> {
    for name in order {
        match name.parse::<Escalator>() {
            Ok(escalator) if shell.have_cmd(escalator.program()) => return Ok(escalator),
            Ok(_) => debug!("{name} not installed"),
            Err(err) => warn!("{err}"),
        }
    }

    Err(EscalateError::NoneAvailable(order.join(", ")))
}

/// Check if current process already runs with effective uid 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Run command with elevated privileges.
///
/// Root without a target user runs the command directly. Returns the exit
/// code of the command.
///
/// # Errors
///
/// - Return [`EscalateError::NoCommand`] if request has no command.
/// - Return [`EscalateError::NoneAvailable`] if no escalator is installed.
/// - Return [`EscalateError::Shell`] if command cannot be spawned.
#[instrument(skip(shell), level = "debug")]
pub fn elevate(shell: &dyn Shell, order: &[String], request: &Elevation) -> Result<i32> {
    elevate_as(shell, order, request, is_root())
}

fn elevate_as(shell: &dyn Shell, order: &[String], request: &Elevation, root: bool) -> Result<i32> {
    let Some((program, args)) = request.command.split_first() else {
        return Err(EscalateError::NoCommand);
    };

    if request.user.is_none() && root {
        debug!("already root, running {program} directly");
        return Ok(shell.interactive(&Cmd::new(program).args(args))?);
    }

    let escalator = detect(shell, order)?;
    if request.preserve_env && escalator != Escalator::Sudo {
        warn!("{escalator} cannot preserve the environment, ignoring -E");
    }

    Ok(shell.interactive(&escalator.command(request))?)
}

/// Privilege escalation error types.
#[derive(Debug, thiserror::Error)]
pub enum EscalateError {
    #[error("unknown escalator {0:?}")]
    Unknown(String),

    #[error("no privilege escalation tool found, tried {0}")]
    NoneAvailable(String),

    #[error("no command to run")]
    NoCommand,

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = EscalateError> = std::result::Result<T, E>;
