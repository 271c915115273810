// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Nearly everything wrench does boils down to calling some system tool, e.g.,
//! apt-get, curl, gpg, systemctl, etc. This module wraps those calls behind
//! the [`Shell`] trait so that every operation can be exercised against a
//! recording fake instead of the real system.
//!
//! # Silent Calls
//!
//! Most tools are noisy even when nothing goes wrong. A __silent__ call sends
//! both stdout and stderr of the child process into a temporary file. The
//! captured output is replayed to stderr if and only if the child fails, so
//! the user only ever sees output that actually matters.

use std::{
    env,
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    path::Path,
    process::{Child, Command, ExitStatus, Output, Stdio},
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

/// External command to execute.
///
/// Lightweight description of a process invocation. Nothing is spawned until
/// the command is handed to a [`Shell`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    /// Construct new command for target program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a listing of arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an extra environment variable for the child only.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Feed bytes to the child's standard input.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &OsStr {
        self.program.as_os_str()
    }

    pub fn get_args(&self) -> &[OsString] {
        self.args.as_slice()
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        command
    }

    fn spawn(&self, command: &mut Command) -> Result<Running> {
        if self.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;

        // INVARIANT: Stdin is fed from its own thread, so a child blocked on a
        // full stdout pipe never deadlocks against us. Dropping the pipe at
        // the end of the thread gives the child EOF.
        let feeder = match (&self.stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.clone();
                Some(thread::spawn(move || pipe.write_all(&input)))
            }
            _ => None,
        };

        Ok(Running {
            cmd: self,
            child,
            feeder,
        })
    }

    fn spawn_error(&self, err: std::io::Error) -> ShellError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ShellError::MissingCommand(self.program.to_string_lossy().into_owned())
        } else {
            ShellError::Spawn {
                cmd: self.to_string(),
                source: err,
            }
        }
    }
}

impl Display for Cmd {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(fmt, " {}", quote(arg))?;
        }

        Ok(())
    }
}

/// Spawned child with an optional stdin feeder thread.
struct Running<'a> {
    cmd: &'a Cmd,
    child: Child,
    feeder: Option<JoinHandle<std::io::Result<()>>>,
}

impl Running<'_> {
    fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait().map_err(|err| self.cmd.spawn_error(err));
        self.join_feeder()?;
        status
    }

    fn wait_with_output(mut self) -> Result<Output> {
        let feeder = self.feeder.take();
        let cmd = self.cmd;
        let output = self
            .child
            .wait_with_output()
            .map_err(|err| cmd.spawn_error(err));
        join(cmd, feeder)?;
        output
    }

    fn join_feeder(&mut self) -> Result<()> {
        join(self.cmd, self.feeder.take())
    }
}

// INVARIANT: A child may exit without reading all of its input. Broken pipe
// is left for the exit status to report.
fn join(cmd: &Cmd, feeder: Option<JoinHandle<std::io::Result<()>>>) -> Result<()> {
    let Some(feeder) = feeder else {
        return Ok(());
    };

    match feeder.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        Ok(Err(err)) => Err(cmd.spawn_error(err)),
        Err(_) => Err(cmd.spawn_error(std::io::Error::other("stdin feeder panicked"))),
    }
}

fn quote(word: &OsStr) -> String {
    let word = word.to_string_lossy();
    if word.is_empty() || word.chars().any(char::is_whitespace) {
        format!("'{word}'")
    } else {
        word.into_owned()
    }
}

/// Layer of indirection for process execution.
pub trait Shell {
    /// Check if a program can be found and executed.
    fn have_cmd(&self, name: &str) -> bool;

    /// Run command and capture its standard output.
    ///
    /// # Errors
    ///
    /// - Return [`ShellError::Failed`] with captured stderr if command exits
    ///   with non-zero status.
    fn output(&self, cmd: &Cmd) -> Result<String>;

    /// Run command with all output captured and replayed only on failure.
    ///
    /// # Errors
    ///
    /// - Return [`ShellError::Failed`] if command exits with non-zero status.
    fn silent(&self, cmd: &Cmd) -> Result<()>;

    /// Run command attached to the current terminal.
    ///
    /// Returns exit code of the command. Failure is left for the caller to
    /// decide on.
    fn interactive(&self, cmd: &Cmd) -> Result<i32>;
}

/// Process execution through the host system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl Shell for SystemShell {
    fn have_cmd(&self, name: &str) -> bool {
        if name.contains('/') {
            return is_executable(Path::new(name));
        }

        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| is_executable(&dir.join(name))))
            .unwrap_or(false)
    }

    fn output(&self, cmd: &Cmd) -> Result<String> {
        debug!("run: {cmd}");
        let mut command = cmd.to_command();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = cmd.spawn(&mut command)?.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShellError::failed(cmd, output.status, stderr.trim_end()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn silent(&self, cmd: &Cmd) -> Result<()> {
        debug!("run silently: {cmd}");
        let mut capture = tempfile::tempfile().map_err(ShellError::Capture)?;
        let mut command = cmd.to_command();
        command
            .stdout(Stdio::from(capture.try_clone().map_err(ShellError::Capture)?))
            .stderr(Stdio::from(capture.try_clone().map_err(ShellError::Capture)?));
        let status = cmd.spawn(&mut command)?.wait()?;

        if !status.success() {
            // INVARIANT: Replay captured output only when the child failed.
            let mut captured = Vec::new();
            capture
                .seek(SeekFrom::Start(0))
                .and_then(|_| capture.read_to_end(&mut captured))
                .map_err(ShellError::Capture)?;
            best_effort(
                std::io::stderr().write_all(&captured),
                "failed to replay command output",
            );
            return Err(ShellError::failed(cmd, status, ""));
        }

        Ok(())
    }

    fn interactive(&self, cmd: &Cmd) -> Result<i32> {
        debug!("run interactively: {cmd}");
        let mut command = cmd.to_command();
        let status = cmd.spawn(&mut command)?.wait()?;

        Ok(exit_code(status))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Make wrench leader of its own process group.
///
/// Commands spawned afterwards inherit the group, so [`terminate_process_group`]
/// reaches all of them without touching whatever started wrench.
///
/// # Errors
///
/// - Return OS error if process group cannot be changed.
pub fn lead_process_group() -> std::io::Result<()> {
    // SAFETY: getpgrp, getpid and setpgid have no memory safety preconditions.
    unsafe {
        if libc::getpgrp() == libc::getpid() || libc::setpgid(0, 0) == 0 {
            return Ok(());
        }
    }

    Err(std::io::Error::last_os_error())
}

/// Send SIGTERM to every member of own process group, wrench included.
///
/// Only call this after [`lead_process_group`] succeeded.
///
/// # Errors
///
/// - Return OS error if signal cannot be sent.
pub fn terminate_process_group() -> std::io::Result<()> {
    // SAFETY: kill has no memory safety preconditions.
    if unsafe { libc::kill(0, libc::SIGTERM) } == 0 {
        return Ok(());
    }

    Err(std::io::Error::last_os_error())
}

/// Require that all listed programs are available.
///
/// # Errors
///
/// - Return [`ShellError::MissingCommand`] for the first missing program.
pub fn require_cmd(shell: &dyn Shell, names: &[&str]) -> Result<()> {
    for name in names {
        if !shell.have_cmd(name) {
            return Err(ShellError::MissingCommand((*name).to_string()));
        }
    }

    Ok(())
}

/// Log failure of a non-critical step and keep going.
pub fn best_effort<T, E>(result: std::result::Result<T, E>, what: &str) -> Option<T>
where
    E: Display,
{
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            warn!("{what}: {error}");
            None
        }
    }
}

/// Command execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// Program is not installed, or not in `PATH`.
    #[error("required command {0:?} not found")]
    MissingCommand(String),

    /// Child process could not be spawned or waited on.
    #[error("failed to run `{cmd}`")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    /// Child process exited with non-zero status.
    #[error("command `{cmd}` failed with {status}{detail}")]
    Failed {
        cmd: String,
        status: String,
        detail: String,
    },

    /// Temporary capture file for silent calls failed.
    #[error("failed to capture command output")]
    Capture(#[source] std::io::Error),
}

impl ShellError {
    pub(crate) fn failed(cmd: &Cmd, status: impl Display, stderr: &str) -> Self {
        let detail = if stderr.is_empty() {
            String::new()
        } else {
            format!(":\n{stderr}")
        };

        Self::Failed {
            cmd: cmd.to_string(),
            status: status.to_string(),
            detail,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ShellError> = std::result::Result<T, E>;


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cmd_display_quotes_whitespace() {
        let cmd = Cmd::new("systemctl")
            .args(["enable", "--now"])
            .arg("my unit.service")
            .arg("");
        assert_eq!(cmd.to_string(), "systemctl enable --now 'my unit.service' ''");
    }

    #[test]
    fn system_shell_captures_stdout() -> anyhow::Result<()> {
        let out = SystemShell.output(&Cmd::new("sh").args(["-c", "printf hello"]))?;
        assert_eq!(out, "hello");
        Ok(())
    }

    #[test]
    fn system_shell_feeds_stdin() -> anyhow::Result<()> {
        let out = SystemShell.output(&Cmd::new("cat").stdin("piped\n"))?;
        assert_eq!(out, "piped\n");
        Ok(())
    }

    #[test]
    fn system_shell_reports_stderr_on_failure() {
        let result = SystemShell.output(&Cmd::new("sh").args(["-c", "echo boom >&2; exit 3"]));
        match result {
            Err(ShellError::Failed { detail, .. }) => assert_eq!(detail, ":\nboom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn large_stdin_does_not_deadlock() -> anyhow::Result<()> {
        let input = "wrench\n".repeat(256 * 1024);
        let out = SystemShell.output(&Cmd::new("cat").stdin(input.clone()))?;
        assert_eq!(out.len(), input.len());
        Ok(())
    }

    #[test]
    fn unread_stdin_is_not_an_error() -> anyhow::Result<()> {
        let input = vec![b'x'; 1024 * 1024];
        let out = SystemShell.output(&Cmd::new("sh").args(["-c", "printf done"]).stdin(input))?;
        assert_eq!(out, "done");
        Ok(())
    }

    #[test]
    fn silent_call_succeeds_quietly() {
        assert!(SystemShell
            .silent(&Cmd::new("sh").args(["-c", "echo noisy; echo noisier >&2"]))
            .is_ok());
        assert!(SystemShell.silent(&Cmd::new("false")).is_err());
    }

    #[test]
    fn missing_program_is_reported() {
        let result = SystemShell.output(&Cmd::new("wrench-no-such-program"));
        assert!(matches!(result, Err(ShellError::MissingCommand(name)) if name == "wrench-no-such-program"));
    }

    #[test]
    fn interactive_returns_exit_code() -> anyhow::Result<()> {
        assert_eq!(SystemShell.interactive(&Cmd::new("sh").args(["-c", "exit 7"]))?, 7);
        Ok(())
    }

    #[test]
    fn require_cmd_names_first_missing() {
        let shell = fake::FakeShell::new().with_cmds(&["curl"]);
        assert!(require_cmd(&shell, &["curl"]).is_ok());
        let result = require_cmd(&shell, &["curl", "gpg", "tar"]);
        assert!(matches!(result, Err(ShellError::MissingCommand(name)) if name == "gpg"));
    }

    #[test]
    fn best_effort_swallows_errors() {
        let ok: std::result::Result<u8, String> = Ok(1);
        let err: std::result::Result<u8, String> = Err("nope".into());
        assert_eq!(best_effort(ok, "step"), Some(1));
        assert_eq!(best_effort(err, "step"), None);
    }
}
