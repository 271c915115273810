// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Systemd service installation.
//!
//! A service is a unit template plus an optional configuration file template,
//! e.g., a monerod unit along with "/etc/monerod.conf". Both are rendered with
//! the service's variables and written only when they change. Systemd is only
//! poked when something was actually written.

use crate::{
    config::ServiceConfig,
    file::{compare, write_if_changed, FileError, WriteOutcome},
    shell::{best_effort, require_cmd, Cmd, Shell, ShellError},
    template::{render, TemplateError, Vars},
};

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// What installation did to each file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub unit: WriteOutcome,
    pub config_file: Option<WriteOutcome>,
}

impl ServiceReport {
    pub fn is_changed(&self) -> bool {
        self.unit.is_changed() || self.config_file.is_some_and(|outcome| outcome.is_changed())
    }
}

/// Path of unit file for service.
pub fn unit_path(unit_dir: &Path, name: &str) -> PathBuf {
    unit_dir.join(format!("{name}.service"))
}

/// Install, enable, and start service.
///
/// Variables of the service are available to both templates, along with
/// "name" set to the service name unless overridden.
///
/// # Errors
///
/// - Return [`ServiceError::Read`] if a template cannot be read.
/// - Return [`ServiceError::Template`] if a template fails to render.
/// - Return [`ServiceError::File`] if a file cannot be written.
/// - Return [`ServiceError::Shell`] if systemctl fails.
#[instrument(skip(shell, service), fields(name = %service.name), level = "debug")]
pub fn install(
    shell: &dyn Shell,
    service: &ServiceConfig,
    unit_dir: &Path,
    dry_run: bool,
) -> Result<ServiceReport> {
    let mut vars: Vars = service.vars.clone();
    vars.entry("name".into())
        .or_insert_with(|| service.name.clone());

    let unit = render_file(&service.unit_template, &vars)?;
    let config = service
        .config_file
        .as_ref()
        .map(|file| Ok::<_, ServiceError>((file.path.clone(), render_file(&file.template, &vars)?)))
        .transpose()?;
    let unit_file = unit_path(unit_dir, &service.name);

    if dry_run {
        let report = ServiceReport {
            unit: compare(&unit_file, &unit)?,
            config_file: config
                .as_ref()
                .map(|(path, contents)| compare(path, contents))
                .transpose()?,
        };
        info!("would install {}: {report:?}", service.name);
        return Ok(report);
    }

    require_cmd(shell, &["systemctl"])?;

    // INVARIANT: Config file lands first so the unit never starts without it.
    let config_file = config
        .map(|(path, contents)| {
            let outcome = write_if_changed(&path, contents, 0o644)?;
            info!("{}: {outcome}", path.display());
            Ok::<_, ServiceError>(outcome)
        })
        .transpose()?;
    let unit = write_if_changed(&unit_file, unit, 0o644)?;
    info!("{}: {unit}", unit_file.display());
    let report = ServiceReport { unit, config_file };

    let unit_name = format!("{}.service", service.name);
    if report.is_changed() {
        shell.silent(&Cmd::new("systemctl").arg("daemon-reload"))?;
    }
    shell.silent(&Cmd::new("systemctl").args(["enable", "--now", unit_name.as_str()]))?;
    if report.is_changed() {
        best_effort(
            shell.silent(&Cmd::new("systemctl").args(["restart", unit_name.as_str()])),
            "failed to restart service",
        );
    }

    Ok(report)
}

fn render_file(template: &Path, vars: &Vars) -> Result<String> {
    let text = read_to_string(template).map_err(|err| ServiceError::Read {
        source: err,
        path: template.to_path_buf(),
    })?;

    render(&text, vars).map_err(|err| ServiceError::Template {
        source: err,
        path: template.to_path_buf(),
    })
}

/// Service installation error types.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to read template {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to render template {:?}", path.display())]
    Template {
        #[source]
        source: TemplateError,
        path: PathBuf,
    },

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Friendly result alias :3
type Result<T, E = ServiceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigFile, shell::fake::FakeShell};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs;

    fn monerod() -> anyhow::Result<ServiceConfig> {
        fs::write(
            "monerod.service.in",
            indoc! {"
                [Unit]
                Description={{ name }} daemon

                [Service]
                User={{ user }}
                ExecStart=/usr/local/bin/monerod --config-file {{ config }} --non-interactive

                [Install]
                WantedBy=multi-user.target
            "},
        )?;
        fs::write(
            "monerod.conf.in",
            indoc! {"
                data-dir={{ data_dir }}
                prune-blockchain=1
            "},
        )?;

        Ok(ServiceConfig {
            name: "monerod".into(),
            unit_template: "monerod.service.in".into(),
            config_file: Some(ConfigFile {
                template: "monerod.conf.in".into(),
                path: "etc/monerod.conf".into(),
            }),
            vars: [
                ("user", "monero"),
                ("config", "/etc/monerod.conf"),
                ("data_dir", "/var/lib/monero"),
            ]
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        })
    }

    #[sealed_test]
    fn install_renders_and_starts() -> anyhow::Result<()> {
        let service = monerod()?;
        let shell = FakeShell::new().with_cmds(&["systemctl"]);

        let report = install(&shell, &service, Path::new("system"), false)?;
        assert_eq!(
            report,
            ServiceReport {
                unit: WriteOutcome::Created,
                config_file: Some(WriteOutcome::Created),
            }
        );

        let expect = indoc! {"
            [Unit]
            Description=monerod daemon

            [Service]
            User=monero
            ExecStart=/usr/local/bin/monerod --config-file /etc/monerod.conf --non-interactive

            [Install]
            WantedBy=multi-user.target
        "};
        assert_eq!(fs::read_to_string("system/monerod.service")?, expect);
        assert_eq!(
            fs::read_to_string("etc/monerod.conf")?,
            "data-dir=/var/lib/monero\nprune-blockchain=1\n"
        );
        let expect = vec![
            "systemctl daemon-reload",
            "systemctl enable --now monerod.service",
            "systemctl restart monerod.service",
        ];
        assert_eq!(shell.calls(), expect);

        Ok(())
    }

    #[sealed_test]
    fn reinstall_without_changes_only_enables() -> anyhow::Result<()> {
        let service = monerod()?;
        install(
            &FakeShell::new().with_cmds(&["systemctl"]),
            &service,
            Path::new("system"),
            false,
        )?;

        let shell = FakeShell::new().with_cmds(&["systemctl"]);
        let report = install(&shell, &service, Path::new("system"), false)?;
        assert!(!report.is_changed());
        assert_eq!(shell.calls(), vec!["systemctl enable --now monerod.service"]);

        Ok(())
    }

    #[sealed_test]
    fn unknown_variable_fails_before_writing() -> anyhow::Result<()> {
        let mut service = monerod()?;
        service.vars.remove("user");
        let shell = FakeShell::new().with_cmds(&["systemctl"]);

        let result = install(&shell, &service, Path::new("system"), false);
        assert!(matches!(result, Err(ServiceError::Template { .. })));
        assert!(!Path::new("system/monerod.service").exists());
        assert!(!Path::new("etc/monerod.conf").exists());

        Ok(())
    }

    #[sealed_test]
    fn dry_run_writes_nothing() -> anyhow::Result<()> {
        let service = monerod()?;
        let shell = FakeShell::new();

        let report = install(&shell, &service, Path::new("system"), true)?;
        assert_eq!(report.unit, WriteOutcome::Created);
        assert!(!Path::new("system").exists());
        assert!(shell.calls().is_empty());

        Ok(())
    }
}
