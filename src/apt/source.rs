// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! APT source entry formats.
//!
//! APT understands two formats for its sources. The legacy one-line format
//! places an entire entry on a single line in a ".list" file:
//!
//! ```text
//! deb [arch=amd64 signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/debian bookworm stable
//! ```
//!
//! The modern __deb822__ format uses multi-line stanzas of key-value fields
//! in a ".sources" file, separated from each other by blank lines:
//!
//! ```text
//! Types: deb
//! URIs: https://download.docker.com/linux/debian
//! Suites: bookworm
//! Components: stable
//! Architectures: amd64
//! Signed-By: /etc/apt/keyrings/docker.gpg
//! ```
//!
//! Wrench always writes deb822, but reads both so that old entries can be
//! migrated.
//!
//! # See Also
//!
//! - [sources.list(5)](https://manpages.debian.org/stable/apt/sources.list.5.en.html)

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Single deb822 source stanza.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Deb822Source {
    pub types: Vec<String>,
    pub uris: Vec<String>,
    pub suites: Vec<String>,
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    pub signed_by: Option<String>,

    /// Any other field, e.g., "Trusted" or "Enabled".
    pub options: BTreeMap<String, String>,
}

impl Deb822Source {
    /// Check that the stanza carries every mandatory field.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::MissingField`] for the first absent field.
    pub fn validate(&self) -> Result<()> {
        for (field, values) in [
            ("Types", &self.types),
            ("URIs", &self.uris),
            ("Suites", &self.suites),
        ] {
            if values.is_empty() {
                return Err(SourceError::MissingField(field));
            }
        }

        // INVARIANT: Suites ending with "/" are exact paths, and must not
        // have components. Everything else requires components.
        let exact_path = self.suites.iter().all(|suite| suite.ends_with('/'));
        if !exact_path && self.components.is_empty() {
            return Err(SourceError::MissingField("Components"));
        }

        Ok(())
    }

    /// Check if two sources refer to the same location.
    fn same_location(&self, other: &Self) -> bool {
        self.uris == other.uris
            && self.suites == other.suites
            && self.components == other.components
            && self.architectures == other.architectures
            && self.signed_by == other.signed_by
            && self.options == other.options
    }
}

impl Display for Deb822Source {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut field = |name: &str, values: &[String]| -> FmtResult {
            if values.is_empty() {
                return Ok(());
            }
            writeln!(fmt, "{name}: {}", values.join(" "))
        };

        field("Types", self.types.as_slice())?;
        field("URIs", self.uris.as_slice())?;
        field("Suites", self.suites.as_slice())?;
        field("Components", self.components.as_slice())?;
        field("Architectures", self.architectures.as_slice())?;
        if let Some(signed_by) = &self.signed_by {
            writeln!(fmt, "Signed-By: {signed_by}")?;
        }
        for (name, value) in &self.options {
            writeln!(fmt, "{name}: {value}")?;
        }

        Ok(())
    }
}

/// Render listing of stanzas as deb822 file content.
pub fn render_sources(sources: &[Deb822Source]) -> String {
    sources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse deb822 file content into listing of stanzas.
///
/// Field names are case-insensitive. Continuation lines start with a space
/// or tab. Lines starting with "#" are comments.
///
/// # Errors
///
/// - Return [`SourceError::Syntax`] if a line is neither field, continuation,
///   comment, nor blank.
/// - Return [`SourceError::MissingField`] if a stanza lacks mandatory fields.
pub fn parse_deb822(data: &str) -> Result<Vec<Deb822Source>> {
    let mut stanzas: Vec<Vec<(String, String)>> = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();

    for (number, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            let (_, value) = current
                .last_mut()
                .ok_or(SourceError::Syntax { line: number + 1 })?;
            value.push('\n');
            value.push_str(line.trim_end());
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(SourceError::Syntax { line: number + 1 })?;
        current.push((key.trim().to_string(), value.trim().to_string()));
    }
    if !current.is_empty() {
        stanzas.push(current);
    }

    stanzas
        .into_iter()
        .map(|fields| {
            let source = stanza_to_source(fields);
            source.validate()?;
            Ok(source)
        })
        .collect()
}

fn stanza_to_source(fields: Vec<(String, String)>) -> Deb822Source {
    let mut source = Deb822Source::default();
    let words = |value: &str| value.split_whitespace().map(String::from).collect::<Vec<_>>();

    for (key, value) in fields {
        match key.to_ascii_lowercase().as_str() {
            "types" => source.types = words(&value),
            "uris" => source.uris = words(&value),
            "suites" => source.suites = words(&value),
            "components" => source.components = words(&value),
            "architectures" => source.architectures = words(&value),
            "signed-by" => source.signed_by = Some(value),
            _ => {
                source.options.insert(key, value);
            }
        }
    }

    source
}

/// Parse legacy one-line entries.
///
/// Lines that differ only in their type, e.g., a "deb" line and its matching
/// "deb-src" line, are merged into one stanza.
///
/// # Errors
///
/// - Return [`SourceError::Syntax`] if a line is not a valid entry.
pub fn parse_one_line(data: &str) -> Result<Vec<Deb822Source>> {
    let mut sources: Vec<Deb822Source> = Vec::new();

    for (number, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let source = parse_line(line).ok_or(SourceError::Syntax { line: number + 1 })?;
        match sources
            .iter_mut()
            .find(|existing| existing.same_location(&source))
        {
            Some(existing) => {
                for kind in source.types {
                    if !existing.types.contains(&kind) {
                        existing.types.push(kind);
                    }
                }
            }
            None => sources.push(source),
        }
    }

    Ok(sources)
}

fn parse_line(line: &str) -> Option<Deb822Source> {
    let (kind, rest) = line.split_once(char::is_whitespace)?;
    if kind != "deb" && kind != "deb-src" {
        return None;
    }

    let mut source = Deb822Source {
        types: vec![kind.to_string()],
        ..Default::default()
    };

    let mut rest = rest.trim_start();
    if let Some(bracketed) = rest.strip_prefix('[') {
        let (options, after) = bracketed.split_once(']')?;
        for option in options.split_whitespace() {
            let (key, value) = option.split_once('=')?;
            match key {
                "arch" => source.architectures = value.split(',').map(String::from).collect(),
                "signed-by" => source.signed_by = Some(value.to_string()),
                other => {
                    source.options.insert(deb822_option_name(other), value.to_string());
                }
            }
        }
        rest = after.trim_start();
    }

    let mut words = rest.split_whitespace();
    source.uris.push(words.next()?.to_string());
    source.suites.push(words.next()?.to_string());
    source.components = words.map(String::from).collect();
    source.validate().ok()?;

    Some(source)
}

/// Map one-line option name to deb822 field name.
fn deb822_option_name(option: &str) -> String {
    match option {
        "lang" => "Languages".into(),
        "target" => "Targets".into(),
        "pdiffs" => "PDiffs".into(),
        "by-hash" => "By-Hash".into(),
        "allow-insecure" => "Allow-Insecure".into(),
        "check-valid-until" => "Check-Valid-Until".into(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

/// APT source format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("malformed source entry on line {line}")]
    Syntax { line: usize },

    #[error("source entry lacks mandatory field {0:?}")]
    MissingField(&'static str),
}

/// Friendly result alias :3
pub type Result<T, E = SourceError> = std::result::Result<T, E>;
