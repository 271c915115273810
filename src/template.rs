// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Placeholder substitution for generated configuration files.
//!
//! Templates mark variables as `{{ name }}`. Whitespace between the braces and
//! the name is ignored. Every placeholder must resolve, so a typo in a unit
//! template fails loudly instead of writing a broken file to `/etc`.

use std::collections::BTreeMap;

/// Variables available to a template.
pub type Vars = BTreeMap<String, String>;

/// Render template text with target variables.
///
/// # Errors
///
/// - Return [`TemplateError::Unterminated`] if `{{` has no closing `}}`.
/// - Return [`TemplateError::Unknown`] if a placeholder names no variable.
pub fn render(text: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(line_of(text, rest, start)))?;
        let key = after[..end].trim();
        let value = vars
            .get(key)
            .ok_or_else(|| TemplateError::Unknown(key.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

fn line_of(text: &str, rest: &str, offset: usize) -> usize {
    let consumed = text.len() - rest.len() + offset;
    text[..consumed].matches('\n').count() + 1
}

/// Template rendering error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder on line {0}")]
    Unterminated(usize),

    #[error("template variable {0:?} is not defined")]
    Unknown(String),
}

/// Friendly result alias :3
type Result<T, E = TemplateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_placeholders() -> anyhow::Result<()> {
        let template = indoc! {r#"
            data-dir={{data_dir}}
            rpc-bind-port={{ rpc_port }}
            p2p-bind-port={{rpc_port}}0
        "#};
        let result = render(template, &vars(&[("data_dir", "/var/lib/monero"), ("rpc_port", "18081")]))?;
        let expect = indoc! {r#"
            data-dir=/var/lib/monero
            rpc-bind-port=18081
            p2p-bind-port=180810
        "#};
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn plain_text_is_untouched() -> anyhow::Result<()> {
        assert_eq!(render("a } b { c", &Vars::new())?, "a } b { c");
        Ok(())
    }

    #[test]
    fn unknown_variable_fails() {
        assert_eq!(
            render("x={{ nope }}", &Vars::new()),
            Err(TemplateError::Unknown("nope".into()))
        );
    }

    #[test]
    fn unterminated_placeholder_reports_line() {
        assert_eq!(
            render("ok\nbroken={{ name\n", &vars(&[("name", "x")])),
            Err(TemplateError::Unterminated(2))
        );
    }
}
