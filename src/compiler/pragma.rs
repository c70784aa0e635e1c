use std::fmt;

use semver::{Version, VersionReq};

/// A `pragma solidity` version constraint.
///
/// Comparators separated by whitespace must all hold; `||` separates
/// alternatives. A bare version means exactly that version, unlike Cargo
/// where it implies `^`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    text: String,
    alternatives: Vec<VersionReq>,
}

impl VersionConstraint {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty constraint".into());
        }

        let alternatives = text
            .split("||")
            .map(parse_alternative)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            text: text.to_owned(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn parse_alternative(text: &str) -> Result<VersionReq, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty alternative".into());
    }

    // Hyphen range: `0.6.0 - 0.7.6` means `>=0.6.0 <=0.7.6`.
    if let Some((lo, hi)) = text.split_once(" - ") {
        return VersionReq::parse(&format!(">={}, <={}", lo.trim(), hi.trim()))
            .map_err(|e| e.to_string());
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;

    for token in text.split_whitespace() {
        let token_is_op = token.chars().all(|c| matches!(c, '^' | '~' | '>' | '<' | '='));

        match (pending_op.take(), token_is_op) {
            (Some(op), false) => comparators.push(format!("{op}{token}")),
            (Some(op), true) => return Err(format!("'{op}' is not followed by a version")),
            (None, true) => pending_op = Some(token),
            (None, false) if Version::parse(token).is_ok() => comparators.push(format!("={token}")),
            (None, false) => comparators.push(token.to_owned()),
        }
    }

    if let Some(op) = pending_op {
        return Err(format!("'{op}' is not followed by a version"));
    }

    VersionReq::parse(&comparators.join(", ")).map_err(|e| e.to_string())
}

/// Finds the constraint of the first `pragma solidity ...;` declaration.
pub fn find_pragma(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("pragma")?;
        let rest = rest.trim_start().strip_prefix("solidity")?;
        let end = rest.find(';')?;
        Some(rest[..end].trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    #[test]
    fn test_bare_version_is_exact() {
        let c = VersionConstraint::parse("0.7.6").unwrap();
        assert!(c.matches(&v("0.7.6")));
        assert!(!c.matches(&v("0.7.7")));
    }

    #[test]
    fn test_caret_and_tilde() {
        let caret = VersionConstraint::parse("^0.7.0").unwrap();
        assert!(caret.matches(&v("0.7.6")));
        assert!(!caret.matches(&v("0.8.0")));

        let tilde = VersionConstraint::parse("~0.8.1").unwrap();
        assert!(tilde.matches(&v("0.8.19")));
        assert!(!tilde.matches(&v("0.8.0")));
    }

    #[test]
    fn test_conjunction_with_spaces() {
        let c = VersionConstraint::parse(">=0.6.12 <0.8.0").unwrap();
        assert!(c.matches(&v("0.7.6")));
        assert!(!c.matches(&v("0.8.19")));

        let spaced = VersionConstraint::parse(">= 0.6.12 < 0.8.0").unwrap();
        assert!(spaced.matches(&v("0.6.12")));
    }

    #[test]
    fn test_alternatives() {
        let c = VersionConstraint::parse("^0.6.0 || ^0.8.0").unwrap();
        assert!(c.matches(&v("0.6.12")));
        assert!(c.matches(&v("0.8.19")));
        assert!(!c.matches(&v("0.7.6")));
    }

    #[test]
    fn test_hyphen_range() {
        let c = VersionConstraint::parse("0.6.0 - 0.7.6").unwrap();
        assert!(c.matches(&v("0.7.6")));
        assert!(!c.matches(&v("0.7.7")));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(VersionConstraint::parse("").is_err());
        assert!(VersionConstraint::parse(">=").is_err());
        assert!(VersionConstraint::parse("^0.7.0 ||").is_err());
        assert!(VersionConstraint::parse("latest").is_err());
    }

    #[test]
    fn test_find_pragma() {
        let source = "// SPDX-License-Identifier: MIT\npragma solidity ^0.7.6;\n\ncontract A {}\n";
        assert_eq!(find_pragma(source), Some("^0.7.6"));

        let source = "pragma abicoder v2;\n  pragma solidity >=0.6.0 <0.8.0 ;\n";
        assert_eq!(find_pragma(source), Some(">=0.6.0 <0.8.0"));

        assert_eq!(find_pragma("contract A {}"), None);
    }
}
