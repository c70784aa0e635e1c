use std::borrow::Cow;
use std::fmt;

use serde_json::Value;

use crate::config::merge::lookup;
use crate::error::ConfigIssue;

/// The shape a configuration value is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Integer,
    PositiveInteger,
    Record,
    Array,
    /// A string holding a semantic version, e.g. `"0.7.6"`.
    Version,
}

impl ValueKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::PositiveInteger => value.as_u64().is_some_and(|n| n > 0),
            ValueKind::Record => value.is_object(),
            ValueKind::Array => value.is_array(),
            ValueKind::Version => value
                .as_str()
                .is_some_and(|s| semver::Version::parse(s).is_ok()),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::String => "a string",
            ValueKind::Bool => "a boolean",
            ValueKind::Integer => "an integer",
            ValueKind::PositiveInteger => "a positive integer",
            ValueKind::Record => "a record",
            ValueKind::Array => "an array",
            ValueKind::Version => "a version string",
        })
    }
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "record",
    }
}

#[derive(Debug, Clone)]
struct SchemaEntry {
    path: Cow<'static, str>,
    kind: ValueKind,
    required: bool,
}

/// A set of typed, dotted configuration paths.
///
/// The framework contributes its own fragment and every plugin may
/// contribute another; fragments are concatenated in registration order.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    entries: Vec<SchemaEntry>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a path that must hold a value of `kind` after resolution.
    pub fn required(mut self, path: impl Into<Cow<'static, str>>, kind: ValueKind) -> Self {
        self.entries.push(SchemaEntry {
            path: path.into(),
            kind,
            required: true,
        });
        self
    }

    /// Declares a path that is type-checked only when present.
    pub fn optional(mut self, path: impl Into<Cow<'static, str>>, kind: ValueKind) -> Self {
        self.entries.push(SchemaEntry {
            path: path.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn extend(&mut self, other: ConfigSchema) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks every entry against `tree` and returns all problems found.
    ///
    /// A `null` counts as absent, so a user can unset a default. A path whose
    /// parent is already reported is skipped to keep the list readable.
    pub fn validate(&self, tree: &Value) -> Vec<ConfigIssue> {
        let mut issues: Vec<ConfigIssue> = Vec::new();

        for entry in &self.entries {
            let shadowed = issues.iter().any(|issue| {
                let parent = issue.path();
                entry.path.len() > parent.len()
                    && entry.path.starts_with(parent)
                    && entry.path.as_bytes()[parent.len()] == b'.'
            });

            if shadowed || issues.iter().any(|issue| issue.path() == entry.path) {
                continue;
            }

            match lookup(tree, &entry.path).filter(|value| !value.is_null()) {
                None if entry.required => issues.push(ConfigIssue::Missing {
                    path: entry.path.to_string(),
                }),
                None => {}
                Some(value) if entry.kind.accepts(value) => {}
                Some(value) => {
                    let issue = match (entry.kind, value) {
                        (ValueKind::Version, Value::String(text)) => ConfigIssue::Invalid {
                            path: entry.path.to_string(),
                            reason: format!("'{text}' is not a valid version"),
                        },
                        (ValueKind::PositiveInteger, Value::Number(_)) => ConfigIssue::Invalid {
                            path: entry.path.to_string(),
                            reason: format!("{value} is not a positive integer"),
                        },
                        _ => ConfigIssue::TypeMismatch {
                            path: entry.path.to_string(),
                            expected: entry.kind,
                            found: describe(value),
                        },
                    };
                    issues.push(issue);
                }
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collects_all_issues() {
        let schema = ConfigSchema::new()
            .required("paths.sources", ValueKind::String)
            .required("solidity.version", ValueKind::Version)
            .optional("defaultNetwork", ValueKind::String)
            .optional("solidity.settings.optimizer.runs", ValueKind::PositiveInteger);

        let tree = json!({
            "defaultNetwork": 5,
            "solidity": { "version": "latest", "settings": { "optimizer": { "runs": 0 } } }
        });

        let issues = schema.validate(&tree);
        let paths: Vec<_> = issues.iter().map(ConfigIssue::path).collect();

        assert_eq!(
            paths,
            vec![
                "paths.sources",
                "solidity.version",
                "defaultNetwork",
                "solidity.settings.optimizer.runs"
            ]
        );
        assert!(matches!(issues[2], ConfigIssue::TypeMismatch { .. }));
        assert!(matches!(issues[3], ConfigIssue::Invalid { .. }));
    }

    #[test]
    fn test_optional_absent_is_fine() {
        let schema = ConfigSchema::new().optional("etherscan.apiKey", ValueKind::String);
        assert!(schema.validate(&json!({})).is_empty());
    }

    #[test]
    fn test_null_counts_as_missing() {
        let schema = ConfigSchema::new().required("paths.cache", ValueKind::String);
        let issues = schema.validate(&json!({ "paths": { "cache": null } }));
        assert_eq!(
            issues,
            vec![ConfigIssue::Missing {
                path: "paths.cache".into()
            }]
        );
    }

    #[test]
    fn test_children_of_broken_parent_are_skipped() {
        let schema = ConfigSchema::new()
            .required("paths", ValueKind::Record)
            .required("paths.sources", ValueKind::String);

        let issues = schema.validate(&json!({ "paths": "contracts" }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path(), "paths");
    }
}
