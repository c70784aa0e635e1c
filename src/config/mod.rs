//! Configuration resolution.
//!
//! A run is driven by exactly one [`Configuration`], produced by
//! [`ConfigResolver::resolve`] from three kinds of layers, lowest precedence
//! first:
//!
//! 1. framework defaults ([`framework_defaults`]),
//! 2. plugin defaults, in plugin registration order,
//! 3. the user's configuration.
//!
//! Layers are deep-merged with a right-biased overlay (see [`merge::overlay`])
//! and the result is validated against the combined [`ConfigSchema`].
//! Validation never stops at the first problem: every missing field,
//! mismatched type and malformed entry is reported in one
//! [`ConfigError::Invalid`].
//!
//! Secret values (RPC URLs with credentials, private keys, API keys) are
//! expected to arrive already substituted. The resolver treats them as plain
//! strings.

pub mod merge;
mod schema;

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use serde_json::{Map, Value, json};

use crate::compiler::{CompilerSetting, OptimizerSettings};
use crate::error::{ConfigError, ConfigIssue};
use crate::network::{Endpoint, GasPolicy, GasSetting, NetworkDefinition};

pub use schema::{ConfigSchema, ValueKind};
pub(crate) use schema::describe;

const DEFAULT_SOLC_VERSION: &str = "0.8.19";
const DEFAULT_OPTIMIZER_RUNS: u32 = 200;

/// The defaults every project starts from.
///
/// `defaultNetwork` is deliberately absent: an unconfigured project runs
/// against the in-process simulated network.
pub fn framework_defaults() -> Value {
    json!({
        "solidity": {
            "version": DEFAULT_SOLC_VERSION,
            "settings": {
                "optimizer": { "enabled": false, "runs": DEFAULT_OPTIMIZER_RUNS }
            }
        },
        "paths": {
            "root": ".",
            "sources": "contracts",
            "artifacts": "artifacts",
            "cache": "cache"
        },
        "networks": {}
    })
}

/// The schema fragment owned by the framework itself.
pub fn framework_schema() -> ConfigSchema {
    ConfigSchema::new()
        .optional("defaultNetwork", ValueKind::String)
        .required("solidity", ValueKind::Record)
        .optional("solidity.version", ValueKind::Version)
        .optional("solidity.settings", ValueKind::Record)
        .optional("solidity.settings.optimizer", ValueKind::Record)
        .optional("solidity.settings.optimizer.enabled", ValueKind::Bool)
        .optional("solidity.settings.optimizer.runs", ValueKind::PositiveInteger)
        .optional("solidity.compilers", ValueKind::Array)
        .optional("solidity.overrides", ValueKind::Record)
        .required("paths", ValueKind::Record)
        .required("paths.root", ValueKind::String)
        .required("paths.sources", ValueKind::String)
        .required("paths.artifacts", ValueKind::String)
        .required("paths.cache", ValueKind::String)
        .optional("networks", ValueKind::Record)
}

/// Reads a user configuration file. The format is chosen by extension,
/// `.json` or `.toml`.
pub fn load_user_config(path: impl AsRef<Utf8Path>) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.to_owned(), e))?;

    match path.extension() {
        Some("json") => serde_json::from_str(&text)
            .map_err(|e| ConfigError::Parse(path.to_owned(), e.to_string())),
        Some("toml") => toml::from_str::<Value>(&text)
            .map_err(|e| ConfigError::Parse(path.to_owned(), e.to_string())),
        _ => Err(ConfigError::Format(path.to_owned())),
    }
}

/// Compiler settings resolved from the `solidity` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoliditySettings {
    /// Registered compilers, in declaration order. The first one is the
    /// project default.
    pub compilers: Vec<CompilerSetting>,
    /// Explicit source path to setting bindings.
    pub overrides: BTreeMap<Utf8PathBuf, CompilerSetting>,
}

/// Project directories. All but `root` are relative to `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: Utf8PathBuf,
    pub sources: Utf8PathBuf,
    pub artifacts: Utf8PathBuf,
    pub cache: Utf8PathBuf,
}

impl ProjectPaths {
    pub fn sources_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.sources)
    }

    pub fn artifacts_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.artifacts)
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.cache)
    }
}

#[derive(Debug)]
struct Resolved {
    tree: Value,
    default_network: Option<String>,
    solidity: SoliditySettings,
    networks: Vec<NetworkDefinition>,
    paths: ProjectPaths,
}

/// The frozen, validated configuration of one run.
///
/// Cheap to clone; every component holds the same immutable tree.
#[derive(Debug, Clone)]
pub struct Configuration {
    inner: Arc<Resolved>,
}

impl Configuration {
    /// The merged configuration tree.
    pub fn tree(&self) -> &Value {
        &self.inner.tree
    }

    /// Looks up a dotted path, e.g. `solidity.settings.optimizer.runs`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        merge::lookup(&self.inner.tree, path).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn default_network(&self) -> Option<&str> {
        self.inner.default_network.as_deref()
    }

    pub fn solidity(&self) -> &SoliditySettings {
        &self.inner.solidity
    }

    /// Networks declared in the `networks` section, sorted by name.
    pub fn networks(&self) -> &[NetworkDefinition] {
        &self.inner.networks
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.inner.paths
    }

    /// Key for the contract verification service, if one is configured.
    pub fn etherscan_api_key(&self) -> Option<&str> {
        self.get_str("etherscan.apiKey").filter(|key| !key.is_empty())
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.inner.tree == other.inner.tree
    }
}

/// Merges configuration layers and validates the result.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    schema: ConfigSchema,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(framework_schema())
    }
}

impl ConfigResolver {
    pub fn new(schema: ConfigSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &ConfigSchema {
        &self.schema
    }

    /// Deep-merges `framework`, every plugin layer, and `user`, in that
    /// order, and validates the result. Plugin layers are `(plugin name,
    /// layer)` pairs. Pure: no I/O, no substitution.
    pub fn resolve(
        &self,
        framework: &Value,
        plugins: &[(String, Value)],
        user: &Value,
    ) -> Result<Configuration, ConfigError> {
        let mut issues = Vec::new();

        let layers = std::iter::once((framework, "<framework>".to_owned()))
            .chain(plugins.iter().map(|(name, layer)| (layer, format!("<plugin:{name}>"))))
            .chain(std::iter::once((user, "<user>".to_owned())));

        for (layer, path) in layers {
            if !layer.is_object() && !layer.is_null() {
                issues.push(ConfigIssue::TypeMismatch {
                    path,
                    expected: ValueKind::Record,
                    found: describe(layer),
                });
            }
        }

        if !issues.is_empty() {
            return Err(ConfigError::Invalid(issues));
        }

        let tree = merge::merge_all(
            std::iter::once(framework)
                .chain(plugins.iter().map(|(_, layer)| layer))
                .chain(std::iter::once(user)),
        );

        issues.extend(self.schema.validate(&tree));

        let default_network = merge::lookup(&tree, "defaultNetwork")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let solidity = extract_solidity(&tree, &mut issues);
        let networks = extract_networks(&tree, &mut issues);
        let paths = extract_paths(&tree);

        if !issues.is_empty() {
            return Err(ConfigError::Invalid(issues));
        }

        Ok(Configuration {
            inner: Arc::new(Resolved {
                tree,
                default_network,
                solidity,
                networks,
                paths,
            }),
        })
    }
}

/// Parses `{ version, settings: { optimizer: { enabled, runs } } }`.
///
/// Issues are only pushed when `report` is set; the paths of the single
/// `solidity` form are already covered by the schema.
fn parse_setting(
    value: &Value,
    path: &str,
    report: bool,
    issues: &mut Vec<ConfigIssue>,
) -> Option<CompilerSetting> {
    let mut push = |issue| {
        if report {
            issues.push(issue)
        }
    };

    let version = match value.get("version") {
        Some(Value::String(text)) => match Version::parse(text) {
            Ok(version) => Some(version),
            Err(e) => {
                push(ConfigIssue::Invalid {
                    path: format!("{path}.version"),
                    reason: format!("'{text}' is not a valid version: {e}"),
                });
                None
            }
        },
        Some(other) => {
            push(ConfigIssue::TypeMismatch {
                path: format!("{path}.version"),
                expected: ValueKind::Version,
                found: describe(other),
            });
            None
        }
        None => {
            push(ConfigIssue::Missing {
                path: format!("{path}.version"),
            });
            None
        }
    };

    let optimizer = value.pointer("/settings/optimizer");

    let enabled = match optimizer.and_then(|o| o.get("enabled")) {
        None | Some(Value::Null) => Some(false),
        Some(Value::Bool(enabled)) => Some(*enabled),
        Some(other) => {
            push(ConfigIssue::TypeMismatch {
                path: format!("{path}.settings.optimizer.enabled"),
                expected: ValueKind::Bool,
                found: describe(other),
            });
            None
        }
    };

    let runs = match optimizer.and_then(|o| o.get("runs")) {
        None | Some(Value::Null) => NonZeroU32::new(DEFAULT_OPTIMIZER_RUNS),
        Some(value) => {
            let runs = value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .and_then(NonZeroU32::new);

            if runs.is_none() {
                push(ConfigIssue::Invalid {
                    path: format!("{path}.settings.optimizer.runs"),
                    reason: format!("{value} is not a positive integer"),
                });
            }

            runs
        }
    };

    Some(CompilerSetting::new(
        version?,
        OptimizerSettings {
            enabled: enabled?,
            runs: runs?,
        },
    ))
}

fn extract_solidity(tree: &Value, issues: &mut Vec<ConfigIssue>) -> SoliditySettings {
    let mut settings = SoliditySettings {
        compilers: Vec::new(),
        overrides: BTreeMap::new(),
    };

    let Some(solidity) = tree.get("solidity").filter(|v| v.is_object()) else {
        return settings;
    };

    match solidity.get("compilers").and_then(Value::as_array) {
        Some(compilers) if !compilers.is_empty() => {
            for (i, entry) in compilers.iter().enumerate() {
                let path = format!("solidity.compilers[{i}]");

                if !entry.is_object() {
                    issues.push(ConfigIssue::TypeMismatch {
                        path,
                        expected: ValueKind::Record,
                        found: describe(entry),
                    });
                    continue;
                }

                if let Some(setting) = parse_setting(entry, &path, true, issues)
                    && !settings.compilers.contains(&setting)
                {
                    settings.compilers.push(setting);
                }
            }
        }
        _ => {
            if let Some(setting) = parse_setting(solidity, "solidity", false, issues) {
                settings.compilers.push(setting);
            }
        }
    }

    if settings.compilers.is_empty() && !issues.iter().any(|i| i.path().starts_with("solidity")) {
        issues.push(ConfigIssue::Missing {
            path: "solidity.version".into(),
        });
    }

    if let Some(overrides) = solidity.get("overrides").and_then(Value::as_object) {
        for (file, entry) in overrides {
            let path = format!("solidity.overrides[{file}]");

            if !entry.is_object() {
                issues.push(ConfigIssue::TypeMismatch {
                    path,
                    expected: ValueKind::Record,
                    found: describe(entry),
                });
                continue;
            }

            if let Some(setting) = parse_setting(entry, &path, true, issues) {
                settings.overrides.insert(Utf8PathBuf::from(file), setting);
            }
        }
    }

    settings
}

fn parse_gas_setting(
    entry: &Map<String, Value>,
    key: &str,
    path: &str,
    issues: &mut Vec<ConfigIssue>,
) -> GasSetting {
    match entry.get(key) {
        None | Some(Value::Null) => GasSetting::Auto,
        Some(Value::String(text)) if text == "auto" => GasSetting::Auto,
        Some(value) => match value.as_u64() {
            Some(amount) => GasSetting::Fixed(amount),
            None => {
                issues.push(ConfigIssue::Invalid {
                    path: format!("{path}.{key}"),
                    reason: format!("expected \"auto\" or an integer, found {value}"),
                });
                GasSetting::Auto
            }
        },
    }
}

fn extract_networks(tree: &Value, issues: &mut Vec<ConfigIssue>) -> Vec<NetworkDefinition> {
    let Some(networks) = tree.get("networks").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut definitions = Vec::with_capacity(networks.len());

    for (name, entry) in networks {
        let path = format!("networks.{name}");

        let Some(entry) = entry.as_object() else {
            issues.push(ConfigIssue::TypeMismatch {
                path,
                expected: ValueKind::Record,
                found: describe(entry),
            });
            continue;
        };

        let url = match entry.get("url") {
            Some(Value::String(url)) if !url.is_empty() => Some(url.clone()),
            Some(Value::String(_)) => {
                issues.push(ConfigIssue::Invalid {
                    path: format!("{path}.url"),
                    reason: "URL is empty".into(),
                });
                None
            }
            Some(other) => {
                issues.push(ConfigIssue::TypeMismatch {
                    path: format!("{path}.url"),
                    expected: ValueKind::String,
                    found: describe(other),
                });
                None
            }
            None => {
                issues.push(ConfigIssue::Missing {
                    path: format!("{path}.url"),
                });
                None
            }
        };

        let chain_id = match entry.get("chainId") {
            Some(value) => {
                let id = value.as_u64();
                if id.is_none() {
                    issues.push(ConfigIssue::TypeMismatch {
                        path: format!("{path}.chainId"),
                        expected: ValueKind::Integer,
                        found: describe(value),
                    });
                }
                id
            }
            None => {
                issues.push(ConfigIssue::Missing {
                    path: format!("{path}.chainId"),
                });
                None
            }
        };

        let mut signers = Vec::new();
        match entry.get("accounts") {
            None | Some(Value::Null) => {}
            Some(Value::Array(accounts)) => {
                for (i, account) in accounts.iter().enumerate() {
                    match account.as_str() {
                        Some(account) => signers.push(account.to_owned()),
                        None => issues.push(ConfigIssue::TypeMismatch {
                            path: format!("{path}.accounts[{i}]"),
                            expected: ValueKind::String,
                            found: describe(account),
                        }),
                    }
                }
            }
            Some(other) => issues.push(ConfigIssue::TypeMismatch {
                path: format!("{path}.accounts"),
                expected: ValueKind::Array,
                found: describe(other),
            }),
        }

        let gas = GasPolicy {
            limit: parse_gas_setting(entry, "gas", &path, issues),
            price: parse_gas_setting(entry, "gasPrice", &path, issues),
        };

        if let (Some(url), Some(chain_id)) = (url, chain_id) {
            definitions.push(NetworkDefinition {
                name: name.clone(),
                endpoint: Endpoint::Url(url),
                chain_id,
                signers,
                gas,
            });
        }
    }

    definitions
}

fn extract_paths(tree: &Value) -> ProjectPaths {
    let get = |key: &str, fallback: &str| -> Utf8PathBuf {
        tree.pointer(&format!("/paths/{key}"))
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .into()
    };

    ProjectPaths {
        root: get("root", "."),
        sources: get("sources", "contracts"),
        artifacts: get("artifacts", "artifacts"),
        cache: get("cache", "cache"),
    }
}
