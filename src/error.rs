use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use semver::Version;
use thiserror::Error;

use crate::config::ValueKind;

/// Any error that can stop a runtime from being assembled or a run from
/// starting.
#[derive(Debug, Error)]
pub enum SmelterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Compiler(#[from] CompilerError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single problem found while resolving the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigIssue {
    Missing {
        path: String,
    },
    TypeMismatch {
        path: String,
        expected: ValueKind,
        found: &'static str,
    },
    Invalid {
        path: String,
        reason: String,
    },
}

impl ConfigIssue {
    pub fn path(&self) -> &str {
        match self {
            ConfigIssue::Missing { path }
            | ConfigIssue::TypeMismatch { path, .. }
            | ConfigIssue::Invalid { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigIssue::Missing { path } => write!(f, "'{path}' is required but missing"),
            ConfigIssue::TypeMismatch {
                path,
                expected,
                found,
            } => write!(f, "'{path}' should be {expected}, found {found}"),
            ConfigIssue::Invalid { path, reason } => write!(f, "'{path}' is invalid: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Every problem found in the merged configuration, not just the first.
    #[error("Invalid configuration ({} problems):\n{}", .0.len(), format_issues(.0))]
    Invalid(Vec<ConfigIssue>),

    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, String),

    #[error("Unsupported config file format '{0}', expected .json or .toml")]
    Format(Utf8PathBuf),
}

impl ConfigError {
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            ConfigError::Invalid(issues) => issues,
            _ => &[],
        }
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Unknown network '{name}', available networks: {}", .available.join(", "))]
    Unknown {
        name: String,
        available: Vec<String>,
    },

    #[error("Network '{0}' is already registered")]
    Duplicate(String),
}

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A diagnostic emitted by the external compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// The external compiler rejected a source unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Compilation of '{file}' with solc {version} failed:\n{}", format_diagnostics(.diagnostics))]
pub struct CompileError {
    pub file: Utf8PathBuf,
    pub version: Version,
    pub diagnostics: Vec<Diagnostic>,
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  {}", d.message))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompilerError {
    #[error(
        "No registered compiler satisfies '{}' required by '{file}', registered versions: {}",
        .constraint.as_deref().unwrap_or("<none>"),
        format_versions(.available)
    )]
    NoMatchingCompiler {
        file: Utf8PathBuf,
        constraint: Option<String>,
        available: Vec<Version>,
    },

    #[error("Invalid version pragma '{pragma}' in '{file}': {reason}")]
    InvalidPragma {
        file: Utf8PathBuf,
        pragma: String,
        reason: String,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

fn format_versions(versions: &[Version]) -> String {
    if versions.is_empty() {
        return "<none>".into();
    }

    versions
        .iter()
        .map(Version::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The task graph contains a dependency cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cycle detected in task graph between: {}", .tasks.join(" -> "))]
pub struct CycleError {
    pub tasks: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Task '{task}' depends on undefined task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{0}' is already defined, use an override to redefine it")]
    DuplicateTask(String),

    #[error("Can't override task '{0}' because it isn't defined")]
    OverrideUndefined(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),
}

/// A task action failed. Carries the failing task's name and the cause.
#[derive(Debug, Error, Clone)]
#[error("Task '{task}' failed: {cause:#}")]
pub struct TaskError {
    pub task: String,
    pub cause: Arc<anyhow::Error>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("No RPC transport is configured for network '{0}'")]
    NoTransport(String),

    #[error("RPC call to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Transaction rejected by {endpoint}: {message}")]
    Rejected { endpoint: String, message: String },

    #[error("Network '{0}' has no signing accounts")]
    NoSigner(String),

    #[error("RPC call to {endpoint} gave up after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: String,
    },
}

impl RpcError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("No verification service is configured")]
    NoVerifier,

    #[error("Missing 'etherscan.apiKey' in configuration")]
    MissingApiKey,

    #[error("Contract '{0}' was not found among compiled artifacts")]
    UnknownContract(String),

    #[error("Network '{0}' can't be verified against")]
    UnsupportedNetwork(String),

    #[error("Verification rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin '{0}' is already registered")]
    Duplicate(String),
}

/// Process exit status derived from the first failure's classification.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const TASK: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const NETWORK: i32 = 3;
    pub const COMPILE: i32 = 4;
    pub const RPC: i32 = 5;
    pub const VERIFICATION: i32 = 6;
    pub const CANCELLED: i32 = 130;
}

/// Maps an error chain to an exit status. The first error in the chain with
/// a known classification wins.
pub(crate) fn classify(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(code) = classify_cause(cause) {
            return code;
        }
    }

    exit::TASK
}

fn classify_cause(cause: &(dyn std::error::Error + 'static)) -> Option<i32> {
    if cause.is::<ConfigError>() || cause.is::<GraphError>() || cause.is::<CycleError>() {
        Some(exit::CONFIG)
    } else if cause.is::<NetworkError>() {
        Some(exit::NETWORK)
    } else if cause.is::<CompilerError>() || cause.is::<CompileError>() {
        Some(exit::COMPILE)
    } else if cause.is::<RpcError>() {
        Some(exit::RPC)
    } else if cause.is::<VerificationError>() {
        Some(exit::VERIFICATION)
    } else if let Some(err) = cause.downcast_ref::<SmelterError>() {
        Some(match err {
            SmelterError::Config(_) | SmelterError::Graph(_) | SmelterError::Plugin(_) => {
                exit::CONFIG
            }
            SmelterError::Network(_) => exit::NETWORK,
            SmelterError::Compiler(_) => exit::COMPILE,
            SmelterError::Io(_) => exit::TASK,
        })
    } else {
        None
    }
}
