use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::compiler::{CompiledContract, Compiler, CompilerOutput, OptimizerSettings, SourceUnit};
use crate::error::{CompileError, Diagnostic, Severity};

/// A set of `solc` executables, one per version, driven through the
/// standard-JSON interface.
#[derive(Debug, Clone, Default)]
pub struct SolcInstallation {
    binaries: BTreeMap<Version, Utf8PathBuf>,
}

impl SolcInstallation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, version: Version, path: impl Into<Utf8PathBuf>) -> Self {
        self.binaries.insert(version, path.into());
        self
    }

    /// Registers every `solc-<version>` (or `solc-v<version>`) file in `dir`.
    pub fn discover(dir: impl AsRef<Utf8Path>) -> std::io::Result<Self> {
        let pattern = dir.as_ref().join("solc-*");
        let mut installation = Self::new();

        for entry in glob::glob(pattern.as_str()).map_err(std::io::Error::other)? {
            let path = entry.map_err(glob::GlobError::into_error)?;
            let Ok(path) = Utf8PathBuf::try_from(path) else {
                continue;
            };

            let version = path
                .file_name()
                .and_then(|name| name.strip_prefix("solc-"))
                .map(|v| v.strip_prefix('v').unwrap_or(v))
                .and_then(|v| Version::parse(v).ok());

            match version {
                Some(version) => {
                    tracing::debug!(%version, %path, "found solc");
                    installation.binaries.insert(version, path);
                }
                None => tracing::debug!(%path, "skipping file without a version"),
            }
        }

        Ok(installation)
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.binaries.keys()
    }

    fn run(&self, binary: &Utf8Path, input: &Value) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(binary)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            serde_json::to_writer(&mut stdin, input)?;
            stdin.flush()?;
        }

        child.wait_with_output()
    }
}

impl Compiler for SolcInstallation {
    fn compile(
        &self,
        source: &SourceUnit,
        version: &Version,
        optimizer: &OptimizerSettings,
    ) -> Result<CompilerOutput, CompileError> {
        let fail = |message: String| CompileError {
            file: source.path.clone(),
            version: version.clone(),
            diagnostics: vec![Diagnostic::error(message)],
        };

        let binary = self
            .binaries
            .get(version)
            .ok_or_else(|| fail(format!("solc {version} is not installed")))?;

        let output = self
            .run(binary, &standard_input(source, optimizer))
            .map_err(|e| fail(format!("couldn't run {binary}: {e}")))?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(fail(format!(
                "{binary} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_output(source, version, &output.stdout)
    }
}

fn standard_input(source: &SourceUnit, optimizer: &OptimizerSettings) -> Value {
    json!({
        "language": "Solidity",
        "sources": {
            source.path.as_str(): { "content": &*source.content }
        },
        "settings": {
            "optimizer": { "enabled": optimizer.enabled, "runs": optimizer.runs.get() },
            "outputSelection": { "*": { "*": ["abi", "evm.bytecode.object"] } }
        }
    })
}

#[derive(Deserialize)]
struct StandardOutput {
    #[serde(default)]
    errors: Vec<SolcDiagnostic>,
    #[serde(default)]
    contracts: BTreeMap<String, BTreeMap<String, SolcContract>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolcDiagnostic {
    severity: String,
    message: String,
    formatted_message: Option<String>,
}

#[derive(Deserialize)]
struct SolcContract {
    #[serde(default)]
    abi: Value,
    evm: SolcEvm,
}

#[derive(Deserialize)]
struct SolcEvm {
    bytecode: SolcBytecode,
}

#[derive(Deserialize)]
struct SolcBytecode {
    object: String,
}

fn parse_output(
    source: &SourceUnit,
    version: &Version,
    stdout: &[u8],
) -> Result<CompilerOutput, CompileError> {
    let fail = |diagnostics| CompileError {
        file: source.path.clone(),
        version: version.clone(),
        diagnostics,
    };

    let output: StandardOutput = serde_json::from_slice(stdout)
        .map_err(|e| fail(vec![Diagnostic::error(format!("malformed compiler output: {e}"))]))?;

    let diagnostics: Vec<Diagnostic> = output
        .errors
        .into_iter()
        .map(|d| Diagnostic {
            severity: match d.severity.as_str() {
                "error" => Severity::Error,
                "warning" => Severity::Warning,
                _ => Severity::Info,
            },
            message: d.formatted_message.unwrap_or(d.message),
        })
        .collect();

    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        return Err(fail(diagnostics));
    }

    for warning in &diagnostics {
        tracing::warn!(source = %source.path, "{}", warning.message.trim());
    }

    let mut contracts = Vec::new();
    for (name, contract) in output.contracts.into_iter().flat_map(|(_, c)| c) {
        let bytecode = crate::utils::unhex(&contract.evm.bytecode.object).ok_or_else(|| {
            fail(vec![Diagnostic::error(format!("bytecode of {name} isn't hex"))])
        })?;

        contracts.push(CompiledContract {
            name,
            bytecode,
            abi: contract.abi,
        });
    }

    Ok(CompilerOutput { contracts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn unit() -> SourceUnit {
        SourceUnit::new("contracts/Counter.sol", "pragma solidity 0.7.6; contract Counter {}")
    }

    #[test]
    fn test_standard_input_passes_optimizer_through() {
        let optimizer = OptimizerSettings {
            enabled: true,
            runs: NonZeroU32::new(2000).unwrap(),
        };
        let input = standard_input(&unit(), &optimizer);

        assert_eq!(input["settings"]["optimizer"], json!({ "enabled": true, "runs": 2000 }));
        assert!(input["sources"]["contracts/Counter.sol"]["content"].is_string());
    }

    #[test]
    fn test_parse_output() {
        let stdout = json!({
            "errors": [{ "severity": "warning", "message": "unused variable" }],
            "contracts": {
                "contracts/Counter.sol": {
                    "Counter": {
                        "abi": [{ "type": "function", "name": "increment" }],
                        "evm": { "bytecode": { "object": "6080" } }
                    }
                }
            }
        });

        let output = parse_output(&unit(), &Version::new(0, 7, 6), stdout.to_string().as_bytes()).unwrap();
        assert_eq!(output.contracts.len(), 1);
        assert_eq!(output.contracts[0].name, "Counter");
        assert_eq!(output.contracts[0].bytecode, vec![0x60, 0x80]);
    }

    #[test]
    fn test_parse_output_errors() {
        let stdout = json!({
            "errors": [{
                "severity": "error",
                "message": "Expected ';'",
                "formattedMessage": "ParserError: Expected ';'"
            }]
        });

        let err = parse_output(&unit(), &Version::new(0, 7, 6), stdout.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.diagnostics, vec![Diagnostic::error("ParserError: Expected ';'")]);
    }

    #[test]
    fn test_missing_binary() {
        let optimizer = OptimizerSettings {
            enabled: false,
            runs: NonZeroU32::new(200).unwrap(),
        };
        let err = SolcInstallation::new()
            .compile(&unit(), &Version::new(0, 7, 6), &optimizer)
            .unwrap_err();
        assert!(err.diagnostics[0].message.contains("not installed"));
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        for name in ["solc-0.7.6", "solc-v0.8.19", "solc-nightly", "README"] {
            std::fs::write(root.join(name), "").unwrap();
        }

        let installation = SolcInstallation::discover(root).unwrap();
        let versions: Vec<_> = installation.versions().map(Version::to_string).collect();
        assert_eq!(versions, vec!["0.7.6", "0.8.19"]);
    }
}
