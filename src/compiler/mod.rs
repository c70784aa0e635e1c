//! Compiler selection, invocation and artifact caching.

mod cache;
mod pragma;
mod solc;

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{ProjectPaths, SoliditySettings};
use crate::core::{Blake3Hasher, Hash32};
use crate::error::{CompileError, CompilerError};

pub use cache::{ArtifactCache, CacheStatus, DiskStore};
pub use pragma::{VersionConstraint, find_pragma};
pub use solc::SolcInstallation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub enabled: bool,
    pub runs: NonZeroU32,
}

/// A compiler version together with the settings it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompilerSetting {
    pub version: Version,
    pub optimizer: OptimizerSettings,
}

impl CompilerSetting {
    pub fn new(version: Version, optimizer: OptimizerSettings) -> Self {
        Self { version, optimizer }
    }
}

impl fmt::Display for CompilerSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.optimizer.enabled {
            true => write!(f, "{} (optimizer, {} runs)", self.version, self.optimizer.runs),
            false => write!(f, "{} (no optimizer)", self.version),
        }
    }
}

/// One source file, with its path relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub path: Utf8PathBuf,
    pub content: Arc<str>,
}

impl SourceUnit {
    pub fn new(path: impl Into<Utf8PathBuf>, content: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Fingerprint of the path and text of this source.
    pub fn hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::new("smelter-source");
        hasher
            .field(self.path.as_str().as_bytes())
            .field(self.content.as_bytes());
        Hash32::from(hasher)
    }

    /// The version constraint from this file's `pragma solidity`, if any.
    pub fn declared_constraint(&self) -> Result<Option<VersionConstraint>, CompilerError> {
        let Some(pragma) = find_pragma(&self.content) else {
            return Ok(None);
        };

        VersionConstraint::parse(pragma)
            .map(Some)
            .map_err(|reason| CompilerError::InvalidPragma {
                file: self.path.clone(),
                pragma: pragma.to_owned(),
                reason,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledContract {
    pub name: String,
    pub bytecode: Vec<u8>,
    /// The interface descriptor (ABI) as emitted by the compiler.
    pub abi: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompilerOutput {
    pub contracts: Vec<CompiledContract>,
}

/// The external compiler.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        source: &SourceUnit,
        version: &Version,
        optimizer: &OptimizerSettings,
    ) -> Result<CompilerOutput, CompileError>;
}

/// One compiled contract and everything needed to tell whether it is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationArtifact {
    pub source: Utf8PathBuf,
    pub source_hash: Hash32,
    pub setting: CompilerSetting,
    pub contract: String,
    pub bytecode: Vec<u8>,
    pub abi: Value,
}

impl CompilationArtifact {
    /// The JSON document written to the artifacts directory.
    pub fn to_json(&self) -> Value {
        json!({
            "contractName": self.contract,
            "sourceName": self.source,
            "sourceHash": self.source_hash,
            "compiler": {
                "version": self.setting.version.to_string(),
                "optimizer": self.setting.optimizer,
            },
            "abi": self.abi,
            "bytecode": format!("0x{}", crate::utils::hex(&self.bytecode)),
        })
    }

    /// `<source path>/<contract>.json`, relative to the artifacts directory.
    pub fn relative_path(&self) -> Utf8PathBuf {
        self.source.join(&self.contract).with_extension("json")
    }
}

/// Result of [`CompilerManager::compile_project`].
#[derive(Debug, Clone, Default)]
pub struct ProjectOutput {
    /// Sorted by source path, then contract name.
    pub artifacts: Vec<CompilationArtifact>,
    /// Sources that went through the external compiler.
    pub compiled: usize,
    /// Sources answered by the cache.
    pub cached: usize,
}

impl ProjectOutput {
    pub fn artifact(&self, contract: &str) -> Option<&CompilationArtifact> {
        self.artifacts.iter().find(|a| a.contract == contract)
    }
}

fn cache_key(source: &SourceUnit, setting: &CompilerSetting) -> Hash32 {
    let mut hasher = Blake3Hasher::new("smelter-artifact");
    hasher
        .field(source.path.as_str().as_bytes())
        .field(source.content.as_bytes())
        .field(setting.version.to_string().as_bytes())
        .field(&[setting.optimizer.enabled as u8])
        .field(&setting.optimizer.runs.get().to_le_bytes());
    Hash32::from(hasher)
}

/// Owns compiler selection and the artifact cache for one process.
pub struct CompilerManager {
    settings: SoliditySettings,
    compiler: Arc<dyn Compiler>,
    cache: ArtifactCache,
}

impl CompilerManager {
    pub fn new(settings: SoliditySettings, compiler: Arc<dyn Compiler>, cache: ArtifactCache) -> Self {
        Self {
            settings,
            compiler,
            cache,
        }
    }

    pub fn settings(&self) -> &SoliditySettings {
        &self.settings
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    fn versions(&self) -> Vec<Version> {
        self.settings
            .compilers
            .iter()
            .map(|s| s.version.clone())
            .collect()
    }

    /// Picks the setting a source compiles with.
    ///
    /// An explicit override for the path wins. Otherwise the file's pragma
    /// is matched against the registered compilers and the highest matching
    /// version is chosen; a file without a pragma uses the first registered
    /// compiler.
    pub fn bind(&self, source: &SourceUnit) -> Result<&CompilerSetting, CompilerError> {
        if let Some(setting) = self.settings.overrides.get(&source.path) {
            return Ok(setting);
        }

        let constraint = source.declared_constraint()?;

        let chosen = match &constraint {
            Some(constraint) => self
                .settings
                .compilers
                .iter()
                .filter(|s| constraint.matches(&s.version))
                // max_by keeps the last maximum; reversing keeps the first
                // declared setting among equal versions.
                .rev()
                .max_by(|a, b| a.version.cmp(&b.version)),
            None => self.settings.compilers.first(),
        };

        chosen.ok_or_else(|| CompilerError::NoMatchingCompiler {
            file: source.path.clone(),
            constraint: constraint.map(|c| c.as_str().to_owned()),
            available: self.versions(),
        })
    }

    fn compile_unit(
        &self,
        source: &SourceUnit,
        setting: &CompilerSetting,
    ) -> Result<(cache::Artifacts, CacheStatus), CompileError> {
        let key = cache_key(source, setting);

        self.cache.get_or_compile(key, || {
            tracing::debug!(source = %source.path, %setting, %key, "invoking compiler");

            let output = self
                .compiler
                .compile(source, &setting.version, &setting.optimizer)?;
            let source_hash = source.hash();

            Ok(output
                .contracts
                .into_iter()
                .map(|contract| CompilationArtifact {
                    source: source.path.clone(),
                    source_hash,
                    setting: setting.clone(),
                    contract: contract.name,
                    bytecode: contract.bytecode,
                    abi: contract.abi,
                })
                .collect())
        })
    }

    /// Compiles `sources` with one setting. Sources are compiled in
    /// parallel; artifacts come back in source order.
    pub fn compile(
        &self,
        sources: &[SourceUnit],
        setting: &CompilerSetting,
    ) -> Result<Vec<CompilationArtifact>, CompilerError> {
        let results = sources
            .par_iter()
            .map(|source| self.compile_unit(source, setting))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(results
            .into_iter()
            .flat_map(|(artifacts, _)| artifacts.to_vec())
            .collect())
    }

    /// Binds every source to a setting and compiles each group.
    pub fn compile_project(&self, sources: &[SourceUnit]) -> Result<ProjectOutput, CompilerError> {
        let mut groups: Vec<(&CompilerSetting, Vec<&SourceUnit>)> = Vec::new();

        for source in sources {
            let setting = self.bind(source)?;
            match groups.iter_mut().find(|(s, _)| *s == setting) {
                Some((_, members)) => members.push(source),
                None => groups.push((setting, vec![source])),
            }
        }

        for (setting, members) in &groups {
            tracing::info!(%setting, sources = members.len(), "compiling group");
        }

        let results = groups
            .par_iter()
            .flat_map_iter(|(setting, members)| {
                members
                    .iter()
                    .map(move |source| self.compile_unit(source, setting))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = ProjectOutput::default();
        for (artifacts, status) in results {
            match status.is_hit() {
                true => output.cached += 1,
                false => output.compiled += 1,
            }
            output.artifacts.extend(artifacts.iter().cloned());
        }

        output
            .artifacts
            .sort_by(|a, b| (&a.source, &a.contract).cmp(&(&b.source, &b.contract)));

        Ok(output)
    }
}

/// Reads every `*.sol` file under the sources directory. Paths in the result
/// are relative to the project root.
pub fn discover_sources(paths: &ProjectPaths) -> std::io::Result<Vec<SourceUnit>> {
    let pattern = paths.sources_dir().join("**").join("*.sol");
    let entries = glob::glob(pattern.as_str()).map_err(std::io::Error::other)?;

    let mut sources = Vec::new();
    for entry in entries {
        let path = entry.map_err(glob::GlobError::into_error)?;
        let path = Utf8PathBuf::try_from(path).map_err(std::io::Error::other)?;
        let content = std::fs::read_to_string(&path)?;
        let relative = relative_to(&path, &paths.root);

        sources.push(SourceUnit::new(relative, content));
    }

    sources.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(sources)
}

fn relative_to(path: &Utf8Path, root: &Utf8Path) -> Utf8PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_owned()
}
