use std::fs;
use std::time::Instant;

use anyhow::{Context, anyhow};
use camino::Utf8Path;

use crate::compiler::{CompilationArtifact, ProjectOutput, discover_sources};
use crate::core::Hash32;
use crate::engine::{TaskContext, TaskGraphBuilder};
use crate::harness::TestSummary;
use crate::plugin::Plugin;

/// One contract creation sent by the `deploy` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub contract: String,
    pub address: String,
    pub transaction_hash: Hash32,
    pub block_number: u64,
}

/// The framework's own tasks: `clean`, `compile`, `test` and `deploy`.
pub struct Builtin;

impl Plugin for Builtin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn tasks(&self, tasks: &mut TaskGraphBuilder) {
        tasks
            .define("clean")
            .describe("Removes compiled artifacts and the compilation cache")
            .run(clean);

        tasks
            .define("compile")
            .describe("Compiles every source file of the project")
            .run(compile);

        tasks
            .define("test")
            .describe("Runs the project's tests on the active network")
            .depends_on("compile")
            .run(test);

        tasks
            .define("deploy")
            .describe("Deploys compiled contracts to the active network")
            .depends_on("compile")
            .run(deploy);
    }
}

fn remove_dir(dir: &Utf8Path) -> anyhow::Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Couldn't remove '{dir}'")),
    }
}

fn clean(ctx: &TaskContext<'_>) -> anyhow::Result<()> {
    let paths = ctx.config().paths();

    for dir in [paths.artifacts_dir(), paths.cache_dir()] {
        if remove_dir(&dir)? {
            tracing::info!(%dir, "removed");
        }
    }

    Ok(())
}

fn write_artifact(dir: &Utf8Path, artifact: &CompilationArtifact) -> anyhow::Result<()> {
    let path = dir.join(artifact.relative_path());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Couldn't create '{parent}'"))?;
    }

    let json = serde_json::to_vec_pretty(&artifact.to_json())?;
    fs::write(&path, json).with_context(|| format!("Couldn't write artifact '{path}'"))?;

    Ok(())
}

fn compile(ctx: &TaskContext<'_>) -> anyhow::Result<ProjectOutput> {
    let s = Instant::now();
    let paths = ctx.config().paths();

    let sources = discover_sources(paths)
        .with_context(|| format!("Couldn't read sources from '{}'", paths.sources_dir()))?;

    if sources.is_empty() {
        tracing::warn!(dir = %paths.sources_dir(), "no sources found");
    }

    let output = ctx.compilers().compile_project(&sources)?;

    let dir = paths.artifacts_dir();
    for artifact in &output.artifacts {
        write_artifact(&dir, artifact)?;
    }

    tracing::info!(
        compiled = output.compiled,
        cached = output.cached,
        artifacts = output.artifacts.len(),
        "Compiled {} sources {}",
        sources.len(),
        crate::utils::as_overhead(s)
    );

    Ok(output)
}

fn test(ctx: &TaskContext<'_>) -> anyhow::Result<TestSummary> {
    let compiled = ctx.dependency::<ProjectOutput>("compile")?;
    let harness = ctx
        .harness()
        .ok_or_else(|| anyhow!("No test harness is configured"))?;

    let summary = harness.run_tests(&compiled.artifacts, ctx.network(), ctx.rpc())?;
    tracing::info!(
        network = %ctx.network().name,
        passed = summary.passed,
        failed = summary.failed,
        "tests finished"
    );

    anyhow::ensure!(
        summary.failed == 0,
        "{} of {} tests failed",
        summary.failed,
        summary.passed + summary.failed
    );

    Ok(summary)
}

/// Deploys the contracts named in the comma-separated `contracts` argument,
/// or every contract with bytecode if the argument is absent.
fn deploy(ctx: &TaskContext<'_>) -> anyhow::Result<Vec<Deployment>> {
    let compiled = ctx.dependency::<ProjectOutput>("compile")?;
    let network = ctx.network();

    let selected: Vec<&CompilationArtifact> = match ctx.arg("contracts") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                compiled
                    .artifact(name)
                    .ok_or_else(|| anyhow!("Contract '{name}' was not compiled"))
            })
            .collect::<anyhow::Result<_>>()?,
        None => compiled
            .artifacts
            .iter()
            .filter(|a| !a.bytecode.is_empty())
            .collect(),
    };

    let mut deployments = Vec::with_capacity(selected.len());

    for artifact in selected {
        if ctx.is_cancelled() {
            anyhow::bail!("Deployment cancelled before '{}'", artifact.contract);
        }

        let receipt = ctx
            .rpc()
            .deploy(network, &artifact.bytecode)
            .with_context(|| format!("Couldn't deploy '{}' to '{}'", artifact.contract, network.name))?;

        let address = receipt
            .contract_address
            .ok_or_else(|| anyhow!("Receipt for '{}' has no contract address", artifact.contract))?;

        tracing::info!(
            contract = %artifact.contract,
            network = %network.name,
            %address,
            gas = receipt.gas_used,
            "deployed"
        );

        deployments.push(Deployment {
            contract: artifact.contract.clone(),
            address,
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        });
    }

    Ok(deployments)
}
