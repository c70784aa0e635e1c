//! Collaborator doubles shared by the unit tests.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use semver::Version;
use serde_json::{Value, json};

use crate::compiler::{
    ArtifactCache, CompilationArtifact, CompiledContract, Compiler, CompilerManager,
    CompilerOutput, CompilerSetting, OptimizerSettings, SourceUnit,
};
use crate::config::{ConfigResolver, framework_defaults};
use crate::core::{Blake3Hasher, Hash32};
use crate::engine::Environment;
use crate::error::{CompileError, Diagnostic, RpcError, VerificationError};
use crate::harness::{TestHarness, TestSummary};
use crate::network::{
    NetworkClient, NetworkDefinition, Receipt, RetryPolicy, SignedTransaction, Transport,
};
use crate::verify::Verifier;

/// Contract names declared with `contract <Name>` in `content`.
fn declared_contracts(content: &str) -> Vec<String> {
    let mut words = content.split_whitespace();
    let mut names = Vec::new();

    while let Some(word) = words.next() {
        if word == "contract"
            && let Some(name) = words.next()
        {
            let name: String = name
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                names.push(name);
            }
        }
    }

    names
}

/// A compiler that counts its invocations. Sources containing `#error` fail;
/// every `contract X` becomes one contract with bytecode derived from the
/// input.
#[derive(Default)]
pub struct CountingCompiler {
    calls: AtomicUsize,
    seen: Mutex<Vec<(Version, OptimizerSettings)>>,
}

impl CountingCompiler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(Version, OptimizerSettings)> {
        self.seen.lock().unwrap().clone()
    }
}

impl Compiler for CountingCompiler {
    fn compile(
        &self,
        source: &SourceUnit,
        version: &Version,
        optimizer: &OptimizerSettings,
    ) -> Result<CompilerOutput, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((version.clone(), *optimizer));

        if source.content.contains("#error") {
            return Err(CompileError {
                file: source.path.clone(),
                version: version.clone(),
                diagnostics: vec![Diagnostic::error("ParserError: Expected pragma")],
            });
        }

        let contracts = declared_contracts(&source.content)
            .into_iter()
            .map(|name| {
                let mut hasher = Blake3Hasher::new("counting-compiler");
                hasher
                    .field(name.as_bytes())
                    .field(source.content.as_bytes())
                    .field(version.to_string().as_bytes())
                    .field(&[optimizer.enabled as u8])
                    .field(&optimizer.runs.get().to_le_bytes());

                let mut bytecode = vec![0x60, 0x80, 0x60, 0x40];
                bytecode.extend_from_slice(&Hash32::from(hasher).as_bytes()[..8]);

                CompiledContract {
                    name,
                    bytecode,
                    abi: json!([]),
                }
            })
            .collect();

        Ok(CompilerOutput { contracts })
    }
}

/// An external transport that records calls. Reads can be made to fail a
/// fixed number of times, sends can be made to always fail.
#[derive(Default)]
pub struct RecordingTransport {
    calls: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_sends: bool,
    sent: Mutex<Vec<SignedTransaction>>,
}

impl RecordingTransport {
    pub fn failing_reads(count: usize) -> Self {
        Self {
            failing_reads: AtomicUsize::new(count),
            ..Self::default()
        }
    }

    pub fn failing_sends() -> Self {
        Self {
            failing_sends: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SignedTransaction> {
        self.sent.lock().unwrap().clone()
    }

    fn unreachable(network: &NetworkDefinition) -> RpcError {
        RpcError::Transport {
            endpoint: network.endpoint.to_string(),
            message: "connection refused".into(),
        }
    }
}

impl Transport for RecordingTransport {
    fn send_transaction(
        &self,
        network: &NetworkDefinition,
        transaction: &SignedTransaction,
    ) -> Result<Receipt, RpcError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_sends {
            return Err(Self::unreachable(network));
        }

        self.sent.lock().unwrap().push(transaction.clone());

        Ok(Receipt {
            transaction_hash: Hash32::hash(&transaction.data),
            contract_address: transaction
                .to
                .is_none()
                .then(|| format!("0x{:040x}", count + 1)),
            block_number: count as u64 + 1,
            gas_used: 21_000,
        })
    }

    fn get_code(&self, network: &NetworkDefinition, _: &str) -> Result<Vec<u8>, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_reads.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unreachable(network));
        }

        Ok(Vec::new())
    }
}

/// A verifier that accepts everything and remembers what it was given.
#[derive(Default)]
pub struct RecordingVerifier {
    pub submissions: Mutex<Vec<(String, String, String)>>,
}

impl Verifier for RecordingVerifier {
    fn verify(
        &self,
        artifact: &CompilationArtifact,
        address: &str,
        network: &NetworkDefinition,
        _: &str,
    ) -> Result<String, VerificationError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((artifact.contract.clone(), address.to_owned(), network.name.clone()));
        Ok(format!("guid-{}", submissions.len()))
    }
}

/// A harness that passes one test per artifact and counts its runs.
#[derive(Default)]
pub struct CountingHarness {
    pub runs: AtomicUsize,
}

impl TestHarness for CountingHarness {
    fn run_tests(
        &self,
        artifacts: &[CompilationArtifact],
        _: &NetworkDefinition,
        _: &NetworkClient,
    ) -> anyhow::Result<TestSummary> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(TestSummary {
            passed: artifacts.len(),
            failed: 0,
        })
    }
}

/// A compiled artifact for `contracts/<name>.sol`.
pub fn artifact(name: &str) -> CompilationArtifact {
    CompilationArtifact {
        source: format!("contracts/{name}.sol").into(),
        source_hash: Hash32::hash(name),
        setting: CompilerSetting::new(
            Version::new(0, 8, 19),
            OptimizerSettings {
                enabled: false,
                runs: NonZeroU32::new(200).unwrap(),
            },
        ),
        contract: name.to_owned(),
        bytecode: vec![0x60, 0x80, 0x60, 0x40, 0x52],
        abi: json!([{ "type": "constructor", "inputs": [] }]),
    }
}

/// Defaults-only configuration on the simulated network, with a counting
/// compiler and no external collaborators.
pub fn environment() -> Environment {
    let config = ConfigResolver::default()
        .resolve(&framework_defaults(), &[], &Value::Null)
        .unwrap();

    let compilers = CompilerManager::new(
        config.solidity().clone(),
        Arc::new(CountingCompiler::default()),
        ArtifactCache::in_memory(),
    );

    Environment {
        config,
        network: NetworkDefinition::simulated(),
        compilers: Arc::new(compilers),
        rpc: NetworkClient::new(None, RetryPolicy::none()),
        verifier: None,
        harness: None,
    }
}
