use crate::compiler::CompilationArtifact;
use crate::network::{NetworkClient, NetworkDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestSummary {
    pub passed: usize,
    pub failed: usize,
}

/// Runs a project's tests against compiled artifacts on the active network.
pub trait TestHarness: Send + Sync {
    fn run_tests(
        &self,
        artifacts: &[CompilationArtifact],
        network: &NetworkDefinition,
        rpc: &NetworkClient,
    ) -> anyhow::Result<TestSummary>;
}
