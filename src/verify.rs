use crate::compiler::CompilationArtifact;
use crate::error::VerificationError;
use crate::network::NetworkDefinition;

/// A contract verification service, such as a block explorer's source
/// verification API. Only ever invoked by an explicit task.
pub trait Verifier: Send + Sync {
    /// Submits `artifact`, deployed at `address` on `network`, for
    /// verification. Returns the service's reference for the submission.
    fn verify(
        &self,
        artifact: &CompilationArtifact,
        address: &str,
        network: &NetworkDefinition,
        api_key: &str,
    ) -> Result<String, VerificationError>;
}
