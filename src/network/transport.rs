use std::sync::Arc;
use std::time::Duration;

use crate::core::{CancellationToken, Hash32};
use crate::error::RpcError;
use crate::network::{Endpoint, GasPolicy, NetworkDefinition, SimulatedChain};

/// A transaction ready to be submitted. Signing itself is left to the
/// transport, which holds the key material for `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub chain_id: u64,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub data: Vec<u8>,
    pub gas: GasPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: Hash32,
    pub contract_address: Option<String>,
    pub block_number: u64,
    pub gas_used: u64,
}

/// The RPC collaborator for an external network.
pub trait Transport: Send + Sync {
    /// Submits a transaction and waits for its receipt.
    fn send_transaction(
        &self,
        network: &NetworkDefinition,
        transaction: &SignedTransaction,
    ) -> Result<Receipt, RpcError>;

    /// Reads the deployed code at `address`. Empty when nothing is deployed.
    fn get_code(&self, network: &NetworkDefinition, address: &str) -> Result<Vec<u8>, RpcError>;
}

/// Bounded exponential backoff for idempotent RPC reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }

    fn run<T>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
        mut operation: impl FnMut() -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if attempt >= attempts || cancel.is_cancelled() {
                tracing::warn!(endpoint, attempt, error = %err, "RPC read exhausted retries");
                return Err(RpcError::Exhausted {
                    endpoint: endpoint.to_owned(),
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            tracing::debug!(endpoint, attempt, ?delay, error = %err, "retrying RPC read");
            std::thread::sleep(delay);
            delay = self.next_delay(delay);
        }
    }
}

/// Routes RPC calls to the right collaborator for a network.
///
/// The simulated network is always served in-process. Every other network
/// goes through the external [`Transport`], if one was supplied.
#[derive(Clone)]
pub struct NetworkClient {
    simulated: SimulatedChain,
    external: Option<Arc<dyn Transport>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl NetworkClient {
    pub fn new(external: Option<Arc<dyn Transport>>, retry: RetryPolicy) -> Self {
        Self {
            simulated: SimulatedChain::new(),
            external,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn simulated(&self) -> &SimulatedChain {
        &self.simulated
    }

    fn transport(&self, network: &NetworkDefinition) -> Result<&dyn Transport, RpcError> {
        match &network.endpoint {
            Endpoint::InProcess => Ok(&self.simulated),
            Endpoint::Url(_) => self
                .external
                .as_deref()
                .ok_or_else(|| RpcError::NoTransport(network.name.clone())),
        }
    }

    /// Submits a transaction. Submission is not idempotent and is never
    /// retried.
    pub fn send_transaction(
        &self,
        network: &NetworkDefinition,
        transaction: &SignedTransaction,
    ) -> Result<Receipt, RpcError> {
        let transport = self.transport(network)?;
        tracing::debug!(network = %network.name, from = %transaction.from, "sending transaction");
        transport.send_transaction(network, transaction)
    }

    /// Reads deployed code, retrying transient failures.
    pub fn get_code(&self, network: &NetworkDefinition, address: &str) -> Result<Vec<u8>, RpcError> {
        let transport = self.transport(network)?;
        let endpoint = network.endpoint.to_string();
        self.retry
            .run(&endpoint, &self.cancel, || transport.get_code(network, address))
    }

    /// Builds and sends a contract creation transaction from the network's
    /// first signer.
    pub fn deploy(&self, network: &NetworkDefinition, bytecode: &[u8]) -> Result<Receipt, RpcError> {
        let from = network
            .signers
            .first()
            .ok_or_else(|| RpcError::NoSigner(network.name.clone()))?;

        let transaction = SignedTransaction {
            chain_id: network.chain_id,
            from: from.clone(),
            to: None,
            data: bytecode.to_vec(),
            gas: network.gas,
        };

        self.send_transaction(network, &transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    fn external() -> NetworkDefinition {
        NetworkDefinition {
            name: "sepolia".into(),
            endpoint: Endpoint::Url("https://sepolia.example".into()),
            chain_id: 11155111,
            signers: vec!["0xabc".into()],
            gas: GasPolicy::default(),
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_simulated_never_reaches_external() {
        let recording = Arc::new(RecordingTransport::default());
        let client = NetworkClient::new(Some(recording.clone()), quick());
        let network = NetworkDefinition::simulated();

        let receipt = client.deploy(&network, &[0x60, 0x80]).unwrap();
        let address = receipt.contract_address.unwrap();

        assert_eq!(client.get_code(&network, &address).unwrap(), vec![0x60, 0x80]);
        assert_eq!(recording.calls(), 0);
    }

    #[test]
    fn test_missing_transport() {
        let client = NetworkClient::new(None, quick());
        assert_eq!(
            client.get_code(&external(), "0x00"),
            Err(RpcError::NoTransport("sepolia".into()))
        );
    }

    #[test]
    fn test_reads_are_retried() {
        let recording = Arc::new(RecordingTransport::failing_reads(2));
        let client = NetworkClient::new(Some(recording.clone()), quick());

        assert_eq!(client.get_code(&external(), "0x00").unwrap(), Vec::<u8>::new());
        assert_eq!(recording.calls(), 3);
    }

    #[test]
    fn test_retries_are_bounded() {
        let recording = Arc::new(RecordingTransport::failing_reads(10));
        let client = NetworkClient::new(Some(recording.clone()), quick());

        let err = client.get_code(&external(), "0x00").unwrap_err();
        assert!(matches!(err, RpcError::Exhausted { attempts: 3, .. }));
        assert_eq!(recording.calls(), 3);
    }

    #[test]
    fn test_sends_are_not_retried() {
        let recording = Arc::new(RecordingTransport::failing_sends());
        let client = NetworkClient::new(Some(recording.clone()), quick());

        let err = client.deploy(&external(), &[0x00]).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(recording.calls(), 1);
    }

    #[test]
    fn test_deploy_needs_a_signer() {
        let client = NetworkClient::new(Some(Arc::new(RecordingTransport::default())), quick());
        let mut network = external();
        network.signers.clear();

        assert_eq!(
            client.deploy(&network, &[]),
            Err(RpcError::NoSigner("sepolia".into()))
        );
    }
}
