use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::RpcError;
use crate::network::{GasSetting, NetworkDefinition, Receipt, SignedTransaction, Transport};

const BASE_GAS: u64 = 21_000;
const CREATE_GAS: u64 = 32_000;
const BYTE_GAS: u64 = 16;

/// Address of the `index`-th development account of the simulated network.
pub(super) fn dev_account(index: usize) -> String {
    let mut hasher = Blake3Hasher::new("smelter-dev-account");
    hasher.field(&(index as u64).to_le_bytes());
    address(Hash32::from(hasher))
}

fn address(hash: Hash32) -> String {
    format!("0x{}", crate::utils::hex(&hash.as_bytes()[..20]))
}

#[derive(Debug, Default)]
struct ChainState {
    block_number: u64,
    nonces: HashMap<String, u64>,
    code: HashMap<String, Vec<u8>>,
}

/// An in-process chain backing the `simulated` network.
///
/// State lives for the lifetime of the value and is shared between clones.
/// Addresses and hashes are derived deterministically from sender and nonce.
#[derive(Debug, Clone, Default)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).block_number
    }

    pub fn nonce(&self, account: &str) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .nonces
            .get(account)
            .copied()
            .unwrap_or(0)
    }
}

impl Transport for SimulatedChain {
    fn send_transaction(
        &self,
        network: &NetworkDefinition,
        transaction: &SignedTransaction,
    ) -> Result<Receipt, RpcError> {
        let reject = |message: String| RpcError::Rejected {
            endpoint: network.endpoint.to_string(),
            message,
        };

        if transaction.chain_id != network.chain_id {
            return Err(reject(format!(
                "chain id {} does not match {}",
                transaction.chain_id, network.chain_id
            )));
        }

        if !network.signers.contains(&transaction.from) {
            return Err(reject(format!("unknown account {}", transaction.from)));
        }

        let mut gas_used = BASE_GAS + BYTE_GAS * transaction.data.len() as u64;
        if transaction.to.is_none() {
            gas_used += CREATE_GAS;
        }

        if let GasSetting::Fixed(limit) = transaction.gas.limit
            && gas_used > limit
        {
            return Err(reject(format!("out of gas: needs {gas_used}, limit {limit}")));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let nonce = state.nonces.entry(transaction.from.clone()).or_default();
        let current = *nonce;
        *nonce += 1;

        let mut hasher = Blake3Hasher::new("smelter-simulated-tx");
        hasher
            .field(transaction.from.as_bytes())
            .field(&current.to_le_bytes())
            .field(&transaction.data);
        let transaction_hash = Hash32::from(hasher);

        let contract_address = match transaction.to {
            Some(_) => None,
            None => {
                let mut hasher = Blake3Hasher::new("smelter-simulated-create");
                hasher
                    .field(transaction.from.as_bytes())
                    .field(&current.to_le_bytes());
                let created = address(Hash32::from(hasher));
                state.code.insert(created.clone(), transaction.data.clone());
                Some(created)
            }
        };

        state.block_number += 1;

        Ok(Receipt {
            transaction_hash,
            contract_address,
            block_number: state.block_number,
            gas_used,
        })
    }

    fn get_code(&self, _: &NetworkDefinition, address: &str) -> Result<Vec<u8>, RpcError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.code.get(address).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::GasPolicy;

    fn create(network: &NetworkDefinition, data: &[u8]) -> SignedTransaction {
        SignedTransaction {
            chain_id: network.chain_id,
            from: network.signers[0].clone(),
            to: None,
            data: data.to_vec(),
            gas: GasPolicy::default(),
        }
    }

    #[test]
    fn test_dev_accounts_are_stable() {
        let a = NetworkDefinition::simulated();
        let b = NetworkDefinition::simulated();
        assert_eq!(a.signers, b.signers);
        assert_eq!(a.signers[0].len(), 42);
        assert_ne!(a.signers[0], a.signers[1]);
    }

    #[test]
    fn test_deploy_stores_code() {
        let chain = SimulatedChain::new();
        let network = NetworkDefinition::simulated();

        let first = chain.send_transaction(&network, &create(&network, b"\x60\x80")).unwrap();
        let second = chain.send_transaction(&network, &create(&network, b"\x60\x80")).unwrap();

        assert_ne!(first.contract_address, second.contract_address);
        assert_ne!(first.transaction_hash, second.transaction_hash);
        assert_eq!(second.block_number, 2);
        assert_eq!(chain.nonce(&network.signers[0]), 2);

        let address = first.contract_address.unwrap();
        assert_eq!(chain.get_code(&network, &address).unwrap(), b"\x60\x80");
        assert!(chain.get_code(&network, "0x00").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_foreign_sender_and_chain() {
        let chain = SimulatedChain::new();
        let network = NetworkDefinition::simulated();

        let mut tx = create(&network, &[]);
        tx.from = "0xdeadbeef".into();
        assert!(matches!(
            chain.send_transaction(&network, &tx),
            Err(RpcError::Rejected { .. })
        ));

        let mut tx = create(&network, &[]);
        tx.chain_id = 1;
        assert!(matches!(
            chain.send_transaction(&network, &tx),
            Err(RpcError::Rejected { .. })
        ));
        assert_eq!(chain.block_number(), 0);
    }

    #[test]
    fn test_gas_limit() {
        let chain = SimulatedChain::new();
        let network = NetworkDefinition::simulated();

        let mut tx = create(&network, &[0; 10]);
        tx.gas.limit = GasSetting::Fixed(BASE_GAS);
        assert!(chain.send_transaction(&network, &tx).is_err());
    }

    #[test]
    fn test_poisoned_state_keeps_serving() {
        let chain = SimulatedChain::new();
        let network = NetworkDefinition::simulated();

        let state = chain.state.clone();
        let poisoner = std::thread::spawn(move || {
            let _state = state.lock().unwrap();
            panic!("poison the chain");
        });
        assert!(poisoner.join().is_err());

        let receipt = chain.send_transaction(&network, &create(&network, b"\x60")).unwrap();
        assert_eq!(receipt.block_number, 1);
        assert_eq!(chain.block_number(), 1);
    }
}
