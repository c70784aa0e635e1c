//! Named target networks and selection of the active one.

mod simulated;
mod transport;

use std::fmt;

use crate::config::Configuration;
use crate::error::NetworkError;

pub use simulated::SimulatedChain;
pub use transport::{NetworkClient, Receipt, RetryPolicy, SignedTransaction, Transport};

/// Reserved name of the built-in in-process network.
pub const SIMULATED_NETWORK: &str = "simulated";

/// Chain id of the built-in in-process network.
pub const SIMULATED_CHAIN_ID: u64 = 31337;

const SIMULATED_ACCOUNTS: usize = 10;

/// Where the RPC collaborator for a network lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Served by [`SimulatedChain`] inside this process. Never touches the
    /// network.
    InProcess,
    /// An external JSON-RPC endpoint.
    Url(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::InProcess => f.write_str("in-process"),
            Endpoint::Url(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GasSetting {
    /// Let the node estimate.
    #[default]
    Auto,
    Fixed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GasPolicy {
    pub limit: GasSetting,
    pub price: GasSetting,
}

/// A named target environment for deployment and testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDefinition {
    pub name: String,
    pub endpoint: Endpoint,
    pub chain_id: u64,
    /// Account identifiers used to sign transactions, already substituted
    /// from whatever secret source provided them.
    pub signers: Vec<String>,
    pub gas: GasPolicy,
}

impl NetworkDefinition {
    /// The built-in simulated network: ten deterministic development
    /// accounts, automatic gas, zero external I/O.
    pub fn simulated() -> Self {
        Self {
            name: SIMULATED_NETWORK.into(),
            endpoint: Endpoint::InProcess,
            chain_id: SIMULATED_CHAIN_ID,
            signers: (0..SIMULATED_ACCOUNTS)
                .map(simulated::dev_account)
                .collect(),
            gas: GasPolicy::default(),
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.endpoint == Endpoint::InProcess
    }
}

/// Holds every known network, in registration order.
///
/// The simulated network is always present, registered first.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: Vec<NetworkDefinition>,
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self {
            networks: vec![NetworkDefinition::simulated()],
        }
    }

    pub fn register(&mut self, network: NetworkDefinition) -> Result<(), NetworkError> {
        if self.get(&network.name).is_some() {
            return Err(NetworkError::Duplicate(network.name));
        }

        tracing::debug!(network = %network.name, endpoint = %network.endpoint, "registered network");
        self.networks.push(network);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NetworkDefinition> {
        self.networks.iter().find(|network| network.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(|network| network.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Picks the network for a run.
    ///
    /// Precedence: `selected` (a run-time override), then the
    /// configuration's `defaultNetwork`, then the simulated network. A name
    /// that is given but not registered is an error; it never falls through
    /// to another network.
    pub fn resolve_active(
        &self,
        config: &Configuration,
        selected: Option<&str>,
    ) -> Result<&NetworkDefinition, NetworkError> {
        let name = selected
            .or(config.default_network())
            .unwrap_or(SIMULATED_NETWORK);

        self.get(name).ok_or_else(|| NetworkError::Unknown {
            name: name.to_owned(),
            available: self.names().map(str::to_owned).collect(),
        })
    }
}
