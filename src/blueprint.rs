use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use crate::compiler::{ArtifactCache, Compiler, CompilerManager, SolcInstallation};
use crate::config::{ConfigResolver, Configuration, framework_defaults, framework_schema, merge};
use crate::core::CancellationToken;
use crate::engine::{Environment, RunReport, TaskArgs, TaskGraph, TaskGraphBuilder};
use crate::error::{PluginError, SmelterError, classify};
use crate::harness::TestHarness;
use crate::network::{NetworkClient, NetworkDefinition, NetworkRegistry, RetryPolicy, Transport};
use crate::plugin::{Builtin, Etherscan, Plugin, PluginRegistry};
use crate::verify::Verifier;

type TaskHook = Box<dyn FnOnce(&mut TaskGraphBuilder)>;

/// The blueprint for one build invocation.
///
/// `Blueprint` collects plugins, the user's configuration and the external
/// collaborators. Once set up, [`finish`](Self::finish) freezes it into a
/// [`Runtime`], failing on the first configuration, network or task graph
/// problem, before any task runs.
///
/// # Example
///
/// ```rust,no_run
/// use smelter::Blueprint;
/// use serde_json::json;
///
/// let mut blueprint = Blueprint::new();
/// blueprint.user_config(json!({
///     "solidity": {
///         "version": "0.7.6",
///         "settings": { "optimizer": { "enabled": true, "runs": 2000 } }
///     }
/// }));
///
/// let runtime = blueprint.finish().unwrap();
/// let status = runtime.run_task("compile", &Default::default(), None);
/// std::process::exit(status);
/// ```
pub struct Blueprint {
    plugins: PluginRegistry,
    errors: Vec<PluginError>,
    tasks: Vec<TaskHook>,
    user: Value,
    root: Option<Utf8PathBuf>,
    compiler: Option<Arc<dyn Compiler>>,
    transport: Option<Arc<dyn Transport>>,
    verifier: Option<Arc<dyn Verifier>>,
    harness: Option<Arc<dyn TestHarness>>,
    retry: RetryPolicy,
    durable_cache: bool,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Blueprint {
    /// A blueprint with the `builtin` and `etherscan` plugins registered.
    pub fn new() -> Self {
        let mut blueprint = Self::bare();
        blueprint.plugin(Builtin).plugin(Etherscan);
        blueprint
    }

    /// A blueprint without any plugin.
    pub fn bare() -> Self {
        Self {
            plugins: PluginRegistry::new(),
            errors: Vec::new(),
            tasks: Vec::new(),
            user: Value::Null,
            root: None,
            compiler: None,
            transport: None,
            verifier: None,
            harness: None,
            retry: RetryPolicy::default(),
            durable_cache: true,
        }
    }

    /// Registers a plugin after the ones already registered.
    pub fn plugin(&mut self, plugin: impl Plugin + 'static) -> &mut Self {
        if let Err(err) = self.plugins.register(plugin) {
            self.errors.push(err);
        }
        self
    }

    /// Defines or overrides tasks after every plugin has contributed its own.
    pub fn tasks(&mut self, define: impl FnOnce(&mut TaskGraphBuilder) + 'static) -> &mut Self {
        self.tasks.push(Box::new(define));
        self
    }

    /// The user's configuration layer, already substituted.
    pub fn user_config(&mut self, user: Value) -> &mut Self {
        self.user = user;
        self
    }

    /// Project root; wins over `paths.root` in the user's configuration.
    pub fn root(&mut self, root: impl Into<Utf8PathBuf>) -> &mut Self {
        self.root = Some(root.into());
        self
    }

    /// The external compiler. Defaults to the `solc-<version>` binaries
    /// found in `<paths.cache>/compilers`.
    pub fn compiler(&mut self, compiler: Arc<dyn Compiler>) -> &mut Self {
        self.compiler = Some(compiler);
        self
    }

    /// RPC transport for every network other than the simulated one.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    pub fn verifier(&mut self, verifier: Arc<dyn Verifier>) -> &mut Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn harness(&mut self, harness: Arc<dyn TestHarness>) -> &mut Self {
        self.harness = Some(harness);
        self
    }

    pub fn retry(&mut self, retry: RetryPolicy) -> &mut Self {
        self.retry = retry;
        self
    }

    /// Whether compiled artifacts persist in `<paths.cache>/artifacts`
    /// between runs. On by default.
    pub fn durable_cache(&mut self, durable: bool) -> &mut Self {
        self.durable_cache = durable;
        self
    }

    /// Registers plugins, resolves the configuration, registers networks and
    /// finalizes the task graph, in that order.
    pub fn finish(self) -> Result<Runtime, SmelterError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err.into());
        }

        let mut schema = framework_schema();
        schema.extend(self.plugins.schema());

        let mut user = self.user;
        if let Some(root) = &self.root
            && (user.is_object() || user.is_null())
        {
            merge::overlay(&mut user, &json!({ "paths": { "root": root } }));
        }

        let config = ConfigResolver::new(schema).resolve(
            &framework_defaults(),
            &self.plugins.defaults(),
            &user,
        )?;

        let mut networks = NetworkRegistry::new();
        for network in self.plugins.networks(&config) {
            networks.register(network)?;
        }
        for network in config.networks() {
            networks.register(network.clone())?;
        }

        // An unknown default network is a configuration problem, caught
        // before anything runs.
        networks.resolve_active(&config, None)?;

        let mut builder = TaskGraphBuilder::new();
        self.plugins.contribute_tasks(&mut builder);
        for define in self.tasks {
            define(&mut builder);
        }
        let graph = builder.finalize()?;

        let paths = config.paths();
        let compiler: Arc<dyn Compiler> = match self.compiler {
            Some(compiler) => compiler,
            None => Arc::new(SolcInstallation::discover(paths.cache_dir().join("compilers"))?),
        };
        let cache = match self.durable_cache {
            true => ArtifactCache::durable(paths.cache_dir()),
            false => ArtifactCache::in_memory(),
        };
        let compilers = CompilerManager::new(config.solidity().clone(), compiler, cache);

        let cancel = CancellationToken::new();
        let rpc = NetworkClient::new(self.transport, self.retry).with_cancellation(cancel.clone());

        tracing::debug!(
            plugins = self.plugins.len(),
            networks = networks.len(),
            tasks = graph.len(),
            "runtime ready"
        );

        Ok(Runtime {
            plugins: self.plugins,
            config,
            networks,
            graph,
            compilers: Arc::new(compilers),
            rpc,
            verifier: self.verifier,
            harness: self.harness,
            cancel,
        })
    }
}

/// A resolved configuration, its networks and a frozen task graph, ready to
/// run tasks.
pub struct Runtime {
    plugins: PluginRegistry,
    config: Configuration,
    networks: NetworkRegistry,
    graph: TaskGraph,
    compilers: Arc<CompilerManager>,
    rpc: NetworkClient,
    verifier: Option<Arc<dyn Verifier>>,
    harness: Option<Arc<dyn TestHarness>>,
    cancel: CancellationToken,
}

impl Runtime {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn compilers(&self) -> &CompilerManager {
        &self.compilers
    }

    pub fn rpc(&self) -> &NetworkClient {
        &self.rpc
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Every task with its description, in declaration order.
    pub fn tasks(&self) -> Vec<(&str, &str)> {
        self.graph.list()
    }

    /// Cancelling this token stops every run of this runtime from starting
    /// new tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The network a run would use with the given override.
    pub fn active_network(&self, selected: Option<&str>) -> Result<&NetworkDefinition, SmelterError> {
        Ok(self.networks.resolve_active(&self.config, selected)?)
    }

    /// Runs `task` and everything it depends on.
    pub fn run(
        &self,
        task: &str,
        args: &TaskArgs,
        network: Option<&str>,
    ) -> Result<RunReport, SmelterError> {
        let network = self.active_network(network)?.clone();

        tracing::info!(task, network = %network.name, "Running {}", console::style(task).bold());

        let env = Environment {
            config: self.config.clone(),
            network,
            compilers: self.compilers.clone(),
            rpc: self.rpc.clone(),
            verifier: self.verifier.clone(),
            harness: self.harness.clone(),
        };

        Ok(crate::engine::run(&self.graph, task, args, &env, &self.cancel)?)
    }

    /// Runs `task` and turns the outcome into a process exit status: `0` if
    /// the task succeeded, otherwise the classification of the first
    /// failure (see [`exit`](crate::error::exit)).
    pub fn run_task(&self, task: &str, args: &TaskArgs, network: Option<&str>) -> i32 {
        match self.run(task, args, network) {
            Ok(report) => {
                if !report.succeeded() {
                    tracing::error!("\n{report}");
                }
                report.exit_code()
            }
            Err(err) => {
                tracing::error!("{err}");
                classify(&anyhow::Error::new(err))
            }
        }
    }
}
