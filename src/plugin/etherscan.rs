use crate::compiler::ProjectOutput;
use crate::config::{ConfigSchema, ValueKind};
use crate::engine::{TaskContext, TaskGraphBuilder};
use crate::error::VerificationError;
use crate::plugin::Plugin;

/// Source verification through a block explorer. Adds the `verify` task,
/// which nothing depends on, so it only runs when asked for.
pub struct Etherscan;

impl Plugin for Etherscan {
    fn name(&self) -> &str {
        "etherscan"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("etherscan", ValueKind::Record)
            .optional("etherscan.apiKey", ValueKind::String)
    }

    fn tasks(&self, tasks: &mut TaskGraphBuilder) {
        tasks
            .define("verify")
            .describe("Verifies a deployed contract's source (args: contract, address)")
            .depends_on("compile")
            .run(verify);
    }
}

fn verify(ctx: &TaskContext<'_>) -> anyhow::Result<String> {
    let contract = ctx.require_arg("contract")?;
    let address = ctx.require_arg("address")?;
    let network = ctx.network();

    if network.is_simulated() {
        return Err(VerificationError::UnsupportedNetwork(network.name.clone()).into());
    }

    let api_key = ctx
        .config()
        .etherscan_api_key()
        .ok_or(VerificationError::MissingApiKey)?;

    let compiled = ctx.dependency::<ProjectOutput>("compile")?;
    let artifact = compiled
        .artifact(contract)
        .ok_or_else(|| VerificationError::UnknownContract(contract.to_owned()))?;

    let reference = ctx
        .verifier()?
        .verify(artifact, address, network, api_key)?;

    tracing::info!(%contract, %address, network = %network.name, %reference, "submitted for verification");

    Ok(reference)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8Path;
    use serde_json::{Value, json};

    use crate::Blueprint;
    use crate::engine::TaskArgs;
    use crate::error::exit;
    use crate::testing::{CountingCompiler, RecordingVerifier};

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("contracts")).unwrap();
        std::fs::write(dir.path().join("contracts/Counter.sol"), "contract Counter {}").unwrap();
        dir
    }

    fn config(api_key: Value) -> Value {
        json!({
            "defaultNetwork": "sepolia",
            "networks": {
                "sepolia": { "url": "https://sepolia.example", "chainId": 11155111 }
            },
            "etherscan": { "apiKey": api_key }
        })
    }

    fn args(contract: &str) -> TaskArgs {
        TaskArgs::from([
            ("contract".to_string(), contract.to_string()),
            ("address".to_string(), "0x1234".to_string()),
        ])
    }

    fn runtime(root: &tempfile::TempDir, user: Value, verifier: Arc<RecordingVerifier>) -> crate::Runtime {
        let mut blueprint = Blueprint::new();
        blueprint
            .root(Utf8Path::from_path(root.path()).unwrap())
            .user_config(user)
            .compiler(Arc::new(CountingCompiler::default()))
            .verifier(verifier);
        blueprint.finish().unwrap()
    }

    #[test]
    fn test_verify_submits_artifact() {
        let root = project();
        let verifier = Arc::new(RecordingVerifier::default());
        let runtime = runtime(&root, config(json!("KEY")), verifier.clone());

        let report = runtime.run("verify", &args("Counter"), None).unwrap();
        assert!(report.succeeded(), "{report}");
        assert_eq!(
            *verifier.submissions.lock().unwrap(),
            vec![("Counter".to_string(), "0x1234".to_string(), "sepolia".to_string())]
        );
    }

    #[test]
    fn test_verify_needs_api_key() {
        let root = project();
        let verifier = Arc::new(RecordingVerifier::default());
        let runtime = runtime(&root, config(Value::Null), verifier.clone());

        assert_eq!(runtime.run_task("verify", &args("Counter"), None), exit::VERIFICATION);
        assert!(verifier.submissions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_verify_unknown_contract() {
        let root = project();
        let runtime = runtime(&root, config(json!("KEY")), Arc::default());
        assert_eq!(runtime.run_task("verify", &args("Nope"), None), exit::VERIFICATION);
    }

    #[test]
    fn test_verify_rejects_simulated_network() {
        let root = project();
        let runtime = runtime(&root, config(json!("KEY")), Arc::default());
        assert_eq!(
            runtime.run_task("verify", &args("Counter"), Some("simulated")),
            exit::VERIFICATION
        );
    }

    #[test]
    fn test_verify_not_part_of_compile() {
        let root = project();
        let runtime = runtime(&root, config(json!("KEY")), Arc::default());
        let report = runtime.run("compile", &TaskArgs::new(), None).unwrap();
        assert!(report.status("verify").is_none());
    }
}
