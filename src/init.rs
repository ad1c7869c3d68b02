use std::io::{self, Write as _};

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use pkcs8::LineEnding;
use rand::rngs::OsRng;

use crate::agent::{AgentError, AgentResult};
use crate::api::ControllerClient;
use crate::store::{NodeSettingsPatch, Store};
use crate::utils::console::Console;

/// Interactive `init -d <path>`: create (or keep) the node key, collect
/// node settings, join the cluster, persist everything.
pub async fn run_init(store_path: &str) -> AgentResult<()> {
    Console::section("networktools node initialisation");
    let store = Store::open(store_path).await?;
    let existing = store.settings().get_node_settings().await?;

    let namespace = prompt(
        "Network namespace",
        existing.as_ref().map(|s| s.namespace.as_str()),
    )?;
    let eth_name = prompt(
        "Uplink interface",
        existing.as_ref().map(|s| s.eth_name.as_str()).or(Some("eth0")),
    )?;
    let domain_prefix = prompt(
        "Controller URL",
        existing.as_ref().map(|s| s.domain_prefix.as_str()),
    )?;

    let private_key = match existing.as_ref() {
        Some(settings) => {
            Console::info("keeping the existing node key");
            settings.private_key.clone()
        }
        None => {
            let key = SigningKey::generate(&mut OsRng);
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| AgentError::Invariant(format!("key encoding failed: {}", e)))?;
            Console::info("generated a new Ed25519 node key");
            pem.to_string()
        }
    };

    store
        .settings()
        .set_node_settings(&NodeSettingsPatch {
            namespace: Some(namespace.clone()),
            eth_name: Some(eth_name),
            private_key: Some(private_key.clone()),
            domain_prefix: Some(domain_prefix.clone()),
            node_id: None,
        })
        .await?;

    let client = ControllerClient::new(&domain_prefix, &private_key)?;
    Console::info("joining the cluster...");
    let joined = match client.join().await {
        Ok(joined) => joined,
        Err(e) => {
            Console::error(&format!("cluster join failed: {}", e));
            return Err(e.into());
        }
    };
    store
        .settings()
        .set_node_settings(&NodeSettingsPatch {
            node_id: Some(joined.node_id),
            ..NodeSettingsPatch::default()
        })
        .await?;

    Console::success("node initialised");
    Console::detail("namespace", &namespace);
    Console::detail("node id", &joined.node_id.to_string());
    Console::detail("client id", client.client_id());
    store.close().await;
    Ok(())
}

fn prompt(label: &str, default: Option<&str>) -> io::Result<String> {
    loop {
        match default {
            Some(value) => print!("{} [{}]: ", label, value),
            None => print!("{}: ", label),
        }
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        let value = line.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        if let Some(value) = default {
            return Ok(value.to_string());
        }
    }
}
