use crate::net::error::NetResult;
use crate::net::iptables::Iptables;
use crate::utils::command::{argv, CommandExecutor};
use crate::utils::constants::{agent_chain, router_dir, tmp_dir, AGENT_CHAINS};

/// Idempotent prerequisites: namespace, chain scaffolding, forwarding
/// sysctls, temp dirs, MSS clamping. Safe to run every tick.
pub struct EnsureLayer {
    netns: String,
}

impl EnsureLayer {
    pub fn new(netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
        }
    }

    pub async fn ensure_all(&self) -> NetResult<()> {
        self.ensure_namespace().await?;
        self.ensure_chains().await?;
        self.ensure_forwarding().await?;
        self.ensure_tmp_dirs().await?;
        self.ensure_mss_clamp().await?;
        Ok(())
    }

    pub async fn ensure_namespace(&self) -> NetResult<()> {
        let list = CommandExecutor::run_privileged("", argv(&["ip", "netns", "list"])).await?;
        let present = list
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .any(|name| name == self.netns);
        if !present {
            CommandExecutor::run_privileged("", argv(&["ip", "netns", "add", &self.netns]))
                .await?;
            tracing::info!(ns = %self.netns, "created network namespace");
        }
        Ok(())
    }

    /// One agent-owned chain per builtin, with a jump inserted at the top
    /// of that builtin so agent rules match before foreign ones.
    pub async fn ensure_chains(&self) -> NetResult<()> {
        let ipt = Iptables::root();
        for (table, builtin) in AGENT_CHAINS {
            let chain = agent_chain(&self.netns, builtin);
            if !ipt.chain_exists(table, &chain).await? {
                ipt.create_chain(table, &chain).await?;
            }
            ipt.insert_if_missing(table, builtin, &argv(&["-j", &chain]))
                .await?;
        }
        Ok(())
    }

    /// IPv4 forwarding in both the root namespace and the agent namespace.
    pub async fn ensure_forwarding(&self) -> NetResult<()> {
        CommandExecutor::run_privileged("", argv(&["sysctl", "-w", "net.ipv4.ip_forward=1"]))
            .await?;
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&["sysctl", "-w", "net.ipv4.ip_forward=1"]),
        )
        .await?;
        Ok(())
    }

    pub async fn ensure_tmp_dirs(&self) -> NetResult<()> {
        tokio::fs::create_dir_all(tmp_dir(&self.netns)).await?;
        tokio::fs::create_dir_all(router_dir(&self.netns)).await?;
        Ok(())
    }

    /// Clamp TCP MSS to path MTU on traffic forwarded through the namespace;
    /// tunnels shrink the effective MTU below what LAN hosts assume.
    pub async fn ensure_mss_clamp(&self) -> NetResult<()> {
        Iptables::in_ns(&self.netns)
            .append_if_missing(
                "filter",
                "FORWARD",
                &argv(&[
                    "-p",
                    "tcp",
                    "--tcp-flags",
                    "SYN,RST",
                    "SYN",
                    "-j",
                    "TCPMSS",
                    "--clamp-mss-to-pmtu",
                ]),
            )
            .await?;
        Ok(())
    }
}
