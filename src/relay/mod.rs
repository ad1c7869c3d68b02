use std::env;

use uuid::Uuid;

use crate::net::error::{NetError, NetResult};
use crate::utils::command::{argv, CommandExecutor};
use crate::utils::constants::worker_unit;

/// UDP-over-TLS relay workers, one transient systemd unit per WireGuard
/// interface that needs one. Workers run inside the agent namespace so the
/// paired WireGuard socket can reach them over loopback.
pub struct RelayManager {
    netns: String,
    gost_path: String,
}

impl RelayManager {
    pub fn new(netns: &str) -> Self {
        let install_dir = env::var("INSTALL_DIR").unwrap_or_else(|_| "/opt/networktools".to_string());
        Self {
            netns: netns.to_string(),
            gost_path: format!("{}/bin/gost", install_dir),
        }
    }

    /// Client mode: accept WireGuard's UDP locally and carry it to the
    /// remote relay server over TLS. Returns the unit name.
    pub async fn start_client(
        &self,
        listen_port: u16,
        server_host: &str,
        server_port: u16,
    ) -> NetResult<String> {
        let unit = worker_unit(&self.netns, &Uuid::new_v4().to_string());
        let listener = format!("-L=udp://:{}?keepAlive=true&ttl=120", listen_port);
        let forward = format!("-F=relay+tls://{}:{}", server_host, server_port);
        self.launch(&unit, &[listener, forward]).await?;
        tracing::info!(
            unit = %unit,
            listen_port,
            server = %format!("{}:{}", server_host, server_port),
            "started relay client worker"
        );
        Ok(unit)
    }

    /// Server mode: terminate TLS from remote relay clients and hand the
    /// inner UDP to the local WireGuard listen port.
    pub async fn start_server(&self, listen_port: u16, wg_listen_port: u16) -> NetResult<String> {
        let unit = worker_unit(&self.netns, &Uuid::new_v4().to_string());
        let listener = format!(
            "-L=relay+tls://:{}/127.0.0.1:{}",
            listen_port, wg_listen_port
        );
        self.launch(&unit, &[listener]).await?;
        tracing::info!(unit = %unit, listen_port, wg_listen_port, "started relay server worker");
        Ok(unit)
    }

    async fn launch(&self, unit: &str, gost_args: &[String]) -> NetResult<()> {
        let mut cmd = argv(&[
            "systemd-run",
            "--unit",
            unit,
            "--collect",
            "--property",
            "Restart=always",
            "--property",
            "RestartSec=5s",
            "ip",
            "netns",
            "exec",
            &self.netns,
            &self.gost_path,
        ]);
        cmd.extend(gost_args.iter().cloned());
        CommandExecutor::run_privileged("", cmd)
            .await
            .map_err(NetError::from)?;
        Ok(())
    }

    /// Stop a worker unit, tolerating one that is already gone.
    pub async fn stop(&self, unit: &str) {
        match CommandExecutor::run_privileged_raw("", argv(&["systemctl", "stop", unit])).await {
            Ok(out) if out.success => {
                tracing::info!(unit, "stopped relay worker");
            }
            Ok(out) => {
                tracing::debug!(unit, "relay worker stop skipped: {}", out.stderr.trim());
            }
            Err(e) => {
                tracing::warn!(unit, "relay worker stop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_carry_namespace_and_uuid() {
        let unit = worker_unit("netA", "123e4567-e89b-12d3-a456-426614174000");
        assert!(unit.starts_with("networktools-netA-worker-"));
        assert!(unit.ends_with("426614174000"));
    }

    #[test]
    fn gost_path_defaults_under_install_dir() {
        let manager = RelayManager::new("netA");
        assert!(manager.gost_path.ends_with("/bin/gost"));
    }
}
