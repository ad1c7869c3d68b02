use serde::Deserialize;

use crate::net::error::{NetError, NetResult};
use crate::utils::command::{argv, CommandExecutor};
use crate::utils::constants::{router_container_name, router_dir, router_unit, tmp_dir};

const ROUTER_IMAGE: &str = "bird-router";

/// The BIRD routing daemon runs in a podman container joined to the agent
/// namespace and supervised by a transient systemd unit.
pub struct RouterContainer {
    netns: String,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub status: String,
    pub binds: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "HostConfig")]
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "Binds", default)]
    binds: Vec<String>,
}

impl RouterContainer {
    pub fn new(netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
        }
    }

    fn name(&self) -> String {
        router_container_name(&self.netns)
    }

    /// Locate the router container by name. `None` when it does not exist.
    pub async fn inspect(&self) -> NetResult<Option<ContainerInfo>> {
        let listing =
            CommandExecutor::run_privileged("", argv(&["podman", "ps", "-a", "--format", "json"]))
                .await?;
        let entries: Vec<PsEntry> = serde_json::from_str(&listing).map_err(|e| NetError::Parse {
            what: "podman ps".to_string(),
            message: e.to_string(),
        })?;
        let wanted = self.name();
        let Some(entry) = entries.into_iter().find(|e| e.names.iter().any(|n| n == &wanted))
        else {
            return Ok(None);
        };

        let raw =
            CommandExecutor::run_privileged("", argv(&["podman", "inspect", &entry.id])).await?;
        let mut detail: Vec<InspectEntry> =
            serde_json::from_str(&raw).map_err(|e| NetError::Parse {
                what: "podman inspect".to_string(),
                message: e.to_string(),
            })?;
        let Some(detail) = detail.pop() else {
            return Ok(None);
        };
        Ok(Some(ContainerInfo {
            id: detail.id,
            status: detail.state.status,
            binds: detail.host_config.binds,
        }))
    }

    /// Create the container joined to the agent namespace and launch it
    /// through the supervisor. Returns the container id.
    pub async fn start(&self) -> NetResult<String> {
        let netns_path = format!("ns:/var/run/netns/{}", self.netns);
        let bind = format!("{}:/data:ro", router_dir(&self.netns));
        let id = CommandExecutor::run_privileged(
            "",
            argv(&[
                "podman",
                "create",
                "--network",
                &netns_path,
                "--cap-add",
                "NET_ADMIN,CAP_NET_BIND_SERVICE,NET_RAW,NET_BROADCAST",
                "-v",
                &bind,
                "--name",
                &self.name(),
                ROUTER_IMAGE,
            ]),
        )
        .await?;
        let id = id.trim().to_string();

        CommandExecutor::run_privileged(
            "",
            argv(&[
                "systemd-run",
                "--unit",
                &router_unit(&self.netns),
                "--collect",
                "--property",
                "Type=forking",
                "--property",
                "KillMode=none",
                "podman",
                "start",
                &id,
            ]),
        )
        .await?;
        tracing::info!(ns = %self.netns, id = %id, "router container started");
        Ok(id)
    }

    /// Create the container if missing, start it if stopped.
    pub async fn ensure_running(&self) -> NetResult<ContainerInfo> {
        match self.inspect().await? {
            None => {
                let id = self.start().await?;
                Ok(ContainerInfo {
                    id,
                    status: "running".to_string(),
                    binds: vec![format!("{}:/data:ro", router_dir(&self.netns))],
                })
            }
            Some(info) if info.status != "running" => {
                CommandExecutor::run_privileged("", argv(&["podman", "start", &info.id])).await?;
                tracing::info!(ns = %self.netns, id = %info.id, "router container restarted");
                Ok(ContainerInfo {
                    status: "running".to_string(),
                    ..info
                })
            }
            Some(info) => {
                tracing::debug!(ns = %self.netns, id = %info.id, binds = ?info.binds, "router container already running");
                Ok(info)
            }
        }
    }

    /// Tear the container down; every step is best-effort so shutdown always
    /// makes forward progress.
    pub async fn shutdown(&self, clear_temp: bool) {
        let unit = router_unit(&self.netns);
        if let Err(e) =
            CommandExecutor::run_privileged_raw("", argv(&["systemctl", "stop", &unit])).await
        {
            tracing::warn!(unit = %unit, "router unit stop failed: {}", e);
        }
        match CommandExecutor::run_privileged_raw("", argv(&["podman", "rm", "-f", &self.name()]))
            .await
        {
            Ok(out) if !out.success => {
                tracing::debug!(ns = %self.netns, "podman rm skipped: {}", out.stderr.trim());
            }
            Err(e) => tracing::warn!(ns = %self.netns, "podman rm failed: {}", e),
            _ => {}
        }
        if clear_temp {
            if let Err(e) = CommandExecutor::run_privileged_raw(
                "",
                argv(&["rm", "-rf", &tmp_dir(&self.netns)]),
            )
            .await
            {
                tracing::warn!(ns = %self.netns, "temp dir purge failed: {}", e);
            }
        }
        tracing::info!(ns = %self.netns, "router container shut down");
    }

    /// `birdc configure` inside the running container.
    pub async fn reload(&self) -> NetResult<()> {
        let info = self
            .inspect()
            .await?
            .ok_or_else(|| NetError::NotFound(format!("container {}", self.name())))?;
        CommandExecutor::run_privileged(
            "",
            argv(&["podman", "exec", &info.id, "birdc", "configure"]),
        )
        .await?;
        tracing::info!(ns = %self.netns, "router configuration reloaded");
        Ok(())
    }

    /// Raw `birdc show ospf state all` text for the telemetry parser.
    pub async fn fetch_ospf_state(&self) -> NetResult<String> {
        let info = self
            .inspect()
            .await?
            .ok_or_else(|| NetError::NotFound(format!("container {}", self.name())))?;
        let output = CommandExecutor::run_privileged(
            "",
            argv(&["podman", "exec", &info.id, "birdc", "show", "ospf", "state", "all"]),
        )
        .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_json_locates_container_by_name() {
        let json = r#"[
            {"Id": "aaa111", "Names": ["other"]},
            {"Id": "bbb222", "Names": ["netA-router"]}
        ]"#;
        let entries: Vec<PsEntry> = serde_json::from_str(json).unwrap();
        let hit = entries
            .iter()
            .find(|e| e.names.iter().any(|n| n == "netA-router"))
            .unwrap();
        assert_eq!(hit.id, "bbb222");
    }

    #[test]
    fn inspect_json_exposes_status_and_binds() {
        let json = r#"[{
            "Id": "bbb222",
            "State": {"Status": "running", "Pid": 42},
            "HostConfig": {"Binds": ["/tmp/networktools-netA/router:/data:ro"]}
        }]"#;
        let entries: Vec<InspectEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].state.status, "running");
        assert_eq!(entries[0].host_config.binds.len(), 1);
    }
}
