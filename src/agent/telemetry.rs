use crate::agent::reconcile::Reconciler;
use crate::agent::AgentResult;
use crate::api::model::{LinkTelemetry, RemotePeerInfo};
use crate::ospf::state::parse_ospf_state;
use crate::utils::constants::peer_ifname;

impl Reconciler {
    /// Step 10: report per-link liveness and traffic counters, and, when
    /// the router is up, the parsed LSDB. Runs after the config reload so
    /// the fresh ping window reflects the converged state.
    pub(crate) async fn report_telemetry(&self, peers: &[RemotePeerInfo]) -> AgentResult<()> {
        let ns = self.namespace();
        let observed = self.link.dump_all_wireguard().await?;

        // Only links that exist locally and are still declared remotely.
        let targets: Vec<(i64, String)> = peers
            .iter()
            .map(|p| (p.id, peer_ifname(ns, p.id)))
            .filter(|(_, ifname)| observed.contains_key(ifname))
            .collect();
        let names: Vec<String> = targets.iter().map(|(_, n)| n.clone()).collect();
        let pings = self.ping.measure(&self.link, &names).await;

        let mut links = Vec::with_capacity(targets.len());
        for (id, ifname) in &targets {
            let state = &observed[ifname];
            let (rx, tx) = state
                .peers
                .values()
                .next()
                .map(|p| (p.rx_bytes, p.tx_bytes))
                .unwrap_or((0, 0));
            links.push(LinkTelemetry {
                id: *id,
                ping: pings.get(ifname).copied().flatten().unwrap_or(-1.0),
                rx,
                tx,
            });
        }
        self.api.report_link_telemetry(&links).await?;

        match self.container.inspect().await? {
            Some(info) if info.status == "running" => {
                let text = self.container.fetch_ospf_state().await?;
                let state = parse_ospf_state(&text)?;
                self.api.report_router_telemetry(&state).await?;
                tracing::debug!(
                    areas = state.area_routers.len(),
                    asbrs = state.other_asbrs.len(),
                    "router telemetry reported"
                );
            }
            _ => {
                tracing::debug!(ns, "router container not running, skipping router telemetry");
            }
        }
        Ok(())
    }
}
