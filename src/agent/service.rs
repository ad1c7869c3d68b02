use std::time::Duration;

use crate::agent::reconcile::Reconciler;
use crate::agent::AgentResult;
use crate::net::iptables::Iptables;
use crate::store::Store;
use crate::utils::constants::{agent_chain, veth_base, AGENT_CHAINS};

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const POST_CLEANUP_SETTLE: Duration = Duration::from_secs(1);

/// The long-running service: a full cleanup sweep, then reconciliation
/// ticks forever. A failed tick is logged and retried on the next tick;
/// only missing node settings are fatal.
pub async fn run(store: Store) -> AgentResult<()> {
    let reconciler = Reconciler::new(store).await?;
    tracing::info!(ns = %reconciler.namespace(), "agent service starting");

    cleanup_on_startup(&reconciler).await;
    tokio::time::sleep(POST_CLEANUP_SETTLE).await;

    loop {
        if let Err(e) = reconciler.sync_once().await {
            tracing::error!(ns = %reconciler.namespace(), "sync tick failed: {}", e);
        }
        tokio::time::sleep(TICK_INTERVAL).await;
    }
}

/// Remove every kernel object a previous run may have left behind; the
/// first tick rebuilds whatever is still desired. All best-effort.
async fn cleanup_on_startup(reconciler: &Reconciler) {
    let ns = reconciler.namespace();
    tracing::info!(ns, "startup cleanup sweep");

    match reconciler.link.dump_all_wireguard().await {
        Ok(devices) => {
            for name in devices.keys() {
                if let Err(e) = reconciler.link.try_destroy(name).await {
                    tracing::warn!(ns, ifname = %name, "cleanup destroy failed: {}", e);
                }
            }
        }
        Err(e) => tracing::debug!(ns, "no wireguard state to clean: {}", e),
    }

    let host_veth = format!("{}0", veth_base(ns));
    if let Err(e) = reconciler.link.try_destroy_root(&host_veth).await {
        tracing::warn!(ns, ifname = %host_veth, "cleanup destroy failed: {}", e);
    }

    for (table, builtin) in AGENT_CHAINS {
        reconciler.ipt.flush(table, &agent_chain(ns, builtin)).await;
    }
    Iptables::in_ns(ns).flush("filter", "FORWARD").await;

    reconciler.container.shutdown(true).await;
}
