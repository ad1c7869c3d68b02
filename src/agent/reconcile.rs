use std::collections::{BTreeMap, HashSet};

use ipnet::Ipv4Net;
use uuid::Uuid;

use crate::agent::{AgentError, AgentResult};
use crate::api::model::{non_empty, PeerOspfExtra, RemoteNodeInfo, RemotePeerInfo};
use crate::api::ControllerClient;
use crate::container::RouterContainer;
use crate::net::ensure::EnsureLayer;
use crate::net::iptables::Iptables;
use crate::net::link::{LinkManager, WgAssignment};
use crate::net::ping::PingAggregator;
use crate::ospf::config::{BfdInterfaceConfig, OspfInterfaceConfig, RouterConfigSpec};
use crate::relay::RelayManager;
use crate::store::{NodeSettings, Store};
use crate::utils::command::{argv, CommandExecutor};
use crate::utils::constants::{
    agent_chain, bird_conf_path, peer_ifname, peer_tag, veth_base, DEFAULT_WG_MTU, TAG_LOCAL_VETH,
    WG_KEY_POOL_SIZE,
};

/// Drives the kernel towards the controller's intent, one tick at a time.
/// Every step is idempotent and tolerates a previous tick having stopped
/// part-way through.
pub struct Reconciler {
    pub(crate) store: Store,
    pub(crate) settings: NodeSettings,
    pub(crate) api: ControllerClient,
    pub(crate) link: LinkManager,
    pub(crate) ipt: Iptables,
    pub(crate) ping: PingAggregator,
    pub(crate) relay: RelayManager,
    pub(crate) container: RouterContainer,
    ensure: EnsureLayer,
}

impl Reconciler {
    pub async fn new(store: Store) -> AgentResult<Self> {
        let settings = store
            .settings()
            .get_node_settings()
            .await?
            .ok_or(AgentError::SettingsMissing)?;
        let api = ControllerClient::new(&settings.domain_prefix, &settings.private_key)?;
        let ns = settings.namespace.clone();
        Ok(Self {
            store,
            api,
            link: LinkManager::new(&ns),
            ipt: Iptables::root(),
            ping: PingAggregator::new(&ns),
            relay: RelayManager::new(&ns),
            container: RouterContainer::new(&ns),
            ensure: EnsureLayer::new(&ns),
            settings,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    /// One full reconciliation pass.
    pub async fn sync_once(&self) -> AgentResult<()> {
        tracing::info!(ns = %self.namespace(), "sync tick started");
        self.ensure.ensure_all().await?;
        self.sync_key_pool().await?;

        let remote = self.api.fetch_node_config().await?;
        let peers = self.api.fetch_peers().await?;
        tracing::debug!(peers = peers.len(), exit_node = remote.exit_node, "desired state fetched");

        self.sync_exit_node(&remote).await?;
        self.sync_veth(&remote).await?;
        self.sync_peers(&peers).await?;
        self.sync_router_config(&remote, &peers).await?;
        self.report_telemetry(&peers).await?;
        tracing::info!(ns = %self.namespace(), "sync tick completed");
        Ok(())
    }

    // ── step 3: key pool ──────────────────────────────────────────────

    /// Top the pre-generated pool up to size, then publish the public keys
    /// so the controller can assign them.
    pub(crate) async fn sync_key_pool(&self) -> AgentResult<()> {
        let mut keys = self.store.wg_keys().get_all_wireguard_keys().await?;
        while keys.len() < WG_KEY_POOL_SIZE {
            let private = CommandExecutor::run_checked(&["wg", "genkey"])
                .await?
                .trim()
                .to_string();
            let public = CommandExecutor::run_checked_with_stdin(&["wg", "pubkey"], private.as_bytes())
                .await?
                .trim()
                .to_string();
            self.store
                .wg_keys()
                .create_wireguard_key(&private, &public)
                .await?;
            keys = self.store.wg_keys().get_all_wireguard_keys().await?;
        }
        let publics: Vec<String> = keys.iter().map(|k| k.public.clone()).collect();
        self.api.sync_wireguard_keys(&publics).await?;
        Ok(())
    }

    // ── step 5: exit node ─────────────────────────────────────────────

    pub(crate) async fn sync_exit_node(&self, remote: &RemoteNodeInfo) -> AgentResult<()> {
        let chain = agent_chain(self.namespace(), "POSTROUTING");
        let rule = argv(&["-o", &self.settings.eth_name, "-j", "MASQUERADE"]);
        if remote.exit_node {
            self.ipt.append_if_missing("nat", &chain, &rule).await?;
        } else {
            self.ipt.delete_if_present("nat", &chain, &rule).await?;
        }
        Ok(())
    }

    // ── step 6: veth ──────────────────────────────────────────────────

    pub(crate) async fn sync_veth(&self, remote: &RemoteNodeInfo) -> AgentResult<()> {
        let ns = self.namespace();
        let base = veth_base(ns);
        let host_if = format!("{}0", base);
        let observed = self.link.get_root_interface_state(&host_if).await?;
        if let Some(state) = &observed {
            tracing::debug!(name = %state.name, mtu = state.mtu, addr = ?state.ipv4, "veth host side observed");
        }
        let desired = non_empty(&remote.veth_cidr);

        match (observed.is_some(), desired) {
            (true, None) => {
                // Destroy first so the rule purge sees the post-destroy dump.
                self.link.try_destroy_root(&host_if).await?;
                for (table, builtin) in [("nat", "POSTROUTING"), ("filter", "FORWARD"), ("filter", "INPUT")]
                {
                    self.ipt
                        .purge_tagged(table, &agent_chain(ns, builtin), TAG_LOCAL_VETH)
                        .await?;
                }
                tracing::info!(ns, "veth removed");
            }
            (false, Some(cidr)) => {
                self.link.create_veth(&base, cidr).await?;
                self.install_veth_rules(&host_if, cidr).await?;
                tracing::info!(ns, cidr, "veth created");
            }
            _ => {}
        }
        Ok(())
    }

    async fn install_veth_rules(&self, host_if: &str, cidr: &str) -> AgentResult<()> {
        let ns = self.namespace();
        let network = cidr
            .parse::<Ipv4Net>()
            .map_err(|e| AgentError::Invariant(format!("bad veth cidr '{}': {}", cidr, e)))?
            .trunc()
            .to_string();
        let uplink = self
            .link
            .get_root_interface_state(&self.settings.eth_name)
            .await?
            .and_then(|s| s.ipv4)
            .ok_or_else(|| {
                AgentError::Invariant(format!("uplink {} has no ipv4", self.settings.eth_name))
            })?;
        let uplink_ip = uplink.addr().to_string();
        let tag = |mut rule: Vec<String>| {
            rule.extend(argv(&["-m", "comment", "--comment", TAG_LOCAL_VETH]));
            rule
        };

        let nat = agent_chain(ns, "POSTROUTING");
        let forward = agent_chain(ns, "FORWARD");
        let input = agent_chain(ns, "INPUT");

        // Keep intra-subnet traffic un-NATed.
        self.ipt
            .append_if_missing("nat", &nat, &tag(argv(&["-s", &network, "-d", &network, "-j", "ACCEPT"])))
            .await?;
        // Everything else leaving the subnet is rewritten to the uplink IP,
        // multicast excepted.
        self.ipt
            .append_if_missing(
                "nat",
                &nat,
                &tag(argv(&[
                    "-s",
                    &network,
                    "!",
                    "-d",
                    "224.0.0.0/4",
                    "-j",
                    "SNAT",
                    "--to-source",
                    &uplink_ip,
                ])),
            )
            .await?;
        self.ipt
            .append_if_missing("filter", &forward, &tag(argv(&["-i", host_if, "-j", "ACCEPT"])))
            .await?;
        self.ipt
            .append_if_missing("filter", &forward, &tag(argv(&["-o", host_if, "-j", "ACCEPT"])))
            .await?;
        self.ipt
            .append_if_missing(
                "filter",
                &input,
                &tag(argv(&["-i", host_if, "-p", "ospf", "-j", "ACCEPT"])),
            )
            .await?;
        Ok(())
    }

    // ── step 7: peers ─────────────────────────────────────────────────

    pub(crate) async fn sync_peers(&self, peers: &[RemotePeerInfo]) -> AgentResult<()> {
        let ns = self.namespace();
        let observed = self.link.dump_all_wireguard().await?;
        let keys = self.store.wg_keys().get_all_wireguard_keys().await?;
        let input_chain = agent_chain(ns, "INPUT");
        let mut desired: HashSet<String> = HashSet::new();

        for peer in peers {
            let ifname = peer_ifname(ns, peer.id);
            desired.insert(ifname.clone());
            peer_link_network(peer)?;

            let pair = keys
                .iter()
                .find(|k| k.public == peer.public_key)
                .ok_or_else(|| {
                    AgentError::Invariant(format!(
                        "no local private key for declared public key {}",
                        peer.public_key
                    ))
                })?;

            if let Some(state) = observed.get(&ifname) {
                self.sync_underlay(peer, &ifname).await?;
                if peer_underlay(peer).is_none() {
                    // Only the relay-less path tracks keepalive drift.
                    if let Some(want) = peer.keepalive {
                        let have = state
                            .peers
                            .get(&peer.peer_public_key)
                            .and_then(|p| p.keepalive);
                        if have != Some(want) {
                            self.link
                                .set_peer_keepalive(&ifname, &peer.peer_public_key, want)
                                .await?;
                        }
                    }
                }
            } else {
                self.link
                    .create_wireguard(&ifname, &peer.address_cidr, peer.mtu.unwrap_or(DEFAULT_WG_MTU))
                    .await?;
                self.link
                    .assign_wireguard(
                        &ifname,
                        &WgAssignment {
                            private_key: pair.private.clone(),
                            listen_port: (peer.listen_port != 0).then_some(peer.listen_port),
                            peer_public_key: Some(peer.peer_public_key.clone()),
                            endpoint: Some(peer.endpoint.clone()),
                            keepalive: peer.keepalive,
                            allowed_ips: Some("0.0.0.0/0".to_string()),
                        },
                    )
                    .await?;
                self.link.up_wireguard(&ifname).await?;
                if peer.listen_port != 0 {
                    let mut rule = argv(&[
                        "-p",
                        "udp",
                        "--dport",
                        &peer.listen_port.to_string(),
                        "-j",
                        "ACCEPT",
                    ]);
                    rule.extend(argv(&["-m", "comment", "--comment", &peer_tag(&ifname)]));
                    self.ipt
                        .append_if_missing("filter", &input_chain, &rule)
                        .await?;
                }
                tracing::info!(ns, ifname = %ifname, peer = peer.id, "peer link created");
                self.sync_underlay(peer, &ifname).await?;
            }
        }

        // Anything matching our interface pattern but absent from the peer
        // set is stale.
        for name in observed.keys() {
            if !is_agent_peer_iface(ns, name) || desired.contains(name) {
                continue;
            }
            self.link.try_destroy(name).await?;
            self.ipt
                .purge_tagged("filter", &input_chain, &peer_tag(name))
                .await?;
            if let Some(record) = self.store.kv().get_underlay_state(name).await? {
                self.relay.stop(underlay_unit_name(&record)).await;
                self.store.kv().delete_underlay_state(name).await?;
            }
            tracing::info!(ns, ifname = %name, "stale peer link removed");
        }
        Ok(())
    }

    // ── step 9: routing config ────────────────────────────────────────

    pub(crate) async fn sync_router_config(
        &self,
        remote: &RemoteNodeInfo,
        peers: &[RemotePeerInfo],
    ) -> AgentResult<()> {
        let ns = self.namespace();

        // Measure only the links whose peer asked for ping-derived costs.
        let to_measure: Vec<String> = peers
            .iter()
            .filter(|p| peer_ospf(p).map(|o| o.ping).unwrap_or(false))
            .map(|p| peer_ifname(ns, p.id))
            .collect();
        let pings = self.ping.measure(&self.link, &to_measure).await;

        let mut local_cidrs = Vec::new();
        let mut area_zero: BTreeMap<String, OspfInterfaceConfig> = BTreeMap::new();
        let mut bfd: BTreeMap<String, BfdInterfaceConfig> = BTreeMap::new();

        for peer in peers {
            let ifname = peer_ifname(ns, peer.id);
            let network = peer_link_network(peer)?;
            local_cidrs.push(network.to_string());

            let measured = pings.get(&ifname).copied().flatten();
            let cost = compute_cost(peer_ospf(peer), measured);
            area_zero.insert(
                ifname.clone(),
                OspfInterfaceConfig {
                    cost: Some(cost),
                    iface_type: Some("ptp".to_string()),
                    auth: peer_ospf(peer).and_then(|o| o.auth.clone()),
                },
            );
            bfd.insert(
                ifname,
                BfdInterfaceConfig {
                    interval_ms: Some(1000),
                    idle_ms: Some(5000),
                    multiplier: Some(5),
                    ..BfdInterfaceConfig::default()
                },
            );
        }

        let mut areas: BTreeMap<String, BTreeMap<String, OspfInterfaceConfig>> = BTreeMap::new();
        areas.insert("0".to_string(), area_zero);

        let mut direct_interfaces = Vec::new();
        if let (Some(_), Some(node_ospf)) = (non_empty(&remote.veth_cidr), &remote.ospf) {
            let veth_ns_if = format!("{}1", veth_base(ns));
            direct_interfaces.push(veth_ns_if.clone());
            areas.entry(node_ospf.area.clone()).or_default().insert(
                veth_ns_if,
                OspfInterfaceConfig {
                    cost: node_ospf.cost,
                    iface_type: None,
                    auth: node_ospf.auth.clone(),
                },
            );
        }

        let spec = RouterConfigSpec {
            router_id: None,
            direct_interface_names: direct_interfaces,
            ospf_import_exclude: local_cidrs,
            ospf_export_exclude: Vec::new(),
            ospf_area_config: areas,
            bfd_config: bfd,
            debug_protocols: None,
            disable_logging: false,
            git_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            generated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        let rendered = crate::ospf::config::render(&spec);

        // Render to a unique temp path, then a privileged move into the
        // container-bound directory so the daemon never reads a half-written
        // file.
        let staging = format!("/tmp/{}", Uuid::new_v4());
        tokio::fs::write(&staging, &rendered).await?;
        CommandExecutor::run_privileged("", argv(&["mv", &staging, &bird_conf_path(ns)])).await?;

        self.container.ensure_running().await?;
        self.container.reload().await?;
        tracing::info!(ns, "router configuration applied");
        Ok(())
    }
}

// ── pure helpers ──────────────────────────────────────────────────────

pub(crate) fn peer_ospf(peer: &RemotePeerInfo) -> Option<&PeerOspfExtra> {
    peer.extra.as_ref().and_then(|e| e.ospf.as_ref())
}

pub(crate) fn peer_underlay(peer: &RemotePeerInfo) -> Option<&crate::api::model::PeerUnderlay> {
    peer.extra.as_ref().and_then(|e| e.underlay.as_ref())
}

/// The /30 link network of a peer; a /32 cannot hold both link ends.
pub(crate) fn peer_link_network(peer: &RemotePeerInfo) -> AgentResult<Ipv4Net> {
    let net: Ipv4Net = peer.address_cidr.parse().map_err(|e| {
        AgentError::Invariant(format!(
            "peer {} has bad address cidr '{}': {}",
            peer.id, peer.address_cidr, e
        ))
    })?;
    if net.prefix_len() == 32 {
        return Err(AgentError::Invariant(format!(
            "peer {} link network {} is a /32",
            peer.id, peer.address_cidr
        )));
    }
    Ok(net.trunc())
}

/// `{ns}-{digits}` and nothing else.
pub(crate) fn is_agent_peer_iface(ns: &str, name: &str) -> bool {
    name.strip_prefix(ns)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

pub(crate) fn underlay_unit_name(state: &crate::store::LocalUnderlayState) -> &str {
    match state {
        crate::store::LocalUnderlayState::Client { unit_name, .. } => unit_name,
        crate::store::LocalUnderlayState::Server { unit_name, .. } => unit_name,
    }
}

/// OSPF cost: measured ping if available, else the configured cost, else
/// 1000; plus offset, floored, clamped into the OSPF metric range.
pub(crate) fn compute_cost(ospf: Option<&PeerOspfExtra>, ping_ms: Option<f64>) -> u32 {
    let base = match ping_ms {
        Some(ms) => ms,
        None => ospf.and_then(|o| o.cost).unwrap_or(1000) as f64,
    };
    let offset = ospf.map(|o| o.offset).unwrap_or(0.0);
    (base + offset).floor().clamp(1.0, 65535.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ospf_extra(cost: Option<u32>, offset: f64) -> PeerOspfExtra {
        PeerOspfExtra {
            cost,
            ping: true,
            offset,
            auth: None,
        }
    }

    #[test]
    fn cost_prefers_measured_ping() {
        let extra = ospf_extra(Some(1000), 5.0);
        assert_eq!(compute_cost(Some(&extra), Some(27.3)), 32);
    }

    #[test]
    fn cost_falls_back_to_configured_then_default() {
        let extra = ospf_extra(Some(1000), 5.0);
        assert_eq!(compute_cost(Some(&extra), None), 1005);
        assert_eq!(compute_cost(None, None), 1000);
    }

    #[test]
    fn cost_is_clamped_to_the_metric_range() {
        let low = ospf_extra(Some(1), -100.0);
        assert_eq!(compute_cost(Some(&low), None), 1);
        let high = ospf_extra(Some(65000), 10_000.0);
        assert_eq!(compute_cost(Some(&high), None), 65535);
        let sub_ms = ospf_extra(None, 0.0);
        assert_eq!(compute_cost(Some(&sub_ms), Some(0.4)), 1);
    }

    #[test]
    fn agent_iface_pattern_is_namespace_dash_digits() {
        assert!(is_agent_peer_iface("netA", "netA-7"));
        assert!(is_agent_peer_iface("netA", "netA-123"));
        assert!(!is_agent_peer_iface("netA", "netA-veth0"));
        assert!(!is_agent_peer_iface("netA", "netA-"));
        assert!(!is_agent_peer_iface("netA", "netB-7"));
        assert!(!is_agent_peer_iface("netA", "eth0"));
    }
}
