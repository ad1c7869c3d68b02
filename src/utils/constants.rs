//! Names and knobs shared across the agent. Everything the kernel or the
//! supervisor sees is derived from the node's namespace name so that all
//! agent-owned objects are recognizable and removable.

/// Pre-generated WireGuard key pool size the controller can draw from.
pub const WG_KEY_POOL_SIZE: usize = 20;

/// MTU applied to peer tunnels when the controller does not specify one.
pub const DEFAULT_WG_MTU: u32 = 1420;

/// Comment tag on every veth-related iptables rule.
pub const TAG_LOCAL_VETH: &str = "#local_veth#";

/// Comment tag on the per-peer UDP accept rule.
pub fn peer_tag(ifname: &str) -> String {
    format!("#peer_{}#", ifname)
}

pub fn peer_ifname(ns: &str, peer_id: i64) -> String {
    format!("{}-{}", ns, peer_id)
}

/// Base name of the veth pair; sides are `{base}0` (root) and `{base}1` (ns).
pub fn veth_base(ns: &str) -> String {
    format!("{}-veth", ns)
}

pub fn tmp_dir(ns: &str) -> String {
    format!("/tmp/networktools-{}", ns)
}

/// Bind-mounted read-only into the router container at /data.
pub fn router_dir(ns: &str) -> String {
    format!("{}/router", tmp_dir(ns))
}

pub fn bird_conf_path(ns: &str) -> String {
    format!("{}/bird.conf", router_dir(ns))
}

pub fn router_container_name(ns: &str) -> String {
    format!("{}-router", ns)
}

pub fn router_unit(ns: &str) -> String {
    format!("networktools-{}-router", ns)
}

pub fn worker_unit(ns: &str, id: &str) -> String {
    format!("networktools-{}-worker-{}", ns, id)
}

/// Agent-owned chain in a builtin table, e.g. `netA-POSTROUTING`.
pub fn agent_chain(ns: &str, builtin: &str) -> String {
    format!("{}-{}", ns, builtin)
}

/// Every (table, builtin) pair the agent scaffolds a jump chain for.
pub const AGENT_CHAINS: &[(&str, &str)] = &[
    ("nat", "POSTROUTING"),
    ("nat", "PREROUTING"),
    ("raw", "PREROUTING"),
    ("mangle", "OUTPUT"),
    ("mangle", "POSTROUTING"),
    ("filter", "FORWARD"),
    ("filter", "INPUT"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_derive_from_namespace() {
        assert_eq!(peer_ifname("netA", 7), "netA-7");
        assert_eq!(peer_tag("netA-7"), "#peer_netA-7#");
        assert_eq!(veth_base("netA"), "netA-veth");
        assert_eq!(
            bird_conf_path("netA"),
            "/tmp/networktools-netA/router/bird.conf"
        );
        assert_eq!(router_unit("netA"), "networktools-netA-router");
        assert_eq!(agent_chain("netA", "INPUT"), "netA-INPUT");
    }
}
