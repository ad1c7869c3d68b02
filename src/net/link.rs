use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;
use uuid::Uuid;

use crate::net::error::{NetError, NetResult};
use crate::utils::command::{argv, CommandExecutor};

/// Network-device lifecycle for one agent namespace. WireGuard and the
/// namespace side of veth pairs live inside `netns`; devices are always
/// created in the root namespace first and moved in, since `ip link add`
/// cannot target a foreign namespace directly.
pub struct LinkManager {
    netns: String,
}

/// Everything `wg set` accepts for a freshly created interface.
#[derive(Debug, Clone, Default)]
pub struct WgAssignment {
    pub private_key: String,
    pub listen_port: Option<u16>,
    pub peer_public_key: Option<String>,
    pub endpoint: Option<String>,
    pub keepalive: Option<u16>,
    pub allowed_ips: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireGuardState {
    #[allow(dead_code)] // Parsed for completeness; reconciliation keys off the public half
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    #[allow(dead_code)] // Parsed for completeness
    pub fwmark: u32,
    /// peer public key -> runtime peer state
    pub peers: HashMap<String, WireGuardPeer>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireGuardPeer {
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceState {
    pub name: String,
    pub mtu: u32,
    /// Primary IPv4 address with its prefix.
    pub ipv4: Option<Ipv4Net>,
}

impl LinkManager {
    pub fn new(netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
        }
    }

    // ── WireGuard ─────────────────────────────────────────────────────

    pub async fn create_wireguard(&self, name: &str, addr_cidr: &str, mtu: u32) -> NetResult<()> {
        CommandExecutor::run_privileged("", argv(&["ip", "link", "add", name, "type", "wireguard"]))
            .await?;
        CommandExecutor::run_privileged(
            "",
            argv(&["ip", "link", "set", name, "netns", &self.netns]),
        )
        .await?;
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&["ip", "addr", "add", addr_cidr, "dev", name]),
        )
        .await?;
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&["ip", "link", "set", name, "mtu", &mtu.to_string()]),
        )
        .await?;
        tracing::info!(ns = %self.netns, name, addr_cidr, mtu, "created wireguard interface");
        Ok(())
    }

    /// Configure key material and the single peer. The private key transits
    /// through a one-shot temp file consumed by `wg set private-key`; the
    /// file is removed on success and on failure.
    pub async fn assign_wireguard(&self, name: &str, assignment: &WgAssignment) -> NetResult<()> {
        let endpoint = match &assignment.endpoint {
            Some(ep) => Some(resolve_endpoint(ep).await?),
            None => None,
        };

        let key_path = format!("/tmp/wgkey-{}", Uuid::new_v4());
        tokio::fs::write(&key_path, format!("{}\n", assignment.private_key)).await?;

        let mut args = argv(&["wg", "set", name, "private-key", &key_path]);
        if let Some(port) = assignment.listen_port {
            args.extend(argv(&["listen-port", &port.to_string()]));
        }
        if let Some(peer) = &assignment.peer_public_key {
            args.extend(argv(&["peer", peer]));
            if let Some(ep) = &endpoint {
                args.extend(argv(&["endpoint", ep]));
            }
            if let Some(keepalive) = assignment.keepalive {
                args.extend(argv(&["persistent-keepalive", &keepalive.to_string()]));
            }
            if let Some(allowed) = &assignment.allowed_ips {
                args.extend(argv(&["allowed-ips", allowed]));
            }
        }

        // The key file must vanish on every path out of here.
        let result = async {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
            CommandExecutor::run_privileged(&self.netns, args)
                .await
                .map_err(NetError::from)?;
            Ok::<(), NetError>(())
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&key_path).await {
            tracing::warn!(path = %key_path, "failed to remove one-shot key file: {}", e);
        }
        result?;
        tracing::debug!(ns = %self.netns, name, "assigned wireguard configuration");
        Ok(())
    }

    pub async fn up_wireguard(&self, name: &str) -> NetResult<()> {
        CommandExecutor::run_privileged(&self.netns, argv(&["ip", "link", "set", name, "up"]))
            .await?;
        Ok(())
    }

    /// Point one peer's persistent-keepalive without touching anything else.
    pub async fn set_peer_keepalive(
        &self,
        name: &str,
        peer_public_key: &str,
        keepalive: u16,
    ) -> NetResult<()> {
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&[
                "wg",
                "set",
                name,
                "peer",
                peer_public_key,
                "persistent-keepalive",
                &keepalive.to_string(),
            ]),
        )
        .await?;
        Ok(())
    }

    /// Rewrite one peer's endpoint (used to point WireGuard at a local relay).
    pub async fn set_peer_endpoint(
        &self,
        name: &str,
        peer_public_key: &str,
        endpoint: &str,
    ) -> NetResult<()> {
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&["wg", "set", name, "peer", peer_public_key, "endpoint", endpoint]),
        )
        .await?;
        Ok(())
    }

    pub async fn dump_all_wireguard(&self) -> NetResult<HashMap<String, WireGuardState>> {
        let output =
            CommandExecutor::run_privileged(&self.netns, argv(&["wg", "show", "all", "dump"]))
                .await?;
        parse_wg_dump_all(&output)
    }

    pub async fn dump_wireguard(&self, name: &str) -> NetResult<WireGuardState> {
        let output =
            CommandExecutor::run_privileged(&self.netns, argv(&["wg", "show", name, "dump"]))
                .await?;
        parse_wg_dump_single(&output)
    }

    // ── veth / dummy / GRE ────────────────────────────────────────────

    /// Create `{base}0` (root side) paired with `{base}1` (namespace side)
    /// and address them as the two usable hosts of the /30.
    pub async fn create_veth(&self, base_name: &str, cidr: &str) -> NetResult<()> {
        let (host_addr, ns_addr, prefix) = veth_pair_addrs(cidr)?;
        let host_if = format!("{}0", base_name);
        let ns_if = format!("{}1", base_name);

        CommandExecutor::run_privileged(
            "",
            argv(&["ip", "link", "add", &host_if, "type", "veth", "peer", "name", &ns_if]),
        )
        .await?;
        CommandExecutor::run_privileged(
            "",
            argv(&["ip", "link", "set", &ns_if, "netns", &self.netns]),
        )
        .await?;
        CommandExecutor::run_privileged(
            "",
            argv(&[
                "ip",
                "addr",
                "add",
                &format!("{}/{}", host_addr, prefix),
                "dev",
                &host_if,
            ]),
        )
        .await?;
        CommandExecutor::run_privileged("", argv(&["ip", "link", "set", &host_if, "up"])).await?;
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&[
                "ip",
                "addr",
                "add",
                &format!("{}/{}", ns_addr, prefix),
                "dev",
                &ns_if,
            ]),
        )
        .await?;
        CommandExecutor::run_privileged(&self.netns, argv(&["ip", "link", "set", &ns_if, "up"]))
            .await?;
        tracing::info!(ns = %self.netns, host = %host_if, peer = %ns_if, cidr, "created veth pair");
        Ok(())
    }

    #[allow(dead_code)] // Operator-driven device kind, not part of the sync loop
    pub async fn create_dummy(&self, name: &str, addr_cidr: Option<&str>) -> NetResult<()> {
        CommandExecutor::run_privileged("", argv(&["ip", "link", "add", name, "type", "dummy"]))
            .await?;
        CommandExecutor::run_privileged(
            "",
            argv(&["ip", "link", "set", name, "netns", &self.netns]),
        )
        .await?;
        if let Some(cidr) = addr_cidr {
            CommandExecutor::run_privileged(
                &self.netns,
                argv(&["ip", "addr", "add", cidr, "dev", name]),
            )
            .await?;
        }
        CommandExecutor::run_privileged(&self.netns, argv(&["ip", "link", "set", name, "up"]))
            .await?;
        Ok(())
    }

    #[allow(dead_code)] // Operator-driven device kind, not part of the sync loop
    pub async fn create_gre(
        &self,
        name: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        addr_cidr: Option<&str>,
    ) -> NetResult<()> {
        CommandExecutor::run_privileged(
            &self.netns,
            argv(&[
                "ip",
                "tunnel",
                "add",
                name,
                "mode",
                "gre",
                "local",
                &local.to_string(),
                "remote",
                &remote.to_string(),
            ]),
        )
        .await?;
        if let Some(cidr) = addr_cidr {
            CommandExecutor::run_privileged(
                &self.netns,
                argv(&["ip", "addr", "add", cidr, "dev", name]),
            )
            .await?;
        }
        CommandExecutor::run_privileged(&self.netns, argv(&["ip", "link", "set", name, "up"]))
            .await?;
        Ok(())
    }

    /// Delete a namespace device iff it exists.
    pub async fn try_destroy(&self, name: &str) -> NetResult<()> {
        self.try_destroy_in(&self.netns, name).await
    }

    /// Delete a root-namespace device iff it exists (the host side of veth).
    pub async fn try_destroy_root(&self, name: &str) -> NetResult<()> {
        self.try_destroy_in("", name).await
    }

    async fn try_destroy_in(&self, ns: &str, name: &str) -> NetResult<()> {
        let show = CommandExecutor::run_privileged_raw(ns, argv(&["ip", "link", "show", name]))
            .await?;
        if !show.success {
            return Ok(());
        }
        CommandExecutor::run_privileged(ns, argv(&["ip", "link", "del", name])).await?;
        tracing::info!(ns, name, "destroyed interface");
        Ok(())
    }

    /// Inspect a namespace device via `ip -j addr show`. Returns `None` when
    /// the device does not exist.
    pub async fn get_interface_state(&self, name: &str) -> NetResult<Option<InterfaceState>> {
        interface_state_in(&self.netns, name).await
    }

    /// Root-namespace variant (uplink and the host side of veth).
    pub async fn get_root_interface_state(&self, name: &str) -> NetResult<Option<InterfaceState>> {
        interface_state_in("", name).await
    }
}

// ── endpoint resolution ───────────────────────────────────────────────

/// Turn `host:port` / `[v6]:port` into a literal address `wg` accepts,
/// resolving hostnames with an IPv4 preference.
pub async fn resolve_endpoint(endpoint: &str) -> NetResult<String> {
    let (host, port) = split_endpoint(endpoint)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(format_endpoint(ip, port));
    }
    let mut v6_fallback = None;
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| NetError::Parse {
            what: format!("endpoint {}", endpoint),
            message: format!("dns resolution failed: {}", e),
        })?;
    for addr in addrs {
        match addr.ip() {
            ip @ IpAddr::V4(_) => return Ok(format_endpoint(ip, port)),
            ip @ IpAddr::V6(_) => {
                v6_fallback.get_or_insert(ip);
            }
        }
    }
    v6_fallback
        .map(|ip| format_endpoint(ip, port))
        .ok_or_else(|| NetError::NotFound(format!("no address for endpoint {}", endpoint)))
}

pub fn split_endpoint(endpoint: &str) -> NetResult<(String, u16)> {
    let bad = |msg: &str| NetError::Validation(format!("endpoint '{}': {}", endpoint, msg));
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| bad("unterminated bracket"))?;
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("missing port"))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| bad("missing port"))?;
    let port = port.parse().map_err(|_| bad("invalid port"))?;
    Ok((host.to_string(), port))
}

fn format_endpoint(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

// ── /30 addressing ────────────────────────────────────────────────────

/// For `a.b.c.d/30` with network N the host side is N+1 and the namespace
/// side N+2; those are the only two usable hosts.
pub fn veth_pair_addrs(cidr: &str) -> NetResult<(Ipv4Addr, Ipv4Addr, u8)> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|e| NetError::Validation(format!("bad veth cidr '{}': {}", cidr, e)))?;
    if net.prefix_len() != 30 {
        return Err(NetError::Validation(format!(
            "veth cidr '{}' must be a /30",
            cidr
        )));
    }
    let base = u32::from(net.network());
    Ok((
        Ipv4Addr::from(base + 1),
        Ipv4Addr::from(base + 2),
        net.prefix_len(),
    ))
}

// ── ip -j addr parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IpAddrShowEntry {
    ifname: String,
    mtu: u32,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

async fn interface_state_in(ns: &str, name: &str) -> NetResult<Option<InterfaceState>> {
    let args = argv(&["ip", "-j", "addr", "show", "dev", name]);
    let out = CommandExecutor::run_privileged_raw(ns, args.clone()).await?;
    if !out.success {
        return Ok(None);
    }
    match parse_interface_state(&out.stdout) {
        Ok(state) => Ok(state),
        Err(first) => {
            // ip occasionally emits truncated JSON under churn; one retry.
            tracing::warn!(ns, name, "ip -j parse failed, retrying: {}", first);
            tokio::time::sleep(Duration::from_secs(3)).await;
            let out = CommandExecutor::run_privileged_raw(ns, args).await?;
            if !out.success {
                return Ok(None);
            }
            parse_interface_state(&out.stdout)
        }
    }
}

fn parse_interface_state(json: &str) -> NetResult<Option<InterfaceState>> {
    let entries: Vec<IpAddrShowEntry> =
        serde_json::from_str(json).map_err(|e| NetError::Parse {
            what: "ip -j addr show".to_string(),
            message: e.to_string(),
        })?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };
    let ipv4 = entry
        .addr_info
        .iter()
        .filter(|a| a.family == "inet")
        .find_map(|a| {
            let addr: Ipv4Addr = a.local.parse().ok()?;
            Ipv4Net::new(addr, a.prefixlen).ok()
        });
    Ok(Some(InterfaceState {
        name: entry.ifname,
        mtu: entry.mtu,
        ipv4,
    }))
}

// ── wg dump parsing ───────────────────────────────────────────────────

fn optional_field(value: &str) -> Option<&str> {
    match value {
        "(none)" | "off" => None,
        other => Some(other),
    }
}

fn parse_fwmark(value: &str) -> u32 {
    if value == "off" {
        return 0;
    }
    if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        value.parse().unwrap_or(0)
    }
}

fn parse_peer_fields(fields: &[&str]) -> NetResult<(String, WireGuardPeer)> {
    if fields.len() != 8 {
        return Err(NetError::Parse {
            what: "wg dump peer line".to_string(),
            message: format!("expected 8 fields, got {}", fields.len()),
        });
    }
    let numeric = |v: &str, what: &str| -> NetResult<u64> {
        v.parse().map_err(|_| NetError::Parse {
            what: "wg dump peer line".to_string(),
            message: format!("bad {}: '{}'", what, v),
        })
    };
    let peer = WireGuardPeer {
        endpoint: optional_field(fields[2]).map(str::to_string),
        allowed_ips: optional_field(fields[3])
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        latest_handshake: numeric(fields[4], "handshake")?,
        rx_bytes: numeric(fields[5], "rx")?,
        tx_bytes: numeric(fields[6], "tx")?,
        keepalive: optional_field(fields[7]).and_then(|v| v.parse().ok()),
    };
    Ok((fields[0].to_string(), peer))
}

/// `wg show all dump`: every line is prefixed by the interface name; the
/// interface line has 5 tab-separated fields, peer lines have 9.
pub fn parse_wg_dump_all(output: &str) -> NetResult<HashMap<String, WireGuardState>> {
    let mut states: HashMap<String, WireGuardState> = HashMap::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.len() {
            5 => {
                states.insert(
                    fields[0].to_string(),
                    WireGuardState {
                        private_key: fields[1].to_string(),
                        public_key: fields[2].to_string(),
                        listen_port: fields[3].parse().unwrap_or(0),
                        fwmark: parse_fwmark(fields[4]),
                        peers: HashMap::new(),
                    },
                );
            }
            9 => {
                let iface = fields[0];
                let (public_key, peer) = parse_peer_fields(&fields[1..])?;
                states
                    .get_mut(iface)
                    .ok_or_else(|| NetError::Parse {
                        what: "wg show all dump".to_string(),
                        message: format!("peer line before interface line for {}", iface),
                    })?
                    .peers
                    .insert(public_key, peer);
            }
            n => {
                return Err(NetError::Parse {
                    what: "wg show all dump".to_string(),
                    message: format!("unexpected field count {}", n),
                })
            }
        }
    }
    Ok(states)
}

/// `wg show {name} dump`: first line is the interface (4 fields), the rest
/// are peers (8 fields).
pub fn parse_wg_dump_single(output: &str) -> NetResult<WireGuardState> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| NetError::Parse {
        what: "wg show dump".to_string(),
        message: "empty output".to_string(),
    })?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() != 4 {
        return Err(NetError::Parse {
            what: "wg show dump".to_string(),
            message: format!("expected 4 header fields, got {}", fields.len()),
        });
    }
    let mut state = WireGuardState {
        private_key: fields[0].to_string(),
        public_key: fields[1].to_string(),
        listen_port: fields[2].parse().unwrap_or(0),
        fwmark: parse_fwmark(fields[3]),
        peers: HashMap::new(),
    };
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let (public_key, peer) = parse_peer_fields(&fields)?;
        state.peers.insert(public_key, peer);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_addresses_are_the_two_usable_hosts() {
        let (host, ns, prefix) = veth_pair_addrs("10.0.0.1/30").unwrap();
        assert_eq!(host, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ns, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(prefix, 30);

        let (host, ns, _) = veth_pair_addrs("192.168.7.9/30").unwrap();
        assert_eq!(host, Ipv4Addr::new(192, 168, 7, 9));
        assert_eq!(ns, Ipv4Addr::new(192, 168, 7, 10));
    }

    #[test]
    fn veth_rejects_non_30_prefixes() {
        assert!(veth_pair_addrs("10.0.0.1/32").is_err());
        assert!(veth_pair_addrs("10.0.0.1/24").is_err());
        assert!(veth_pair_addrs("not-a-cidr").is_err());
    }

    #[test]
    fn endpoint_split_handles_v4_v6_and_names() {
        assert_eq!(
            split_endpoint("198.51.100.9:51820").unwrap(),
            ("198.51.100.9".to_string(), 51820)
        );
        assert_eq!(
            split_endpoint("[2001:db8::1]:443").unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
        assert_eq!(
            split_endpoint("relay.example.org:443").unwrap(),
            ("relay.example.org".to_string(), 443)
        );
        assert!(split_endpoint("no-port").is_err());
    }

    #[test]
    fn wg_dump_all_parses_interfaces_and_peers() {
        let dump = "netA-7\tPRIV_A\tPUB_A\t51820\toff\n\
                    netA-7\tPUB_B\t(none)\t198.51.100.9:51820\t0.0.0.0/0\t1700000000\t1024\t2048\t25\n\
                    netA-9\tPRIV_C\tPUB_C\t0\t0x2a\n";
        let states = parse_wg_dump_all(dump).unwrap();
        assert_eq!(states.len(), 2);

        let a = &states["netA-7"];
        assert_eq!(a.listen_port, 51820);
        assert_eq!(a.fwmark, 0);
        let peer = &a.peers["PUB_B"];
        assert_eq!(peer.endpoint.as_deref(), Some("198.51.100.9:51820"));
        assert_eq!(peer.allowed_ips, vec!["0.0.0.0/0"]);
        assert_eq!(peer.rx_bytes, 1024);
        assert_eq!(peer.tx_bytes, 2048);
        assert_eq!(peer.keepalive, Some(25));

        let b = &states["netA-9"];
        assert_eq!(b.listen_port, 0);
        assert_eq!(b.fwmark, 0x2a);
        assert!(b.peers.is_empty());
    }

    #[test]
    fn wg_dump_single_parses_header_and_absent_fields() {
        let dump = "PRIV_A\tPUB_A\t51820\toff\n\
                    PUB_B\t(none)\t(none)\t10.0.0.0/30\t0\t0\t0\toff\n";
        let state = parse_wg_dump_single(dump).unwrap();
        assert_eq!(state.public_key, "PUB_A");
        let peer = &state.peers["PUB_B"];
        assert_eq!(peer.endpoint, None);
        assert_eq!(peer.keepalive, None);
        assert_eq!(peer.latest_handshake, 0);
    }

    #[test]
    fn wg_dump_rejects_orphan_peer_lines() {
        let dump = "netA-7\tPUB_B\t(none)\t(none)\t0.0.0.0/0\t0\t0\t0\toff\n";
        assert!(parse_wg_dump_all(dump).is_err());
    }

    #[test]
    fn interface_state_picks_first_inet_address() {
        let json = r#"[{"ifname":"netA-7","mtu":1420,"addr_info":[
            {"family":"inet6","local":"fe80::1","prefixlen":64},
            {"family":"inet","local":"10.0.0.1","prefixlen":30}
        ]}]"#;
        let state = parse_interface_state(json).unwrap().unwrap();
        assert_eq!(state.name, "netA-7");
        assert_eq!(state.mtu, 1420);
        let net = state.ipv4.unwrap();
        assert_eq!(net.addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(net.prefix_len(), 30);
    }

    #[test]
    fn interface_state_surfaces_json_errors() {
        assert!(parse_interface_state("[{\"ifname\": truncated").is_err());
        assert!(parse_interface_state("[]").unwrap().is_none());
    }
}
