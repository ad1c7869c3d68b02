use serde::{Deserialize, Serialize};

/// The one "non-empty optional string" predicate: controller fields arrive
/// as `null` in some deployments and `""` in others; both mean absent.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Node-level desired state, carried as a JSON string inside the
/// `node/config` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteNodeInfo {
    pub exit_node: bool,
    #[serde(rename = "vethCIDR")]
    pub veth_cidr: Option<String>,
    pub ospf: Option<NodeOspfConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOspfConfig {
    pub area: String,
    #[serde(default)]
    pub cost: Option<u32>,
    #[serde(default)]
    pub auth: Option<String>,
}

/// Per-peer desired state as it arrives on the wire; `extra` is still the
/// raw JSON blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeerInfoRaw {
    pub id: i64,
    /// Selects which locally held private key this link uses.
    pub public_key: String,
    pub peer_public_key: String,
    #[serde(rename = "addressCIDR")]
    pub address_cidr: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub keepalive: Option<u16>,
    pub endpoint: String,
    #[serde(default)]
    pub extra: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemotePeerInfo {
    pub id: i64,
    pub public_key: String,
    pub peer_public_key: String,
    pub address_cidr: String,
    pub listen_port: u16,
    pub mtu: Option<u32>,
    pub keepalive: Option<u16>,
    pub endpoint: String,
    pub extra: Option<PeerExtra>,
}

impl RemotePeerInfoRaw {
    /// Decode `extra` per peer; a malformed blob degrades that one peer to
    /// `extra = None` instead of failing the batch.
    pub fn into_peer(self) -> RemotePeerInfo {
        let extra = self.extra.as_deref().filter(|s| !s.is_empty()).and_then(|raw| {
            match serde_json::from_str::<PeerExtra>(raw) {
                Ok(extra) => Some(extra),
                Err(e) => {
                    tracing::warn!(peer = self.id, "unparseable peer extra, ignoring: {}", e);
                    None
                }
            }
        });
        RemotePeerInfo {
            id: self.id,
            public_key: self.public_key,
            peer_public_key: self.peer_public_key,
            address_cidr: self.address_cidr,
            listen_port: self.listen_port,
            mtu: self.mtu,
            keepalive: self.keepalive,
            endpoint: self.endpoint,
            extra,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerExtra {
    pub ospf: Option<PeerOspfExtra>,
    pub underlay: Option<PeerUnderlay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerOspfExtra {
    pub cost: Option<u32>,
    /// Measure this link and use the round-trip time as the base cost.
    pub ping: bool,
    pub offset: f64,
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum PeerUnderlay {
    GostRelayClient {
        listen_port: u16,
        #[serde(default)]
        server_addr: Option<String>,
        #[serde(default)]
        server_port: Option<u16>,
    },
    GostRelayServer { listen_port: u16 },
}

// ── responses ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NodeConfigResponse {
    pub config: String,
}

#[derive(Debug, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<RemotePeerInfoRaw>,
}

#[derive(Debug, Deserialize)]
pub struct JoinResponse {
    pub node_id: i64,
}

// ── telemetry payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LinkTelemetry {
    pub id: i64,
    /// Trimmed-mean round-trip in milliseconds, -1 when unmeasured.
    pub ping: f64,
    pub rx: u64,
    pub tx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_peer(extra: Option<&str>) -> RemotePeerInfoRaw {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "publicKey": "PUB_A",
            "peerPublicKey": "PUB_B",
            "addressCIDR": "10.0.0.1/30",
            "listenPort": 51820,
            "mtu": 1420,
            "keepalive": 25,
            "endpoint": "198.51.100.9:51820",
            "extra": extra,
        }))
        .unwrap()
    }

    #[test]
    fn peer_extra_parses_ospf_and_underlay() {
        let extra = r#"{"ospf":{"cost":1000,"ping":true,"offset":5},
                        "underlay":{"provider":"gost_relay_client","listen_port":1080,
                                    "server_addr":"1.2.3.4","server_port":443}}"#;
        let peer = raw_peer(Some(extra)).into_peer();
        let extra = peer.extra.unwrap();
        let ospf = extra.ospf.unwrap();
        assert_eq!(ospf.cost, Some(1000));
        assert!(ospf.ping);
        assert_eq!(ospf.offset, 5.0);
        assert_eq!(
            extra.underlay,
            Some(PeerUnderlay::GostRelayClient {
                listen_port: 1080,
                server_addr: Some("1.2.3.4".to_string()),
                server_port: Some(443),
            })
        );
    }

    #[test]
    fn malformed_extra_degrades_to_none() {
        let peer = raw_peer(Some("{not json")).into_peer();
        assert!(peer.extra.is_none());
        let peer = raw_peer(None).into_peer();
        assert!(peer.extra.is_none());
    }

    #[test]
    fn node_config_tolerates_missing_fields() {
        let info: RemoteNodeInfo = serde_json::from_str("{}").unwrap();
        assert!(!info.exit_node);
        assert!(info.veth_cidr.is_none());

        let info: RemoteNodeInfo = serde_json::from_str(
            r#"{"exitNode":true,"vethCIDR":"10.9.0.1/30","ospf":{"area":"1","cost":50}}"#,
        )
        .unwrap();
        assert!(info.exit_node);
        assert_eq!(info.ospf.unwrap().area, "1");
    }

    #[test]
    fn non_empty_treats_blank_as_absent() {
        assert_eq!(non_empty(&None), None);
        assert_eq!(non_empty(&Some(String::new())), None);
        assert_eq!(non_empty(&Some("10.0.0.0/30".to_string())), Some("10.0.0.0/30"));
    }
}
