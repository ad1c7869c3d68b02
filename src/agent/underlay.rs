use crate::agent::reconcile::{peer_underlay, underlay_unit_name, Reconciler};
use crate::agent::{AgentError, AgentResult};
use crate::api::model::{PeerUnderlay, RemotePeerInfo};
use crate::net::link::{resolve_endpoint, split_endpoint};
use crate::store::LocalUnderlayState;

impl Reconciler {
    /// Per-peer relay-worker state machine. The four (recorded, desired)
    /// combinations map to no-op / create / destroy / conditional recreate.
    pub(crate) async fn sync_underlay(
        &self,
        peer: &RemotePeerInfo,
        ifname: &str,
    ) -> AgentResult<()> {
        let desired = peer_underlay(peer);
        let recorded = self.store.kv().get_underlay_state(ifname).await?;

        match (recorded, desired) {
            (None, None) => {}
            (None, Some(want)) => {
                self.create_underlay(peer, ifname, want).await?;
            }
            (Some(have), None) => {
                self.remove_underlay(ifname, &have).await?;
            }
            (Some(have), Some(want)) => {
                if underlay_needs_recreate(&have, want) {
                    tracing::info!(ifname, "relay worker parameters changed, recreating");
                    self.remove_underlay(ifname, &have).await?;
                    self.create_underlay(peer, ifname, want).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_underlay(
        &self,
        peer: &RemotePeerInfo,
        ifname: &str,
        want: &PeerUnderlay,
    ) -> AgentResult<()> {
        match want {
            PeerUnderlay::GostRelayClient {
                listen_port,
                server_addr,
                server_port,
            } => {
                let endpoint_port = split_endpoint(&peer.endpoint)?.1;
                // An empty server address means "same host as the WireGuard
                // endpoint"; resolve it to a literal, IPv4 first.
                let server_ip = match server_addr.as_deref().filter(|s| !s.is_empty()) {
                    Some(addr) => addr.to_string(),
                    None => {
                        let resolved = resolve_endpoint(&peer.endpoint).await?;
                        split_endpoint(&resolved)?.0
                    }
                };
                let server_port = server_port.unwrap_or(endpoint_port);

                let unit = self
                    .relay
                    .start_client(*listen_port, &server_ip, server_port)
                    .await?;
                self.store
                    .kv()
                    .set_underlay_state(
                        ifname,
                        &LocalUnderlayState::Client {
                            unit_name: unit,
                            listen_port: *listen_port,
                            server_ip,
                            server_port,
                        },
                    )
                    .await?;
                // WireGuard now talks to the local worker instead of the
                // unreachable native endpoint.
                self.link
                    .set_peer_endpoint(
                        ifname,
                        &peer.peer_public_key,
                        &format!("127.0.0.1:{}", listen_port),
                    )
                    .await?;
            }
            PeerUnderlay::GostRelayServer { listen_port } => {
                let wg = self.link.dump_wireguard(ifname).await?;
                if wg.listen_port == 0 {
                    return Err(AgentError::Invariant(format!(
                        "relay server requested but {} has no listen port",
                        ifname
                    )));
                }
                let unit = self.relay.start_server(*listen_port, wg.listen_port).await?;
                self.store
                    .kv()
                    .set_underlay_state(
                        ifname,
                        &LocalUnderlayState::Server {
                            unit_name: unit,
                            listen_port: *listen_port,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn remove_underlay(
        &self,
        ifname: &str,
        have: &LocalUnderlayState,
    ) -> AgentResult<()> {
        self.relay.stop(underlay_unit_name(have)).await;
        self.store.kv().delete_underlay_state(ifname).await?;
        Ok(())
    }
}

/// Recreate when the mode flipped, a relevant port moved, or (client mode)
/// the remote names a server address different from the recorded one.
pub(crate) fn underlay_needs_recreate(have: &LocalUnderlayState, want: &PeerUnderlay) -> bool {
    match (have, want) {
        (
            LocalUnderlayState::Client {
                listen_port: have_listen,
                server_ip,
                server_port: have_server_port,
                ..
            },
            PeerUnderlay::GostRelayClient {
                listen_port,
                server_addr,
                server_port,
            },
        ) => {
            if have_listen != listen_port {
                return true;
            }
            if let Some(port) = server_port {
                if port != have_server_port {
                    return true;
                }
            }
            match server_addr.as_deref().filter(|s| !s.is_empty()) {
                Some(addr) => addr != server_ip,
                None => false,
            }
        }
        (
            LocalUnderlayState::Server {
                listen_port: have_listen,
                ..
            },
            PeerUnderlay::GostRelayServer { listen_port },
        ) => have_listen != listen_port,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_record() -> LocalUnderlayState {
        LocalUnderlayState::Client {
            unit_name: "networktools-netA-worker-u1".to_string(),
            listen_port: 1080,
            server_ip: "1.2.3.4".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn mode_change_forces_recreate() {
        let want = PeerUnderlay::GostRelayServer { listen_port: 2000 };
        assert!(underlay_needs_recreate(&client_record(), &want));
    }

    #[test]
    fn matching_client_parameters_keep_the_worker() {
        let want = PeerUnderlay::GostRelayClient {
            listen_port: 1080,
            server_addr: Some("1.2.3.4".to_string()),
            server_port: Some(443),
        };
        assert!(!underlay_needs_recreate(&client_record(), &want));
    }

    #[test]
    fn client_port_or_address_drift_forces_recreate() {
        let moved_listen = PeerUnderlay::GostRelayClient {
            listen_port: 1081,
            server_addr: None,
            server_port: None,
        };
        assert!(underlay_needs_recreate(&client_record(), &moved_listen));

        let moved_server_port = PeerUnderlay::GostRelayClient {
            listen_port: 1080,
            server_addr: None,
            server_port: Some(8443),
        };
        assert!(underlay_needs_recreate(&client_record(), &moved_server_port));

        let moved_addr = PeerUnderlay::GostRelayClient {
            listen_port: 1080,
            server_addr: Some("5.6.7.8".to_string()),
            server_port: Some(443),
        };
        assert!(underlay_needs_recreate(&client_record(), &moved_addr));
    }

    #[test]
    fn empty_server_addr_never_forces_recreate() {
        let want = PeerUnderlay::GostRelayClient {
            listen_port: 1080,
            server_addr: Some(String::new()),
            server_port: None,
        };
        assert!(!underlay_needs_recreate(&client_record(), &want));
    }

    #[test]
    fn server_listen_port_drift_forces_recreate() {
        let have = LocalUnderlayState::Server {
            unit_name: "u".to_string(),
            listen_port: 2000,
        };
        assert!(!underlay_needs_recreate(
            &have,
            &PeerUnderlay::GostRelayServer { listen_port: 2000 }
        ));
        assert!(underlay_needs_recreate(
            &have,
            &PeerUnderlay::GostRelayServer { listen_port: 2001 }
        ));
    }
}
