use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

use crate::api::model::{
    JoinResponse, LinkTelemetry, NodeConfigResponse, PeersResponse, RemoteNodeInfo, RemotePeerInfo,
};
use crate::ospf::state::OspfState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response schema error: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("node key error: {0}")]
    Key(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Signed HTTP client for the central controller. Every request carries the
/// node identity (`X-Client-Id`), a fresh nonce, and an Ed25519 signature
/// over `"{path}\n{nonce}\n{query-or-body}"`.
pub struct ControllerClient {
    base_url: String,
    signing_key: SigningKey,
    client_id: String,
    http: reqwest::Client,
}

impl ControllerClient {
    pub fn new(domain_prefix: &str, private_key_pem: &str) -> ApiResult<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| ApiError::Key(format!("bad private key pem: {}", e)))?;
        let client_id = derive_client_id(&signing_key)?;
        Ok(Self {
            base_url: domain_prefix.trim_end_matches('/').to_string(),
            signing_key,
            client_id,
            http: reqwest::Client::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ── endpoints ─────────────────────────────────────────────────────

    pub async fn fetch_node_config(&self) -> ApiResult<RemoteNodeInfo> {
        let value = self.get("/api/v1/node/config", &[]).await?;
        let response: NodeConfigResponse = serde_json::from_value(value)?;
        Ok(serde_json::from_str(&response.config)?)
    }

    pub async fn fetch_peers(&self) -> ApiResult<Vec<RemotePeerInfo>> {
        let value = self.get("/api/v1/node/peers", &[]).await?;
        let response: PeersResponse = serde_json::from_value(value)?;
        Ok(response
            .peers
            .into_iter()
            .map(|raw| raw.into_peer())
            .collect())
    }

    pub async fn sync_wireguard_keys(&self, public_keys: &[String]) -> ApiResult<()> {
        self.post(
            "/api/v1/node/sync_wireguard_keys",
            &serde_json::json!({ "keys": public_keys }),
        )
        .await?;
        Ok(())
    }

    pub async fn report_link_telemetry(&self, links: &[LinkTelemetry]) -> ApiResult<()> {
        self.post(
            "/api/v1/node/link_telemetry",
            &serde_json::json!({ "links": links }),
        )
        .await?;
        Ok(())
    }

    pub async fn report_router_telemetry(&self, state: &OspfState) -> ApiResult<()> {
        // OspfState serializes to exactly {area_routers, other_asbrs}.
        self.post("/api/v1/node/router_telemetry", &serde_json::to_value(state)?)
            .await?;
        Ok(())
    }

    pub async fn join(&self) -> ApiResult<JoinResponse> {
        let public_key = hex::encode(self.signing_key.verifying_key().to_bytes());
        let value = self
            .post("/api/v1/node/join", &serde_json::json!({ "public_key": public_key }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // ── transport ─────────────────────────────────────────────────────

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> ApiResult<serde_json::Value> {
        let qs = encode_query(params);
        let nonce = make_nonce();
        let signature = sign_request(&self.signing_key, path, &nonce, &qs);
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };
        let response = self
            .http
            .get(url)
            .header("X-Client-Id", &self.client_id)
            .header("X-Client-Nonce", &nonce)
            .header("X-Client-Sign", &signature)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> ApiResult<serde_json::Value> {
        // Sign the exact byte string that goes on the wire.
        let body_text = serde_json::to_string(body)?;
        let nonce = make_nonce();
        let signature = sign_request(&self.signing_key, path, &nonce, &body_text);
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .header("X-Client-Id", &self.client_id)
            .header("X-Client-Nonce", &nonce)
            .header("X-Client-Sign", &signature)
            .body(body_text)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> ApiResult<serde_json::Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// `X-Client-Id`: SHA-256 hex over the SPKI DER of the node public key.
pub fn derive_client_id(key: &SigningKey) -> ApiResult<String> {
    let spki = key
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| ApiError::Key(format!("spki encoding failed: {}", e)))?;
    Ok(hex::encode(Sha256::digest(spki.as_bytes())))
}

/// Hex Ed25519 signature over `"{path}\n{nonce}\n{payload}"`.
pub fn sign_request(key: &SigningKey, path: &str, nonce: &str, payload: &str) -> String {
    let message = format!("{}\n{}\n{}", path, nonce, payload);
    hex::encode(key.sign(message.as_bytes()).to_bytes())
}

fn make_nonce() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

fn encode_query(params: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn signatures_are_stable_for_the_same_key_and_input() {
        let key = test_key();
        let first = sign_request(&key, "/api/v1/node/config", "0011223344556677", "{}");
        let second = sign_request(&key, "/api/v1/node/config", "0011223344556677", "{}");
        assert_eq!(first, second);
        assert_eq!(first.len(), 128);

        let other = sign_request(&key, "/api/v1/node/config", "ffffffffffffffff", "{}");
        assert_ne!(first, other);
    }

    #[test]
    fn client_id_is_a_sha256_hex_of_the_spki() {
        let id = derive_client_id(&test_key()).unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for a fixed key.
        assert_eq!(id, derive_client_id(&test_key()).unwrap());
    }

    #[test]
    fn nonce_is_eight_random_bytes_hex() {
        let nonce = make_nonce();
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn query_encoding_is_url_form_encoded() {
        assert_eq!(encode_query(&[]), "");
        assert_eq!(
            encode_query(&[("a", "1"), ("b", "x y")]),
            "a=1&b=x+y"
        );
    }
}
