use sqlx::{Row, SqlitePool};

use crate::store::error::StoreResult;

/// Identity and placement of this node; written by the init flow, read by
/// every reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    /// Linux netns holding all overlay devices.
    pub namespace: String,
    /// Host uplink interface (SNAT target, exit-node egress).
    pub eth_name: String,
    /// Ed25519 node key, PKCS#8 PEM.
    pub private_key: String,
    /// Assigned on cluster join.
    pub node_id: Option<i64>,
    /// Controller base URL.
    pub domain_prefix: String,
}

/// Partial update; only present fields are written.
#[derive(Debug, Clone, Default)]
pub struct NodeSettingsPatch {
    pub namespace: Option<String>,
    pub eth_name: Option<String>,
    pub private_key: Option<String>,
    pub node_id: Option<i64>,
    pub domain_prefix: Option<String>,
}

pub struct SettingsManager {
    pool: SqlitePool,
}

impl SettingsManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load settings; `None` until the init flow has written the required
    /// fields.
    pub async fn get_node_settings(&self) -> StoreResult<Option<NodeSettings>> {
        let rows = sqlx::query("SELECT key, value FROM nodeconfig")
            .fetch_all(&self.pool)
            .await?;

        let mut namespace = None;
        let mut eth_name = None;
        let mut private_key = None;
        let mut node_id = None;
        let mut domain_prefix = None;
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            match key.as_str() {
                "namespace" => namespace = Some(value),
                "eth_name" => eth_name = Some(value),
                "private_key" => private_key = Some(value),
                "node_id" => node_id = value.parse().ok(),
                "domain_prefix" => domain_prefix = Some(value),
                other => tracing::debug!(key = other, "ignoring unknown nodeconfig key"),
            }
        }

        match (namespace, eth_name, private_key, domain_prefix) {
            (Some(namespace), Some(eth_name), Some(private_key), Some(domain_prefix)) => {
                Ok(Some(NodeSettings {
                    namespace,
                    eth_name,
                    private_key,
                    node_id,
                    domain_prefix,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Upsert only the fields present in the patch.
    pub async fn set_node_settings(&self, patch: &NodeSettingsPatch) -> StoreResult<()> {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(v) = &patch.namespace {
            pairs.push(("namespace", v.clone()));
        }
        if let Some(v) = &patch.eth_name {
            pairs.push(("eth_name", v.clone()));
        }
        if let Some(v) = &patch.private_key {
            pairs.push(("private_key", v.clone()));
        }
        if let Some(v) = patch.node_id {
            pairs.push(("node_id", v.to_string()));
        }
        if let Some(v) = &patch.domain_prefix {
            pairs.push(("domain_prefix", v.clone()));
        }
        for (key, value) in pairs {
            sqlx::query("INSERT OR REPLACE INTO nodeconfig (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::NamedTempFile;

    async fn open_store(file: &NamedTempFile) -> Store {
        Store::open(file.path().to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn settings_absent_until_required_fields_written() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file).await;
        assert!(store.settings().get_node_settings().await.unwrap().is_none());

        store
            .settings()
            .set_node_settings(&NodeSettingsPatch {
                namespace: Some("netA".to_string()),
                ..NodeSettingsPatch::default()
            })
            .await
            .unwrap();
        assert!(store.settings().get_node_settings().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_upsert_preserves_other_fields() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file).await;
        store
            .settings()
            .set_node_settings(&NodeSettingsPatch {
                namespace: Some("netA".to_string()),
                eth_name: Some("eth0".to_string()),
                private_key: Some("PEM".to_string()),
                domain_prefix: Some("https://ctl.example".to_string()),
                node_id: None,
            })
            .await
            .unwrap();

        store
            .settings()
            .set_node_settings(&NodeSettingsPatch {
                node_id: Some(42),
                ..NodeSettingsPatch::default()
            })
            .await
            .unwrap();

        let settings = store
            .settings()
            .get_node_settings()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings.namespace, "netA");
        assert_eq!(settings.eth_name, "eth0");
        assert_eq!(settings.node_id, Some(42));
        assert_eq!(settings.domain_prefix, "https://ctl.example");
    }
}
