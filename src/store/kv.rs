use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::error::StoreResult;

/// A locally supervised relay worker paired with one WireGuard interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LocalUnderlayState {
    Client {
        unit_name: String,
        listen_port: u16,
        server_ip: String,
        server_port: u16,
    },
    Server { unit_name: String, listen_port: u16 },
}

pub struct KvManager {
    pool: SqlitePool,
}

impl KvManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read a key, dropping it when its TTL has elapsed. `expires` is a unix
    /// timestamp; entries with NULL never expire.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value, expires FROM simplekv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires: Option<i64> = row.get("expires");
        if let Some(expires) = expires {
            if expires <= now_unix()? {
                self.delete(key).await?;
                return Ok(None);
            }
        }
        Ok(Some(row.get("value")))
    }

    pub async fn set(&self, key: &str, value: &str, expires: Option<i64>) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO simplekv (key, value, expires) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(expires)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM simplekv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── underlay worker records ───────────────────────────────────────

    pub async fn get_underlay_state(&self, ifname: &str) -> StoreResult<Option<LocalUnderlayState>> {
        let Some(raw) = self.get(&underlay_key(ifname)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Underlay records carry no TTL; they live until reconciliation deletes
    /// them.
    pub async fn set_underlay_state(
        &self,
        ifname: &str,
        state: &LocalUnderlayState,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(state)?;
        self.set(&underlay_key(ifname), &raw, None).await
    }

    pub async fn delete_underlay_state(&self, ifname: &str) -> StoreResult<()> {
        self.delete(&underlay_key(ifname)).await
    }
}

fn underlay_key(ifname: &str) -> String {
    format!("underlay-worker-{}", ifname)
}

fn now_unix() -> StoreResult<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64)
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
    async fn expired_entries_are_deleted_on_read() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file).await;
        let kv = store.kv();

        kv.set("ephemeral", "x", Some(1)).await.unwrap();
        assert_eq!(kv.get("ephemeral").await.unwrap(), None);

        let future = now_unix().unwrap() + 3600;
        kv.set("live", "y", Some(future)).await.unwrap();
        assert_eq!(kv.get("live").await.unwrap(), Some("y".to_string()));

        kv.set("forever", "z", None).await.unwrap();
        assert_eq!(kv.get("forever").await.unwrap(), Some("z".to_string()));
    }

    #[tokio::test]
    async fn underlay_records_round_trip_both_modes() {
        let file = NamedTempFile::new().unwrap();
        let store = open_store(&file).await;
        let kv = store.kv();

        let client = LocalUnderlayState::Client {
            unit_name: "networktools-netA-worker-u1".to_string(),
            listen_port: 1080,
            server_ip: "1.2.3.4".to_string(),
            server_port: 443,
        };
        kv.set_underlay_state("netA-7", &client).await.unwrap();
        assert_eq!(kv.get_underlay_state("netA-7").await.unwrap(), Some(client));

        let server = LocalUnderlayState::Server {
            unit_name: "networktools-netA-worker-u2".to_string(),
            listen_port: 2000,
        };
        kv.set_underlay_state("netA-7", &server).await.unwrap();
        assert_eq!(
            kv.get_underlay_state("netA-7").await.unwrap(),
            Some(server)
        );

        kv.delete_underlay_state("netA-7").await.unwrap();
        assert_eq!(kv.get_underlay_state("netA-7").await.unwrap(), None);
        // Unrelated interfaces are untouched.
        assert_eq!(kv.get_underlay_state("netA-9").await.unwrap(), None);
    }
}
