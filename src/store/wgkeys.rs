use sqlx::{FromRow, SqlitePool};

use crate::store::error::StoreResult;

/// One pre-generated WireGuard keypair. The controller assigns links by
/// public key, so the agent must already hold the private half.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct WireGuardKeyPair {
    pub private: String,
    pub public: String,
}

pub struct WgKeyManager {
    pool: SqlitePool,
}

impl WgKeyManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a keypair; a duplicate public key is a no-op.
    pub async fn create_wireguard_key(&self, private: &str, public: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO wgkey (private, public) VALUES (?, ?)")
            .bind(private)
            .bind(public)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_all_wireguard_keys(&self) -> StoreResult<Vec<WireGuardKeyPair>> {
        sqlx::query_as::<_, WireGuardKeyPair>("SELECT private, public FROM wgkey")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn duplicate_public_keys_are_ignored() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).await.unwrap();

        store
            .wg_keys()
            .create_wireguard_key("PRIV_A", "PUB_A")
            .await
            .unwrap();
        store
            .wg_keys()
            .create_wireguard_key("PRIV_A2", "PUB_A")
            .await
            .unwrap();
        store
            .wg_keys()
            .create_wireguard_key("PRIV_B", "PUB_B")
            .await
            .unwrap();

        let keys = store.wg_keys().get_all_wireguard_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        let a = keys.iter().find(|k| k.public == "PUB_A").unwrap();
        assert_eq!(a.private, "PRIV_A");
    }
}
