// Single-file relational store: node settings, WireGuard key pool, and
// TTL-keyed ephemera (relay-worker records).
pub mod error;
pub mod kv;
pub mod schema;
pub mod settings;
pub mod wgkeys;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use error::StoreResult;
use kv::KvManager;
use schema::SchemaManager;
use settings::SettingsManager;
use wgkeys::WgKeyManager;

pub use error::StoreError;
pub use kv::LocalUnderlayState;
pub use settings::{NodeSettings, NodeSettingsPatch};
pub use wgkeys::WireGuardKeyPair;

pub struct Store {
    pool: SqlitePool,
    settings: SettingsManager,
    wg_keys: WgKeyManager,
    kv: KvManager,
}

impl Store {
    pub async fn open(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(path))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        SchemaManager::new(pool.clone()).initialize_schema().await?;

        Ok(Self {
            settings: SettingsManager::new(pool.clone()),
            wg_keys: WgKeyManager::new(pool.clone()),
            kv: KvManager::new(pool.clone()),
            pool,
        })
    }

    pub fn settings(&self) -> &SettingsManager {
        &self.settings
    }

    pub fn wg_keys(&self) -> &WgKeyManager {
        &self.wg_keys
    }

    pub fn kv(&self) -> &KvManager {
        &self.kv
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
