use sqlx::SqlitePool;

use crate::store::error::StoreResult;

pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        self.create_nodeconfig_table().await?;
        self.create_wgkey_table().await?;
        self.create_simplekv_table().await?;
        tracing::info!("store schema initialized");
        Ok(())
    }

    async fn create_nodeconfig_table(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodeconfig (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_wgkey_table(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wgkey (
                private TEXT NOT NULL,
                public TEXT NOT NULL UNIQUE
            )
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_simplekv_table(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS simplekv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires INTEGER
            )
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
