//! Postgres-backed portal repositories.
//!
//! Read-only SELECTs against the portal schema, which is owned externally.
//! Row decoding goes through small typed helpers so a schema drift surfaces
//! as a descriptive `Repository` error instead of a panic.

use super::{
    ApplicationRepository, BlockchainRepository, LoadBalancerRepository, RegistryError,
};
use crate::types::{Aat, AppSettings, Application, Blockchain, LoadBalancer};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Repository(e.to_string())
    }
}

/// Shared Postgres implementation of all three portal repositories.
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns `RegistryError::Repository` when the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Extracts a non-nullable column, mapping decode failures to a
    /// column-qualified repository error.
    fn get_required<'r, T>(row: &'r PgRow, column: &str) -> Result<T, RegistryError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<T, _>(column)
            .map_err(|e| RegistryError::Repository(format!("column '{column}': {e}")))
    }

    /// Extracts and converts a non-negative bigint column to u64.
    fn get_u64(row: &PgRow, column: &str) -> Result<u64, RegistryError> {
        let value: i64 = Self::get_required(row, column)?;
        u64::try_from(value).map_err(|_| {
            RegistryError::Repository(format!("column '{column}' value {value} is negative"))
        })
    }

    fn row_to_application(row: &PgRow) -> Result<Application, RegistryError> {
        Ok(Application {
            id: Self::get_required(row, "id")?,
            public_key: Self::get_required(row, "public_key")?,
            free_tier_aat: Self::get_required::<Option<Json<Aat>>>(row, "free_tier_aat")?
                .map(|json| json.0),
            gateway_aat: Self::get_required::<Option<Json<Aat>>>(row, "gateway_aat")?
                .map(|json| json.0),
            chains: Self::get_required(row, "chains")?,
            settings: Self::get_required::<Option<Json<AppSettings>>>(row, "settings")?
                .map(|json| json.0)
                .unwrap_or_default(),
        })
    }

    fn row_to_blockchain(row: &PgRow) -> Result<Blockchain, RegistryError> {
        Ok(Blockchain {
            id: Self::get_required(row, "id")?,
            ticker: Self::get_required(row, "ticker")?,
            network_id: Self::get_required(row, "network_id")?,
            aliases: Self::get_required(row, "aliases")?,
            sync_check_payload: Self::get_required(row, "sync_check_payload")?,
            sync_allowance: Self::get_u64(row, "sync_allowance")?,
            chain_id_check_payload: Self::get_required(row, "chain_id_check_payload")?,
            log_limit: Self::get_required::<Option<i64>>(row, "log_limit")?
                .map(|limit| u64::try_from(limit).unwrap_or(0)),
            alt_runtime_url: Self::get_required(row, "alt_runtime_url")?,
        })
    }
}

#[async_trait]
impl ApplicationRepository for PgRegistry {
    async fn application(&self, id: &str) -> Result<Option<Application>, RegistryError> {
        let row = sqlx::query(
            "SELECT id, public_key, free_tier_aat, gateway_aat, chains, settings
             FROM applications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_application).transpose()
    }
}

#[async_trait]
impl LoadBalancerRepository for PgRegistry {
    async fn load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RegistryError> {
        let row = sqlx::query(
            "SELECT id, application_ids FROM load_balancers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(LoadBalancer {
                id: Self::get_required(&row, "id")?,
                application_ids: Self::get_required(&row, "application_ids")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl BlockchainRepository for PgRegistry {
    async fn blockchains(&self) -> Result<Vec<Blockchain>, RegistryError> {
        let rows = sqlx::query(
            "SELECT id, ticker, network_id, aliases, sync_check_payload, sync_allowance,
                    chain_id_check_payload, log_limit, alt_runtime_url
             FROM blockchains",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_blockchain).collect()
    }
}
