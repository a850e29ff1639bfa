//! Store Writer: reader/writer-split Postgres pool, transactional batch
//! inserts with dedup-on-conflict, and a TTL response cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};

use crate::models::CensusRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
}

/// Parameters bound per `CensusRecord` row in the batch-insert statement.
const PARAMS_PER_RECORD: usize = 13;
/// Keep well under Postgres's 65,535-bound-parameter hard limit per statement.
const SAFE_PARAM_LIMIT: usize = 60_000;
const MAX_ROWS_PER_STATEMENT: usize = SAFE_PARAM_LIMIT / PARAMS_PER_RECORD;

pub struct StoreWriter {
    writer_pool: PgPool,
    reader_pool: PgPool,
    cache: Option<redis::aio::ConnectionManager>,
}

impl StoreWriter {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let writer_connections = ((max_connections as f64) * 0.7).ceil() as u32;
        let reader_connections = max_connections.saturating_sub(writer_connections).max(1);

        let writer_pool = PgPoolOptions::new()
            .max_connections(writer_connections.max(1))
            .connect(database_url)
            .await?;
        let reader_pool = PgPoolOptions::new().max_connections(reader_connections).connect(database_url).await?;

        Ok(Self { writer_pool, reader_pool, cache: None })
    }

    pub async fn with_cache(mut self, redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        self.cache = Some(redis::aio::ConnectionManager::new(client).await?);
        Ok(self)
    }

    pub fn reader_pool(&self) -> &PgPool {
        &self.reader_pool
    }

    /// Inserts `records` inside a single transaction per
    /// `MAX_ROWS_PER_STATEMENT`-sized chunk; duplicates on the dedup key
    /// `(geography_level, geography_code, variable_name, dataset, year)`
    /// are ignored. No partial chunk is ever visible to readers.
    pub async fn insert_batch(&self, records: &[CensusRecord]) -> Result<u64, StoreError> {
        let mut total_inserted = 0u64;

        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut tx = self.writer_pool.begin().await?;

            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO census_data (geography_level, geography_code, geography_name, state_code, \
                 county_code, tract_code, block_group_code, zip_code, variable_name, variable_value, \
                 margin_of_error, dataset, year) ",
            );

            builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.geography_level.as_str())
                    .push_bind(&record.geography_code)
                    .push_bind(&record.geography_name)
                    .push_bind(&record.state_code)
                    .push_bind(&record.county_code)
                    .push_bind(&record.tract_code)
                    .push_bind(&record.block_group_code)
                    .push_bind(&record.zip_code)
                    .push_bind(&record.variable_name)
                    .push_bind(value_as_text(&record.variable_value))
                    .push_bind(record.margin_of_error)
                    .push_bind(&record.dataset)
                    .push_bind(record.year);
            });

            builder.push(
                " ON CONFLICT (geography_level, geography_code, variable_name, dataset, year) DO UPDATE SET \
                 variable_value = EXCLUDED.variable_value, margin_of_error = EXCLUDED.margin_of_error, \
                 updated_at = now()",
            );

            let result = match builder.build().execute(&mut *tx).await {
                Ok(r) => r,
                Err(e) => {
                    tx.rollback().await?;
                    return Err(StoreError::Database(e));
                }
            };

            tx.commit().await?;
            total_inserted += result.rows_affected();
        }

        Ok(total_inserted)
    }

    pub async fn upsert_variables(&self, definitions: &[VariableDefinition]) -> Result<(), StoreError> {
        let mut tx = self.writer_pool.begin().await?;
        for def in definitions {
            sqlx::query(
                "INSERT INTO census_variables (variable_name, label, concept, table_id, universe, variable_type) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (variable_name) DO UPDATE SET label = EXCLUDED.label, concept = EXCLUDED.concept",
            )
            .bind(&def.variable_name)
            .bind(&def.label)
            .bind(&def.concept)
            .bind(&def.table_id)
            .bind(&def.universe)
            .bind(&def.variable_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Distinct `county_code`s already ingested under a state, used to fan
    /// block_group requests out one-per-county once the county phase has
    /// populated this state.
    pub async fn distinct_county_codes(&self, state_code: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT county_code FROM census_data WHERE state_code = $1 AND county_code IS NOT NULL",
        )
        .bind(state_code)
        .fetch_all(&self.reader_pool)
        .await?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }

    pub fn generate_query_hash(query_url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query_url.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn cache_put(&self, query_hash: &str, payload: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(manager) = &self.cache {
            let mut manager = manager.clone();
            let _: () = manager.set_ex(cache_key(query_hash), payload, ttl.as_secs()).await?;
        }
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        sqlx::query(
            "INSERT INTO census_api_cache (query_hash, query_url, response, row_count, expires_at) \
             VALUES ($1, $2, $3::jsonb, $4, $5) \
             ON CONFLICT (query_hash) DO UPDATE SET response = EXCLUDED.response, expires_at = EXCLUDED.expires_at",
        )
        .bind(query_hash)
        .bind(query_hash)
        .bind(payload)
        .bind(0i64)
        .bind(expires_at)
        .execute(&self.writer_pool)
        .await?;
        Ok(())
    }

    pub async fn cache_get(&self, query_hash: &str) -> Result<Option<String>, StoreError> {
        if let Some(manager) = &self.cache {
            let mut manager = manager.clone();
            if let Some(hit) = manager.get::<_, Option<String>>(cache_key(query_hash)).await? {
                return Ok(Some(hit));
            }
        }
        let row: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT response, expires_at FROM census_api_cache WHERE query_hash = $1")
                .bind(query_hash)
                .fetch_optional(&self.reader_pool)
                .await?;
        Ok(row.filter(|(_, expires_at)| *expires_at > Utc::now()).map(|(response, _)| response))
    }
}

fn cache_key(query_hash: &str) -> String {
    format!("census_ingest:cache:{query_hash}")
}

fn value_as_text(value: &crate::models::Value) -> Option<String> {
    use crate::models::Value;
    match value {
        Value::Int64(i) => Some(i.to_string()),
        Value::Float64(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Null => None,
    }
}

#[derive(Debug, Clone)]
pub struct VariableDefinition {
    pub variable_name: String,
    pub label: String,
    pub concept: String,
    pub table_id: String,
    pub universe: String,
    pub variable_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_hash_is_deterministic() {
        let a = StoreWriter::generate_query_hash("https://api.census.gov/data/2023/acs/acs5?get=B01003_001E&for=state:*");
        let b = StoreWriter::generate_query_hash("https://api.census.gov/data/2023/acs/acs5?get=B01003_001E&for=state:*");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn value_as_text_maps_variants() {
        use crate::models::Value;
        assert_eq!(value_as_text(&Value::Int64(5)), Some("5".to_string()));
        assert_eq!(value_as_text(&Value::Null), None);
    }
}
