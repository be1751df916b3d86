//! SQL event store on Diesel with r2d2 connection pooling.
//!
//! Diesel connections are blocking, so every statement runs on the tokio
//! blocking pool.

use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use diesel::sql_types::{Text, Timestamp};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{EventRecord, EventStore};
use crate::config::DatabaseConfig;
use crate::error::StoreError;

// Conditional imports based on database backend
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
pub type DbConnection = PgConnection;

#[cfg(all(feature = "mysql", not(feature = "postgres")))]
use diesel::mysql::MysqlConnection;
#[cfg(all(feature = "mysql", not(feature = "postgres")))]
pub type DbConnection = MysqlConnection;

pub type Pool = r2d2::Pool<ConnectionManager<DbConnection>>;
pub type PooledConnection = r2d2::PooledConnection<ConnectionManager<DbConnection>>;

/// Upsert statement overwriting every column on id conflict
#[cfg(feature = "postgres")]
pub fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (id, message, created_at) VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET message = EXCLUDED.message, created_at = EXCLUDED.created_at",
        table
    )
}

#[cfg(all(feature = "mysql", not(feature = "postgres")))]
pub fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (id, message, created_at) VALUES (?, ?, ?) \
         ON DUPLICATE KEY UPDATE message = VALUES(message), created_at = VALUES(created_at)",
        table
    )
}

#[cfg(feature = "postgres")]
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id TEXT PRIMARY KEY, \
         message TEXT NOT NULL, \
         created_at TIMESTAMP NOT NULL)",
        table
    )
}

#[cfg(all(feature = "mysql", not(feature = "postgres")))]
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id VARCHAR(255) PRIMARY KEY, \
         message TEXT NOT NULL, \
         created_at DATETIME(6) NOT NULL)",
        table
    )
}

/// [`EventStore`] writing to a SQL table through a connection pool
#[derive(Clone)]
pub struct DieselEventStore {
    pool: Arc<Pool>,
    table: String,
}

impl DieselEventStore {
    /// Build the connection pool described by `config`.
    ///
    /// The table name must already have passed
    /// [`SourceConfig::validate`](crate::config::SourceConfig::validate); it
    /// is interpolated into SQL.
    pub fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<DbConnection>::new(&config.url);

        let pool = r2d2::Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_idle))
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
            .build(manager)?;

        Ok(Self {
            pool: Arc::new(pool),
            table: config.table.clone(),
        })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<PooledConnection, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Test database connectivity
    pub fn test_connection(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok(())
    }

    /// Create the events table if it does not exist
    pub fn ensure_table(&self) -> Result<(), StoreError> {
        tracing::info!(table = %self.table, "Ensuring events table exists");
        let mut conn = self.get_connection()?;
        diesel::sql_query(create_table_sql(&self.table)).execute(&mut conn)?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl EventStore for DieselEventStore {
    async fn upsert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let pool = Arc::clone(&self.pool);
        let sql = upsert_sql(&self.table);
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = pool.get()?;
            diesel::sql_query(sql)
                .bind::<Text, _>(&record.id)
                .bind::<Text, _>(&record.message)
                .bind::<Timestamp, _>(record.created_at.naive_utc())
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
