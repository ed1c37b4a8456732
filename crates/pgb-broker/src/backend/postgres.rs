//! PostgreSQL backend on a small sqlx pool

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgColumn, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};

use pgb_core::{BrokerError, ConnectivityError};

use super::{Backend, BackendConnector, QueryResult};

/// Opens PostgreSQL pools
#[derive(Debug, Clone)]
pub struct PgConnector {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgConnector {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout,
        }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

#[async_trait]
impl BackendConnector for PgConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Backend>, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;

        Ok(Arc::new(PgBackend { pool }))
    }
}

/// Pool-backed PostgreSQL handle
#[derive(Debug)]
pub struct PgBackend {
    pool: PgPool,
}

#[async_trait]
impl Backend for PgBackend {
    async fn ping(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ConnectivityError::classify(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, BrokerError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BrokerError::Query(e.to_string()))?;

        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            None => match self.pool.describe(sql).await {
                Ok(described) => column_names(described.columns()),
                Err(e) => {
                    tracing::debug!("Could not describe empty result: {}", e);
                    Vec::new()
                }
            },
        };

        let rows = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(index, column)| extract_cell(row, column, index))
                    .collect()
            })
            .collect();

        Ok(QueryResult { columns, rows })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.pool.close().await;
        Ok(())
    }
}

fn column_names(columns: &[PgColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn extract_cell(row: &PgRow, column: &PgColumn, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => Value::Null,
        Ok(_) => decode_cell(row, column, index),
        Err(_) => Value::Null,
    }
}

fn decode_cell(row: &PgRow, column: &PgColumn, index: usize) -> Value {
    let type_name = column.type_info().name();
    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::from).ok(),
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(|v| Value::from(i64::from(v)))
            .ok(),
        "INT4" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::from(i64::from(v)))
            .ok(),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from).ok(),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(|v| Value::from(f64::from(v)))
            .ok(),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::from).ok(),
        // Kept as text so precision survives
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(|v| Value::String(v.to_string()))
            .ok(),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index).ok(),
        _ => row.try_get::<String, _>(index).map(Value::String).ok(),
    };

    decoded.unwrap_or_else(|| Value::String(format!("<{}>", type_name.to_lowercase())))
}
