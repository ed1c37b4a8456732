//! Database backends sessions run their queries against

mod memory;
mod postgres;

pub use memory::{MemoryBackend, MemoryConnector};
pub use postgres::PgConnector;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pgb_core::BrokerError;

/// Tabular result of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as column-name keyed objects
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// An open database handle
#[async_trait]
pub trait Backend: Send + Sync {
    /// Cheap round trip proving the database answers
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Run one statement and collect its rows
    async fn query(&self, sql: &str) -> Result<QueryResult, BrokerError>;

    /// Release the handle. Called at most once per backend.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens backends from connection URLs
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Backend>, BrokerError>;
}
