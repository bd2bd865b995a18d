//! CQL sessions backed by the `scylla` driver (feature `scylla`).
//!
//! Each pooled [`Session`] wraps one driver session pinned to the endpoint
//! it was opened against; the adapter's pool does the balancing and health
//! checking.

use std::time::Duration;

use async_trait::async_trait;
use ::scylla::batch::{Batch as DriverBatch, BatchType};
use ::scylla::frame::response::result::CqlValue;
use ::scylla::{Session as DriverSession, SessionBuilder};
use tracing::debug;

use crate::config::{Credentials, Endpoint};
use crate::pool::{Session, SessionFactory};
use crate::statement::{Params, ResultSet, Row, Statement, Value};

/// Opens driver sessions for the column backend.
#[derive(Clone, Debug)]
pub struct ScyllaSessionFactory {
    connect_timeout: Duration,
}

impl ScyllaSessionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for ScyllaSessionFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl SessionFactory for ScyllaSessionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, String> {
        let mut builder = SessionBuilder::new()
            .known_node(endpoint.to_string())
            .connection_timeout(self.connect_timeout);
        if !credentials.username.is_empty() {
            builder = builder.user(&credentials.username, &credentials.password);
        }
        let session = builder.build().await.map_err(|e| e.to_string())?;
        debug!(%endpoint, "scylla session established");
        Ok(Box::new(ScyllaSession { inner: session }))
    }
}

pub struct ScyllaSession {
    inner: DriverSession,
}

impl std::fmt::Debug for ScyllaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScyllaSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for ScyllaSession {
    async fn execute(&mut self, statement: &Statement) -> Result<ResultSet, String> {
        let values = bind(&statement.params)?;
        let result = self
            .inner
            .query_unpaged(statement.text.as_str(), values)
            .await
            .map_err(|e| e.to_string())?;

        let names: Vec<String> = result.col_specs().iter().map(|c| c.name.clone()).collect();
        let rows = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .zip(row.columns)
                    .fold(Row::new(), |acc, (name, cell)| acc.with(name.as_str(), from_cql(cell)))
            })
            .collect();
        Ok(ResultSet::from_rows(rows))
    }

    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<(), String> {
        let mut batch = DriverBatch::new(BatchType::Logged);
        let mut values = Vec::with_capacity(statements.len());
        for statement in statements {
            batch.append_statement(statement.text.as_str());
            values.push(bind(&statement.params)?);
        }
        self.inner
            .batch(&batch, values)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn bind(params: &Params) -> Result<Vec<Option<CqlValue>>, String> {
    match params {
        Params::None => Ok(Vec::new()),
        Params::Positional(values) => values.iter().map(to_cql).collect(),
        Params::Named(_) => Err("named parameters are not supported for CQL statements".to_string()),
    }
}

fn to_cql(value: &Value) -> Result<Option<CqlValue>, String> {
    Ok(match value {
        Value::Null => None,
        Value::Text(s) => Some(CqlValue::Text(s.clone())),
        Value::Bytes(b) => Some(CqlValue::Blob(b.clone())),
        Value::Int(i) => Some(CqlValue::Int(*i)),
        Value::BigInt(i) => Some(CqlValue::BigInt(*i)),
        Value::List(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                // CQL collections cannot hold nulls.
                list.push(to_cql(item)?.ok_or("null element in CQL list bind")?);
            }
            Some(CqlValue::List(list))
        }
    })
}

fn from_cql(cell: Option<CqlValue>) -> Value {
    match cell {
        None | Some(CqlValue::Empty) => Value::Null,
        Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => Value::Text(s),
        Some(CqlValue::Blob(b)) => Value::Bytes(b),
        Some(CqlValue::BigInt(i)) => Value::BigInt(i),
        Some(CqlValue::Int(i)) => Value::BigInt(i64::from(i)),
        Some(CqlValue::List(items)) => Value::List(items.into_iter().map(|v| from_cql(Some(v))).collect()),
        Some(other) => Value::Text(format!("{other:?}")),
    }
}
