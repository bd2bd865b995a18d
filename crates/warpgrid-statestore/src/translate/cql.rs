//! CQL translation for wide-column backends.
//!
//! Entries live in one table per keyspace:
//!
//! ```text
//! CREATE TABLE <keyspace>.<table> (
//!     key text PRIMARY KEY,
//!     value blob,
//!     etag text,
//!     last_modified bigint
//! )
//! ```
//!
//! Every value is bound with `?`; only the (pre-validated) keyspace and table
//! identifiers are formatted into the statement text.

use super::{QueryTranslator, from_millis, to_millis};
use crate::config::BackendKind;
use crate::error::{StoreError, StoreResult};
use crate::statement::{Batch, Params, Row, Statement, StatementKind, Value};
use crate::types::StateEntry;

const COLUMNS: &str = "key, value, etag, last_modified";

#[derive(Clone, Debug)]
pub struct CqlTranslator {
    keyspace: String,
    table: String,
    replication_factor: u32,
}

impl CqlTranslator {
    /// `keyspace` and `table` must already be validated identifiers.
    pub fn new(keyspace: &str, table: &str, replication_factor: u32) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            replication_factor,
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.keyspace, self.table)
    }

    fn insert(&self, kind: StatementKind, entry: &StateEntry) -> Statement {
        Statement::new(
            kind,
            format!("INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?)", self.qualified()),
        )
        .with_params(Params::Positional(vec![
            Value::Text(entry.key.clone()),
            Value::Bytes(entry.data.clone()),
            Value::Text(entry.etag.clone()),
            Value::BigInt(to_millis(entry.last_modified)),
        ]))
    }

    fn remove(&self, kind: StatementKind, key: &str) -> Statement {
        Statement::new(
            kind,
            format!("DELETE FROM {} WHERE key = ?", self.qualified()),
        )
        .with_params(Params::Positional(vec![Value::Text(key.to_string())]))
    }
}

impl QueryTranslator for CqlTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::Cql
    }

    fn bootstrap(&self) -> Vec<Statement> {
        vec![
            Statement::new(
                StatementKind::Schema,
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    self.keyspace, self.replication_factor
                ),
            ),
            Statement::new(
                StatementKind::Schema,
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (key text PRIMARY KEY, value blob, \
                     etag text, last_modified bigint)",
                    self.qualified()
                ),
            ),
        ]
    }

    fn session_init(&self) -> Vec<Statement> {
        // Statements use fully qualified table names.
        Vec::new()
    }

    fn probe(&self) -> Statement {
        Statement::new(StatementKind::Probe, "SELECT release_version FROM system.local")
    }

    fn get(&self, key: &str) -> StoreResult<Statement> {
        Ok(Statement::new(
            StatementKind::Get,
            format!("SELECT {COLUMNS} FROM {} WHERE key = ?", self.qualified()),
        )
        .with_params(Params::Positional(vec![Value::Text(key.to_string())])))
    }

    fn get_fallback(&self, _key: &str) -> StoreResult<Option<Statement>> {
        Ok(None)
    }

    fn set(&self, entry: &StateEntry) -> StoreResult<Statement> {
        Ok(self.insert(StatementKind::Set, entry))
    }

    fn delete(&self, key: &str) -> StoreResult<Statement> {
        Ok(self.remove(StatementKind::Delete, key))
    }

    fn bulk_get(&self, keys: &[String]) -> StoreResult<Statement> {
        if keys.is_empty() {
            return Err(StoreError::Validation("empty key list".to_string()));
        }
        Ok(Statement::new(
            StatementKind::BulkGet,
            format!("SELECT {COLUMNS} FROM {} WHERE key IN ?", self.qualified()),
        )
        .with_params(Params::Positional(vec![Value::List(
            keys.iter().map(|k| Value::Text(k.clone())).collect(),
        )])))
    }

    fn bulk_set(&self, entries: &[StateEntry]) -> StoreResult<Batch> {
        if entries.is_empty() {
            return Err(StoreError::Validation("empty entry list".to_string()));
        }
        Ok(Batch::Logged(
            entries
                .iter()
                .map(|e| self.insert(StatementKind::BulkSet, e))
                .collect(),
        ))
    }

    fn bulk_delete(&self, keys: &[String]) -> StoreResult<Batch> {
        if keys.is_empty() {
            return Err(StoreError::Validation("empty key list".to_string()));
        }
        Ok(Batch::Logged(
            keys.iter()
                .map(|k| self.remove(StatementKind::BulkDelete, k))
                .collect(),
        ))
    }

    fn scan(&self, limit: usize) -> StoreResult<Statement> {
        let limit = i32::try_from(limit)
            .map_err(|_| StoreError::Validation(format!("scan limit {limit} too large")))?;
        Ok(Statement::new(
            StatementKind::Scan,
            format!("SELECT {COLUMNS} FROM {} LIMIT ?", self.qualified()),
        )
        .with_params(Params::Positional(vec![Value::Int(limit)])))
    }

    fn decode(&self, row: &Row) -> StoreResult<StateEntry> {
        let key = row
            .get("key")
            .and_then(Value::as_text)
            .ok_or_else(|| StoreError::Decode("column `key` missing or not text".into()))?
            .to_string();
        // A null blob is an empty value.
        let data = match row.get("value") {
            Some(Value::Bytes(b)) => b.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(StoreError::Decode(format!(
                    "column `value` for {key:?} is not a blob: {other:?}"
                )));
            }
        };
        let etag = row
            .get("etag")
            .and_then(Value::as_text)
            .ok_or_else(|| StoreError::Decode(format!("column `etag` for {key:?} missing")))?
            .to_string();
        let last_modified = from_millis(row.get("last_modified").and_then(Value::as_i64).unwrap_or(0));
        Ok(StateEntry {
            key,
            data,
            etag,
            last_modified,
        })
    }
}
