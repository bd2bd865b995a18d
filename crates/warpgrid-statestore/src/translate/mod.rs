//! Translation of logical state operations into native statements.
//!
//! One [`QueryTranslator`] exists per backend family:
//! - [`graph::GraphTranslator`]: nGQL over a space holding one vertex tag.
//! - [`cql::CqlTranslator`]: CQL over a keyspace holding one table.
//!
//! Translators only build statements and decode rows; they never talk to the
//! network. Construction errors (oversized or malformed keys) are permanent.

pub mod cql;
pub mod graph;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{BackendKind, StoreConfig};
use crate::error::StoreResult;
use crate::statement::{Batch, Row, Statement};
use crate::types::StateEntry;

pub use cql::CqlTranslator;
pub use graph::GraphTranslator;

/// Builds native statements for one backend family.
pub trait QueryTranslator: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Idempotent namespace and schema creation, run once at init.
    fn bootstrap(&self) -> Vec<Statement>;

    /// Statements every new session runs before first use.
    fn session_init(&self) -> Vec<Statement>;

    /// Trivial liveness probe.
    fn probe(&self) -> Statement;

    fn get(&self, key: &str) -> StoreResult<Statement>;

    /// Second lookup tried when `get` matches nothing, if the backend has one.
    fn get_fallback(&self, key: &str) -> StoreResult<Option<Statement>>;

    fn set(&self, entry: &StateEntry) -> StoreResult<Statement>;

    fn delete(&self, key: &str) -> StoreResult<Statement>;

    fn bulk_get(&self, keys: &[String]) -> StoreResult<Statement>;

    fn bulk_set(&self, entries: &[StateEntry]) -> StoreResult<Batch>;

    fn bulk_delete(&self, keys: &[String]) -> StoreResult<Batch>;

    /// Unfiltered scan of at most `limit` rows.
    fn scan(&self, limit: usize) -> StoreResult<Statement>;

    /// Extract an entry from one result row.
    fn decode(&self, row: &Row) -> StoreResult<StateEntry>;
}

/// Build the translator matching `config.kind`.
pub fn for_config(config: &StoreConfig) -> Box<dyn QueryTranslator> {
    match config.kind {
        BackendKind::Graph => Box::new(GraphTranslator::new(
            &config.namespace,
            &config.table,
            config.graph.clone(),
        )),
        BackendKind::Cql => Box::new(CqlTranslator::new(
            &config.namespace,
            &config.table,
            config.replication_factor,
        )),
    }
}

/// Milliseconds since the Unix epoch, as stored in `last_modified`.
pub(crate) fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub(crate) fn from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}
