//! In-memory simulated backends for adapter integration tests.
//!
//! `Sim` is a `SessionFactory` whose sessions execute the adapter's real
//! statements against a shared in-memory table:
//! - the CQL flavour dispatches on statement kind and positional binds,
//! - the graph flavour parses the literals out of the generated nGQL text.
//!
//! Both count connects and executed statements and can inject failures per
//! statement kind or per connect.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use warpgrid_statestore::config::{Credentials, Endpoint};
use warpgrid_statestore::retry::FixedJitter;
use warpgrid_statestore::statement::{Params, ResultSet, Row, Statement, StatementKind, Value};
use warpgrid_statestore::{BackendKind, OpContext, Session, SessionFactory, StateStoreAdapter};

// ── Shared state ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub data: Vec<u8>,
    pub etag: String,
    pub last_modified: i64,
}

#[derive(Debug, Default)]
struct SimState {
    rows: Mutex<BTreeMap<String, StoredRow>>,
    faults: Mutex<HashMap<StatementKind, VecDeque<String>>>,
    connect_faults: Mutex<VecDeque<String>>,
    schema: Mutex<Vec<String>>,
    connects: AtomicU64,
    executed: AtomicU64,
    data_statements: AtomicU64,
    batches: AtomicU64,
    /// Graph only: the MATCH lookup misses, forcing the FETCH fallback.
    match_misses: AtomicBool,
    /// Delay applied to every data statement.
    latency_ms: AtomicU64,
}

impl SimState {
    fn take_fault(&self, kind: StatementKind) -> Option<String> {
        self.faults.lock().unwrap().get_mut(&kind).and_then(VecDeque::pop_front)
    }
}

/// Simulated backend of either family.
#[derive(Debug)]
pub struct Sim {
    pub kind: BackendKind,
    state: Arc<SimState>,
}

impl Sim {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Arc::new(SimState::default()),
        })
    }

    /// Fail the next `times` executions of `kind` with `message`.
    pub fn fail_next(&self, kind: StatementKind, times: usize, message: &str) {
        let mut faults = self.state.faults.lock().unwrap();
        let queue = faults.entry(kind).or_default();
        queue.extend(std::iter::repeat_n(message.to_string(), times));
    }

    /// Fail the next `times` connects with `message`.
    pub fn fail_connects(&self, times: usize, message: &str) {
        self.state
            .connect_faults
            .lock()
            .unwrap()
            .extend(std::iter::repeat_n(message.to_string(), times));
    }

    pub fn set_match_misses(&self, misses: bool) {
        self.state.match_misses.store(misses, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::Relaxed)
    }

    /// Every statement executed, probes and schema included.
    pub fn executed(&self) -> u64 {
        self.state.executed.load(Ordering::Relaxed)
    }

    /// Statements that read or write state rows.
    pub fn data_statements(&self) -> u64 {
        self.state.data_statements.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.state.batches.load(Ordering::Relaxed)
    }

    pub fn schema(&self) -> Vec<String> {
        self.state.schema.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.rows.lock().unwrap().keys().cloned().collect()
    }

    pub fn row(&self, key: &str) -> Option<StoredRow> {
        self.state.rows.lock().unwrap().get(key).cloned()
    }

    /// Insert a row directly, bypassing the adapter.
    pub fn seed(&self, key: &str, data: &[u8], etag: &str) {
        self.state.rows.lock().unwrap().insert(
            key.to_string(),
            StoredRow {
                data: data.to_vec(),
                etag: etag.to_string(),
                last_modified: 0,
            },
        );
    }
}

#[async_trait]
impl SessionFactory for Sim {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Session>, String> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = self.state.connect_faults.lock().unwrap().pop_front() {
            return Err(message);
        }
        Ok(Box::new(SimSession {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Sessions ────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimSession {
    kind: BackendKind,
    state: Arc<SimState>,
}

#[async_trait]
impl Session for SimSession {
    async fn execute(&mut self, statement: &Statement) -> Result<ResultSet, String> {
        self.state.executed.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = self.state.take_fault(statement.kind) {
            return Err(message);
        }
        match statement.kind {
            StatementKind::Probe => {
                return Ok(ResultSet::from_rows(vec![Row::new().with("ok", Value::BigInt(1))]));
            }
            StatementKind::Schema => {
                self.state.schema.lock().unwrap().push(statement.text.clone());
                return Ok(ResultSet::empty());
            }
            StatementKind::SessionInit => return Ok(ResultSet::empty()),
            _ => {}
        }

        self.state.data_statements.fetch_add(1, Ordering::Relaxed);
        let latency = self.state.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        match self.kind {
            BackendKind::Cql => cql::execute(&self.state, statement),
            BackendKind::Graph => graph::execute(&self.state, statement),
        }
    }

    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<(), String> {
        if self.kind == BackendKind::Graph {
            return Err("graph sessions do not take logged batches".to_string());
        }
        self.state.executed.fetch_add(1, Ordering::Relaxed);
        self.state.batches.fetch_add(1, Ordering::Relaxed);
        if let Some(first) = statements.first() {
            if let Some(message) = self.state.take_fault(first.kind) {
                return Err(message);
            }
        }
        for statement in statements {
            cql::execute(&self.state, statement)?;
        }
        Ok(())
    }
}

// ── CQL flavour ─────────────────────────────────────────────────────

mod cql {
    use super::*;

    fn text(params: &Params, i: usize) -> Result<String, String> {
        params
            .positional(i)
            .and_then(Value::as_text)
            .map(str::to_string)
            .ok_or_else(|| format!("bind {i} is not text"))
    }

    fn row(key: &str, stored: &StoredRow) -> Row {
        Row::new()
            .with("key", Value::Text(key.to_string()))
            .with("value", Value::Bytes(stored.data.clone()))
            .with("etag", Value::Text(stored.etag.clone()))
            .with("last_modified", Value::BigInt(stored.last_modified))
    }

    pub(super) fn execute(state: &SimState, statement: &Statement) -> Result<ResultSet, String> {
        let params = &statement.params;
        let mut rows = state.rows.lock().unwrap();
        match statement.kind {
            StatementKind::Get | StatementKind::GetFallback => {
                let key = text(params, 0)?;
                Ok(ResultSet::from_rows(rows.get(&key).map(|r| row(&key, r)).into_iter().collect()))
            }
            StatementKind::BulkGet => {
                let Some(Value::List(keys)) = params.positional(0) else {
                    return Err("bulk get expects a key list".to_string());
                };
                let found = keys
                    .iter()
                    .filter_map(Value::as_text)
                    .filter_map(|k| rows.get(k).map(|r| row(k, r)))
                    .collect();
                Ok(ResultSet::from_rows(found))
            }
            StatementKind::Set | StatementKind::BulkSet => {
                let key = text(params, 0)?;
                let data = params
                    .positional(1)
                    .and_then(Value::as_bytes)
                    .ok_or("bind 1 is not a blob")?
                    .to_vec();
                let etag = text(params, 2)?;
                let last_modified = params.positional(3).and_then(Value::as_i64).unwrap_or(0);
                rows.insert(key, StoredRow { data, etag, last_modified });
                Ok(ResultSet::empty())
            }
            StatementKind::Delete | StatementKind::BulkDelete => {
                rows.remove(&text(params, 0)?);
                Ok(ResultSet::empty())
            }
            StatementKind::Scan => {
                // The driver types a LIMIT marker as `int`.
                let Some(Value::Int(limit)) = params.positional(0) else {
                    return Err("LIMIT must be bound as int".to_string());
                };
                let limit = usize::try_from(*limit).map_err(|e| e.to_string())?;
                Ok(ResultSet::from_rows(
                    rows.iter().take(limit).map(|(k, r)| row(k, r)).collect(),
                ))
            }
            other => Err(format!("unexpected {other} statement")),
        }
    }
}

// ── Graph flavour ───────────────────────────────────────────────────

mod graph {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Token {
        Str(String),
        Int(i64),
    }

    /// String and integer literals in `text`, unescaped.
    fn literals(text: &str) -> Vec<Token> {
        let mut out = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                let mut s = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('r') => s.push('\r'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        '"' => break,
                        other => s.push(other),
                    }
                }
                out.push(Token::Str(s));
            } else if c.is_ascii_digit() || (c == '-' && chars.peek().is_some_and(char::is_ascii_digit)) {
                let mut digits = c.to_string();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                out.push(Token::Int(digits.parse().unwrap_or(0)));
            }
        }
        out
    }

    fn strings(text: &str) -> Vec<String> {
        literals(text)
            .into_iter()
            .filter_map(|t| match t {
                Token::Str(s) => Some(s),
                Token::Int(_) => None,
            })
            .collect()
    }

    fn after<'a>(text: &'a str, keyword: &str) -> Result<&'a str, String> {
        text.split_once(keyword)
            .map(|(_, rest)| rest)
            .ok_or_else(|| format!("SyntaxError: expected {keyword}"))
    }

    fn row(key: &str, stored: &StoredRow) -> Row {
        Row::new()
            .with("key", Value::Text(key.to_string()))
            .with("data", Value::Text(STANDARD.encode(&stored.data)))
            .with("etag", Value::Text(stored.etag.clone()))
            .with("last_modified", Value::BigInt(stored.last_modified))
    }

    pub(super) fn execute(state: &SimState, statement: &Statement) -> Result<ResultSet, String> {
        let text = statement.text.as_str();
        let mut rows = state.rows.lock().unwrap();
        match statement.kind {
            StatementKind::Get => {
                if state.match_misses.load(Ordering::Relaxed) {
                    return Ok(ResultSet::empty());
                }
                let key = statement
                    .params
                    .named("key")
                    .and_then(Value::as_text)
                    .ok_or("SemanticError: $key is not bound")?;
                Ok(ResultSet::from_rows(rows.get(key).map(|r| row(key, r)).into_iter().collect()))
            }
            StatementKind::GetFallback | StatementKind::BulkGet => {
                let ids = after(text, "FETCH PROP ON")?;
                let ids = ids.split_once("YIELD").map_or(ids, |(ids, _)| ids);
                let found = strings(ids)
                    .iter()
                    .filter_map(|k| rows.get(k).map(|r| row(k, r)))
                    .collect();
                Ok(ResultSet::from_rows(found))
            }
            StatementKind::Set | StatementKind::BulkSet => {
                let values = literals(after(text, "VALUES")?);
                for chunk in values.chunks(4) {
                    let [Token::Str(key), Token::Str(data), Token::Str(etag), Token::Int(millis)] = chunk
                    else {
                        return Err(format!("SyntaxError: malformed vertex values {chunk:?}"));
                    };
                    let data = STANDARD.decode(data).map_err(|e| e.to_string())?;
                    rows.insert(
                        key.clone(),
                        StoredRow {
                            data,
                            etag: etag.clone(),
                            last_modified: *millis,
                        },
                    );
                }
                Ok(ResultSet::empty())
            }
            StatementKind::Delete | StatementKind::BulkDelete => {
                for key in strings(after(text, "DELETE VERTEX")?) {
                    rows.remove(&key);
                }
                Ok(ResultSet::empty())
            }
            StatementKind::Scan => {
                let limit = match literals(after(text, "LIMIT")?).first() {
                    Some(Token::Int(n)) => *n as usize,
                    _ => return Err("SyntaxError: bad LIMIT".to_string()),
                };
                Ok(ResultSet::from_rows(
                    rows.iter().take(limit).map(|(k, r)| row(k, r)).collect(),
                ))
            }
            other => Err(format!("unexpected {other} statement")),
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub const BOTH: [BackendKind; 2] = [BackendKind::Cql, BackendKind::Graph];

/// Metadata for a small, fast-retrying pool.
pub fn metadata(kind: BackendKind) -> HashMap<String, String> {
    let namespace_key = match kind {
        BackendKind::Cql => "keyspace",
        BackendKind::Graph => "space",
    };
    HashMap::from([
        ("hosts".to_string(), "node-a,node-b".to_string()),
        (namespace_key.to_string(), "statestore_test".to_string()),
        ("minPoolSize".to_string(), "1".to_string()),
        ("maxPoolSize".to_string(), "4".to_string()),
        ("connectTimeout".to_string(), "200ms".to_string()),
        ("executeTimeout".to_string(), "500ms".to_string()),
        ("maxRetries".to_string(), "3".to_string()),
        ("retryBaseDelay".to_string(), "1ms".to_string()),
    ])
}

/// An uninitialized adapter over `sim` with deterministic jitter.
pub fn adapter(sim: &Arc<Sim>) -> StateStoreAdapter {
    let factory: Arc<dyn SessionFactory> = sim.clone();
    StateStoreAdapter::new(sim.kind, factory).with_jitter(Arc::new(FixedJitter(0.0)))
}

/// An adapter initialized with `metadata(kind)` plus `overrides`.
pub async fn ready(kind: BackendKind, overrides: &[(&str, &str)]) -> (StateStoreAdapter, Arc<Sim>) {
    init_tracing();
    let sim = Sim::new(kind);
    let store = adapter(&sim);
    let mut md = metadata(kind);
    for (k, v) in overrides {
        md.insert(k.to_string(), v.to_string());
    }
    store
        .init(&OpContext::background(), &md)
        .await
        .expect("init against simulated backend");
    (store, sim)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
