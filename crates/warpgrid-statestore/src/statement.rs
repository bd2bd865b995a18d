//! Backend-neutral statement and result types.
//!
//! Translators produce [`Statement`]s; sessions execute them and hand back
//! [`ResultSet`]s of named-column [`Row`]s.

/// A value bound into a statement or read back from a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Bytes(Vec<u8>),
    /// CQL `int`; `LIMIT` markers are typed this way.
    Int(i32),
    BigInt(i64),
    List(Vec<Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::BigInt(i) => Some(*i),
            Value::Int(i) => Some(i64::from(*i)),
            _ => None,
        }
    }
}

/// Logical operation a statement implements; used for logging and by
/// sessions that dispatch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Schema,
    SessionInit,
    Probe,
    Get,
    GetFallback,
    Set,
    Delete,
    BulkGet,
    BulkSet,
    BulkDelete,
    Scan,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatementKind::Schema => "schema",
            StatementKind::SessionInit => "session-init",
            StatementKind::Probe => "probe",
            StatementKind::Get => "get",
            StatementKind::GetFallback => "get-fallback",
            StatementKind::Set => "set",
            StatementKind::Delete => "delete",
            StatementKind::BulkGet => "bulk-get",
            StatementKind::BulkSet => "bulk-set",
            StatementKind::BulkDelete => "bulk-delete",
            StatementKind::Scan => "scan",
        };
        f.write_str(name)
    }
}

/// Bound parameters: positional `?` markers (CQL) or named `$name` (nGQL).
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    /// Look up a named parameter.
    pub fn named(&self, name: &str) -> Option<&Value> {
        match self {
            Params::Named(pairs) => pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up a positional parameter.
    pub fn positional(&self, index: usize) -> Option<&Value> {
        match self {
            Params::Positional(values) => values.get(index),
            _ => None,
        }
    }
}

/// A native statement plus its bound parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub text: String,
    pub params: Params,
}

impl Statement {
    pub fn new(kind: StatementKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            params: Params::None,
        }
    }

    pub fn with_params(self, params: Params) -> Self {
        Self { params, ..self }
    }
}

/// How a bulk write is shipped to the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Batch {
    /// One multi-value statement.
    Single(Statement),
    /// Several statements applied as one logged batch.
    Logged(Vec<Statement>),
}

/// One result row with named columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a column.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Rows returned by one statement execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
