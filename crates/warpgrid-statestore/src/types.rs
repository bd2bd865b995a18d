//! Request and response types for the state store contract.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Maximum rows a single `query` returns.
pub const QUERY_PAGE_LIMIT: usize = 1000;

/// One stored row. `data` is opaque and returned verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub etag: String,
    pub last_modified: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub key: String,
}

impl GetRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a `get`. An empty response (no etag) means the key is absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub data: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl GetResponse {
    pub fn found(&self) -> bool {
        self.etag.is_some()
    }
}

impl From<StateEntry> for GetResponse {
    fn from(entry: StateEntry) -> Self {
        Self {
            data: entry.data,
            etag: Some(entry.etag),
            last_modified: Some(entry.last_modified),
        }
    }
}

/// A write. A non-empty `etag` makes the write conditional on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetRequest {
    pub key: String,
    pub data: Vec<u8>,
    pub etag: Option<String>,
}

impl SetRequest {
    pub fn new(key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            etag: None,
        }
    }

    pub fn with_etag(self, etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            ..self
        }
    }

    /// The expected etag, if the caller supplied a non-empty one.
    pub fn expected_etag(&self) -> Option<&str> {
        self.etag.as_deref().filter(|e| !e.is_empty())
    }
}

/// A delete. A non-empty `etag` makes the delete conditional on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
    pub etag: Option<String>,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: None,
        }
    }

    pub fn with_etag(self, etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            ..self
        }
    }

    pub fn expected_etag(&self) -> Option<&str> {
        self.etag.as_deref().filter(|e| !e.is_empty())
    }
}

/// One element of a `bulk_get` result, positioned like its input key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkGetItem {
    pub key: String,
    pub data: Vec<u8>,
    pub etag: Option<String>,
    /// Set when this key's individual read failed.
    pub error: Option<String>,
}

impl BulkGetItem {
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn from_response(key: impl Into<String>, response: GetResponse) -> Self {
        Self {
            key: key.into(),
            data: response.data,
            etag: response.etag,
            error: None,
        }
    }

    pub fn found(&self) -> bool {
        self.etag.is_some()
    }
}

/// Optional adapter-side filter over a scanned page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    pub key_prefix: Option<String>,
}

impl QueryFilter {
    /// Parse a JSON filter document such as `{"keyPrefix": "user-"}`.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn matches(&self, key: &str) -> bool {
        self.key_prefix
            .as_deref()
            .is_none_or(|prefix| key.starts_with(prefix))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub filter: Option<QueryFilter>,
    /// Row cap; `0` or anything above [`QUERY_PAGE_LIMIT`] means the page limit.
    pub limit: usize,
}

impl QueryRequest {
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => QUERY_PAGE_LIMIT,
            n => n.min(QUERY_PAGE_LIMIT),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryItem {
    pub key: String,
    pub data: Vec<u8>,
    pub etag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResponse {
    pub results: Vec<QueryItem>,
    /// True when the backend had more rows than the scan cap allowed.
    pub truncated: bool,
}

/// Optional capabilities advertised by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    ETag,
    BulkFallback,
    Query,
}
