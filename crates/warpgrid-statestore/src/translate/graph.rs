//! nGQL translation for graph backends.
//!
//! Each entry is a vertex whose id is the entry key, tagged with
//! `<tag>(data string, etag string, last_modified int64)`. `data` is stored
//! as standard base64 so arbitrary bytes survive the string property.
//!
//! Reads by id bind the key as a `$key` parameter. Writes and id lists
//! cannot be parameterized in nGQL, so every literal goes through
//! [`escape_string`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::{QueryTranslator, from_millis, to_millis};
use crate::config::{BackendKind, GraphSchema};
use crate::error::{StoreError, StoreResult};
use crate::statement::{Batch, Params, Row, Statement, StatementKind, Value};
use crate::types::StateEntry;

/// Escape a string for embedding between double quotes in nGQL.
///
/// Covers the backslash, both quote characters and the control characters
/// nGQL string literals recognise as escapes.
pub fn escape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", escape_string(raw))
}

#[derive(Clone, Debug)]
pub struct GraphTranslator {
    space: String,
    tag: String,
    schema: GraphSchema,
}

impl GraphTranslator {
    /// `space` and `tag` must already be validated identifiers.
    pub fn new(space: &str, tag: &str, schema: GraphSchema) -> Self {
        Self {
            space: space.to_string(),
            tag: tag.to_string(),
            schema,
        }
    }

    /// Quote a vertex id, rejecting keys the space cannot store.
    fn vid(&self, key: &str) -> StoreResult<String> {
        if key.contains('\0') {
            return Err(StoreError::Validation(format!(
                "key {key:?} contains a NUL character"
            )));
        }
        if key.len() > self.schema.vid_length {
            return Err(StoreError::Validation(format!(
                "key is {} bytes, longer than the space's vertex id length {}",
                key.len(),
                self.schema.vid_length
            )));
        }
        Ok(quote(key))
    }

    fn vid_list(&self, keys: &[String]) -> StoreResult<String> {
        if keys.is_empty() {
            return Err(StoreError::Validation("empty key list".to_string()));
        }
        Ok(keys
            .iter()
            .map(|k| self.vid(k))
            .collect::<StoreResult<Vec<_>>>()?
            .join(", "))
    }

    fn match_columns(&self) -> String {
        let tag = &self.tag;
        format!(
            "id(v) AS key, v.{tag}.data AS data, v.{tag}.etag AS etag, v.{tag}.last_modified AS last_modified"
        )
    }

    fn fetch(&self, kind: StatementKind, ids: &str) -> Statement {
        let tag = &self.tag;
        Statement::new(
            kind,
            format!(
                "FETCH PROP ON {tag} {ids} YIELD id(vertex) AS key, {tag}.data AS data, \
                 {tag}.etag AS etag, {tag}.last_modified AS last_modified"
            ),
        )
    }

    fn vertex_values(&self, entry: &StateEntry) -> StoreResult<String> {
        Ok(format!(
            "{}:({}, {}, {})",
            self.vid(&entry.key)?,
            quote(&STANDARD.encode(&entry.data)),
            quote(&entry.etag),
            to_millis(entry.last_modified)
        ))
    }

    fn insert(&self, kind: StatementKind, values: &str) -> Statement {
        Statement::new(
            kind,
            format!(
                "INSERT VERTEX {}(data, etag, last_modified) VALUES {values}",
                self.tag
            ),
        )
    }
}

fn text_column<'r>(row: &'r Row, name: &str) -> StoreResult<&'r str> {
    row.get(name)
        .and_then(Value::as_text)
        .ok_or_else(|| StoreError::Decode(format!("column `{name}` missing or not a string")))
}

impl QueryTranslator for GraphTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn bootstrap(&self) -> Vec<Statement> {
        let GraphSchema {
            partitions,
            replicas,
            vid_length,
        } = self.schema;
        let (space, tag) = (&self.space, &self.tag);
        vec![
            Statement::new(
                StatementKind::Schema,
                format!(
                    "CREATE SPACE IF NOT EXISTS {space}(partition_num = {partitions}, \
                     replica_factor = {replicas}, vid_type = FIXED_STRING({vid_length}))"
                ),
            ),
            Statement::new(StatementKind::Schema, format!("USE {space}")),
            Statement::new(
                StatementKind::Schema,
                format!(
                    "CREATE TAG IF NOT EXISTS {tag}(data string, etag string, last_modified int64)"
                ),
            ),
            // MATCH without an id predicate needs an index on the tag.
            Statement::new(
                StatementKind::Schema,
                format!("CREATE TAG INDEX IF NOT EXISTS {tag}_index ON {tag}()"),
            ),
        ]
    }

    fn session_init(&self) -> Vec<Statement> {
        vec![Statement::new(
            StatementKind::SessionInit,
            format!("USE {}", self.space),
        )]
    }

    fn probe(&self) -> Statement {
        Statement::new(StatementKind::Probe, "YIELD 1 AS ok")
    }

    fn get(&self, key: &str) -> StoreResult<Statement> {
        // Same checks as literal ids, even though the key is bound.
        self.vid(key)?;
        Ok(Statement::new(
            StatementKind::Get,
            format!(
                "MATCH (v:{}) WHERE id(v) == $key RETURN {}",
                self.tag,
                self.match_columns()
            ),
        )
        .with_params(Params::Named(vec![(
            "key".to_string(),
            Value::Text(key.to_string()),
        )])))
    }

    fn get_fallback(&self, key: &str) -> StoreResult<Option<Statement>> {
        let id = self.vid(key)?;
        Ok(Some(self.fetch(StatementKind::GetFallback, &id)))
    }

    fn set(&self, entry: &StateEntry) -> StoreResult<Statement> {
        let values = self.vertex_values(entry)?;
        Ok(self.insert(StatementKind::Set, &values))
    }

    fn delete(&self, key: &str) -> StoreResult<Statement> {
        Ok(Statement::new(
            StatementKind::Delete,
            format!("DELETE VERTEX {}", self.vid(key)?),
        ))
    }

    fn bulk_get(&self, keys: &[String]) -> StoreResult<Statement> {
        let ids = self.vid_list(keys)?;
        Ok(self.fetch(StatementKind::BulkGet, &ids))
    }

    fn bulk_set(&self, entries: &[StateEntry]) -> StoreResult<Batch> {
        if entries.is_empty() {
            return Err(StoreError::Validation("empty entry list".to_string()));
        }
        let values = entries
            .iter()
            .map(|e| self.vertex_values(e))
            .collect::<StoreResult<Vec<_>>>()?
            .join(", ");
        Ok(Batch::Single(self.insert(StatementKind::BulkSet, &values)))
    }

    fn bulk_delete(&self, keys: &[String]) -> StoreResult<Batch> {
        let ids = self.vid_list(keys)?;
        Ok(Batch::Single(Statement::new(
            StatementKind::BulkDelete,
            format!("DELETE VERTEX {ids}"),
        )))
    }

    fn scan(&self, limit: usize) -> StoreResult<Statement> {
        Ok(Statement::new(
            StatementKind::Scan,
            format!(
                "MATCH (v:{}) RETURN {} LIMIT {limit}",
                self.tag,
                self.match_columns()
            ),
        ))
    }

    fn decode(&self, row: &Row) -> StoreResult<StateEntry> {
        let key = text_column(row, "key")?.to_string();
        let data = STANDARD
            .decode(text_column(row, "data")?)
            .map_err(|e| StoreError::Decode(format!("data for {key:?} is not base64: {e}")))?;
        let etag = text_column(row, "etag")?.to_string();
        let last_modified = row
            .get("last_modified")
            .and_then(Value::as_i64)
            .map(from_millis)
            .ok_or_else(|| StoreError::Decode("column `last_modified` missing or not an integer".into()))?;
        Ok(StateEntry {
            key,
            data,
            etag,
            last_modified,
        })
    }
}
