use crate::error::{LoomError, Result};
use crate::schema::TableDefinition;
use crate::system_db::RecordRow;
use crate::value::{payload_to_json, FieldValue, Payload};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A stored record, with values decoded by its table's field types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: String,
    pub table_id: String,
    pub values: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn values_json(&self) -> serde_json::Value {
        payload_to_json(&self.values)
    }

    /// Display label: the table's label field, else the record id.
    pub fn label(&self, table: &TableDefinition) -> String {
        table
            .label_field()
            .and_then(|f| self.values.get(&f.slug))
            .map(FieldValue::search_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Call-scoped options for a mutation. Automation actions pass a suppressed
/// context so their own writes never raise new events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationContext {
    pub suppress_automation: bool,
    pub correlation_id: Option<String>,
}

impl MutationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppressed() -> Self {
        MutationContext {
            suppress_automation: true,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Decode a stored row against its table. Fields added after the row was
/// written come back as Null.
pub(crate) fn decode_row(table: &TableDefinition, row: RecordRow) -> Result<Record> {
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&row.data_json)?;
    let mut values = Payload::new();
    for field in &table.fields {
        let value = match raw.get(&field.slug) {
            Some(json) => FieldValue::decode(field.data_type, json).map_err(|message| {
                LoomError::InvalidData(format!(
                    "record {} field '{}': {message}",
                    row.id, field.slug
                ))
            })?,
            None => FieldValue::Null,
        };
        values.insert(field.slug.clone(), value);
    }
    Ok(Record {
        id: row.id,
        table_id: row.table_id,
        values,
        created_at: row.created_at,
        updated_at: row.updated_at,
        deleted_at: row.deleted_at,
    })
}

/// Text indexed for full-text search: every searchable field, in slug order.
pub(crate) fn index_body(table: &TableDefinition, values: &Payload) -> String {
    table
        .searchable_fields()
        .into_iter()
        .filter_map(|f| values.get(&f.slug))
        .map(FieldValue::search_text)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
