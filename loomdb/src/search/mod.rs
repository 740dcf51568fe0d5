use crate::error::{LoomError, Result};
use crate::store::{records::decode_row, Record, Store};
use crate::system_db::{parse_timestamp, RecordRow};
use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

/// Paging and highlighting options for full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub limit: u32,
    pub offset: u32,
    pub highlight_open: String,
    pub highlight_close: String,
    /// Approximate number of tokens per snippet (1..=64).
    pub snippet_tokens: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 20,
            offset: 0,
            highlight_open: "[".into(),
            highlight_close: "]".into(),
            snippet_tokens: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record: Record,
    /// Higher is more relevant.
    pub score: f64,
    pub snippet: String,
}

impl Store {
    /// Ranked full-text search over a table's searchable fields. Blank
    /// queries return no hits.
    pub async fn search(&self, table: &str, text: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let Some(match_expr) = build_match_expression(text) else {
            return Ok(Vec::new());
        };
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let db = self.db.lock().await;
        let def = db.resolve_table(table)?;

        let sql = "SELECT r.seq, r.id, r.table_id, r.data_json, r.created_at, r.updated_at, r.deleted_at,
                    -bm25(record_search) AS score,
                    snippet(record_search, 2, ?, ?, '...', ?) AS snippet
             FROM record_search
             JOIN records r ON r.id = record_search.record_id
             WHERE record_search MATCH ?
               AND record_search.table_id = ?
               AND r.deleted_at IS NULL
             ORDER BY bm25(record_search), r.updated_at DESC, r.seq DESC
             LIMIT ? OFFSET ?";
        let binds = vec![
            SqlValue::Text(options.highlight_open.clone()),
            SqlValue::Text(options.highlight_close.clone()),
            SqlValue::Integer(i64::from(options.snippet_tokens.clamp(1, 64))),
            SqlValue::Text(match_expr.clone()),
            SqlValue::Text(def.id.clone()),
            SqlValue::Integer(i64::from(options.limit.min(self.config.max_page_size))),
            SqlValue::Integer(i64::from(options.offset)),
        ];

        let mut stmt = db.conn().prepare(sql)?;
        let mut rows = stmt
            .query(params_from_iter(binds))
            .map_err(|e| map_query_error(e, &match_expr))?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next().map_err(|e| map_query_error(e, &match_expr))? {
            let created_at: String = row.get(4)?;
            let updated_at: String = row.get(5)?;
            let deleted_at: Option<String> = row.get(6)?;
            let record_row = RecordRow {
                seq: row.get(0)?,
                id: row.get(1)?,
                table_id: row.get(2)?,
                data_json: row.get(3)?,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                deleted_at: deleted_at.as_deref().map(parse_timestamp).transpose()?,
            };
            hits.push(SearchHit {
                record: decode_row(&def, record_row)?,
                score: row.get("score")?,
                snippet: row.get("snippet")?,
            });
        }
        Ok(hits)
    }
}

/// Quote every term so punctuation never reaches the FTS5 parser, keeping
/// `AND`/`OR`/`NOT` as operators. Dangling operators are dropped.
fn build_match_expression(text: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;

    for raw in text.split_whitespace() {
        match raw {
            "AND" | "OR" | "NOT" => {
                if !tokens.is_empty() {
                    pending_op = Some(raw);
                }
            }
            term => {
                if let Some(op) = pending_op.take() {
                    tokens.push(op.to_string());
                }
                tokens.push(escape_term(term));
            }
        }
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn escape_term(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

fn map_query_error(err: rusqlite::Error, query: &str) -> LoomError {
    if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
        let msg = message.to_lowercase();
        if (msg.contains("fts5") && msg.contains("syntax")) || msg.contains("malformed match") {
            return LoomError::InvalidQuery {
                query: query.to_string(),
                message: message.clone(),
            };
        }
    }
    LoomError::Sqlite(err)
}
