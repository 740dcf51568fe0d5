use crate::error::{LoomError, Result};
use crate::schema::{DataType, FieldDefinition, TableDefinition};
use crate::store::{records::decode_row, Record, Store};
use crate::value::{normalize_tags, FieldValue};
use rusqlite::types::Value as SqlValue;
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    /// Parse `field`, `-field`, `field desc` or `field:desc`.
    pub fn parse(expr: &str) -> Result<SortSpec> {
        let expr = expr.trim();
        let invalid = |message: &str| LoomError::InvalidQuery {
            query: expr.to_string(),
            message: message.to_string(),
        };

        if let Some(field) = expr.strip_prefix('-') {
            return Ok(SortSpec {
                field: field.trim().to_string(),
                direction: SortDirection::Desc,
            });
        }

        let mut parts = expr.split(|c: char| c == ':' || c.is_whitespace()).filter(|p| !p.is_empty());
        let field = parts.next().ok_or_else(|| invalid("empty sort expression"))?;
        let direction = match parts.next().map(|d| d.to_ascii_lowercase()) {
            None => SortDirection::Asc,
            Some(d) if d == "asc" => SortDirection::Asc,
            Some(d) if d == "desc" => SortDirection::Desc,
            Some(_) => return Err(invalid("sort direction must be asc or desc")),
        };
        if parts.next().is_some() {
            return Err(invalid("unexpected trailing input"));
        }
        Ok(SortSpec {
            field: field.to_string(),
            direction,
        })
    }
}

/// Filter, sort and page parameters for `Store::query` and `Store::count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// Named view whose filters and sort are merged in.
    pub view: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub sort: Option<SortSpec>,
    pub skip: u32,
    pub take: Option<u32>,
    pub include_deleted: bool,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, slug: &str) -> Self {
        self.view = Some(slug.to_string());
        self
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: serde_json::Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn sort_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, take: u32) -> Self {
        self.take = Some(take);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// A compiled WHERE clause with its positional arguments.
struct Compiled {
    clause: String,
    args: Vec<SqlValue>,
    sort: Option<SortSpec>,
    page_size: Option<u32>,
}

impl Store {
    /// Records matching `spec`, in insertion order unless a sort is given.
    pub async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        let def = db.resolve_table(table)?;
        let compiled = compile(&def, spec)?;

        let mut sql = compiled.clause;
        let mut args = compiled.args;
        match &compiled.sort {
            Some(sort) => {
                let field = lookup_field(&def, &sort.field)?;
                sql.push_str(&format!(
                    " ORDER BY {} {}, seq ASC",
                    sort_expression(field),
                    match sort.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    }
                ));
                args.push(SqlValue::Text(json_path(&field.slug)));
            }
            None => sql.push_str(" ORDER BY seq ASC"),
        }

        let take = self.config.page_size(spec.take.or(compiled.page_size));
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(i64::from(take)));
        args.push(SqlValue::Integer(i64::from(spec.skip)));

        let refs: Vec<&dyn ToSql> = args.iter().map(|a| a as &dyn ToSql).collect();
        db.select_records(&sql, &refs)?
            .into_iter()
            .map(|row| decode_row(&def, row))
            .collect()
    }

    /// Number of records `query` would match, ignoring skip/take.
    pub async fn count(&self, table: &str, spec: &QuerySpec) -> Result<u64> {
        let db = self.db.lock().await;
        let def = db.resolve_table(table)?;
        let compiled = compile(&def, spec)?;

        let sql = format!("SELECT COUNT(*) FROM records {}", compiled.clause);
        let count: i64 = db.conn().query_row(
            &sql,
            rusqlite::params_from_iter(compiled.args.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn compile(table: &TableDefinition, spec: &QuerySpec) -> Result<Compiled> {
    let view = match &spec.view {
        Some(slug) => Some(table.view(slug).ok_or_else(|| LoomError::not_found("view", slug))?),
        None => None,
    };

    let mut clause = String::from("WHERE table_id = ?");
    let mut args = vec![SqlValue::Text(table.id.clone())];
    if !spec.include_deleted {
        clause.push_str(" AND deleted_at IS NULL");
    }

    let view_filters = view
        .into_iter()
        .flat_map(|v| v.filters.iter())
        .map(|(field, value)| FieldFilter {
            field: field.clone(),
            op: FilterOp::Equals,
            value: value.clone(),
        });
    for filter in view_filters.chain(spec.filters.iter().cloned()) {
        let field = lookup_field(table, &filter.field)?;
        let (condition, mut filter_args) = compile_filter(field, &filter)?;
        clause.push_str(" AND ");
        clause.push_str(&condition);
        args.append(&mut filter_args);
    }

    let sort = match (&spec.sort, view.and_then(|v| v.sort.as_deref())) {
        (Some(sort), _) => Some(sort.clone()),
        (None, Some(expr)) => Some(SortSpec::parse(expr)?),
        (None, None) => None,
    };

    Ok(Compiled {
        clause,
        args,
        sort,
        page_size: view.and_then(|v| v.page_size),
    })
}

fn lookup_field<'a>(table: &'a TableDefinition, slug: &str) -> Result<&'a FieldDefinition> {
    table.field(slug).ok_or_else(|| LoomError::InvalidQuery {
        query: slug.to_string(),
        message: format!("table '{}' has no field '{slug}'", table.slug),
    })
}

fn json_path(slug: &str) -> String {
    format!("$.\"{slug}\"")
}

fn sort_expression(field: &FieldDefinition) -> &'static str {
    if field.data_type.is_numeric() {
        "CAST(json_extract(data_json, ?) AS REAL)"
    } else {
        "json_extract(data_json, ?)"
    }
}

fn compile_filter(field: &FieldDefinition, filter: &FieldFilter) -> Result<(String, Vec<SqlValue>)> {
    let path = SqlValue::Text(json_path(&field.slug));
    let invalid = |message: String| LoomError::InvalidQuery {
        query: format!("{} {:?} {}", filter.field, filter.op, filter.value),
        message,
    };

    if filter.value.is_null() {
        return match filter.op {
            FilterOp::Equals => Ok(("json_extract(data_json, ?) IS NULL".into(), vec![path])),
            _ => Err(invalid("only equals accepts null".into())),
        };
    }

    match field.data_type {
        DataType::Tags => {
            let tag = filter
                .value
                .as_str()
                .map(|s| normalize_tags([s]))
                .and_then(|t| t.into_iter().next())
                .ok_or_else(|| invalid("tag filters take a non-empty string".into()))?;
            match filter.op {
                FilterOp::Equals | FilterOp::Contains => Ok((
                    "EXISTS (SELECT 1 FROM json_each(records.data_json, ?) AS t WHERE t.value = ?)".into(),
                    vec![path, SqlValue::Text(tag)],
                )),
                _ => Err(invalid("tags support equals and contains only".into())),
            }
        }
        DataType::Boolean => match (filter.op, filter.value.as_bool()) {
            (FilterOp::Equals, Some(b)) => Ok((
                "json_extract(data_json, ?) = ?".into(),
                vec![path, SqlValue::Integer(i64::from(b))],
            )),
            _ => Err(invalid("boolean fields support equals with true/false".into())),
        },
        DataType::Number | DataType::Decimal => {
            if filter.op == FilterOp::Contains {
                return Ok(contains_clause(path, &filter.value));
            }
            let n = match &filter.value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| invalid(format!("'{}' is not numeric", filter.value)))?;
            Ok((
                format!("CAST(json_extract(data_json, ?) AS REAL) {} ?", comparison(filter.op)),
                vec![path, SqlValue::Real(n)],
            ))
        }
        DataType::Json => match (&filter.op, &filter.value) {
            (FilterOp::Contains, value) => Ok(contains_clause(path, value)),
            (op, serde_json::Value::Number(n)) => Ok((
                format!("json_extract(data_json, ?) {} ?", comparison(*op)),
                vec![path, SqlValue::Real(n.as_f64().unwrap_or_default())],
            )),
            (op, serde_json::Value::String(s)) => Ok((
                format!("json_extract(data_json, ?) {} ?", comparison(*op)),
                vec![path, SqlValue::Text(s.clone())],
            )),
            (FilterOp::Equals, serde_json::Value::Bool(b)) => Ok((
                "json_extract(data_json, ?) = ?".into(),
                vec![path, SqlValue::Integer(i64::from(*b))],
            )),
            _ => Err(invalid("json fields compare against scalars only".into())),
        },
        _ => {
            if filter.op == FilterOp::Contains {
                return Ok(contains_clause(path, &filter.value));
            }
            // Canonicalize typed values (dates, datetimes) so text comparison
            // lines up with what is stored.
            let canonical = match FieldValue::decode(field.data_type, &filter.value) {
                Ok(FieldValue::Text(s)) => s,
                Ok(other) => match other.to_json() {
                    serde_json::Value::String(s) => s,
                    v => v.to_string(),
                },
                Err(message) => return Err(invalid(message)),
            };
            Ok((
                format!("json_extract(data_json, ?) {} ?", comparison(filter.op)),
                vec![path, SqlValue::Text(canonical)],
            ))
        }
    }
}

fn contains_clause(path: SqlValue, value: &serde_json::Value) -> (String, Vec<SqlValue>) {
    let needle = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (
        "instr(lower(CAST(json_extract(data_json, ?) AS TEXT)), lower(?)) > 0".into(),
        vec![path, SqlValue::Text(needle)],
    )
}

fn comparison(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Equals | FilterOp::Contains => "=",
        FilterOp::GreaterThan => ">",
        FilterOp::LessThan => "<",
    }
}
