pub mod records;

pub use records::{MutationContext, Record};

use crate::automation::{AutomationEvent, TriggerType};
use crate::config::LoomConfig;
use crate::error::{LoomError, Result, ValidationErrors};
use crate::schema::{DataType, FieldDefinition, TableDefinition};
use crate::system_db::{now, timestamp, MutationEntry, MutationOperation, RecordRow, SystemDb};
use crate::validation;
use crate::value::{payload_to_json, FieldValue, Payload};
use chrono::{DateTime, Utc};
use records::{decode_row, index_body};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel end the store raises automation events into.
pub type EventSink = mpsc::UnboundedSender<AutomationEvent>;

/// The Record Store: table definitions plus generic CRUD over records
/// validated against them. Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Mutex<SystemDb>>,
    pub(crate) config: LoomConfig,
    events: Option<EventSink>,
}

impl Store {
    /// Open the database named by the config, or an in-memory one.
    pub fn open(config: LoomConfig) -> Result<Self> {
        let db = match &config.database {
            Some(path) => SystemDb::open(path)?,
            None => SystemDb::open_in_memory()?,
        };
        Ok(Store {
            db: Arc::new(Mutex::new(db)),
            config,
            events: None,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(LoomConfig::default())
    }

    /// Raise an event into `sink` after every committed mutation.
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    // ── Tables ───────────────────────────────────────────────────────

    /// Persist a new table definition. Slugs and ids are derived when empty.
    pub async fn create_table(&self, mut table: TableDefinition) -> Result<TableDefinition> {
        table.prepare();
        let problems = table.validate();
        if !problems.is_empty() {
            return Err(LoomError::Schema(problems.join("; ")));
        }

        let db = self.db.lock().await;
        db.atomically(|db| {
            if db.get_table_by_slug(&table.slug)?.is_some() || db.get_table(&table.id)?.is_some() {
                return Err(LoomError::SchemaConflict {
                    slug: table.slug.clone(),
                });
            }
            resolve_lookup_targets(db, &mut table)?;
            db.insert_table(&table)
        })?;

        log::info!("Created table '{}' ({} fields)", table.slug, table.fields.len());
        Ok(table)
    }

    pub async fn list_tables(&self) -> Result<Vec<TableDefinition>> {
        self.db.lock().await.list_tables()
    }

    /// Fetch a table by id or slug.
    pub async fn get_table(&self, table: &str) -> Result<TableDefinition> {
        self.db.lock().await.resolve_table(table)
    }

    pub async fn get_table_by_slug(&self, slug: &str) -> Result<TableDefinition> {
        self.db
            .lock()
            .await
            .get_table_by_slug(slug)?
            .ok_or_else(|| LoomError::not_found("table", slug))
    }

    /// Remove a table with all of its records, index entries and edges.
    /// Returns the number of records removed.
    pub async fn drop_table(&self, table: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let (slug, removed) = db.atomically(|db| {
            let table = db.resolve_table(table)?;
            let now = now();
            for row in db.select_records("WHERE table_id = ?1 ORDER BY seq", &[&table.id])? {
                if row.deleted_at.is_none() {
                    db.append_mutation(&table.id, &row.id, MutationOperation::Delete, &now, None)?;
                }
            }
            let removed = db.delete_table(&table.id)?;
            Ok((table.slug, removed))
        })?;
        log::info!("Dropped table '{slug}' ({removed} records)");
        Ok(removed)
    }

    // ── Records ──────────────────────────────────────────────────────

    pub async fn insert(&self, table: &str, values: serde_json::Value) -> Result<Record> {
        self.insert_with(&MutationContext::new(), table, values).await
    }

    /// Validate and persist a new record. Every violation is reported in a
    /// single `Validation` error.
    pub async fn insert_with(
        &self,
        ctx: &MutationContext,
        table: &str,
        values: serde_json::Value,
    ) -> Result<Record> {
        let (def, record) = {
            let db = self.db.lock().await;
            db.atomically(|db| {
                let def = db.resolve_table(table)?;
                let record = insert_record(db, &def, &values)?;
                Ok((def, record))
            })?
        };
        log::debug!("Inserted record {} into '{}'", record.id, def.slug);
        self.emit(ctx, MutationOperation::Create, &def, &record, None);
        Ok(record)
    }

    pub async fn update(&self, table: &str, record_id: &str, values: serde_json::Value) -> Result<Record> {
        self.update_with(&MutationContext::new(), table, record_id, values)
            .await
    }

    /// Merge `values` onto a live record and re-validate the result.
    pub async fn update_with(
        &self,
        ctx: &MutationContext,
        table: &str,
        record_id: &str,
        values: serde_json::Value,
    ) -> Result<Record> {
        let (def, record, previous) = {
            let db = self.db.lock().await;
            db.atomically(|db| {
                let def = db.resolve_table(table)?;
                let current = load_record(db, &def, record_id, false)?;
                let prepared = validation::prepare_payload(&def, &values, Some(&current.values));
                let mut errors = prepared.errors;
                check_references(db, &def, &prepared.payload, Some(record_id), &mut errors)?;
                validation::finish(errors)?;

                let now = now();
                let data_json = payload_to_json(&prepared.payload).to_string();
                db.update_record_data(record_id, &data_json, &now)?;
                db.index_record(record_id, &def.id, &index_body(&def, &prepared.payload))?;
                log_mutation(db, &def, record_id, MutationOperation::Update, &now, &prepared.payload)?;

                let previous = current.values.clone();
                let record = Record {
                    values: prepared.payload,
                    updated_at: now,
                    ..current
                };
                Ok((def, record, previous))
            })?
        };
        log::debug!("Updated record {} in '{}'", record.id, def.slug);
        self.emit(ctx, MutationOperation::Update, &def, &record, Some(&previous));
        Ok(record)
    }

    pub async fn delete(&self, table: &str, record_id: &str) -> Result<Record> {
        self.delete_with(&MutationContext::new(), table, record_id).await
    }

    /// Soft-delete when the table keeps deleted rows, otherwise remove the
    /// row and its knowledge edges. The search entry goes either way.
    pub async fn delete_with(&self, ctx: &MutationContext, table: &str, record_id: &str) -> Result<Record> {
        let (def, record) = {
            let db = self.db.lock().await;
            db.atomically(|db| {
                let def = db.resolve_table(table)?;
                let current = load_record(db, &def, record_id, false)?;
                let now = now();

                db.remove_from_index(record_id)?;
                if def.soft_delete {
                    db.set_record_deleted(record_id, Some(&now), &now)?;
                } else {
                    db.delete_record(record_id)?;
                    db.delete_edges_for_record(record_id)?;
                }
                log_mutation(db, &def, record_id, MutationOperation::Delete, &now, &current.values)?;

                let record = Record {
                    updated_at: now,
                    deleted_at: Some(now),
                    ..current
                };
                Ok((def, record))
            })?
        };
        log::debug!(
            "Deleted record {} from '{}' ({})",
            record.id,
            def.slug,
            if def.soft_delete { "soft" } else { "hard" }
        );
        self.emit(ctx, MutationOperation::Delete, &def, &record, None);
        Ok(record)
    }

    pub async fn restore(&self, table: &str, record_id: &str) -> Result<Record> {
        self.restore_with(&MutationContext::new(), table, record_id).await
    }

    /// Clear a soft-delete marker. Restoring a live record is a no-op.
    pub async fn restore_with(&self, ctx: &MutationContext, table: &str, record_id: &str) -> Result<Record> {
        let (def, record, restored) = {
            let db = self.db.lock().await;
            db.atomically(|db| {
                let def = db.resolve_table(table)?;
                let current = load_record(db, &def, record_id, true)?;
                if !current.is_deleted() {
                    return Ok((def, current, false));
                }

                let mut errors = ValidationErrors::default();
                check_references(db, &def, &current.values, Some(record_id), &mut errors)?;
                validation::finish(errors)?;

                let now = now();
                db.set_record_deleted(record_id, None, &now)?;
                db.index_record(record_id, &def.id, &index_body(&def, &current.values))?;
                log_mutation(db, &def, record_id, MutationOperation::Restore, &now, &current.values)?;

                let record = Record {
                    updated_at: now,
                    deleted_at: None,
                    ..current
                };
                Ok((def, record, true))
            })?
        };
        if restored {
            log::debug!("Restored record {} in '{}'", record.id, def.slug);
            self.emit(ctx, MutationOperation::Restore, &def, &record, None);
        }
        Ok(record)
    }

    /// Fetch one record. Soft-deleted records are `NotFound` unless
    /// `include_deleted` is set.
    pub async fn get(&self, table: &str, record_id: &str, include_deleted: bool) -> Result<Record> {
        let db = self.db.lock().await;
        let def = db.resolve_table(table)?;
        load_record(&db, &def, record_id, include_deleted)
    }

    /// Committed mutations after `seq`, for the sync collaborator.
    pub async fn mutations_since(&self, seq: i64, limit: usize) -> Result<Vec<MutationEntry>> {
        self.db.lock().await.mutations_since(seq, limit)
    }

    fn emit(
        &self,
        ctx: &MutationContext,
        operation: MutationOperation,
        table: &TableDefinition,
        record: &Record,
        previous: Option<&Payload>,
    ) {
        if ctx.suppress_automation {
            log::debug!(
                "Automation suppressed for {} of record {}",
                operation.as_str(),
                record.id
            );
            return;
        }
        let Some(sink) = &self.events else {
            return;
        };
        let event = record_event(ctx, operation, table, record, previous);
        if sink.send(event).is_err() {
            log::warn!("Automation event for record {} dropped: receiver closed", record.id);
        }
    }
}

/// Build the event raised for a committed record mutation.
pub(crate) fn record_event(
    ctx: &MutationContext,
    operation: MutationOperation,
    table: &TableDefinition,
    record: &Record,
    previous: Option<&Payload>,
) -> AutomationEvent {
    let (trigger, name) = match operation {
        MutationOperation::Create => (TriggerType::OnCreate, "record.created"),
        MutationOperation::Update => (TriggerType::OnUpdate, "record.updated"),
        MutationOperation::Restore => (TriggerType::OnUpdate, "record.restored"),
        MutationOperation::Delete => (TriggerType::OnDelete, "record.deleted"),
    };
    let mut payload = serde_json::json!({
        "table_id": table.id,
        "table_slug": table.slug,
        "record_id": record.id,
        "operation": operation.as_str(),
        "occurred_at": timestamp(&record.updated_at),
        "values": record.values_json(),
    });
    if let Some(previous) = previous {
        payload["previous"] = payload_to_json(previous);
    }
    AutomationEvent::new(name, trigger, payload)
        .with_module(table.id.clone())
        .with_correlation(ctx.correlation_id.clone())
}

fn insert_record(db: &SystemDb, table: &TableDefinition, values: &serde_json::Value) -> Result<Record> {
    let prepared = validation::prepare_payload(table, values, None);
    let mut errors = prepared.errors;
    check_references(db, table, &prepared.payload, None, &mut errors)?;
    validation::finish(errors)?;

    let now = now();
    let row = RecordRow {
        seq: 0,
        id: ulid::Ulid::new().to_string(),
        table_id: table.id.clone(),
        data_json: payload_to_json(&prepared.payload).to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    db.insert_record(&row)?;
    db.index_record(&row.id, &table.id, &index_body(table, &prepared.payload))?;
    log_mutation(db, table, &row.id, MutationOperation::Create, &now, &prepared.payload)?;

    Ok(Record {
        id: row.id,
        table_id: row.table_id,
        values: prepared.payload,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

pub(crate) fn load_record(
    db: &SystemDb,
    table: &TableDefinition,
    record_id: &str,
    include_deleted: bool,
) -> Result<Record> {
    let row = db
        .get_record(record_id)?
        .filter(|row| row.table_id == table.id)
        .filter(|row| include_deleted || row.deleted_at.is_none())
        .ok_or_else(|| LoomError::not_found("record", record_id))?;
    decode_row(table, row)
}

/// Checks that need storage: uniqueness against live records (excluding the
/// record being written) and lookup targets that must be live records.
fn check_references(
    db: &SystemDb,
    table: &TableDefinition,
    payload: &Payload,
    exclude: Option<&str>,
    errors: &mut ValidationErrors,
) -> Result<()> {
    let unique: Vec<(&FieldDefinition, serde_json::Value)> = table
        .fields_by_slug()
        .into_iter()
        .filter(|f| f.unique)
        .filter_map(|f| {
            payload
                .get(&f.slug)
                .filter(|v| !v.is_null())
                .map(|v| (f, v.unique_key()))
        })
        .collect();

    if !unique.is_empty() {
        let mut live = Vec::new();
        for row in db.list_live_records(&table.id)? {
            if Some(row.id.as_str()) == exclude {
                continue;
            }
            let data: serde_json::Value = serde_json::from_str(&row.data_json)?;
            live.push((row.id, data));
        }
        for (field, wanted) in &unique {
            let taken = live.iter().find(|(_, data)| {
                data.get(&field.slug)
                    .and_then(|stored| FieldValue::decode(field.data_type, stored).ok())
                    .is_some_and(|stored| !stored.is_null() && stored.unique_key() == *wanted)
            });
            if let Some((other, _)) = taken {
                errors.push(
                    field.slug.clone(),
                    format!("value must be unique; already used by record {other}"),
                );
            }
        }
    }

    for field in table.fields_by_slug() {
        if field.data_type != DataType::Lookup {
            continue;
        }
        let (Some(FieldValue::Text(target_id)), Some(target_table)) =
            (payload.get(&field.slug), field.target.as_deref())
        else {
            continue;
        };
        let live_target = db
            .get_record(target_id)?
            .map(|row| row.table_id == target_table && row.deleted_at.is_none())
            .unwrap_or(false);
        if !live_target {
            errors.push(
                field.slug.clone(),
                format!("references missing record '{target_id}'"),
            );
        }
    }

    Ok(())
}

/// Point lookup fields at table ids. A lookup may target its own table.
pub(crate) fn resolve_lookup_targets(db: &SystemDb, table: &mut TableDefinition) -> Result<()> {
    let (own_id, own_slug) = (table.id.clone(), table.slug.clone());
    for field in table.fields.iter_mut().filter(|f| f.data_type == DataType::Lookup) {
        let Some(target) = field.target.clone() else {
            continue;
        };
        if target == own_id || target == own_slug {
            field.target = Some(own_id.clone());
            continue;
        }
        let resolved = match db.get_table(&target)? {
            Some(t) => Some(t),
            None => db.get_table_by_slug(&target)?,
        };
        match resolved {
            Some(t) => field.target = Some(t.id),
            None => {
                return Err(LoomError::Schema(format!(
                    "Lookup field '{}' targets unknown table '{target}'",
                    field.slug
                )))
            }
        }
    }
    Ok(())
}

fn log_mutation(
    db: &SystemDb,
    table: &TableDefinition,
    record_id: &str,
    operation: MutationOperation,
    at: &DateTime<Utc>,
    payload: &Payload,
) -> Result<()> {
    let snapshot = table.audit_trail.then(|| payload_to_json(payload));
    db.append_mutation(&table.id, record_id, operation, at, snapshot.as_ref())?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterOp, QuerySpec};
    use crate::schema::parse_tables_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_table_conflict() {
        let store = fixtures::store().await;
        let again = parse_tables_str("name: Tasks\nfields: []\n").unwrap().remove(0);
        let err = store.create_table(again).await.unwrap_err();
        assert!(matches!(err, LoomError::SchemaConflict { ref slug } if slug == "tasks"));
        assert_eq!(store.list_tables().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_table_rejects_unknown_lookup_target() {
        let store = fixtures::store().await;
        let table = parse_tables_str("name: Deals\nfields:\n  - { label: Owner, type: lookup, target: people }\n")
            .unwrap()
            .remove(0);
        let err = store.create_table(table).await.unwrap_err();
        assert!(matches!(err, LoomError::Schema(ref m) if m.contains("people")));
    }

    #[tokio::test]
    async fn test_insert_reports_every_violation() {
        let store = fixtures::store().await;
        let err = store
            .insert("tasks", json!({"status": "later", "priority": 42, "due": "tomorrow"}))
            .await
            .unwrap_err();

        let fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["due", "priority", "status", "title"]);
    }

    #[tokio::test]
    async fn test_insert_and_get_applies_defaults() {
        let store = fixtures::store().await;
        let record = store
            .insert("tasks", json!({"title": "Ship", "tags": ["Work", "work"]}))
            .await
            .unwrap();

        let fetched = store.get("tasks", &record.id, false).await.unwrap();
        assert_eq!(fetched, record);
        assert_eq!(
            fetched.values_json(),
            json!({
                "title": "Ship",
                "status": "normal",
                "priority": null,
                "tags": ["work"],
                "notes": null,
                "due": null
            })
        );
    }

    #[tokio::test]
    async fn test_every_data_type_round_trips() {
        let store = fixtures::store().await;
        let table = parse_tables_str(
            r#"
name: Kitchen Sink
fields:
  - { label: Text, type: text }
  - { label: Number, type: number }
  - { label: Decimal, type: decimal }
  - { label: Boolean, type: boolean }
  - { label: Date, type: date }
  - { label: Moment, type: datetime }
  - { label: Choice, type: enum, enum: [a, b], default: a }
  - { label: Owner, type: lookup, target: contacts }
  - { label: Attachment, type: file }
  - { label: Note, type: note }
  - { label: Data, type: json }
  - { label: Tags, type: tags }
  - { label: Empty, type: text }
"#,
        )
        .unwrap()
        .remove(0);
        store.create_table(table).await.unwrap();
        let owner = store
            .insert("contacts", json!({"name": "Ana", "email": "ana@example.com"}))
            .await
            .unwrap();

        let payload = json!({
            "text": "hello",
            "number": 7.25,
            "decimal": "10.50",
            "boolean": false,
            "date": "2024-02-29",
            "moment": "2024-05-01T10:00:00.000000000Z",
            "owner": owner.id,
            "attachment": "files/report.pdf",
            "note": "line one\nline two",
            "data": {"nested": [1, {"deep": true}]},
            "tags": ["a", "b"],
            "empty": null
        });
        let record = store.insert("kitchen_sink", payload.clone()).await.unwrap();
        let fetched = store.get("kitchen_sink", &record.id, false).await.unwrap();

        let mut expected = payload;
        expected["choice"] = json!("a");
        assert_eq!(fetched.values_json(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_unique_inserts() {
        let store = Arc::new(fixtures::store().await);
        let mut handles = Vec::new();
        for name in ["First", "Second"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert("contacts", json!({"name": name, "email": "same@example.com"}))
                    .await
            }));
        }

        let mut ok = 0;
        let mut failures = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => failures.push(e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(failures.len(), 1);
        let violations = failures[0].violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "email");
        assert!(violations[0].message.contains("unique"));
    }

    #[tokio::test]
    async fn test_decimal_exponents_are_stored_as_plain_digits() {
        let store = fixtures::store().await;
        let table = parse_tables_str("name: Readings\nfields:\n  - { label: Amount, type: decimal }\n")
            .unwrap()
            .remove(0);
        store.create_table(table).await.unwrap();

        let tiny = store.insert("readings", json!({"amount": 1e-7})).await.unwrap();
        let huge = store.insert("readings", json!({"amount": 1e21})).await.unwrap();

        let fetched = store.get("readings", &tiny.id, false).await.unwrap();
        assert_eq!(fetched.values_json(), json!({"amount": "0.0000001"}));
        let fetched = store.get("readings", &huge.id, false).await.unwrap();
        assert_eq!(fetched.values_json(), json!({"amount": "1000000000000000000000"}));

        let all = store.query("readings", &QuerySpec::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        let large = QuerySpec::new().filter("amount", FilterOp::GreaterThan, json!(1));
        let large = store.query("readings", &large).await.unwrap();
        assert_eq!(large.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![huge.id.as_str()]);
    }

    #[tokio::test]
    async fn test_uniqueness_compares_numbers_by_value() {
        let store = fixtures::store().await;
        let table = parse_tables_str(
            r#"
name: Ledger
fields:
  - { label: Code, type: number, unique: true }
  - { label: Amount, type: decimal, unique: true }
"#,
        )
        .unwrap()
        .remove(0);
        store.create_table(table).await.unwrap();
        store
            .insert("ledger", json!({"code": 1, "amount": "10.5"}))
            .await
            .unwrap();

        let cases = vec![
            (json!({"code": 1.0, "amount": "10.50"}), vec!["amount", "code"]),
            (json!({"code": 2, "amount": 10.5}), vec!["amount"]),
            (json!({"code": 1e0, "amount": "1.05e1"}), vec!["amount", "code"]),
            (json!({"code": 1, "amount": "10.25"}), vec!["code"]),
        ];
        for (payload, clashing) in cases {
            let err = store.insert("ledger", payload.clone()).await.unwrap_err();
            let mut fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
            fields.sort();
            assert_eq!(fields, clashing, "{payload}");
        }

        store
            .insert("ledger", json!({"code": 2, "amount": "10.25"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_merges_and_excludes_self_from_uniqueness() {
        let store = fixtures::store().await;
        let ana = store
            .insert("contacts", json!({"name": "Ana", "email": "ana@example.com"}))
            .await
            .unwrap();
        let bo = store
            .insert("contacts", json!({"name": "Bo", "email": "bo@example.com"}))
            .await
            .unwrap();

        let renamed = store
            .update("contacts", &ana.id, json!({"name": "Ana Maria", "email": "ana@example.com"}))
            .await
            .unwrap();
        assert_eq!(renamed.get("name"), Some(&FieldValue::Text("Ana Maria".into())));
        assert_eq!(renamed.created_at, ana.created_at);

        let clash = store
            .update("contacts", &bo.id, json!({"email": "ana@example.com"}))
            .await
            .unwrap_err();
        assert!(clash.violations().iter().any(|v| v.field == "email"));

        let missing = store.update("contacts", "nope", json!({})).await.unwrap_err();
        assert!(matches!(missing, LoomError::NotFound { kind: "record", .. }));
    }

    #[tokio::test]
    async fn test_lookup_must_reference_live_record() {
        let store = fixtures::store().await;
        let err = store
            .insert("contacts", json!({"name": "Cy", "email": "cy@example.com", "manager": "01NOTREAL"}))
            .await
            .unwrap_err();
        assert!(err.violations().iter().any(|v| v.field == "manager"));

        let boss = store
            .insert("contacts", json!({"name": "Di", "email": "di@example.com"}))
            .await
            .unwrap();
        store
            .insert("contacts", json!({"name": "Cy", "email": "cy@example.com", "manager": boss.id}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore() {
        let store = fixtures::store().await;
        let record = store.insert("tasks", json!({"title": "Archive me"})).await.unwrap();

        let deleted = store.delete("tasks", &record.id).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(matches!(
            store.get("tasks", &record.id, false).await.unwrap_err(),
            LoomError::NotFound { .. }
        ));
        assert!(store.get("tasks", &record.id, true).await.unwrap().is_deleted());
        assert!(store.delete("tasks", &record.id).await.is_err());

        let restored = store.restore("tasks", &record.id).await.unwrap();
        assert!(!restored.is_deleted());
        assert_eq!(store.get("tasks", &record.id, false).await.unwrap().values, record.values);
    }

    #[tokio::test]
    async fn test_hard_delete_removes_row() {
        let store = fixtures::store().await;
        let record = store
            .insert("contacts", json!({"name": "Ana", "email": "ana@example.com"}))
            .await
            .unwrap();
        store.delete("contacts", &record.id).await.unwrap();
        assert!(store.get("contacts", &record.id, true).await.is_err());

        // The unique value is free again.
        store
            .insert("contacts", json!({"name": "Ana", "email": "ana@example.com"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = fixtures::store().await.with_events(tx);

        let record = store.insert("tasks", json!({"title": "A"})).await.unwrap();
        store.update("tasks", &record.id, json!({"status": "done"})).await.unwrap();
        store
            .update_with(&MutationContext::suppressed(), "tasks", &record.id, json!({"priority": 1}))
            .await
            .unwrap();
        store
            .delete_with(&MutationContext::new().with_correlation("sync-7"), "tasks", &record.id)
            .await
            .unwrap();

        let created = rx.try_recv().unwrap();
        assert_eq!(created.trigger_type, TriggerType::OnCreate);
        assert_eq!(created.name, "record.created");
        assert_eq!(created.payload["table_slug"], json!("tasks"));
        assert_eq!(created.record_id(), Some(record.id.as_str()));

        let updated = rx.try_recv().unwrap();
        assert_eq!(updated.trigger_type, TriggerType::OnUpdate);
        assert_eq!(updated.payload["values"]["status"], json!("done"));
        assert_eq!(updated.payload["previous"]["status"], json!("normal"));

        let deleted = rx.try_recv().unwrap();
        assert_eq!(deleted.trigger_type, TriggerType::OnDelete);
        assert_eq!(deleted.correlation_id.as_deref(), Some("sync-7"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mutation_log_keeps_audit_payloads() {
        let store = fixtures::store().await;
        let task = store.insert("tasks", json!({"title": "Audited"})).await.unwrap();
        store
            .insert("contacts", json!({"name": "Ana", "email": "ana@example.com"}))
            .await
            .unwrap();
        store.delete("tasks", &task.id).await.unwrap();

        let log = store.mutations_since(0, 100).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].operation, MutationOperation::Create);
        assert_eq!(log[0].payload.as_ref().unwrap()["title"], json!("Audited"));
        assert!(log[1].payload.is_none());
        assert_eq!(log[2].operation, MutationOperation::Delete);
        assert_eq!(log[2].record_id, task.id);

        let tail = store.mutations_since(log[1].seq, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_table_cascades() {
        let store = fixtures::store().await;
        store.insert("docs", json!({"title": "One"})).await.unwrap();
        store.insert("docs", json!({"title": "Two"})).await.unwrap();

        assert_eq!(store.drop_table("docs").await.unwrap(), 2);
        assert!(store.get_table("docs").await.is_err());
        assert!(store.insert("docs", json!({"title": "Three"})).await.is_err());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoomConfig {
            database: Some(dir.path().join("loom.db")),
            ..LoomConfig::default()
        };
        let id = {
            let store = Store::open(config.clone()).unwrap();
            for table in parse_tables_str(fixtures::TABLES).unwrap() {
                store.create_table(table).await.unwrap();
            }
            store.insert("docs", json!({"title": "Kept"})).await.unwrap().id
        };
        let reopened = Store::open(config).unwrap();
        let record = reopened.get("docs", &id, false).await.unwrap();
        assert_eq!(record.get("title"), Some(&FieldValue::Text("Kept".into())));
    }
}
