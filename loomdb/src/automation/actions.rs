use super::conditions::resolve_path;
use super::types::{ActionKind, AutomationAction, AutomationEvent, AutomationRule, Reminder};
use crate::error::{LoomError, Result};
use crate::graph::RelationType;
use crate::store::{MutationContext, Store};
use crate::system_db::now;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

/// Run one action for `rule` against `event`, returning a short outcome line.
/// Record writes go through a suppressed context so they raise no events.
pub(crate) async fn execute(
    store: &Store,
    rule: &AutomationRule,
    action: &AutomationAction,
    event: &AutomationEvent,
) -> Result<String> {
    let ctx = MutationContext::suppressed().with_correlation(correlation(rule, event));
    match action.kind {
        ActionKind::Tag => tag(store, &ctx, action, event).await,
        ActionKind::UpdateField => update_field(store, &ctx, action, event).await,
        ActionKind::CreateNote => create_note(store, &ctx, action, event).await,
        ActionKind::ScheduleReminder => schedule_reminder(store, rule, action, event).await,
        ActionKind::LinkRecords => link(store, action, event).await,
    }
}

fn correlation(rule: &AutomationRule, event: &AutomationEvent) -> String {
    event
        .correlation_id
        .clone()
        .unwrap_or_else(|| format!("rule:{}", rule.id))
}

/// The triggering record as `(table_id, record_id)`.
fn subject(action: &AutomationAction, event: &AutomationEvent) -> Result<(String, String)> {
    match (event.table_id(), event.record_id()) {
        (Some(table), Some(record)) => Ok((table.to_string(), record.to_string())),
        _ => Err(LoomError::ActionFailure(format!(
            "{:?} action needs an event about a record, got '{}'",
            action.kind, event.name
        ))),
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

async fn tag(
    store: &Store,
    ctx: &MutationContext,
    action: &AutomationAction,
    event: &AutomationEvent,
) -> Result<String> {
    let (table_id, record_id) = subject(action, event)?;
    let table = store.get_table(&table_id).await?;
    let field = match action.str_param("field") {
        Some(field) => field.to_string(),
        None => table
            .tags_field()
            .map(|f| f.slug.clone())
            .ok_or_else(|| LoomError::ActionFailure(format!("Table '{}' has no tags field", table.slug)))?,
    };

    let added = action.params.get("tags").map(string_list).unwrap_or_default();
    if added.is_empty() {
        return Err(LoomError::ActionFailure("Tag action needs a 'tags' parameter".into()));
    }

    let record = store.get(&table.id, &record_id, false).await?;
    let mut tags = record
        .get(&field)
        .map(|v| string_list(&v.to_json()))
        .unwrap_or_default();
    tags.extend(added.iter().cloned());
    store
        .update_with(ctx, &table.id, &record_id, json!({ field.as_str(): tags }))
        .await?;
    Ok(format!("tagged {record_id} with {}", added.join(", ")))
}

async fn update_field(
    store: &Store,
    ctx: &MutationContext,
    action: &AutomationAction,
    event: &AutomationEvent,
) -> Result<String> {
    let (table_id, record_id) = subject(action, event)?;
    let field = action.require_str("field")?;
    let value = match (action.params.get("value"), action.str_param("value_from")) {
        (Some(value), _) => value.clone(),
        (None, Some(path)) => resolve_path(&event.payload, path)
            .cloned()
            .ok_or_else(|| LoomError::ActionFailure(format!("Payload has nothing at '{path}'")))?,
        (None, None) => {
            return Err(LoomError::ActionFailure(
                "UpdateField action needs 'value' or 'value_from'".into(),
            ))
        }
    };
    store
        .update_with(ctx, &table_id, &record_id, json!({ field: value }))
        .await?;
    Ok(format!("set {field} on {record_id}"))
}

async fn create_note(
    store: &Store,
    ctx: &MutationContext,
    action: &AutomationAction,
    event: &AutomationEvent,
) -> Result<String> {
    let table = action.require_str("table")?;
    let values = action.params.get("values").cloned().unwrap_or_else(|| json!({}));
    let note = store.insert_with(ctx, table, values).await?;

    if let Some(relation) = action.str_param("link") {
        let (from_table, from_id) = subject(action, event)?;
        store
            .link_records(&from_table, &from_id, table, &note.id, RelationType::parse(relation))
            .await?;
    }
    Ok(format!("created {} in {table}", note.id))
}

async fn schedule_reminder(
    store: &Store,
    rule: &AutomationRule,
    action: &AutomationAction,
    event: &AutomationEvent,
) -> Result<String> {
    let message = action.require_str("message")?.to_string();
    let created_at = now();
    let due_at = match (action.str_param("at"), action.params.get("offset_minutes")) {
        (Some(at), _) => DateTime::parse_from_rfc3339(at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| LoomError::ActionFailure(format!("Bad reminder time '{at}': {e}")))?,
        (None, Some(offset)) => {
            let minutes = offset
                .as_i64()
                .ok_or_else(|| LoomError::ActionFailure("'offset_minutes' must be an integer".into()))?;
            created_at + Duration::minutes(minutes)
        }
        (None, None) => created_at,
    };

    let reminder = Reminder {
        id: ulid::Ulid::new().to_string(),
        rule_id: rule.id.clone(),
        record_id: event.record_id().map(str::to_string),
        message,
        due_at,
        created_at,
    };
    store.db.lock().await.insert_reminder(&reminder)?;
    Ok(format!("reminder {} due {}", reminder.id, reminder.due_at.to_rfc3339()))
}

async fn link(store: &Store, action: &AutomationAction, event: &AutomationEvent) -> Result<String> {
    let (from_table, from_id) = subject(action, event)?;
    let to_table = action.require_str("table")?;
    let to_id = action.require_str("record_id")?;
    let relation = action
        .str_param("relation")
        .map(RelationType::parse)
        .unwrap_or(RelationType::RelatedTo);
    let edge = store
        .link_records(&from_table, &from_id, to_table, to_id, relation)
        .await?;
    Ok(format!("linked {from_id} to {to_id} ({})", edge.relation.as_str()))
}
