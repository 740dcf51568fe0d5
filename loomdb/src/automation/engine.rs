use super::actions;
use super::conditions::all_match;
use super::types::{AutomationEvent, AutomationExecution, AutomationRule, ExecutionStatus, Reminder, TriggerType};
use crate::error::{LoomError, Result};
use crate::scheduler::parse_schedule;
use crate::store::Store;
use crate::system_db::now;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Attempts at writing an execution's outcome before giving up on it.
const RECORD_ATTEMPTS: u32 = 3;

/// Matches events against stored rules and runs their actions. Actions call
/// back into the same store the events came from.
#[derive(Clone)]
pub struct AutomationEngine {
    store: Store,
}

enum Claim {
    /// A prior execution absorbs this event.
    Existing(AutomationExecution),
    /// A fresh execution, persisted as Running.
    New(AutomationExecution),
}

impl AutomationEngine {
    pub fn new(store: Store) -> Self {
        AutomationEngine { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Rules ────────────────────────────────────────────────────────

    /// Persist a rule. A module given by slug is stored by table id, and a
    /// scheduled rule must carry a parseable cron expression.
    pub async fn create_rule(&self, mut rule: AutomationRule) -> Result<AutomationRule> {
        if rule.id.is_empty() {
            rule.id = ulid::Ulid::new().to_string();
        }
        self.normalize(&mut rule).await?;
        self.store.db.lock().await.insert_rule(&rule)?;
        log::info!(
            "Created rule '{}' ({}) on {}",
            rule.name,
            rule.id,
            rule.trigger_type.as_str()
        );
        Ok(rule)
    }

    /// Replace an existing rule.
    pub async fn update_rule(&self, mut rule: AutomationRule) -> Result<AutomationRule> {
        self.normalize(&mut rule).await?;
        self.store.db.lock().await.update_rule(&rule)?;
        Ok(rule)
    }

    async fn normalize(&self, rule: &mut AutomationRule) -> Result<()> {
        if let Some(module) = rule.module_id.take() {
            rule.module_id = Some(self.store.get_table(&module).await?.id);
        }
        if rule.trigger_type == TriggerType::Scheduled {
            let expression = rule.trigger_filter.as_deref().unwrap_or_default();
            parse_schedule(expression)?;
        }
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        self.store
            .db
            .lock()
            .await
            .get_rule(rule_id)?
            .ok_or_else(|| LoomError::not_found("rule", rule_id))
    }

    /// Rules in creation order. `module` may be a table id or slug.
    pub async fn list_rules(&self, module: Option<&str>) -> Result<Vec<AutomationRule>> {
        let module_id = match module {
            Some(m) => Some(self.store.get_table(m).await?.id),
            None => None,
        };
        self.store.db.lock().await.list_rules(module_id.as_deref())
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<AutomationRule> {
        let db = self.store.db.lock().await;
        let mut rule = db
            .get_rule(rule_id)?
            .ok_or_else(|| LoomError::not_found("rule", rule_id))?;
        rule.enabled = enabled;
        db.update_rule(&rule)?;
        log::info!("Rule '{}' {}", rule.name, if enabled { "enabled" } else { "disabled" });
        Ok(rule)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        if self.store.db.lock().await.delete_rule(rule_id)? {
            Ok(())
        } else {
            Err(LoomError::not_found("rule", rule_id))
        }
    }

    pub async fn list_executions(&self, rule_id: &str) -> Result<Vec<AutomationExecution>> {
        self.store.db.lock().await.list_executions(rule_id)
    }

    pub async fn due_reminders(&self, at: DateTime<Utc>) -> Result<Vec<Reminder>> {
        self.store.db.lock().await.due_reminders(&at)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Run every matching rule against `event`. A failing rule is recorded
    /// as Failed and never stops the others.
    pub async fn raise(&self, event: AutomationEvent) -> Result<Vec<AutomationExecution>> {
        let rules = self.store.db.lock().await.list_rules(None)?;
        let payload_key = serde_json::to_string(&event.payload)?;

        let mut executions = Vec::new();
        for rule in rules.iter().filter(|r| r.matches(&event)) {
            match self.run_rule(rule, &event, &payload_key).await {
                Ok(execution) => executions.push(execution),
                Err(e) => log::error!("Rule '{}' could not run for '{}': {e}", rule.name, event.name),
            }
        }
        Ok(executions)
    }

    async fn run_rule(
        &self,
        rule: &AutomationRule,
        event: &AutomationEvent,
        payload_key: &str,
    ) -> Result<AutomationExecution> {
        let mut execution = match self.claim(rule, event, payload_key).await? {
            Claim::Existing(execution) => {
                log::debug!(
                    "Rule '{}' already {} for this payload",
                    rule.name,
                    execution.status.as_str()
                );
                return Ok(execution);
            }
            Claim::New(execution) => execution,
        };

        if all_match(&rule.conditions, &event.payload) {
            let mut outcomes = Vec::new();
            let mut failure = None;
            for action in &rule.actions {
                match actions::execute(&self.store, rule, action, event).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            match failure {
                Some(message) => {
                    log::warn!("Rule '{}' failed: {message}", rule.name);
                    execution.status = ExecutionStatus::Failed;
                    execution.outcome = Some(message);
                }
                None => {
                    execution.status = ExecutionStatus::Succeeded;
                    execution.outcome = Some(outcomes.join("; "));
                }
            }
        } else {
            execution.status = ExecutionStatus::Skipped;
            execution.outcome = Some("conditions not met".to_string());
        }

        execution.completed_at = Some(now());
        self.record_outcome(&mut execution).await?;
        log::debug!(
            "Rule '{}' {} for '{}'",
            rule.name,
            execution.status.as_str(),
            event.name
        );
        Ok(execution)
    }

    /// Write the finished execution, retrying transient failures. If the
    /// outcome cannot be written, the row is marked Failed instead so the
    /// Running claim does not absorb every later replay.
    async fn record_outcome(&self, execution: &mut AutomationExecution) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=RECORD_ATTEMPTS {
            let result = self.store.db.lock().await.complete_execution(execution);
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "Recording execution {} failed (attempt {attempt}/{RECORD_ATTEMPTS}): {e}",
                        execution.id
                    );
                    last_error = Some(e);
                }
            }
            if attempt < RECORD_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        log::error!(
            "Execution {} could not be recorded as {}; releasing it as failed",
            execution.id,
            execution.status.as_str()
        );
        execution.status = ExecutionStatus::Failed;
        execution.outcome = Some(format!("outcome could not be recorded: {reason}"));
        self.store.db.lock().await.complete_execution(execution)
    }

    /// Look up and claim the (rule, payload) pair in one transaction.
    async fn claim(&self, rule: &AutomationRule, event: &AutomationEvent, payload_key: &str) -> Result<Claim> {
        let db = self.store.db.lock().await;
        db.atomically(|db| {
            if let Some(latest) = db.latest_execution(&rule.id, payload_key)? {
                if latest.status.absorbs_replay() {
                    return Ok(Claim::Existing(latest));
                }
            }
            let execution = AutomationExecution {
                id: ulid::Ulid::new().to_string(),
                rule_id: rule.id.clone(),
                trigger_name: event.name.clone(),
                payload_key: payload_key.to_string(),
                status: ExecutionStatus::Running,
                outcome: None,
                started_at: now(),
                completed_at: None,
            };
            db.insert_execution(&execution)?;
            Ok(Claim::New(execution))
        })
    }

    /// Raise every event already queued on `events`, returning the executions.
    pub async fn drain(&self, events: &mut mpsc::UnboundedReceiver<AutomationEvent>) -> Result<Vec<AutomationExecution>> {
        let mut executions = Vec::new();
        while let Ok(event) = events.try_recv() {
            executions.extend(self.raise(event).await?);
        }
        Ok(executions)
    }

    /// Consume events until the channel closes or `shutdown` flips to true.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<AutomationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Automation engine started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.raise(event).await {
                        log::error!("Automation dispatch failed: {e}");
                    }
                }
            }
        }
        log::info!("Automation engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{ActionKind, AutomationAction, AutomationCondition, ConditionOperator};
    use crate::store::fixtures;
    use crate::value::FieldValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> (AutomationEngine, mpsc::UnboundedReceiver<AutomationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = fixtures::store().await.with_events(tx);
        (AutomationEngine::new(store), rx)
    }

    fn urgent_rule() -> AutomationRule {
        let mut rule = AutomationRule::new("Review urgent tasks", TriggerType::OnCreate);
        rule.module_id = Some("tasks".into());
        rule.conditions.push(AutomationCondition::new(
            "values.status",
            ConditionOperator::Equals,
            Some(json!("urgent")),
        ));
        rule.actions
            .push(AutomationAction::new(ActionKind::Tag).param("tags", json!("needs-review")));
        rule
    }

    fn tags_of(values: Option<&FieldValue>) -> serde_json::Value {
        values.map(FieldValue::to_json).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_urgent_tasks_get_tagged() {
        let (engine, mut rx) = setup().await;
        let rule = engine.create_rule(urgent_rule()).await.unwrap();
        let tasks = engine.store().get_table("tasks").await.unwrap();
        assert_eq!(rule.module_id.as_deref(), Some(tasks.id.as_str()));

        let urgent = engine
            .store()
            .insert("tasks", json!({"title": "x", "status": "urgent"}))
            .await
            .unwrap();
        let normal = engine
            .store()
            .insert("tasks", json!({"title": "y", "status": "normal"}))
            .await
            .unwrap();

        let executions = engine.drain(&mut rx).await.unwrap();
        let statuses: Vec<ExecutionStatus> = executions.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![ExecutionStatus::Succeeded, ExecutionStatus::Skipped]);

        let urgent = engine.store().get("tasks", &urgent.id, false).await.unwrap();
        assert_eq!(tags_of(urgent.get("tags")), json!(["needs-review"]));
        let normal = engine.store().get("tasks", &normal.id, false).await.unwrap();
        assert_eq!(tags_of(normal.get("tags")), json!(null));

        // The tag write itself raised nothing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replayed_event_returns_existing_execution() {
        let (engine, mut rx) = setup().await;
        engine.create_rule(urgent_rule()).await.unwrap();
        engine
            .store()
            .insert("tasks", json!({"title": "x", "status": "urgent"}))
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();

        let first = engine.raise(event.clone()).await.unwrap();
        let second = engine.raise(event).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.list_executions(&first[0].rule_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_execution_can_be_retried() {
        let (engine, _rx) = setup().await;
        let mut rule = AutomationRule::new("Broken", TriggerType::Event);
        rule.actions.push(AutomationAction::new(ActionKind::UpdateField));
        let rule = engine.create_rule(rule).await.unwrap();

        let event = AutomationEvent::new("custom", TriggerType::Event, json!({"n": 1}));
        let first = engine.raise(event.clone()).await.unwrap();
        assert_eq!(first[0].status, ExecutionStatus::Failed);
        engine.raise(event).await.unwrap();
        assert_eq!(engine.list_executions(&rule.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_self_updating_rule_does_not_recurse() {
        let (engine, mut rx) = setup().await;
        let mut rule = AutomationRule::new("Bump priority", TriggerType::OnUpdate);
        rule.module_id = Some("tasks".into());
        rule.conditions.push(AutomationCondition::new(
            "values.priority",
            ConditionOperator::LessThan,
            Some(json!(10)),
        ));
        rule.actions.push(
            AutomationAction::new(ActionKind::UpdateField)
                .param("field", json!("priority"))
                .param("value", json!(10)),
        );
        let rule = engine.create_rule(rule).await.unwrap();

        let task = engine.store().insert("tasks", json!({"title": "t"})).await.unwrap();
        engine
            .store()
            .update("tasks", &task.id, json!({"priority": 1}))
            .await
            .unwrap();

        let executions = engine.drain(&mut rx).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Succeeded);
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.list_executions(&rule.id).await.unwrap().len(), 1);

        let task = engine.store().get("tasks", &task.id, false).await.unwrap();
        assert_eq!(task.get("priority").and_then(FieldValue::as_f64), Some(10.0));
    }

    #[tokio::test]
    async fn test_failing_rule_is_isolated() {
        let (engine, mut rx) = setup().await;
        let mut broken = AutomationRule::new("Broken", TriggerType::OnCreate);
        broken.module_id = Some("tasks".into());
        broken.actions.push(
            AutomationAction::new(ActionKind::UpdateField)
                .param("field", json!("priority"))
                .param("value", json!(99)),
        );
        broken.actions
            .push(AutomationAction::new(ActionKind::Tag).param("tags", json!("never")));
        engine.create_rule(broken).await.unwrap();
        let mut rule = urgent_rule();
        rule.conditions.clear();
        engine.create_rule(rule).await.unwrap();

        let task = engine.store().insert("tasks", json!({"title": "t"})).await.unwrap();
        let executions = engine.drain(&mut rx).await.unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].outcome.as_deref().unwrap_or_default().contains("priority"));
        assert_eq!(executions[1].status, ExecutionStatus::Succeeded);

        let task = engine.store().get("tasks", &task.id, false).await.unwrap();
        assert_eq!(tags_of(task.get("tags")), json!(["needs-review"]));
    }

    #[tokio::test]
    async fn test_note_reminder_and_link_actions() {
        let (engine, mut rx) = setup().await;
        let target = engine
            .store()
            .insert("docs", json!({"title": "Runbook"}))
            .await
            .unwrap();

        let mut rule = AutomationRule::new("Follow up", TriggerType::OnCreate);
        rule.module_id = Some("tasks".into());
        rule.actions = vec![
            AutomationAction::new(ActionKind::CreateNote)
                .param("table", json!("docs"))
                .param("values", json!({"title": "Follow-up"}))
                .param("link", json!("mentions")),
            AutomationAction::new(ActionKind::ScheduleReminder)
                .param("message", json!("check in"))
                .param("offset_minutes", json!(-5)),
            AutomationAction::new(ActionKind::LinkRecords)
                .param("table", json!("docs"))
                .param("record_id", json!(target.id)),
        ];
        let rule = engine.create_rule(rule).await.unwrap();

        let task = engine.store().insert("tasks", json!({"title": "t"})).await.unwrap();
        let executions = engine.drain(&mut rx).await.unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Succeeded, "{:?}", executions[0].outcome);
        assert!(rx.try_recv().is_err());

        let links = engine.store().links_of("tasks", &task.id).await.unwrap();
        assert_eq!(links.len(), 2);
        let reminders = engine.due_reminders(now()).await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].rule_id, rule.id);
        assert_eq!(reminders[0].record_id.as_deref(), Some(task.id.as_str()));
    }

    #[tokio::test]
    async fn test_rule_management() {
        let (engine, _rx) = setup().await;
        let rule = engine.create_rule(urgent_rule()).await.unwrap();
        assert_eq!(engine.list_rules(Some("tasks")).await.unwrap().len(), 1);
        assert!(engine.list_rules(Some("docs")).await.unwrap().is_empty());

        let disabled = engine.set_rule_enabled(&rule.id, false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(!engine.get_rule(&rule.id).await.unwrap().enabled);

        engine.delete_rule(&rule.id).await.unwrap();
        assert!(matches!(
            engine.get_rule(&rule.id).await,
            Err(LoomError::NotFound { kind: "rule", .. })
        ));

        let mut scheduled = AutomationRule::new("Bad cron", TriggerType::Scheduled);
        scheduled.trigger_filter = Some("every tuesday".into());
        assert!(matches!(
            engine.create_rule(scheduled).await,
            Err(LoomError::ScheduleParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_rule_normalizes_module() {
        let (engine, mut rx) = setup().await;
        let mut rule = engine.create_rule(urgent_rule()).await.unwrap();

        rule.name = "Remind about docs".into();
        rule.module_id = Some("docs".into());
        rule.conditions.clear();
        rule.actions =
            vec![AutomationAction::new(ActionKind::ScheduleReminder).param("message", json!("read it"))];
        let updated = engine.update_rule(rule.clone()).await.unwrap();

        let docs = engine.store().get_table("docs").await.unwrap();
        assert_eq!(updated.module_id.as_deref(), Some(docs.id.as_str()));
        assert_eq!(engine.get_rule(&rule.id).await.unwrap(), updated);
        assert!(engine.list_rules(Some("tasks")).await.unwrap().is_empty());

        engine.store().insert("docs", json!({"title": "d"})).await.unwrap();
        engine
            .store()
            .insert("tasks", json!({"title": "t", "status": "urgent"}))
            .await
            .unwrap();
        let executions = engine.drain(&mut rx).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Succeeded);

        let mut bad_cron = updated.clone();
        bad_cron.trigger_type = TriggerType::Scheduled;
        bad_cron.trigger_filter = Some("whenever".into());
        assert!(matches!(
            engine.update_rule(bad_cron).await,
            Err(LoomError::ScheduleParse { .. })
        ));
        assert_eq!(engine.get_rule(&rule.id).await.unwrap(), updated);

        let mut unknown = updated;
        unknown.id = "missing".into();
        assert!(matches!(
            engine.update_rule(unknown).await,
            Err(LoomError::NotFound { kind: "rule", .. })
        ));
    }

    #[tokio::test]
    async fn test_unrecordable_outcome_releases_claim() {
        let (engine, _rx) = setup().await;
        let mut rule = AutomationRule::new("Nudge", TriggerType::Event);
        rule.actions
            .push(AutomationAction::new(ActionKind::ScheduleReminder).param("message", json!("hi")));
        let rule = engine.create_rule(rule).await.unwrap();

        // Every attempt at writing a success fails.
        engine
            .store()
            .db
            .lock()
            .await
            .conn()
            .execute_batch(
                "CREATE TEMP TRIGGER refuse_success BEFORE UPDATE ON automation_executions
                 WHEN NEW.status = 'succeeded'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let event = AutomationEvent::new("nudge", TriggerType::Event, json!({"n": 1}));
        let first = engine.raise(event.clone()).await.unwrap();
        assert_eq!(first[0].status, ExecutionStatus::Failed);
        assert!(first[0]
            .outcome
            .as_deref()
            .unwrap_or_default()
            .contains("could not be recorded"));

        let stored = engine.list_executions(&rule.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ExecutionStatus::Failed);

        // No Running row is left behind to absorb the replay.
        engine
            .store()
            .db
            .lock()
            .await
            .conn()
            .execute_batch("DROP TRIGGER refuse_success;")
            .unwrap();
        let second = engine.raise(event).await.unwrap();
        assert_eq!(second[0].status, ExecutionStatus::Succeeded);
        assert_eq!(engine.list_executions(&rule.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, rx) = setup().await;
        engine.create_rule(urgent_rule()).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = engine.clone();
        let handle = tokio::spawn(async move { worker.run(rx, stop_rx).await });

        engine
            .store()
            .insert("tasks", json!({"title": "x", "status": "urgent"}))
            .await
            .unwrap();
        // Wait for the background engine to record the execution.
        let rule_id = engine.list_rules(None).await.unwrap()[0].id.clone();
        for _ in 0..100 {
            if !engine.list_executions(&rule_id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(engine.list_executions(&rule_id).await.unwrap().len(), 1);
    }
}
