use crate::automation::{AutomationEngine, AutomationEvent, AutomationExecution, TriggerType};
use crate::config::{CatchUpPolicy, SchedulerConfig};
use crate::error::{LoomError, Result};
use crate::system_db::{now, timestamp};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::json;
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Parse a cron expression. Classic five-field expressions get a leading
/// seconds field of `0`.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| LoomError::ScheduleParse {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Occurrences in `(after, until]`, reduced according to `policy`. At most
/// `max` occurrences are returned, the most recent ones.
pub fn due_occurrences(
    schedule: &Schedule,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
    policy: CatchUpPolicy,
    max: usize,
) -> Vec<DateTime<Utc>> {
    let keep = match policy {
        CatchUpPolicy::EmitAll => max,
        CatchUpPolicy::LatestOnly => max.min(1),
    };
    if keep == 0 || until <= after {
        return Vec::new();
    }

    let mut window = VecDeque::with_capacity(keep);
    for at in schedule.after(&after).take_while(|at| *at <= until) {
        if window.len() == keep {
            window.pop_front();
        }
        window.push_back(at);
    }
    window.into()
}

/// Turns scheduled rules into synthetic events. Each tick covers the wall
/// clock time since the previous one, so no occurrence is lost to a poll gap.
pub struct Scheduler {
    engine: AutomationEngine,
    config: SchedulerConfig,
    last_tick: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(engine: AutomationEngine, config: SchedulerConfig) -> Self {
        Scheduler {
            engine,
            config,
            last_tick: now(),
        }
    }

    /// Start the first window at `at` instead of now.
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_tick = at;
        self
    }

    pub fn last_tick(&self) -> DateTime<Utc> {
        self.last_tick
    }

    /// Raise every occurrence between the previous tick and `until`.
    pub async fn tick(&mut self, until: DateTime<Utc>) -> Result<Vec<AutomationExecution>> {
        self.tick_with(until, || false).await
    }

    /// Like `tick`, checking `stopped` between occurrences. An interrupted
    /// tick keeps its window start so the next tick covers it again; the
    /// execution ledger absorbs the replayed occurrences.
    async fn tick_with(
        &mut self,
        until: DateTime<Utc>,
        stopped: impl Fn() -> bool,
    ) -> Result<Vec<AutomationExecution>> {
        let rules = self.engine.list_rules(None).await?;
        let mut executions = Vec::new();

        for rule in rules
            .iter()
            .filter(|r| r.enabled && r.trigger_type == TriggerType::Scheduled)
        {
            let expression = rule.trigger_filter.as_deref().unwrap_or_default();
            let schedule = match parse_schedule(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    log::warn!("Skipping scheduled rule '{}': {e}", rule.name);
                    continue;
                }
            };

            let due = due_occurrences(
                &schedule,
                self.last_tick,
                until,
                self.config.catch_up,
                self.config.max_catch_up,
            );
            for at in due {
                if stopped() {
                    log::info!("Scheduler tick interrupted");
                    return Ok(executions);
                }
                let mut event = AutomationEvent::new(
                    expression,
                    TriggerType::Scheduled,
                    json!({ "rule_id": rule.id, "scheduled_at": timestamp(&at) }),
                );
                event.module_id = rule.module_id.clone();
                executions.extend(self.engine.raise(event).await?);
            }
        }

        self.last_tick = until;
        Ok(executions)
    }

    /// Tick every `interval_ms` until `shutdown` flips to true. A failed
    /// tick is logged and the loop carries on.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Scheduler started ({} ms interval)", self.config.interval_ms);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            match self.tick_with(now(), || *shutdown.borrow()).await {
                Ok(executions) if !executions.is_empty() => {
                    log::debug!("Scheduler tick ran {} execution(s)", executions.len())
                }
                Ok(_) => {}
                Err(e) => log::error!("Scheduler tick failed: {e}"),
            }
            if *shutdown.borrow() {
                break;
            }
        }
        log::info!("Scheduler stopped");
    }
}
