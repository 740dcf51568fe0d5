use crate::automation::{AutomationExecution, AutomationRule, ExecutionStatus, Reminder};
use crate::error::{LoomError, Result};
use crate::graph::{KnowledgeEdge, RelationType};
use crate::schema::TableDefinition;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::path::Path;

/// The SQLite database behind the store: definitions, records, the search
/// index, knowledge edges, the mutation log and automation state.
pub struct SystemDb {
    conn: Connection,
}

/// A raw row of the `records` table. Values are decoded by the store, which
/// knows the owning table's field types.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub seq: i64,
    pub id: String,
    pub table_id: String,
    pub data_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
    Restore,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
            MutationOperation::Restore => "restore",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationOperation::Create),
            "update" => Ok(MutationOperation::Update),
            "delete" => Ok(MutationOperation::Delete),
            "restore" => Ok(MutationOperation::Restore),
            other => Err(LoomError::InvalidData(format!("unknown mutation operation '{other}'"))),
        }
    }
}

/// One entry of the mutation log handed to the sync collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationEntry {
    pub seq: i64,
    pub table_id: String,
    pub record_id: String,
    pub operation: MutationOperation,
    pub occurred_at: DateTime<Utc>,
    /// Payload snapshot; only kept for tables with an audit trail.
    pub payload: Option<serde_json::Value>,
}

impl SystemDb {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        log::info!("Opened loomdb database at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS table_definitions (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                definition_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                table_id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_records_table ON records(table_id, deleted_at);

            CREATE VIRTUAL TABLE IF NOT EXISTS record_search USING fts5(
                record_id UNINDEXED,
                table_id UNINDEXED,
                body
            );

            CREATE TABLE IF NOT EXISTS knowledge_edges (
                id TEXT PRIMARY KEY,
                from_record TEXT NOT NULL,
                to_record TEXT NOT NULL,
                relation TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (from_record, to_record, relation)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_from ON knowledge_edges(from_record);
            CREATE INDEX IF NOT EXISTS idx_edges_to ON knowledge_edges(to_record);

            CREATE TABLE IF NOT EXISTS mutation_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                table_id TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                payload_json TEXT
            );

            CREATE TABLE IF NOT EXISTS automation_rules (
                id TEXT PRIMARY KEY,
                module_id TEXT,
                rule_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS automation_executions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                rule_id TEXT NOT NULL,
                trigger_name TEXT NOT NULL,
                payload_key TEXT NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_executions_key
                ON automation_executions(rule_id, payload_key, seq);

            CREATE TABLE IF NOT EXISTS automation_reminders (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                record_id TEXT,
                message TEXT NOT NULL,
                due_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Run `f` inside one IMMEDIATE transaction. The write lock is taken up
    /// front so check-then-write sequences cannot interleave. Dropping the
    /// transaction on error rolls it back.
    pub fn atomically<T>(&self, f: impl FnOnce(&SystemDb) -> Result<T>) -> Result<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Table Definitions ────────────────────────────────────────────

    pub fn insert_table(&self, table: &TableDefinition) -> Result<()> {
        let now = timestamp(&now());
        self.conn.execute(
            "INSERT INTO table_definitions (id, slug, definition_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![table.id, table.slug, serde_json::to_string(table)?, now],
        )?;
        Ok(())
    }

    pub fn update_table(&self, table: &TableDefinition) -> Result<()> {
        let now = timestamp(&now());
        let changed = self.conn.execute(
            "UPDATE table_definitions SET slug = ?2, definition_json = ?3, updated_at = ?4 WHERE id = ?1",
            params![table.id, table.slug, serde_json::to_string(table)?, now],
        )?;
        if changed == 0 {
            return Err(LoomError::not_found("table", &table.id));
        }
        Ok(())
    }

    pub fn get_table(&self, id: &str) -> Result<Option<TableDefinition>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT definition_json FROM table_definitions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(LoomError::from))
            .transpose()
    }

    pub fn get_table_by_slug(&self, slug: &str) -> Result<Option<TableDefinition>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT definition_json FROM table_definitions WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(LoomError::from))
            .transpose()
    }

    /// Look a table up by id, falling back to its slug.
    pub fn resolve_table(&self, id_or_slug: &str) -> Result<TableDefinition> {
        match self.get_table(id_or_slug)? {
            Some(table) => Ok(table),
            None => self
                .get_table_by_slug(id_or_slug)?
                .ok_or_else(|| LoomError::not_found("table", id_or_slug)),
        }
    }

    pub fn list_tables(&self) -> Result<Vec<TableDefinition>> {
        let mut stmt = self
            .conn
            .prepare("SELECT definition_json FROM table_definitions ORDER BY slug")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(serde_json::from_str(&row?)?);
        }
        Ok(tables)
    }

    /// Remove a table definition with its records, index entries and edges.
    pub fn delete_table(&self, id: &str) -> Result<usize> {
        self.conn.execute(
            "DELETE FROM knowledge_edges
             WHERE from_record IN (SELECT id FROM records WHERE table_id = ?1)
                OR to_record IN (SELECT id FROM records WHERE table_id = ?1)",
            params![id],
        )?;
        self.conn
            .execute("DELETE FROM record_search WHERE table_id = ?1", params![id])?;
        let removed = self
            .conn
            .execute("DELETE FROM records WHERE table_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM table_definitions WHERE id = ?1", params![id])?;
        Ok(removed)
    }

    // ── Records ──────────────────────────────────────────────────────

    pub fn insert_record(&self, row: &RecordRow) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO records (id, table_id, data_json, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.table_id,
                row.data_json,
                timestamp(&row.created_at),
                timestamp(&row.updated_at),
                row.deleted_at.as_ref().map(timestamp),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_record_data(&self, id: &str, data_json: &str, updated_at: &DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET data_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, data_json, timestamp(updated_at)],
        )?;
        Ok(())
    }

    pub fn set_record_deleted(
        &self,
        id: &str,
        deleted_at: Option<&DateTime<Utc>>,
        updated_at: &DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET deleted_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, deleted_at.map(timestamp), timestamp(updated_at)],
        )?;
        Ok(())
    }

    pub fn delete_record(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_record(&self, id: &str) -> Result<Option<RecordRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                params![id],
                raw_record,
            )
            .optional()?;
        row.map(RawRecord::into_row).transpose()
    }

    /// Live records of a table, in insertion order.
    pub fn list_live_records(&self, table_id: &str) -> Result<Vec<RecordRow>> {
        self.select_records(
            "WHERE table_id = ?1 AND deleted_at IS NULL ORDER BY seq",
            &[&table_id],
        )
    }

    /// Run a record SELECT with a caller-built tail (`WHERE ... ORDER BY ...`).
    pub(crate) fn select_records(
        &self,
        tail: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RecordRow>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records {tail}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, raw_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_row()?);
        }
        Ok(out)
    }

    // ── Search Index ─────────────────────────────────────────────────

    /// Replace the index entry of a record.
    pub fn index_record(&self, record_id: &str, table_id: &str, body: &str) -> Result<()> {
        self.remove_from_index(record_id)?;
        if !body.trim().is_empty() {
            self.conn.execute(
                "INSERT INTO record_search (record_id, table_id, body) VALUES (?1, ?2, ?3)",
                params![record_id, table_id, body],
            )?;
        }
        Ok(())
    }

    pub fn remove_from_index(&self, record_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM record_search WHERE record_id = ?1",
            params![record_id],
        )?;
        Ok(())
    }

    // ── Knowledge Edges ──────────────────────────────────────────────

    /// Insert an edge unless an identical (from, to, relation) edge exists;
    /// returns the stored edge either way.
    pub fn upsert_edge(
        &self,
        from_record: &str,
        to_record: &str,
        relation: &RelationType,
    ) -> Result<KnowledgeEdge> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO knowledge_edges (id, from_record, to_record, relation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (from_record, to_record, relation) DO NOTHING",
            params![id, from_record, to_record, relation.as_str(), timestamp(&now())],
        )?;
        let raw = self.conn.query_row(
            "SELECT id, from_record, to_record, relation, created_at FROM knowledge_edges
             WHERE from_record = ?1 AND to_record = ?2 AND relation = ?3",
            params![from_record, to_record, relation.as_str()],
            raw_edge,
        )?;
        raw.into_edge()
    }

    pub fn get_edge(&self, id: &str) -> Result<Option<KnowledgeEdge>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, from_record, to_record, relation, created_at FROM knowledge_edges WHERE id = ?1",
                params![id],
                raw_edge,
            )
            .optional()?;
        raw.map(RawEdge::into_edge).transpose()
    }

    pub fn delete_edge(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM knowledge_edges WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Edges with the record at either end, oldest first.
    pub fn edges_touching(&self, record_id: &str) -> Result<Vec<KnowledgeEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, from_record, to_record, relation, created_at FROM knowledge_edges
             WHERE from_record = ?1 OR to_record = ?1
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![record_id], raw_edge)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?.into_edge()?);
        }
        Ok(edges)
    }

    pub fn delete_edges_for_record(&self, record_id: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM knowledge_edges WHERE from_record = ?1 OR to_record = ?1",
            params![record_id],
        )?;
        Ok(removed)
    }

    // ── Mutation Log ─────────────────────────────────────────────────

    pub fn append_mutation(
        &self,
        table_id: &str,
        record_id: &str,
        operation: MutationOperation,
        occurred_at: &DateTime<Utc>,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO mutation_log (table_id, record_id, operation, occurred_at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table_id, record_id, operation.as_str(), timestamp(occurred_at), payload_json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mutations committed after `seq`, oldest first.
    pub fn mutations_since(&self, seq: i64, limit: usize) -> Result<Vec<MutationEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, table_id, record_id, operation, occurred_at, payload_json
             FROM mutation_log WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![seq, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (seq, table_id, record_id, operation, occurred_at, payload_json) = row?;
            entries.push(MutationEntry {
                seq,
                table_id,
                record_id,
                operation: MutationOperation::parse(&operation)?,
                occurred_at: parse_timestamp(&occurred_at)?,
                payload: payload_json
                    .map(|p| serde_json::from_str(&p))
                    .transpose()?,
            });
        }
        Ok(entries)
    }

    // ── Automation Rules ─────────────────────────────────────────────

    pub fn insert_rule(&self, rule: &AutomationRule) -> Result<()> {
        self.conn.execute(
            "INSERT INTO automation_rules (id, module_id, rule_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![rule.id, rule.module_id, serde_json::to_string(rule)?, timestamp(&now())],
        )?;
        Ok(())
    }

    pub fn update_rule(&self, rule: &AutomationRule) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE automation_rules SET module_id = ?2, rule_json = ?3 WHERE id = ?1",
            params![rule.id, rule.module_id, serde_json::to_string(rule)?],
        )?;
        if changed == 0 {
            return Err(LoomError::not_found("rule", &rule.id));
        }
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT rule_json FROM automation_rules WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(LoomError::from))
            .transpose()
    }

    /// Rules in creation order, optionally limited to one module.
    pub fn list_rules(&self, module_id: Option<&str>) -> Result<Vec<AutomationRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_json FROM automation_rules
             WHERE ?1 IS NULL OR module_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![module_id], |row| row.get::<_, String>(0))?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(serde_json::from_str(&row?)?);
        }
        Ok(rules)
    }

    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM automation_rules WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    // ── Automation Executions ────────────────────────────────────────

    /// The most recent execution for a (rule, payload key) pair.
    pub fn latest_execution(&self, rule_id: &str, payload_key: &str) -> Result<Option<AutomationExecution>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM automation_executions
                     WHERE rule_id = ?1 AND payload_key = ?2
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![rule_id, payload_key],
                raw_execution,
            )
            .optional()?;
        raw.map(RawExecution::into_execution).transpose()
    }

    pub fn insert_execution(&self, execution: &AutomationExecution) -> Result<()> {
        self.conn.execute(
            "INSERT INTO automation_executions
                (id, rule_id, trigger_name, payload_key, status, outcome, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                execution.id,
                execution.rule_id,
                execution.trigger_name,
                execution.payload_key,
                execution.status.as_str(),
                execution.outcome,
                timestamp(&execution.started_at),
                execution.completed_at.as_ref().map(timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn complete_execution(&self, execution: &AutomationExecution) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE automation_executions SET status = ?2, outcome = ?3, completed_at = ?4 WHERE id = ?1",
            params![
                execution.id,
                execution.status.as_str(),
                execution.outcome,
                execution.completed_at.as_ref().map(timestamp),
            ],
        )?;
        if changed == 0 {
            return Err(LoomError::not_found("execution", &execution.id));
        }
        Ok(())
    }

    pub fn list_executions(&self, rule_id: &str) -> Result<Vec<AutomationExecution>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM automation_executions WHERE rule_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![rule_id], raw_execution)?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?.into_execution()?);
        }
        Ok(executions)
    }

    // ── Reminders ────────────────────────────────────────────────────

    pub fn insert_reminder(&self, reminder: &Reminder) -> Result<()> {
        self.conn.execute(
            "INSERT INTO automation_reminders (id, rule_id, record_id, message, due_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reminder.id,
                reminder.rule_id,
                reminder.record_id,
                reminder.message,
                timestamp(&reminder.due_at),
                timestamp(&reminder.created_at),
            ],
        )?;
        Ok(())
    }

    /// Reminders due at or before `now`, earliest first.
    pub fn due_reminders(&self, now: &DateTime<Utc>) -> Result<Vec<Reminder>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, rule_id, record_id, message, due_at, created_at
             FROM automation_reminders WHERE due_at <= ?1 ORDER BY due_at, id",
        )?;
        let rows = stmt.query_map(params![timestamp(now)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut reminders = Vec::new();
        for row in rows {
            let (id, rule_id, record_id, message, due_at, created_at) = row?;
            reminders.push(Reminder {
                id,
                rule_id,
                record_id,
                message,
                due_at: parse_timestamp(&due_at)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(reminders)
    }
}

const RECORD_COLUMNS: &str = "seq, id, table_id, data_json, created_at, updated_at, deleted_at";

const EXECUTION_COLUMNS: &str =
    "id, rule_id, trigger_name, payload_key, status, outcome, started_at, completed_at";

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort as strings.
pub fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoomError::InvalidData(format!("bad timestamp '{s}': {e}")))
}

struct RawRecord {
    seq: i64,
    id: String,
    table_id: String,
    data_json: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl RawRecord {
    fn into_row(self) -> Result<RecordRow> {
        Ok(RecordRow {
            seq: self.seq,
            id: self.id,
            table_id: self.table_id,
            data_json: self.data_json,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        table_id: row.get(2)?,
        data_json: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

struct RawEdge {
    id: String,
    from_record: String,
    to_record: String,
    relation: String,
    created_at: String,
}

impl RawEdge {
    fn into_edge(self) -> Result<KnowledgeEdge> {
        Ok(KnowledgeEdge {
            id: self.id,
            from_record: self.from_record,
            to_record: self.to_record,
            relation: RelationType::parse(&self.relation),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn raw_edge(row: &Row<'_>) -> rusqlite::Result<RawEdge> {
    Ok(RawEdge {
        id: row.get(0)?,
        from_record: row.get(1)?,
        to_record: row.get(2)?,
        relation: row.get(3)?,
        created_at: row.get(4)?,
    })
}

struct RawExecution {
    id: String,
    rule_id: String,
    trigger_name: String,
    payload_key: String,
    status: String,
    outcome: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RawExecution {
    fn into_execution(self) -> Result<AutomationExecution> {
        Ok(AutomationExecution {
            id: self.id,
            rule_id: self.rule_id,
            trigger_name: self.trigger_name,
            payload_key: self.payload_key,
            status: ExecutionStatus::parse(&self.status)?,
            outcome: self.outcome,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn raw_execution(row: &Row<'_>) -> rusqlite::Result<RawExecution> {
    Ok(RawExecution {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        trigger_name: row.get(2)?,
        payload_key: row.get(3)?,
        status: row.get(4)?,
        outcome: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, table_id: &str) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            seq: 0,
            id: id.into(),
            table_id: table_id.into(),
            data_json: r#"{"title":"hello"}"#.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_insert_and_get_record() {
        let db = SystemDb::open_in_memory().unwrap();
        let seq = db.insert_record(&row("r1", "t1")).unwrap();
        assert_eq!(seq, 1);

        let got = db.get_record("r1").unwrap().unwrap();
        assert_eq!(got.table_id, "t1");
        assert_eq!(got.data_json, r#"{"title":"hello"}"#);
        assert!(got.deleted_at.is_none());
        assert!(db.get_record("missing").unwrap().is_none());
    }

    #[test]
    fn test_soft_deleted_records_are_not_live() {
        let db = SystemDb::open_in_memory().unwrap();
        db.insert_record(&row("r1", "t1")).unwrap();
        db.insert_record(&row("r2", "t1")).unwrap();
        let now = Utc::now();
        db.set_record_deleted("r1", Some(&now), &now).unwrap();

        let live = db.list_live_records("t1").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "r2");
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let db = SystemDb::open_in_memory().unwrap();
        let result: Result<()> = db.atomically(|db| {
            db.insert_record(&row("r1", "t1"))?;
            Err(LoomError::ActionFailure("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_record("r1").unwrap().is_none());

        db.atomically(|db| db.insert_record(&row("r2", "t1"))).unwrap();
        assert!(db.get_record("r2").unwrap().is_some());
    }

    #[test]
    fn test_edge_upsert_is_idempotent() {
        let db = SystemDb::open_in_memory().unwrap();
        let first = db.upsert_edge("a", "b", &RelationType::DependsOn).unwrap();
        let second = db.upsert_edge("a", "b", &RelationType::DependsOn).unwrap();
        assert_eq!(first.id, second.id);

        db.upsert_edge("c", "a", &RelationType::Custom("cites".into())).unwrap();
        let touching = db.edges_touching("a").unwrap();
        assert_eq!(touching.len(), 2);
        assert!(touching.iter().any(|e| e.relation == RelationType::Custom("cites".into())));

        assert_eq!(db.delete_edges_for_record("a").unwrap(), 2);
        assert!(db.edges_touching("a").unwrap().is_empty());
    }

    #[test]
    fn test_mutation_log_since() {
        let db = SystemDb::open_in_memory().unwrap();
        let now = Utc::now();
        let first = db
            .append_mutation("t1", "r1", MutationOperation::Create, &now, None)
            .unwrap();
        db.append_mutation(
            "t1",
            "r1",
            MutationOperation::Update,
            &now,
            Some(&serde_json::json!({"title": "x"})),
        )
        .unwrap();

        let entries = db.mutations_since(first, 100).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, MutationOperation::Update);
        assert_eq!(entries[0].payload, Some(serde_json::json!({"title": "x"})));
        assert_eq!(db.mutations_since(0, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_fts_index_replaces_entry() {
        let db = SystemDb::open_in_memory().unwrap();
        db.index_record("r1", "t1", "alpha beta").unwrap();
        db.index_record("r1", "t1", "gamma").unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM record_search WHERE record_search MATCH 'gamma'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        let stale: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM record_search WHERE record_search MATCH 'alpha'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);
    }

    #[test]
    fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.db");
        {
            let db = SystemDb::open(&path).unwrap();
            db.insert_record(&row("r1", "t1")).unwrap();
        }
        let db = SystemDb::open(&path).unwrap();
        assert!(db.get_record("r1").unwrap().is_some());
    }
}
