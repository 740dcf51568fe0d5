//! Knowledge graph: typed links between records and bounded traversal.

use crate::error::{LoomError, Result};
use crate::schema::TableDefinition;
use crate::store::{records::decode_row, load_record, Store};
use crate::system_db::SystemDb;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Relation carried by a knowledge edge. Unknown names round-trip as
/// `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationType {
    RelatedTo,
    LinkedTo,
    DependsOn,
    Blocks,
    ChildOf,
    Mentions,
    Custom(String),
}

impl RelationType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationType::RelatedTo => "related_to",
            RelationType::LinkedTo => "linked_to",
            RelationType::DependsOn => "depends_on",
            RelationType::Blocks => "blocks",
            RelationType::ChildOf => "child_of",
            RelationType::Mentions => "mentions",
            RelationType::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "related_to" => RelationType::RelatedTo,
            "linked_to" => RelationType::LinkedTo,
            "depends_on" => RelationType::DependsOn,
            "blocks" => RelationType::Blocks,
            "child_of" => RelationType::ChildOf,
            "mentions" => RelationType::Mentions,
            other => RelationType::Custom(other.to_string()),
        }
    }
}

impl From<String> for RelationType {
    fn from(s: String) -> Self {
        RelationType::parse(&s)
    }
}

impl From<RelationType> for String {
    fn from(r: RelationType) -> Self {
        r.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeEdge {
    pub id: String,
    pub from_record: String,
    pub to_record: String,
    pub relation: RelationType,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEdge {
    /// The endpoint opposite `record_id`.
    pub fn other_end(&self, record_id: &str) -> &str {
        if self.from_record == record_id {
            &self.to_record
        } else {
            &self.from_record
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub record_id: String,
    /// `None` when the endpoint no longer exists at all.
    pub table_id: Option<String>,
    pub label: String,
    pub depth: usize,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<KnowledgeEdge>,
}

impl KnowledgeGraph {
    pub fn node(&self, record_id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.record_id == record_id)
    }
}

impl Store {
    /// Link two live records. Linking the same pair with the same relation
    /// again returns the existing edge.
    pub async fn link_records(
        &self,
        from_table: &str,
        from_id: &str,
        to_table: &str,
        to_id: &str,
        relation: RelationType,
    ) -> Result<KnowledgeEdge> {
        let db = self.db.lock().await;
        let edge = db.atomically(|db| {
            let from_def = db.resolve_table(from_table)?;
            let to_def = db.resolve_table(to_table)?;
            load_record(db, &from_def, from_id, false)?;
            load_record(db, &to_def, to_id, false)?;
            db.upsert_edge(from_id, to_id, &relation)
        })?;
        log::debug!("Linked {from_id} -[{}]-> {to_id}", edge.relation.as_str());
        Ok(edge)
    }

    pub async fn unlink_records(&self, edge_id: &str) -> Result<()> {
        if self.db.lock().await.delete_edge(edge_id)? {
            Ok(())
        } else {
            Err(LoomError::not_found("edge", edge_id))
        }
    }

    pub async fn get_edge(&self, edge_id: &str) -> Result<KnowledgeEdge> {
        self.db
            .lock()
            .await
            .get_edge(edge_id)?
            .ok_or_else(|| LoomError::not_found("edge", edge_id))
    }

    /// Every edge touching a record, in either direction.
    pub async fn links_of(&self, table: &str, record_id: &str) -> Result<Vec<KnowledgeEdge>> {
        let db = self.db.lock().await;
        let def = db.resolve_table(table)?;
        load_record(&db, &def, record_id, true)?;
        db.edges_touching(record_id)
    }

    /// Breadth-first expansion from a live root across edges in both
    /// directions, at most `depth` hops. Soft-deleted records appear as
    /// labelled endpoints but are not expanded further.
    pub async fn get_graph(&self, table: &str, record_id: &str, depth: usize) -> Result<KnowledgeGraph> {
        let db = self.db.lock().await;
        let root_table = db.resolve_table(table)?;
        let root = load_record(&db, &root_table, record_id, false)?;

        let mut tables = HashMap::new();
        tables.insert(root_table.id.clone(), Some(root_table.clone()));

        let mut graph = KnowledgeGraph::default();
        graph.nodes.push(GraphNode {
            record_id: root.id.clone(),
            table_id: Some(root.table_id.clone()),
            label: root.label(&root_table),
            depth: 0,
            deleted: false,
        });

        let mut seen: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut traversed: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(root.id, 0)]);

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for edge in db.edges_touching(&current)? {
                if !traversed.insert(edge.id.clone()) {
                    continue;
                }
                let other = edge.other_end(&current).to_string();
                graph.edges.push(edge);

                if seen.insert(other.clone()) {
                    let node = resolve_node(&db, &mut tables, &other, hops + 1)?;
                    if !node.deleted {
                        queue.push_back((other, hops + 1));
                    }
                    graph.nodes.push(node);
                }
            }
        }

        Ok(graph)
    }
}

fn resolve_node(
    db: &SystemDb,
    tables: &mut HashMap<String, Option<TableDefinition>>,
    record_id: &str,
    depth: usize,
) -> Result<GraphNode> {
    let Some(row) = db.get_record(record_id)? else {
        return Ok(GraphNode {
            record_id: record_id.to_string(),
            table_id: None,
            label: record_id.to_string(),
            depth,
            deleted: true,
        });
    };

    if !tables.contains_key(&row.table_id) {
        tables.insert(row.table_id.clone(), db.get_table(&row.table_id)?);
    }
    let table_id = row.table_id.clone();
    let deleted = row.deleted_at.is_some();
    let label = match tables.get(&table_id).and_then(Option::as_ref) {
        Some(table) => decode_row(table, row)?.label(table),
        None => record_id.to_string(),
    };

    Ok(GraphNode {
        record_id: record_id.to_string(),
        table_id: Some(table_id),
        label,
        depth,
        deleted,
    })
}
