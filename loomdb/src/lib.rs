pub mod automation;
pub mod config;
pub mod error;
pub mod graph;
pub mod migration;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod search;
pub mod store;
pub mod system_db;
pub mod validation;
pub mod value;

pub use automation::{AutomationEngine, AutomationEvent, AutomationExecution, AutomationRule, TriggerType};
pub use config::LoomConfig;
pub use error::{LoomError, Result};
pub use graph::{KnowledgeEdge, KnowledgeGraph, RelationType};
pub use query::QuerySpec;
pub use scheduler::Scheduler;
pub use schema::TableDefinition;
pub use search::SearchOptions;
pub use store::{MutationContext, Record, Store};
pub use value::FieldValue;
