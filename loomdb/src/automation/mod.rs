pub mod actions;
pub mod conditions;
pub mod engine;
pub mod types;

pub use conditions::{all_match, evaluate, resolve_path};
pub use engine::AutomationEngine;
pub use types::*;
