use super::types::TableDefinition;
use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct TablesDocument {
    #[serde(default)]
    tables: Vec<TableDefinition>,
}

/// Parse a YAML file holding a top-level `tables:` list.
pub fn parse_tables(path: &Path) -> Result<Vec<TableDefinition>> {
    let content = std::fs::read_to_string(path)?;
    parse_tables_str(&content)
}

/// Parse table definitions from a YAML string. Both a `tables:` document and
/// a single bare table mapping are accepted.
pub fn parse_tables_str(content: &str) -> Result<Vec<TableDefinition>> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    let is_document = value
        .as_mapping()
        .map(|m| m.contains_key(serde_yaml::Value::String("tables".into())))
        .unwrap_or(false);

    if is_document {
        let doc: TablesDocument = serde_yaml::from_value(value)?;
        Ok(doc.tables)
    } else {
        let table: TableDefinition = serde_yaml::from_value(value)?;
        Ok(vec![table])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Visualization};

    const TABLES_YAML: &str = r#"
tables:
  - name: Tasks
    soft_delete: true
    fields:
      - label: Title
        type: text
        required: true
        searchable: true
        max_length: 200
      - label: Status
        type: enum
        enum: [normal, urgent]
        default: normal
      - label: Tags
        type: tags
      - slug: due_at
        label: Due
        type: datetime
    views:
      - name: Urgent
        filters:
          status: urgent
        sort: "-due_at"
        page_size: 25
        visualization: board
        default: true
  - name: Notes
    slug: notes
    fields:
      - label: Body
        type: note
        searchable: true
"#;

    #[test]
    fn test_parse_tables_document() {
        let tables = parse_tables_str(TABLES_YAML).unwrap();
        assert_eq!(tables.len(), 2);

        let tasks = &tables[0];
        assert_eq!(tasks.name, "Tasks");
        assert!(tasks.soft_delete);
        assert_eq!(tasks.fields.len(), 4);
        assert_eq!(tasks.fields[0].data_type, DataType::Text);
        assert_eq!(tasks.fields[0].max_length, Some(200));
        assert_eq!(
            tasks.fields[1].enum_values,
            Some(vec!["normal".to_string(), "urgent".to_string()])
        );
        assert_eq!(tasks.fields[1].default, Some(serde_json::json!("normal")));
        assert_eq!(tasks.fields[3].data_type, DataType::DateTime);
        assert_eq!(tasks.views[0].visualization, Visualization::Board);
        assert!(tasks.views[0].is_default);
        assert_eq!(tables[1].slug, "notes");
    }

    #[test]
    fn test_parse_bare_table() {
        let tables = parse_tables_str("name: Journal\nfields:\n  - label: Entry\n    type: note\n").unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "Journal");
    }

    #[test]
    fn test_prepare_derives_slugs() {
        let mut tables = parse_tables_str(TABLES_YAML).unwrap();
        let tasks = &mut tables[0];
        tasks.prepare();

        assert_eq!(tasks.slug, "tasks");
        assert_eq!(tasks.fields[0].slug, "title");
        assert_eq!(tasks.fields[3].slug, "due_at");
        assert_eq!(tasks.default_view.as_deref(), Some("urgent"));
        let urgent = tasks.view("urgent").unwrap();
        assert!(urgent.is_default);
        assert!(tasks.fields.iter().all(|f| f.table_id == tasks.id));
        assert!(tasks.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_constraints() {
        let yaml = r#"
name: Broken
fields:
  - label: Count
    type: number
    max_length: 3
  - label: Title
    type: text
    min_value: 1
  - label: Kind
    type: enum
    enum: []
  - label: Owner
    type: lookup
  - label: Count
    type: number
  - label: Code
    type: text
    pattern: "(["
views:
  - name: A
    default: true
  - name: B
    default: true
"#;
        let mut tables = parse_tables_str(yaml).unwrap();
        let table = &mut tables[0];
        table.prepare();
        let problems = table.validate();

        assert!(problems.iter().any(|p| p.contains("'count'") && p.contains("textual")));
        assert!(problems.iter().any(|p| p.contains("'title'") && p.contains("numeric")));
        assert!(problems.iter().any(|p| p.contains("enum value set is empty")));
        assert!(problems.iter().any(|p| p.contains("must declare a target")));
        assert!(problems.iter().any(|p| p.contains("Duplicate field slug 'count'")));
        assert!(problems.iter().any(|p| p.contains("invalid pattern")));
        assert!(problems.iter().any(|p| p.contains("at most one is allowed")));
    }

    #[test]
    fn test_label_field_prefers_text() {
        let mut tables = parse_tables_str(TABLES_YAML).unwrap();
        tables[0].prepare();
        assert_eq!(tables[0].label_field().unwrap().slug, "title");
        assert_eq!(tables[0].tags_field().unwrap().slug, "tags");
    }
}
