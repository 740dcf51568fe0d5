use crate::error::{LoomError, Result};
use crate::schema::{FieldDefinition, TableDefinition, ViewDefinition};
use crate::store::{records::index_body, records::decode_row, resolve_lookup_targets, Store};
use crate::system_db::SystemDb;
use crate::value::FieldValue;
use std::collections::{HashMap, HashSet};

/// A single change detected between two versions of a table definition.
#[derive(Debug, Clone, PartialEq)]
pub enum TableMigration {
    TableRenamed { from: String, to: String },
    SlugChanged { from: String, to: String },
    TableFlagsChanged,
    DefaultViewChanged,
    FieldAdded {
        field: String,
        has_default: bool,
        required: bool,
    },
    FieldRemoved { field: String },
    FieldTypeChanged { field: String },
    EnumValueAdded { field: String, value: String },
    EnumValueRemoved { field: String, value: String },
    ConstraintsChanged { field: String },
    DefaultChanged { field: String },
    LabelChanged { field: String },
    FieldFlagsChanged { field: String, reindex: bool },
    ViewAdded { view: String },
    ViewRemoved { view: String },
    ViewChanged { view: String },
}

impl TableMigration {
    /// Whether existing records stay valid without intervention.
    pub fn is_safe(&self) -> bool {
        match self {
            TableMigration::FieldAdded {
                has_default,
                required,
                ..
            } => *has_default || !*required,
            TableMigration::SlugChanged { .. }
            | TableMigration::FieldRemoved { .. }
            | TableMigration::FieldTypeChanged { .. }
            | TableMigration::EnumValueRemoved { .. }
            | TableMigration::ConstraintsChanged { .. } => false,
            _ => true,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TableMigration::TableRenamed { from, to } => format!("Table renamed '{from}' -> '{to}'"),
            TableMigration::SlugChanged { from, to } => {
                format!("Table slug changed '{from}' -> '{to}' (not supported)")
            }
            TableMigration::TableFlagsChanged => "Table flags changed".to_string(),
            TableMigration::DefaultViewChanged => "Default view changed".to_string(),
            TableMigration::FieldAdded {
                field,
                has_default,
                required,
            } => {
                let qualifier = if *required && !*has_default {
                    " (required without default, rejected)"
                } else if *has_default {
                    " (has default, will backfill)"
                } else {
                    " (optional)"
                };
                format!("Field '{field}' added{qualifier}")
            }
            TableMigration::FieldRemoved { field } => format!("Field '{field}' removed (rejected)"),
            TableMigration::FieldTypeChanged { field } => {
                format!("Field '{field}' type changed (rejected)")
            }
            TableMigration::EnumValueAdded { field, value } => {
                format!("Enum value '{value}' added to '{field}'")
            }
            TableMigration::EnumValueRemoved { field, value } => {
                format!("Enum value '{value}' removed from '{field}' (rejected)")
            }
            TableMigration::ConstraintsChanged { field } => {
                format!("Constraints of '{field}' changed (rejected)")
            }
            TableMigration::DefaultChanged { field } => format!("Default of '{field}' changed"),
            TableMigration::LabelChanged { field } => format!("Label of '{field}' changed"),
            TableMigration::FieldFlagsChanged { field, reindex } => {
                if *reindex {
                    format!("Flags of '{field}' changed (search index rebuilt)")
                } else {
                    format!("Flags of '{field}' changed")
                }
            }
            TableMigration::ViewAdded { view } => format!("View '{view}' added"),
            TableMigration::ViewRemoved { view } => format!("View '{view}' removed"),
            TableMigration::ViewChanged { view } => format!("View '{view}' changed"),
        }
    }
}

/// Compare two versions of a table definition. Fields and views are matched
/// by slug.
pub fn diff_tables(old: &TableDefinition, new: &TableDefinition) -> Vec<TableMigration> {
    let mut migrations = Vec::new();

    if old.name != new.name {
        migrations.push(TableMigration::TableRenamed {
            from: old.name.clone(),
            to: new.name.clone(),
        });
    }
    if old.slug != new.slug {
        migrations.push(TableMigration::SlugChanged {
            from: old.slug.clone(),
            to: new.slug.clone(),
        });
    }
    if old.soft_delete != new.soft_delete || old.audit_trail != new.audit_trail {
        migrations.push(TableMigration::TableFlagsChanged);
    }
    if old.default_view != new.default_view {
        migrations.push(TableMigration::DefaultViewChanged);
    }

    let old_fields: HashMap<&str, &FieldDefinition> =
        old.fields.iter().map(|f| (f.slug.as_str(), f)).collect();
    let new_slugs: HashSet<&str> = new.fields.iter().map(|f| f.slug.as_str()).collect();

    for field in old.fields_by_slug() {
        if !new_slugs.contains(field.slug.as_str()) {
            migrations.push(TableMigration::FieldRemoved {
                field: field.slug.clone(),
            });
        }
    }

    for new_field in new.fields_by_slug() {
        let Some(old_field) = old_fields.get(new_field.slug.as_str()) else {
            migrations.push(TableMigration::FieldAdded {
                field: new_field.slug.clone(),
                has_default: new_field.default.is_some(),
                required: new_field.required,
            });
            continue;
        };
        diff_field(old_field, new_field, &mut migrations);
    }

    let old_views: HashMap<&str, &ViewDefinition> =
        old.views.iter().map(|v| (v.slug.as_str(), v)).collect();
    let new_views: HashSet<&str> = new.views.iter().map(|v| v.slug.as_str()).collect();
    for view in &old.views {
        if !new_views.contains(view.slug.as_str()) {
            migrations.push(TableMigration::ViewRemoved {
                view: view.slug.clone(),
            });
        }
    }
    for view in &new.views {
        match old_views.get(view.slug.as_str()) {
            None => migrations.push(TableMigration::ViewAdded {
                view: view.slug.clone(),
            }),
            Some(old_view) if !same_view(old_view, view) => {
                migrations.push(TableMigration::ViewChanged {
                    view: view.slug.clone(),
                })
            }
            Some(_) => {}
        }
    }

    migrations
}

fn diff_field(old: &FieldDefinition, new: &FieldDefinition, migrations: &mut Vec<TableMigration>) {
    let slug = new.slug.clone();

    if old.data_type != new.data_type {
        migrations.push(TableMigration::FieldTypeChanged { field: slug });
        return;
    }

    let old_values = old.enum_values.clone().unwrap_or_default();
    let new_values = new.enum_values.clone().unwrap_or_default();
    for value in &new_values {
        if !old_values.contains(value) {
            migrations.push(TableMigration::EnumValueAdded {
                field: slug.clone(),
                value: value.clone(),
            });
        }
    }
    for value in &old_values {
        if !new_values.contains(value) {
            migrations.push(TableMigration::EnumValueRemoved {
                field: slug.clone(),
                value: value.clone(),
            });
        }
    }

    let constraints_changed = old.required != new.required
        || old.unique != new.unique
        || old.min_length != new.min_length
        || old.max_length != new.max_length
        || old.min_value != new.min_value
        || old.max_value != new.max_value
        || old.pattern != new.pattern
        || old.target != new.target;
    if constraints_changed {
        migrations.push(TableMigration::ConstraintsChanged { field: slug.clone() });
    }

    if old.default != new.default {
        migrations.push(TableMigration::DefaultChanged { field: slug.clone() });
    }
    if old.label != new.label {
        migrations.push(TableMigration::LabelChanged { field: slug.clone() });
    }

    let flags = |f: &FieldDefinition| {
        (
            f.indexed, f.sortable, f.filterable, f.hidden, f.read_only, f.computed,
        )
    };
    if old.searchable != new.searchable || flags(old) != flags(new) {
        migrations.push(TableMigration::FieldFlagsChanged {
            field: slug,
            reindex: old.searchable != new.searchable,
        });
    }
}

fn same_view(a: &ViewDefinition, b: &ViewDefinition) -> bool {
    a.name == b.name
        && a.filters == b.filters
        && a.sort == b.sort
        && a.page_size == b.page_size
        && a.visualization == b.visualization
        && a.is_default == b.is_default
}

impl Store {
    /// Replace a table definition with an additive revision. Unsafe changes
    /// are rejected as a whole; nothing is applied.
    pub async fn alter_table(
        &self,
        table: &str,
        revised: TableDefinition,
    ) -> Result<(TableDefinition, Vec<TableMigration>)> {
        let db = self.db.lock().await;
        db.atomically(|db| apply_revision(db, table, |_| revised))
    }

    /// Append one field to a table.
    pub async fn add_field(&self, table: &str, field: FieldDefinition) -> Result<TableDefinition> {
        let db = self.db.lock().await;
        let (def, _) = db.atomically(|db| {
            apply_revision(db, table, |mut current| {
                current.fields.push(field);
                current
            })
        })?;
        Ok(def)
    }

    /// Append one view to a table.
    pub async fn add_view(&self, table: &str, view: ViewDefinition) -> Result<TableDefinition> {
        let db = self.db.lock().await;
        let (def, _) = db.atomically(|db| {
            apply_revision(db, table, |mut current| {
                current.views.push(view);
                current
            })
        })?;
        Ok(def)
    }
}

fn apply_revision(
    db: &SystemDb,
    table: &str,
    revise: impl FnOnce(TableDefinition) -> TableDefinition,
) -> Result<(TableDefinition, Vec<TableMigration>)> {
    let current = db.resolve_table(table)?;
    let mut revised = revise(current.clone());

    revised.id = current.id.clone();
    if revised.slug.is_empty() {
        revised.slug = current.slug.clone();
    }
    for field in &mut revised.fields {
        if field.id.is_empty() {
            if let Some(old) = current.fields.iter().find(|f| f.slug == field.slug) {
                field.id = old.id.clone();
            }
        }
    }
    revised.prepare();

    let problems = revised.validate();
    if !problems.is_empty() {
        return Err(LoomError::Schema(problems.join("; ")));
    }
    resolve_lookup_targets(db, &mut revised)?;

    let migrations = diff_tables(&current, &revised);
    let rejected: Vec<String> = migrations
        .iter()
        .filter(|m| !m.is_safe())
        .map(TableMigration::describe)
        .collect();
    if !rejected.is_empty() {
        return Err(LoomError::Schema(format!(
            "Unsafe changes to table '{}': {}",
            current.slug,
            rejected.join("; ")
        )));
    }
    if migrations.is_empty() {
        return Ok((current, migrations));
    }

    db.update_table(&revised)?;
    backfill_defaults(db, &revised, &migrations)?;
    if migrations.iter().any(needs_reindex) {
        reindex(db, &revised)?;
    }

    for migration in &migrations {
        log::info!("Table '{}': {}", revised.slug, migration.describe());
    }
    Ok((revised, migrations))
}

fn needs_reindex(migration: &TableMigration) -> bool {
    matches!(
        migration,
        TableMigration::FieldFlagsChanged { reindex: true, .. } | TableMigration::FieldAdded { .. }
    )
}

/// Write the default of each newly added field into existing records.
fn backfill_defaults(db: &SystemDb, table: &TableDefinition, migrations: &[TableMigration]) -> Result<()> {
    let mut defaults = Vec::new();
    for migration in migrations {
        if let TableMigration::FieldAdded {
            field,
            has_default: true,
            ..
        } = migration
        {
            let Some(def) = table.field(field) else { continue };
            let Some(raw) = &def.default else { continue };
            let value = FieldValue::decode(def.data_type, raw)
                .map_err(|m| LoomError::Schema(format!("Default of '{field}' is invalid: {m}")))?;
            defaults.push((field.clone(), value.to_json()));
        }
    }
    if defaults.is_empty() {
        return Ok(());
    }

    let rows = db.select_records("WHERE table_id = ?1 ORDER BY seq", &[&table.id])?;
    for row in rows {
        let mut data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&row.data_json)?;
        for (slug, value) in &defaults {
            data.entry(slug.clone()).or_insert_with(|| value.clone());
        }
        let json = serde_json::Value::Object(data).to_string();
        db.update_record_data(&row.id, &json, &row.updated_at)?;
    }
    log::debug!("Backfilled {} default(s) into '{}'", defaults.len(), table.slug);
    Ok(())
}

fn reindex(db: &SystemDb, table: &TableDefinition) -> Result<()> {
    for row in db.list_live_records(&table.id)? {
        let id = row.id.clone();
        let record = decode_row(table, row)?;
        db.index_record(&id, &table.id, &index_body(table, &record.values))?;
    }
    Ok(())
}
