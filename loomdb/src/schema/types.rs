use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Definition of a runtime-declared table (a user "module").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub slug: String,
    pub name: String,
    /// Deleted records are hidden rather than removed.
    #[serde(default)]
    pub soft_delete: bool,
    /// Keep payload snapshots in the mutation log.
    #[serde(default)]
    pub audit_trail: bool,
    #[serde(default)]
    pub default_view: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub views: Vec<ViewDefinition>,
}

/// Definition of a single typed field owned by a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub table_id: String,
    #[serde(default)]
    pub slug: String,
    pub label: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Target table (id or slug) of a Lookup field.
    #[serde(default)]
    pub target: Option<String>,
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Number,
    Decimal,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Enum,
    Lookup,
    File,
    Note,
    Json,
    Tags,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Number => "number",
            DataType::Decimal => "decimal",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Enum => "enum",
            DataType::Lookup => "lookup",
            DataType::File => "file",
            DataType::Note => "note",
            DataType::Json => "json",
            DataType::Tags => "tags",
        }
    }

    /// Types that accept length and pattern constraints.
    pub fn is_textual(&self) -> bool {
        matches!(self, DataType::Text | DataType::Note)
    }

    /// Types that accept min/max value constraints.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Number | DataType::Decimal)
    }
}

/// A saved query preset over a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub table_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: String,
    /// Field slug -> value the field must equal.
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    /// Sort expression: `field`, `field desc` or `-field`.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub visualization: Visualization,
    #[serde(rename = "default", default)]
    pub is_default: bool,
}

/// Presentation hint for a view; the store does not interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visualization {
    #[default]
    Table,
    List,
    Board,
    Calendar,
    Gallery,
}

impl TableDefinition {
    /// Assign missing ids, derive missing slugs and stamp owner ids on
    /// fields and views.
    pub fn prepare(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.slug.is_empty() {
            self.slug = slugify(&self.name);
        }
        for field in &mut self.fields {
            if field.id.is_empty() {
                field.id = uuid::Uuid::new_v4().to_string();
            }
            if field.slug.is_empty() {
                field.slug = slugify(&field.label);
            }
            field.table_id = self.id.clone();
        }
        for view in &mut self.views {
            if view.id.is_empty() {
                view.id = uuid::Uuid::new_v4().to_string();
            }
            if view.slug.is_empty() {
                view.slug = slugify(&view.name);
            }
            if view.name.is_empty() {
                view.name = view.slug.clone();
            }
            view.table_id = self.id.clone();
        }
        if self.default_view.is_none() {
            self.default_view = self
                .views
                .iter()
                .find(|v| v.is_default)
                .map(|v| v.slug.clone());
        }
    }

    /// Check the definition's own invariants. Lookup targets are resolved
    /// by the store, which knows the other tables.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !is_valid_slug(&self.slug) {
            problems.push(format!("Table slug '{}' is not a valid slug", self.slug));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.slug.as_str()) {
                problems.push(format!("Duplicate field slug '{}'", field.slug));
            }
            problems.extend(field.validate());
        }

        let mut view_slugs = HashSet::new();
        for view in &self.views {
            if !is_valid_slug(&view.slug) {
                problems.push(format!("View slug '{}' is not a valid slug", view.slug));
            }
            if !view_slugs.insert(view.slug.as_str()) {
                problems.push(format!("Duplicate view slug '{}'", view.slug));
            }
            for key in view.filters.keys() {
                if self.field(key).is_none() {
                    problems.push(format!(
                        "View '{}' filters on unknown field '{key}'",
                        view.slug
                    ));
                }
            }
        }

        let defaults = self.views.iter().filter(|v| v.is_default).count();
        if defaults > 1 {
            problems.push(format!(
                "Table '{}' declares {defaults} default views; at most one is allowed",
                self.slug
            ));
        }
        if let Some(name) = &self.default_view {
            match self.view(name) {
                None => problems.push(format!("Default view '{name}' is not declared")),
                Some(view) if defaults == 1 && !view.is_default => problems.push(format!(
                    "Default view '{name}' disagrees with the view flagged as default"
                )),
                Some(_) => {}
            }
        }

        problems
    }

    pub fn field(&self, slug: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.slug == slug)
    }

    pub fn view(&self, slug: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.slug == slug)
    }

    /// Fields in deterministic slug order.
    pub fn fields_by_slug(&self) -> Vec<&FieldDefinition> {
        let mut fields: Vec<&FieldDefinition> = self.fields.iter().collect();
        fields.sort_by(|a, b| a.slug.cmp(&b.slug));
        fields
    }

    pub fn searchable_fields(&self) -> Vec<&FieldDefinition> {
        self.fields_by_slug()
            .into_iter()
            .filter(|f| f.searchable)
            .collect()
    }

    /// Field whose value labels a record in graph views: the first declared
    /// Text field, falling back to the first Note or Enum field.
    pub fn label_field(&self) -> Option<&FieldDefinition> {
        [DataType::Text, DataType::Note, DataType::Enum]
            .iter()
            .find_map(|ty| self.fields.iter().find(|f| f.data_type == *ty))
    }

    /// First field holding tags, used by the Tag automation action.
    pub fn tags_field(&self) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.data_type == DataType::Tags)
    }
}

impl FieldDefinition {
    /// Minimal field with all flags off.
    pub fn new(slug: &str, data_type: DataType) -> Self {
        FieldDefinition {
            id: String::new(),
            table_id: String::new(),
            slug: slug.to_string(),
            label: slug.to_string(),
            data_type,
            required: false,
            unique: false,
            indexed: false,
            searchable: false,
            sortable: false,
            filterable: false,
            hidden: false,
            read_only: false,
            computed: false,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            pattern: None,
            enum_values: None,
            default: None,
            target: None,
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let slug = &self.slug;

        if !is_valid_slug(slug) {
            problems.push(format!("Field slug '{slug}' is not a valid slug"));
        }

        let has_text_constraints =
            self.min_length.is_some() || self.max_length.is_some() || self.pattern.is_some();
        if has_text_constraints && !self.data_type.is_textual() {
            problems.push(format!(
                "Field '{slug}': length/pattern constraints require a textual type, got {}",
                self.data_type.as_str()
            ));
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                problems.push(format!("Field '{slug}': min_length {min} exceeds max_length {max}"));
            }
        }
        if let Some(pattern) = &self.pattern {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!("Field '{slug}': invalid pattern: {e}"));
            }
        }

        let has_numeric_constraints = self.min_value.is_some() || self.max_value.is_some();
        if has_numeric_constraints && !self.data_type.is_numeric() {
            problems.push(format!(
                "Field '{slug}': min/max value constraints require a numeric type, got {}",
                self.data_type.as_str()
            ));
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                problems.push(format!("Field '{slug}': min_value {min} exceeds max_value {max}"));
            }
        }

        match (&self.data_type, &self.enum_values) {
            (DataType::Enum, None) => {
                problems.push(format!("Field '{slug}': enum fields must declare values"))
            }
            (DataType::Enum, Some(values)) if values.is_empty() => {
                problems.push(format!("Field '{slug}': enum value set is empty"))
            }
            (DataType::Enum, _) => {}
            (other, Some(_)) => problems.push(format!(
                "Field '{slug}': enum values are only allowed on enum fields, got {}",
                other.as_str()
            )),
            (_, None) => {}
        }

        match (&self.data_type, &self.target) {
            (DataType::Lookup, None) => {
                problems.push(format!("Field '{slug}': lookup fields must declare a target"))
            }
            (DataType::Lookup, Some(_)) => {}
            (other, Some(_)) => problems.push(format!(
                "Field '{slug}': target is only allowed on lookup fields, got {}",
                other.as_str()
            )),
            (_, None) => {}
        }

        problems
    }
}

/// Slugify a display name for use as a machine-facing identifier.
pub fn slugify(input: &str) -> String {
    slug::slugify(input).replace('-', "_")
}

fn is_valid_slug(slug: &str) -> bool {
    let mut chars = slug.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
