use crate::error::{LoomError, Result, ValidationErrors};
use crate::schema::{DataType, FieldDefinition, TableDefinition};
use crate::value::{FieldValue, Payload};
use regex::Regex;

/// Result of preparing a payload against a table definition
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub payload: Payload,
    pub errors: ValidationErrors,
}

impl PreparedPayload {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Merge `input` onto `existing` (for updates), apply defaults, decode every
/// value by its DataType and check constraints. Every violation is collected;
/// nothing short-circuits. Uniqueness and lookup existence need storage and
/// are checked by the store on top of this.
pub fn prepare_payload(
    table: &TableDefinition,
    input: &serde_json::Value,
    existing: Option<&Payload>,
) -> PreparedPayload {
    let mut errors = ValidationErrors::default();
    let mut payload = Payload::new();

    let empty = serde_json::Map::new();
    let object = match input {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => &empty,
        _ => {
            errors.push("_payload", "record values must be a JSON object");
            &empty
        }
    };

    for key in object.keys() {
        if table.field(key).is_none() {
            errors.push(key.clone(), format!("unknown field for table '{}'", table.slug));
        }
    }

    for field in table.fields_by_slug() {
        let previous = existing.and_then(|p| p.get(&field.slug));

        let value = match object.get(&field.slug) {
            Some(raw) => match FieldValue::decode(field.data_type, raw) {
                Ok(value) => {
                    if field.read_only {
                        if let Some(previous) = previous {
                            if *previous != value {
                                errors.push(field.slug.clone(), "field is read-only");
                            }
                        }
                    }
                    value
                }
                Err(message) => {
                    errors.push(field.slug.clone(), message);
                    continue;
                }
            },
            None => match previous {
                Some(previous) => previous.clone(),
                None => match &field.default {
                    Some(default) => match FieldValue::decode(field.data_type, default) {
                        Ok(value) => value,
                        Err(message) => {
                            errors.push(field.slug.clone(), format!("invalid default: {message}"));
                            continue;
                        }
                    },
                    None => FieldValue::Null,
                },
            },
        };

        if is_missing(&value) {
            if field.required && !field.computed {
                errors.push(field.slug.clone(), "is required");
            }
            payload.insert(field.slug.clone(), value);
            continue;
        }

        check_constraints(field, &value, &mut errors);
        payload.insert(field.slug.clone(), value);
    }

    PreparedPayload { payload, errors }
}

fn is_missing(value: &FieldValue) -> bool {
    match value {
        FieldValue::Null => true,
        FieldValue::Text(s) => s.is_empty(),
        _ => false,
    }
}

fn check_constraints(field: &FieldDefinition, value: &FieldValue, errors: &mut ValidationErrors) {
    let slug = &field.slug;

    if field.data_type.is_textual() {
        if let Some(text) = value.as_str() {
            let len = text.chars().count();
            if let Some(min) = field.min_length {
                if len < min {
                    errors.push(slug.clone(), format!("must be at least {min} characters"));
                }
            }
            if let Some(max) = field.max_length {
                if len > max {
                    errors.push(slug.clone(), format!("must be at most {max} characters"));
                }
            }
            if let Some(pattern) = &field.pattern {
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(text) => {
                        errors.push(slug.clone(), format!("does not match pattern '{pattern}'"))
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(slug.clone(), format!("invalid pattern: {e}")),
                }
            }
        }
    }

    if field.data_type.is_numeric() {
        if let Some(n) = value.as_f64() {
            if let Some(min) = field.min_value {
                if n < min {
                    errors.push(slug.clone(), format!("must be >= {min}"));
                }
            }
            if let Some(max) = field.max_value {
                if n > max {
                    errors.push(slug.clone(), format!("must be <= {max}"));
                }
            }
        }
    }

    if field.data_type == DataType::Enum {
        if let (Some(allowed), Some(text)) = (&field.enum_values, value.as_str()) {
            if !allowed.iter().any(|a| a == text) {
                errors.push(
                    slug.clone(),
                    format!("'{text}' is not one of [{}]", allowed.join(", ")),
                );
            }
        }
    }
}

/// Sort the collected violations by field and turn them into an error when
/// any exist.
pub fn finish(mut errors: ValidationErrors) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    errors.violations.sort_by(|a, b| a.field.cmp(&b.field));
    Err(LoomError::Validation(errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_tables_str;
    use serde_json::json;

    fn tasks() -> TableDefinition {
        let mut table = parse_tables_str(
            r#"
name: Tasks
fields:
  - { label: Title, type: text, required: true, min_length: 3, max_length: 20 }
  - { label: Status, type: enum, enum: [normal, urgent], default: normal }
  - { label: Points, type: number, min_value: 0, max_value: 10 }
  - { label: Code, type: text, pattern: "^[A-Z]{3}-[0-9]+$" }
  - { label: Created By, type: text, read_only: true }
  - { label: Score, type: decimal, computed: true, required: true }
"#,
        )
        .unwrap()
        .remove(0);
        table.prepare();
        table
    }

    #[test]
    fn test_valid_payload_gets_defaults() {
        let table = tasks();
        let prepared = prepare_payload(&table, &json!({"title": "Write docs"}), None);
        assert!(prepared.is_ok(), "Errors: {:?}", prepared.errors);
        assert_eq!(
            prepared.payload["status"],
            FieldValue::Text("normal".into())
        );
        assert_eq!(prepared.payload["points"], FieldValue::Null);
    }

    #[test]
    fn test_all_violations_are_collected() {
        let table = tasks();
        let prepared = prepare_payload(
            &table,
            &json!({
                "status": "someday",
                "points": 99,
                "code": "abc",
                "extra": 1
            }),
            None,
        );
        let errors = prepared.errors;
        assert_eq!(errors.len(), 5, "{errors}");
        assert!(errors.has_field("title"));
        assert!(errors.has_field("status"));
        assert!(errors.has_field("points"));
        assert!(errors.has_field("code"));
        assert!(errors.has_field("extra"));
        assert!(!errors.has_field("score"));
    }

    #[test]
    fn test_length_and_type_errors() {
        let table = tasks();
        let prepared = prepare_payload(&table, &json!({"title": "ab", "points": "7"}), None);
        assert!(prepared.errors.violations.iter().any(|v| v.field == "title" && v.message.contains("at least 3")));
        assert!(prepared.errors.violations.iter().any(|v| v.field == "points" && v.message.contains("expected a number")));
    }

    #[test]
    fn test_update_merges_and_guards_read_only() {
        let table = tasks();
        let created = prepare_payload(&table, &json!({"title": "Write docs", "created_by": "ana"}), None);
        assert!(created.is_ok());

        let updated = prepare_payload(&table, &json!({"status": "urgent"}), Some(&created.payload));
        assert!(updated.is_ok());
        assert_eq!(updated.payload["title"], FieldValue::Text("Write docs".into()));
        assert_eq!(updated.payload["status"], FieldValue::Text("urgent".into()));

        let tampered = prepare_payload(&table, &json!({"created_by": "bo"}), Some(&created.payload));
        assert!(tampered.errors.has_field("created_by"));
    }

    #[test]
    fn test_finish_sorts_by_field() {
        let mut errors = ValidationErrors::default();
        errors.push("zeta", "bad");
        errors.push("alpha", "bad");
        let err = finish(errors).unwrap_err();
        let fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["alpha", "zeta"]);
    }
}
