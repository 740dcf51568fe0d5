use super::types::{AutomationCondition, ConditionOperator};
use serde_json::Value;

/// Resolve a dot-separated path through `payload`. Record events keep field
/// values under `values`, so a path that misses at the root is retried there.
/// Array elements are addressed by numeric segments.
pub fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    walk(payload, path).or_else(|| payload.get("values").and_then(|values| walk(values, path)))
}

fn walk<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// All conditions must hold; evaluation stops at the first that fails.
pub fn all_match(conditions: &[AutomationCondition], payload: &Value) -> bool {
    conditions.iter().all(|c| evaluate(c, payload))
}

pub fn evaluate(condition: &AutomationCondition, payload: &Value) -> bool {
    let left = resolve_path(payload, &condition.path).filter(|v| !v.is_null());
    let right = condition.value.as_ref();

    match condition.operator {
        ConditionOperator::Exists => left.is_some(),
        ConditionOperator::NotExists => left.is_none(),
        ConditionOperator::Equals => equals(left, right),
        ConditionOperator::NotEquals => !equals(left, right),
        ConditionOperator::Contains => match (left, right) {
            (Some(Value::Array(items)), Some(r)) => {
                let needle = text(r);
                items.iter().any(|item| text(item) == needle)
            }
            (Some(l), Some(r)) => text(l).contains(&text(r)),
            _ => false,
        },
        ConditionOperator::StartsWith => match (left, right) {
            (Some(l), Some(r)) => text(l).starts_with(&text(r)),
            _ => false,
        },
        ConditionOperator::EndsWith => match (left, right) {
            (Some(l), Some(r)) => text(l).ends_with(&text(r)),
            _ => false,
        },
        ConditionOperator::GreaterThan => compare(left, right).is_some_and(|(l, r)| l > r),
        ConditionOperator::LessThan => compare(left, right).is_some_and(|(l, r)| l < r),
    }
}

fn equals(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right.filter(|v| !v.is_null())) {
        (None, None) => true,
        (Some(l), Some(r)) => text(l) == text(r),
        _ => false,
    }
}

fn compare(left: Option<&Value>, right: Option<&Value>) -> Option<(f64, f64)> {
    Some((number(left?)?, number(right?)?))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Textual form used for ordinal comparisons.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
