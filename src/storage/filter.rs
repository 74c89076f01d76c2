//! Filter matching, projection and sorting for the bundled document store.

use crate::core::{Document, ID_FIELD, StoreError, StoreResult, compare_values, get_path, values_equal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction of a query, written as `1` / `-1` in options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// Map the `1` / `-1` convention onto a direction.
    pub fn from_i64(order: i64) -> Self {
        if order < 0 {
            SortOrder::Descending
        } else {
            SortOrder::Ascending
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

impl From<i64> for SortOrder {
    fn from(order: i64) -> Self {
        SortOrder::from_i64(order)
    }
}

impl From<SortOrder> for i64 {
    fn from(order: SortOrder) -> Self {
        order.as_i64()
    }
}

/// Check whether `document` satisfies `filter`.
pub fn matches(document: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => {
                let clauses = as_clauses(key, condition)?;
                let mut all = true;
                for clause in clauses {
                    if !matches(document, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let clauses = as_clauses(key, condition)?;
                let mut any = false;
                for clause in clauses {
                    if matches(document, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            other if other.starts_with('$') => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown top level operator '{}'",
                    other
                )));
            }
            path => matches_field(get_path(document, path), condition)?,
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn as_clauses<'a>(operator: &str, condition: &'a Value) -> StoreResult<Vec<&'a Document>> {
    let items = condition.as_array().ok_or_else(|| {
        StoreError::InvalidQuery(format!("'{}' expects an array of filters", operator))
    })?;

    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                StoreError::InvalidQuery(format!("'{}' expects an array of filters", operator))
            })
        })
        .collect()
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_field(value: Option<&Value>, condition: &Value) -> StoreResult<bool> {
    if !is_operator_object(condition) {
        return Ok(field_equals(value, condition));
    }

    let Value::Object(operators) = condition else {
        return Ok(false);
    };

    for (operator, operand) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => field_equals(value, operand),
            "$ne" => !field_equals(value, operand),
            "$gt" => field_compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => field_compares(value, operand, |o| o != Ordering::Less),
            "$lt" => field_compares(value, operand, |o| o == Ordering::Less),
            "$lte" => field_compares(value, operand, |o| o != Ordering::Greater),
            "$in" => {
                let candidates = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("'$in' expects an array".to_string())
                })?;
                candidates.iter().any(|c| field_equals(value, c))
            }
            "$nin" => {
                let candidates = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("'$nin' expects an array".to_string())
                })?;
                !candidates.iter().any(|c| field_equals(value, c))
            }
            "$all" => {
                let wanted = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("'$all' expects an array".to_string())
                })?;
                !wanted.is_empty() && wanted.iter().all(|w| field_equals(value, w))
            }
            "$size" => {
                let size = operand.as_u64().ok_or_else(|| {
                    StoreError::InvalidQuery("'$size' expects a non-negative integer".to_string())
                })?;
                matches!(value, Some(Value::Array(items)) if items.len() as u64 == size)
            }
            "$exists" => {
                let wanted = operand.as_bool().ok_or_else(|| {
                    StoreError::InvalidQuery("'$exists' expects a boolean".to_string())
                })?;
                value.is_some() == wanted
            }
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown operator '{}'",
                    other
                )));
            }
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Equality as a document store sees it: a missing field equals `null`, and
/// a scalar matches an array field that contains it.
fn field_equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) => {
            if values_equal(actual, expected) {
                return true;
            }
            match (actual, expected) {
                (Value::Array(items), expected) if !expected.is_array() => {
                    items.iter().any(|item| values_equal(item, expected))
                }
                _ => false,
            }
        }
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn field_compares(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = value else {
        return false;
    };

    if same_kind(actual, operand) && accept(compare_values(actual, operand)) {
        return true;
    }

    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| same_kind(item, operand) && accept(compare_values(item, operand))),
        _ => false,
    }
}

/// Keep only the requested top level fields. `_id` is always kept.
pub fn project(document: Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return document;
    }

    document
        .into_iter()
        .filter(|(key, _)| {
            key == ID_FIELD
                || fields
                    .iter()
                    .any(|field| field.split('.').next() == Some(key.as_str()))
        })
        .collect()
}

/// Stable sort on one field; missing fields sort as `null`.
pub fn sort_documents(documents: &mut [Document], field: &str, order: SortOrder) {
    documents.sort_by(|a, b| {
        let left = get_path(a, field).unwrap_or(&Value::Null);
        let right = get_path(b, field).unwrap_or(&Value::Null);
        let ord = compare_values(left, right);
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}
