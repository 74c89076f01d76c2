//! Aggregation pipeline evaluation for the bundled document store.

use super::filter::{SortOrder, matches, sort_documents};
use crate::core::{Document, ID_FIELD, StoreError, StoreResult, get_path, values_equal};
use serde_json::{Number, Value};

/// Run every stage of `pipeline` over `documents`, in order.
pub fn run(mut documents: Vec<Document>, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(StoreError::InvalidQuery(
                "each pipeline stage must have exactly one operator".to_string(),
            ));
        };

        documents = match name.as_str() {
            "$match" => {
                let filter = as_document(name, spec)?;
                let mut kept = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            "$sort" => {
                let keys = as_document(name, spec)?;
                // Apply keys from least to most significant; the sort is stable
                for (field, order) in keys.iter().rev() {
                    let order = order.as_i64().ok_or_else(|| {
                        StoreError::InvalidQuery("'$sort' expects 1 or -1".to_string())
                    })?;
                    sort_documents(&mut documents, field, SortOrder::from_i64(order));
                }
                documents
            }
            "$skip" => {
                let n = as_count(name, spec)?;
                documents.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = as_count(name, spec)?;
                documents.truncate(n);
                documents
            }
            "$project" => project_stage(documents, as_document(name, spec)?),
            "$count" => {
                let field = spec.as_str().filter(|f| !f.is_empty()).ok_or_else(|| {
                    StoreError::InvalidQuery("'$count' expects a field name".to_string())
                })?;
                let mut counted = Document::new();
                counted.insert(field.to_string(), Value::from(documents.len() as u64));
                vec![counted]
            }
            "$group" => group_stage(documents, as_document(name, spec)?)?,
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unsupported pipeline stage '{}'",
                    other
                )));
            }
        };
    }

    Ok(documents)
}

fn as_document<'a>(stage: &str, spec: &'a Value) -> StoreResult<&'a Document> {
    spec.as_object()
        .ok_or_else(|| StoreError::InvalidQuery(format!("'{}' expects an object", stage)))
}

fn as_count(stage: &str, spec: &Value) -> StoreResult<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::InvalidQuery(format!("'{}' expects a positive integer", stage)))
}

/// Resolve `"$field"` references against a document; anything else is a literal.
fn evaluate(document: &Document, expression: &Value) -> Value {
    match expression {
        Value::String(s) if s.starts_with('$') => {
            get_path(document, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

fn project_stage(documents: Vec<Document>, spec: &Document) -> Vec<Document> {
    let include_id = spec.get(ID_FIELD).is_none_or(is_truthy);

    documents
        .into_iter()
        .map(|document| {
            let mut projected = Document::new();
            if include_id {
                if let Some(id) = document.get(ID_FIELD) {
                    projected.insert(ID_FIELD.to_string(), id.clone());
                }
            }
            for (field, rule) in spec {
                if field == ID_FIELD {
                    continue;
                }
                match rule {
                    Value::String(s) if s.starts_with('$') => {
                        projected.insert(field.clone(), evaluate(&document, rule));
                    }
                    rule if is_truthy(rule) => {
                        if let Some(value) = get_path(&document, field) {
                            projected.insert(field.clone(), value.clone());
                        }
                    }
                    _ => {}
                }
            }
            projected
        })
        .collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn group_stage(documents: Vec<Document>, spec: &Document) -> StoreResult<Vec<Document>> {
    let key_expression = spec.get(ID_FIELD).ok_or_else(|| {
        StoreError::InvalidQuery("'$group' requires an '_id' expression".to_string())
    })?;

    let accumulators: Vec<(&String, &String, &Value)> = spec
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .map(|(field, accumulator)| {
            let mut entries = accumulator.as_object().map(|a| a.iter()).into_iter().flatten();
            match (entries.next(), entries.next()) {
                (Some((op, expr)), None) => Ok((field, op, expr)),
                _ => Err(StoreError::InvalidQuery(format!(
                    "'$group' field '{}' needs one accumulator",
                    field
                ))),
            }
        })
        .collect::<StoreResult<_>>()?;

    // Groups keep the order in which their key was first seen
    let mut groups: Vec<(Value, Document)> = Vec::new();

    for document in &documents {
        let key = evaluate(document, key_expression);
        let position = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(position) => position,
            None => {
                let mut group = Document::new();
                group.insert(ID_FIELD.to_string(), key.clone());
                groups.push((key, group));
                groups.len() - 1
            }
        };
        let group = &mut groups[position].1;

        for (field, op, expr) in &accumulators {
            let value = evaluate(document, expr);
            match op.as_str() {
                "$sum" => {
                    let current = group.get(*field).and_then(Value::as_f64).unwrap_or(0.0);
                    let added = value.as_f64().unwrap_or(0.0);
                    group.insert((*field).clone(), number(current + added));
                }
                "$first" => {
                    group.entry((*field).clone()).or_insert(value);
                }
                "$push" => {
                    let entry = group
                        .entry((*field).clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = entry {
                        items.push(value);
                    }
                }
                other => {
                    return Err(StoreError::InvalidQuery(format!(
                        "unsupported accumulator '{}'",
                        other
                    )));
                }
            }
        }
    }

    Ok(groups.into_iter().map(|(_, group)| group).collect())
}

/// Whole sums stay integers so `{"$sum": 1}` counts read back as `u64`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(value: Value) -> Vec<Document> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn findings() -> Vec<Document> {
        docs(json!([
            {"_id": "1", "severity": "high", "tool": "semgrep", "priority": 40},
            {"_id": "2", "severity": "low", "tool": "bandit", "priority": 10},
            {"_id": "3", "severity": "high", "tool": "bandit", "priority": 90},
        ]))
    }

    #[test]
    fn test_match_sort_limit() {
        let pipeline = docs(json!([
            {"$match": {"severity": "high"}},
            {"$sort": {"priority": -1}},
            {"$limit": 1},
        ]));
        let result = run(findings(), &pipeline).unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["_id"], json!("3"));
    }

    #[test]
    fn test_group_by_severity() {
        let pipeline = docs(json!([
            {"$group": {"_id": "$severity", "count": {"$sum": 1}, "tools": {"$push": "$tool"}}},
        ]));
        let result = run(findings(), &pipeline).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["_id"], json!("high"));
        assert_eq!(result[0]["count"], json!(2));
        assert_eq!(result[0]["tools"], json!(["semgrep", "bandit"]));
        assert_eq!(result[1]["count"], json!(1));
    }

    #[test]
    fn test_count_and_project() {
        let pipeline = docs(json!([{"$match": {"tool": "bandit"}}, {"$count": "total"}]));
        assert_eq!(run(findings(), &pipeline).unwrap()[0]["total"], json!(2));

        let pipeline = docs(json!([{"$project": {"_id": 0, "tool": 1}}]));
        let projected = run(findings(), &pipeline).unwrap();
        assert_eq!(projected[0], docs(json!([{"tool": "semgrep"}]))[0]);
    }

    #[test]
    fn test_invalid_stage() {
        let pipeline = docs(json!([{"$lookup": {}}]));
        assert!(run(findings(), &pipeline).is_err());

        let pipeline = docs(json!([{"$skip": 1, "$limit": 1}]));
        assert!(run(findings(), &pipeline).is_err());
    }
}
