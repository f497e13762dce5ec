//! Document and query types shared by every component.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a document (everything except its id).
pub type Fields = Map<String, Value>;

/// A copy of a remote document: its id plus an arbitrary field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a single field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// JSON object with `id` merged into the fields.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(map)
    }
}

/// Encode a document list as a JSON array (used for state snapshots and
/// event payloads).
pub fn documents_to_value(documents: &[Document]) -> Value {
    Value::Array(documents.iter().map(Document::to_value).collect())
}

/// Comparison operator of a where clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "array-contains")]
    ArrayContains,
}

/// A single `field op value` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Structural description of a collection query.
///
/// The empty filter set means "the whole collection".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_clauses: Vec<WhereClause>,
    #[serde(rename = "orderBy", default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a where clause.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.where_clauses.push(WhereClause {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Shorthand for an equality clause.
    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the filters select the whole collection.
    pub fn is_empty(&self) -> bool {
        self.where_clauses.is_empty() && self.order_by.is_none() && self.limit.is_none()
    }

    /// Deterministic cache key for this query on `collection`.
    ///
    /// Clause order is significant: the same clauses in a different order
    /// produce a different key.
    pub fn cache_key(&self, collection: &str) -> String {
        // Plain data with string keys always serializes.
        let encoded = serde_json::to_string(self).unwrap_or_default();
        format!("{}:{}", collection, encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn test_document_serializes_flat() {
        let doc = Document::new("H01", fields(json!({"reason": "setup", "active": true})));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({"id": "H01", "reason": "setup", "active": true}));
        assert_eq!(doc.to_value(), value);

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_empty_filters_key() {
        let filters = QueryFilters::new();
        assert!(filters.is_empty());
        assert_eq!(filters.cache_key("planning"), "planning:{}");
    }

    #[test]
    fn test_cache_key_is_structural() {
        let a = QueryFilters::new()
            .where_eq("date", json!("2026-02-20"))
            .order_by("machine", Direction::Asc)
            .limit(50);
        let b = QueryFilters::new()
            .where_eq("date", json!("2026-02-20"))
            .order_by("machine", Direction::Asc)
            .limit(50);
        let c = QueryFilters::new().where_eq("date", json!("2026-02-21"));

        assert!(!a.is_empty());
        assert_eq!(a.cache_key("planning"), b.cache_key("planning"));
        assert_ne!(a.cache_key("planning"), c.cache_key("planning"));
        assert_ne!(a.cache_key("planning"), a.cache_key("production_entries"));
        assert!(a.cache_key("planning").contains(r#""where":[{"field":"date","op":"==""#));
    }
}
