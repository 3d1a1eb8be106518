//! Point-in-time document queries

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::models::Document;

type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Sort order applied on top of insertion order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Filter and ordering for `query`/`subscribe`.
///
/// Without a sort key results come back in insertion order. Tombstones are
/// excluded unless `include_deleted` is set.
#[derive(Clone, Default)]
pub struct Query {
    collection: Option<String>,
    predicate: Option<Predicate>,
    sort: Option<SortKey>,
    include_deleted: bool,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("collection", &self.collection)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("sort", &self.sort)
            .field("include_deleted", &self.include_deleted)
            .finish()
    }
}

impl Query {
    /// Every live document in every collection
    pub fn all() -> Self {
        Self::default()
    }

    /// Every live document in one collection
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Only documents whose field equals `value`
    #[must_use]
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        self.filter(move |doc| doc.field_value(&field) == value)
    }

    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortKey {
            field: field.into(),
            descending: false,
        });
        self
    }

    #[must_use]
    pub fn sort_by_desc(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortKey {
            field: field.into(),
            descending: true,
        });
        self
    }

    #[must_use]
    pub const fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub const fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    /// Whether a document belongs in the result set
    pub fn matches(&self, doc: &Document) -> bool {
        if !self.include_deleted && doc.deleted {
            return false;
        }
        if self
            .collection
            .as_deref()
            .is_some_and(|collection| collection != doc.collection)
        {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(doc),
            None => true,
        }
    }

    /// Filter and order documents already in insertion order
    pub fn apply(&self, documents: Vec<Document>) -> Vec<Document> {
        let mut results: Vec<Document> = documents
            .into_iter()
            .filter(|doc| self.matches(doc))
            .collect();
        if let Some(sort) = &self.sort {
            // Stable sort keeps insertion order among equal keys
            results.sort_by(|a, b| {
                let ordering = compare_values(&a.field_value(&sort.field), &b.field_value(&sort.field));
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        results
    }
}

/// Total order over JSON values: null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => {
                    let a = a.as_f64().unwrap_or(f64::NAN);
                    let b = b.as_f64().unwrap_or(f64::NAN);
                    a.total_cmp(&b)
                }
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;
    use serde_json::json;

    fn patient(id: &str, name: &str, age: i64) -> Document {
        Document::with_id(id, "patients", Fields::new())
            .set("name", name)
            .set("age", age)
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|doc| doc.id.as_str()).collect()
    }

    #[test]
    fn test_default_order_is_insertion_order() {
        let docs = vec![patient("b", "Bo", 30), patient("a", "Al", 20)];
        let results = Query::collection("patients").apply(docs);
        assert_eq!(ids(&results), vec!["b", "a"]);
    }

    #[test]
    fn test_sort_and_filter() {
        let docs = vec![
            patient("1", "Cy", 40),
            patient("2", "Al", 20),
            patient("3", "Bo", 30),
        ];

        let by_name = Query::collection("patients").sort_by("name").apply(docs.clone());
        assert_eq!(ids(&by_name), vec!["2", "3", "1"]);

        let oldest_first = Query::collection("patients")
            .filter(|doc| doc.get("age").and_then(Value::as_i64).unwrap_or(0) >= 30)
            .sort_by_desc("age")
            .apply(docs);
        assert_eq!(ids(&oldest_first), vec!["1", "3"]);
    }

    #[test]
    fn test_tombstones_and_collections_excluded() {
        let docs = vec![
            patient("1", "Al", 20).tombstone(),
            patient("2", "Bo", 30),
            Document::with_id("d1", "doctors", Fields::new()),
        ];
        assert_eq!(ids(&Query::collection("patients").apply(docs.clone())), vec!["2"]);
        assert_eq!(
            ids(&Query::collection("patients").include_deleted(true).apply(docs.clone())),
            vec!["1", "2"]
        );
        assert_eq!(Query::all().apply(docs).len(), 2);
    }

    #[test]
    fn test_where_eq_matches_metadata_and_payload() {
        let docs = vec![patient("1", "Al", 20), patient("2", "Bo", 30)];
        let found = Query::collection("patients").where_eq("name", "Bo").apply(docs.clone());
        assert_eq!(ids(&found), vec!["2"]);
        let found = Query::all().where_eq("id", "1").apply(docs);
        assert_eq!(ids(&found), vec!["1"]);
    }

    #[test]
    fn test_compare_values_orders_mixed_types() {
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Less);
    }
}
