//! Collection schemas enforced by the local store on every write.
//!
//! A schema is a list of field rules; fields not named by any rule are
//! accepted as-is. Tombstones only have their present fields type-checked.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Document, METADATA_FIELDS, QUEUE_COLLECTION};

/// Rejection of a local write
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
    #[error("{collection}.{field} is required")]
    MissingField { collection: String, field: String },
    #[error("{collection}.{field} must be of type {expected}")]
    InvalidType {
        collection: String,
        field: String,
        expected: &'static str,
    },
    #[error("{collection}.{field} is not a valid {format}")]
    InvalidFormat {
        collection: String,
        field: String,
        format: String,
    },
    #[error("{collection}.{field} is reserved for document metadata")]
    ReservedField { collection: String, field: String },
    #[error("{collection}.{field} exceeds {max} characters")]
    TooLong {
        collection: String,
        field: String,
        max: usize,
    },
}

/// JSON type a field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Format constraint on string fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFormat {
    /// Calendar date, `YYYY-MM-DD`
    Date,
    Email,
    Phone,
    /// One of a fixed set of values
    OneOf(&'static [&'static str]),
}

impl FieldFormat {
    fn describe(&self) -> String {
        match self {
            Self::Date => "date (YYYY-MM-DD)".to_string(),
            Self::Email => "email address".to_string(),
            Self::Phone => "phone number".to_string(),
            Self::OneOf(values) => format!("value (one of {})", values.join(", ")),
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            Self::Date => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
            Self::Email => email_regex().is_match(value),
            Self::Phone => phone_regex().is_match(value),
            Self::OneOf(values) => values.contains(&value),
        }
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email regex")
    })
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9][0-9 ()-]{5,19}$").expect("Invalid phone regex"))
}

/// Constraint on one payload field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub format: Option<FieldFormat>,
    pub max_len: Option<usize>,
}

impl FieldRule {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            format: None,
            max_len: None,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            format: None,
            max_len: None,
        }
    }

    #[must_use]
    pub fn format(mut self, format: FieldFormat) -> Self {
        self.format = Some(format);
        self
    }

    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

/// Field rules of one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub collection: String,
    pub rules: Vec<FieldRule>,
}

impl CollectionSchema {
    pub fn new(collection: impl Into<String>, rules: Vec<FieldRule>) -> Self {
        Self {
            collection: collection.into(),
            rules,
        }
    }

    /// Validate a document's payload against this schema
    pub fn validate(&self, doc: &Document) -> Result<(), SchemaError> {
        if let Some(field) = METADATA_FIELDS.iter().find(|name| doc.fields.contains_key(**name)) {
            return Err(SchemaError::ReservedField {
                collection: self.collection.clone(),
                field: (*field).to_string(),
            });
        }

        for rule in &self.rules {
            let value = doc.fields.get(rule.name).filter(|value| !value.is_null());
            let Some(value) = value else {
                if rule.required && !doc.deleted {
                    return Err(SchemaError::MissingField {
                        collection: self.collection.clone(),
                        field: rule.name.to_string(),
                    });
                }
                continue;
            };

            if !rule.kind.matches(value) {
                return Err(SchemaError::InvalidType {
                    collection: self.collection.clone(),
                    field: rule.name.to_string(),
                    expected: rule.kind.name(),
                });
            }

            let Some(text) = value.as_str() else {
                continue;
            };
            if rule.required && text.trim().is_empty() && !doc.deleted {
                return Err(SchemaError::MissingField {
                    collection: self.collection.clone(),
                    field: rule.name.to_string(),
                });
            }
            if let Some(max) = rule.max_len {
                if text.chars().count() > max {
                    return Err(SchemaError::TooLong {
                        collection: self.collection.clone(),
                        field: rule.name.to_string(),
                        max,
                    });
                }
            }
            if let Some(format) = &rule.format {
                if !format.accepts(text) {
                    return Err(SchemaError::InvalidFormat {
                        collection: self.collection.clone(),
                        field: rule.name.to_string(),
                        format: format.describe(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Registry of the collections the local store accepts
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, CollectionSchema>,
}

const TRIAGE_LEVELS: &[&str] = &["low", "medium", "high", "critical"];
const QUEUE_STATUSES: &[&str] = &["waiting", "in_progress", "done", "canceled"];
const GENDERS: &[&str] = &["male", "female", "other", "unknown"];

impl SchemaRegistry {
    /// Empty registry; every collection is unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a collection schema
    #[must_use]
    pub fn with(mut self, schema: CollectionSchema) -> Self {
        self.schemas.insert(schema.collection.clone(), schema);
        self
    }

    /// Built-in clinic collections: patients, doctors, queue, consultations
    pub fn clinic() -> Self {
        Self::new()
            .with(CollectionSchema::new(
                "patients",
                vec![
                    FieldRule::required("name", FieldKind::String).max_len(200),
                    FieldRule::optional("dateOfBirth", FieldKind::String).format(FieldFormat::Date),
                    FieldRule::optional("gender", FieldKind::String).format(FieldFormat::OneOf(GENDERS)),
                    FieldRule::optional("phone", FieldKind::String).format(FieldFormat::Phone),
                    FieldRule::optional("email", FieldKind::String).format(FieldFormat::Email),
                    FieldRule::optional("address", FieldKind::Object),
                ],
            ))
            .with(CollectionSchema::new(
                "doctors",
                vec![
                    FieldRule::required("name", FieldKind::String).max_len(200),
                    FieldRule::optional("specialization", FieldKind::String).max_len(120),
                    FieldRule::optional("phone", FieldKind::String).format(FieldFormat::Phone),
                    FieldRule::optional("email", FieldKind::String).format(FieldFormat::Email),
                ],
            ))
            .with(CollectionSchema::new(
                QUEUE_COLLECTION,
                vec![
                    FieldRule::required("patientId", FieldKind::String),
                    FieldRule::required("tokenNumber", FieldKind::Integer),
                    FieldRule::required("triageLevel", FieldKind::String)
                        .format(FieldFormat::OneOf(TRIAGE_LEVELS)),
                    FieldRule::required("status", FieldKind::String).format(FieldFormat::OneOf(QUEUE_STATUSES)),
                    FieldRule::required("queueDate", FieldKind::String).format(FieldFormat::Date),
                ],
            ))
            .with(CollectionSchema::new(
                "consultations",
                vec![
                    FieldRule::required("patientId", FieldKind::String),
                    FieldRule::optional("doctorId", FieldKind::String),
                    FieldRule::required("visitDate", FieldKind::String).format(FieldFormat::Date),
                    FieldRule::optional("diagnosis", FieldKind::String).max_len(2_000),
                    FieldRule::optional("notes", FieldKind::String).max_len(20_000),
                ],
            ))
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.schemas.contains_key(collection)
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names = self.schemas.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Validate a document against its collection's schema
    pub fn validate(&self, doc: &Document) -> Result<(), SchemaError> {
        self.schemas
            .get(&doc.collection)
            .ok_or_else(|| SchemaError::UnknownCollection(doc.collection.clone()))?
            .validate(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;
    use serde_json::json;

    fn patient(value: Value) -> Document {
        let Value::Object(fields) = value else {
            panic!("expected object");
        };
        Document::new("patients", fields)
    }

    #[test]
    fn test_valid_patient() {
        let registry = SchemaRegistry::clinic();
        let doc = patient(json!({
            "name": "Ada Lovelace",
            "dateOfBirth": "1815-12-10",
            "phone": "+44 20 7946 0958",
            "email": "ada@example.com",
            "notes": "extra fields are allowed"
        }));
        assert_eq!(registry.validate(&doc), Ok(()));
    }

    #[test]
    fn test_missing_required_field() {
        let registry = SchemaRegistry::clinic();
        let err = registry.validate(&patient(json!({"phone": "5551234"}))).unwrap_err();
        assert!(matches!(err, SchemaError::MissingField { ref field, .. } if field == "name"));

        let blank = registry.validate(&patient(json!({"name": "   "}))).unwrap_err();
        assert!(matches!(blank, SchemaError::MissingField { .. }));
    }

    #[test]
    fn test_type_and_format_violations() {
        let registry = SchemaRegistry::clinic();
        let err = registry.validate(&patient(json!({"name": 42}))).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidType { expected: "string", .. }));

        let err = registry
            .validate(&patient(json!({"name": "Bo", "dateOfBirth": "10/12/1815"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFormat { ref field, .. } if field == "dateOfBirth"));

        let err = registry
            .validate(&patient(json!({"name": "Bo", "email": "not-an-email"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFormat { .. }));
    }

    #[test]
    fn test_metadata_names_are_reserved() {
        let registry = SchemaRegistry::clinic();
        for field in METADATA_FIELDS {
            let doc = patient(json!({"name": "Bad"})).set(*field, 5);
            assert_eq!(
                registry.validate(&doc),
                Err(SchemaError::ReservedField {
                    collection: "patients".into(),
                    field: (*field).to_string(),
                })
            );
        }

        // Tombstones are checked too
        let doc = patient(json!({"name": "Bad", "revision": 9})).tombstone();
        assert!(matches!(
            registry.validate(&doc),
            Err(SchemaError::ReservedField { .. })
        ));
    }

    #[test]
    fn test_max_length() {
        let registry = SchemaRegistry::clinic();
        let err = registry
            .validate(&patient(json!({"name": "x".repeat(201)})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TooLong { max: 200, .. }));
    }

    #[test]
    fn test_unknown_collection() {
        let registry = SchemaRegistry::clinic();
        let doc = Document::new("invoices", Fields::new());
        assert_eq!(
            registry.validate(&doc),
            Err(SchemaError::UnknownCollection("invoices".into()))
        );
    }

    #[test]
    fn test_tombstone_skips_required_checks() {
        let registry = SchemaRegistry::clinic();
        let doc = Document::new("patients", Fields::new()).tombstone();
        assert_eq!(registry.validate(&doc), Ok(()));
    }

    #[test]
    fn test_queue_schema_enumerations() {
        let registry = SchemaRegistry::clinic();
        let Value::Object(fields) = json!({
            "patientId": "p1",
            "tokenNumber": 1,
            "triageLevel": "urgent",
            "status": "waiting",
            "queueDate": "2026-01-01"
        }) else {
            unreachable!()
        };
        let err = registry
            .validate(&Document::new(QUEUE_COLLECTION, fields))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFormat { ref field, .. } if field == "triageLevel"));
    }
}
