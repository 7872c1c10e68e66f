//! Record families and the persistence seam the cache subsystem sits in front of.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Field values of a record, keyed by field name.
pub type Fields = Map<String, Value>;

/// Keys managed by the store; callers may not write them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("record not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl SourceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFamily {
    Definitions,
    Domains,
    Objectives,
}

impl RecordFamily {
    pub const ALL: [RecordFamily; 3] = [
        RecordFamily::Definitions,
        RecordFamily::Domains,
        RecordFamily::Objectives,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordFamily::Definitions => "definitions",
            RecordFamily::Domains => "domains",
            RecordFamily::Objectives => "objectives",
        }
    }

    /// Collection path served by the HTTP layer.
    pub fn path(self) -> String {
        format!("/api/{}", self.as_str())
    }
}

impl fmt::Display for RecordFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown record family `{0}`")]
pub struct UnknownFamily(pub String);

impl FromStr for RecordFamily {
    type Err = UnknownFamily;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RecordFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == value)
            .ok_or_else(|| UnknownFamily(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: Fields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Record {
    /// Textual form of a scalar field, as compared against query filters.
    pub fn field_text(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(scalar_text)
    }
}

/// Text form of a JSON scalar; arrays, objects and nulls have none.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Equality filters on record fields plus an optional row cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filters: BTreeMap<String, String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn filtered(field: impl Into<String>, value: impl Into<String>) -> Self {
        let mut query = Self::default();
        query.filters.insert(field.into(), value.into());
        query
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| record.field_text(field).as_deref() == Some(expected.as_str()))
    }
}

/// Body of every collection response, and what the warmer caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub data: Vec<Record>,
    pub count: usize,
}

impl From<Vec<Record>> for Listing {
    fn from(data: Vec<Record>) -> Self {
        let count = data.len();
        Self { data, count }
    }
}

/// Reject writes that are not objects or that touch store-managed keys.
pub fn validate_fields(fields: &Fields) -> Result<(), SourceError> {
    if let Some(reserved) = RESERVED_FIELDS.iter().find(|key| fields.contains_key(**key)) {
        return Err(SourceError::invalid(format!(
            "field `{reserved}` is managed by the store"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn list(&self, family: RecordFamily, query: &ListQuery)
    -> Result<Vec<Record>, SourceError>;

    async fn get(&self, family: RecordFamily, id: Uuid) -> Result<Option<Record>, SourceError>;

    async fn create(&self, family: RecordFamily, fields: Fields) -> Result<Record, SourceError>;

    async fn update(
        &self,
        family: RecordFamily,
        id: Uuid,
        fields: Fields,
    ) -> Result<Record, SourceError>;

    async fn delete(&self, family: RecordFamily, id: Uuid) -> Result<bool, SourceError>;

    /// Sorted distinct textual values of `field` across the family.
    async fn distinct_values(
        &self,
        family: RecordFamily,
        field: &str,
    ) -> Result<Vec<String>, SourceError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(fields: Value) -> Record {
        let Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        Record {
            id: Uuid::nil(),
            fields,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn family_parses_and_formats() {
        assert_eq!("domains".parse::<RecordFamily>(), Ok(RecordFamily::Domains));
        assert_eq!(RecordFamily::Objectives.path(), "/api/objectives");
        assert!("posts".parse::<RecordFamily>().is_err());
    }

    #[test]
    fn filters_compare_scalar_text() {
        let objective = record(json!({"domain": "finance", "priority": 2, "active": true}));

        assert!(ListQuery::default().matches(&objective));
        assert!(ListQuery::filtered("domain", "finance").matches(&objective));
        assert!(ListQuery::filtered("priority", "2").matches(&objective));
        assert!(ListQuery::filtered("active", "true").matches(&objective));
        assert!(!ListQuery::filtered("domain", "ops").matches(&objective));
        assert!(!ListQuery::filtered("missing", "x").matches(&objective));
    }

    #[test]
    fn record_serializes_flat() {
        let value = serde_json::to_value(record(json!({"name": "Revenue"}))).unwrap();
        assert_eq!(value["name"], "Revenue");
        assert_eq!(value["created_at"], "1970-01-01T00:00:00Z");
        assert_eq!(value["id"], Uuid::nil().to_string());
    }

    #[test]
    fn reserved_fields_are_rejected() {
        let Value::Object(fields) = json!({"id": "x", "name": "n"}) else {
            unreachable!()
        };
        assert!(matches!(
            validate_fields(&fields),
            Err(SourceError::InvalidInput { .. })
        ));
    }
}
