//! Record persistence adapters.
//!
//! [`MemoryRecords`] is the in-process store the binary serves from.
//! [`InstrumentedSource`] wraps any [`RecordSource`] and reports every call to
//! the [`QueryMonitor`] as the statement a SQL store would have run.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::application::records::{
    Fields, ListQuery, Record, RecordFamily, RecordSource, SourceError, scalar_text,
    validate_fields,
};
use crate::infra::error::InfraError;
use crate::monitor::QueryMonitor;
use crate::sync::{rw_read, rw_write};

const SOURCE: &str = "recordcache::infra::records";

type Table = BTreeMap<Uuid, Record>;

/// In-memory record store, one table per family.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    tables: RwLock<HashMap<RecordFamily, Table>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records from a JSON document of the form
    /// `{"definitions": [{..}], "domains": [..], "objectives": [..]}`.
    pub async fn from_seed_file(path: &Path) -> Result<Self, InfraError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let seed: HashMap<RecordFamily, Vec<Fields>> =
            serde_json::from_str(&raw).map_err(|err| {
                InfraError::configuration(format!(
                    "seed file `{}` is not valid: {err}",
                    path.display()
                ))
            })?;

        let records = Self::new();
        let mut loaded = 0_usize;
        for (family, rows) in seed {
            for fields in rows {
                validate_fields(&fields).map_err(|err| {
                    InfraError::configuration(format!("seed {family} row rejected: {err}"))
                })?;
                records.insert(family, fields);
                loaded += 1;
            }
        }

        info!(
            target = "recordcache::infra::records",
            path = %path.display(),
            loaded,
            "seeded record store"
        );
        Ok(records)
    }

    /// Insert a row without validation, returning the stored record.
    pub fn insert(&self, family: RecordFamily, fields: Fields) -> Record {
        let now = OffsetDateTime::now_utc();
        let record = Record {
            id: Uuid::new_v4(),
            fields,
            created_at: now,
            updated_at: now,
        };
        let mut tables = rw_write(&self.tables, SOURCE, "insert");
        tables
            .entry(family)
            .or_default()
            .insert(record.id, record.clone());
        record
    }

    pub fn len(&self, family: RecordFamily) -> usize {
        rw_read(&self.tables, SOURCE, "len")
            .get(&family)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        rw_read(&self.tables, SOURCE, "is_empty")
            .values()
            .all(BTreeMap::is_empty)
    }
}

#[async_trait]
impl RecordSource for MemoryRecords {
    async fn list(
        &self,
        family: RecordFamily,
        query: &ListQuery,
    ) -> Result<Vec<Record>, SourceError> {
        let tables = rw_read(&self.tables, SOURCE, "list");
        let mut rows: Vec<Record> = tables
            .get(&family)
            .map(|table| {
                table
                    .values()
                    .filter(|record| query.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get(&self, family: RecordFamily, id: Uuid) -> Result<Option<Record>, SourceError> {
        let tables = rw_read(&self.tables, SOURCE, "get");
        Ok(tables.get(&family).and_then(|table| table.get(&id)).cloned())
    }

    async fn create(&self, family: RecordFamily, fields: Fields) -> Result<Record, SourceError> {
        validate_fields(&fields)?;
        Ok(self.insert(family, fields))
    }

    async fn update(
        &self,
        family: RecordFamily,
        id: Uuid,
        fields: Fields,
    ) -> Result<Record, SourceError> {
        validate_fields(&fields)?;
        let mut tables = rw_write(&self.tables, SOURCE, "update");
        let record = tables
            .get_mut(&family)
            .and_then(|table| table.get_mut(&id))
            .ok_or(SourceError::NotFound)?;
        record.fields.extend(fields);
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn delete(&self, family: RecordFamily, id: Uuid) -> Result<bool, SourceError> {
        let mut tables = rw_write(&self.tables, SOURCE, "delete");
        Ok(tables
            .get_mut(&family)
            .is_some_and(|table| table.remove(&id).is_some()))
    }

    async fn distinct_values(
        &self,
        family: RecordFamily,
        field: &str,
    ) -> Result<Vec<String>, SourceError> {
        let tables = rw_read(&self.tables, SOURCE, "distinct_values");
        let mut values: Vec<String> = tables
            .get(&family)
            .map(|table| {
                table
                    .values()
                    .filter_map(|record| record.field_text(field))
                    .collect()
            })
            .unwrap_or_default();
        values.sort();
        values.dedup();
        Ok(values)
    }
}

/// Statement text and bound parameters reported for one source call.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn select(family: RecordFamily, query: &ListQuery) -> Self {
        let mut text = format!("SELECT * FROM {family}");
        let mut params = Vec::with_capacity(query.filters.len());
        for (index, (field, value)) in query.filters.iter().enumerate() {
            let keyword = if index == 0 { "WHERE" } else { "AND" };
            text.push_str(&format!(" {keyword} {field} = ${}", index + 1));
            params.push(Value::String(value.clone()));
        }
        text.push_str(" ORDER BY created_at, id");
        if let Some(limit) = query.limit {
            text.push_str(&format!(" LIMIT {limit}"));
        }
        Self { text, params }
    }

    pub fn select_by_id(family: RecordFamily, id: Uuid) -> Self {
        Self {
            text: format!("SELECT * FROM {family} WHERE id = $1"),
            params: vec![Value::String(id.to_string())],
        }
    }

    pub fn insert(family: RecordFamily, fields: &Fields) -> Self {
        let columns: Vec<&str> = fields.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
        Self {
            text: format!(
                "INSERT INTO {family} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            params: fields.values().cloned().collect(),
        }
    }

    pub fn update(family: RecordFamily, id: Uuid, fields: &Fields) -> Self {
        let mut assignments: Vec<String> = fields
            .keys()
            .enumerate()
            .map(|(index, column)| format!("{column} = ${}", index + 1))
            .collect();
        assignments.push("updated_at = now()".to_string());
        let mut params: Vec<Value> = fields.values().cloned().collect();
        params.push(Value::String(id.to_string()));
        Self {
            text: format!(
                "UPDATE {family} SET {} WHERE id = ${}",
                assignments.join(", "),
                params.len()
            ),
            params,
        }
    }

    pub fn delete(family: RecordFamily, id: Uuid) -> Self {
        Self {
            text: format!("DELETE FROM {family} WHERE id = $1"),
            params: vec![Value::String(id.to_string())],
        }
    }

    pub fn distinct(family: RecordFamily, field: &str) -> Self {
        Self {
            text: format!("SELECT DISTINCT {field} FROM {family} ORDER BY {field}"),
            params: Vec::new(),
        }
    }
}

/// Reports every call on the wrapped source to the query monitor.
///
/// Durations are measured start to finish whether the call succeeds or fails.
pub struct InstrumentedSource<S> {
    inner: S,
    monitor: Arc<QueryMonitor>,
}

impl<S> InstrumentedSource<S> {
    pub fn new(inner: S, monitor: Arc<QueryMonitor>) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl<S: RecordSource> RecordSource for InstrumentedSource<S> {
    async fn list(
        &self,
        family: RecordFamily,
        query: &ListQuery,
    ) -> Result<Vec<Record>, SourceError> {
        let statement = Statement::select(family, query);
        self.monitor
            .observe(
                &statement.text,
                Some(statement.params.as_slice()),
                self.inner.list(family, query),
            )
            .await
    }

    async fn get(&self, family: RecordFamily, id: Uuid) -> Result<Option<Record>, SourceError> {
        let statement = Statement::select_by_id(family, id);
        self.monitor
            .observe(
                &statement.text,
                Some(statement.params.as_slice()),
                self.inner.get(family, id),
            )
            .await
    }

    async fn create(&self, family: RecordFamily, fields: Fields) -> Result<Record, SourceError> {
        let statement = Statement::insert(family, &fields);
        self.monitor
            .observe(
                &statement.text,
                Some(statement.params.as_slice()),
                self.inner.create(family, fields),
            )
            .await
    }

    async fn update(
        &self,
        family: RecordFamily,
        id: Uuid,
        fields: Fields,
    ) -> Result<Record, SourceError> {
        let statement = Statement::update(family, id, &fields);
        self.monitor
            .observe(
                &statement.text,
                Some(statement.params.as_slice()),
                self.inner.update(family, id, fields),
            )
            .await
    }

    async fn delete(&self, family: RecordFamily, id: Uuid) -> Result<bool, SourceError> {
        let statement = Statement::delete(family, id);
        self.monitor
            .observe(
                &statement.text,
                Some(statement.params.as_slice()),
                self.inner.delete(family, id),
            )
            .await
    }

    async fn distinct_values(
        &self,
        family: RecordFamily,
        field: &str,
    ) -> Result<Vec<String>, SourceError> {
        let statement = Statement::distinct(family, field);
        self.monitor
            .observe(&statement.text, None, self.inner.distinct_values(family, field))
            .await
    }
}

/// Parse a JSON body into record fields, rejecting non-objects.
pub fn fields_from_value(value: Value) -> Result<Fields, SourceError> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(SourceError::invalid(format!(
            "expected a JSON object, got `{}`",
            scalar_text(&other).unwrap_or_else(|| "non-scalar".to_string())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::monitor::MonitorConfig;

    fn fields(value: Value) -> Fields {
        fields_from_value(value).expect("object")
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemoryRecords::new();
        let created = store
            .create(RecordFamily::Domains, fields(json!({"name": "Finance"})))
            .await
            .unwrap();

        let fetched = store.get(RecordFamily::Domains, created.id).await.unwrap();
        assert_eq!(fetched.as_ref(), Some(&created));

        let updated = store
            .update(
                RecordFamily::Domains,
                created.id,
                fields(json!({"name": "Treasury"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.field_text("name").as_deref(), Some("Treasury"));

        assert!(store.delete(RecordFamily::Domains, created.id).await.unwrap());
        assert!(!store.delete(RecordFamily::Domains, created.id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let store = MemoryRecords::new();
        let result = store
            .update(RecordFamily::Domains, Uuid::new_v4(), Fields::new())
            .await;
        assert!(matches!(result, Err(SourceError::NotFound)));
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let store = MemoryRecords::new();
        for (domain, status) in [("ops", "open"), ("ops", "done"), ("finance", "open")] {
            store.insert(
                RecordFamily::Objectives,
                fields(json!({"domain": domain, "status": status})),
            );
        }

        let ops = store
            .list(RecordFamily::Objectives, &ListQuery::filtered("domain", "ops"))
            .await
            .unwrap();
        assert_eq!(ops.len(), 2);

        let capped = store
            .list(RecordFamily::Objectives, &ListQuery::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);

        let statuses = store
            .distinct_values(RecordFamily::Objectives, "status")
            .await
            .unwrap();
        assert_eq!(statuses, vec!["done".to_string(), "open".to_string()]);
    }

    #[test]
    fn statements_use_positional_placeholders() {
        let mut query = ListQuery::filtered("domain", "ops");
        query.filters.insert("status".into(), "open".into());
        let statement = Statement::select(RecordFamily::Objectives, &query.with_limit(10));

        assert_eq!(
            statement.text,
            "SELECT * FROM objectives WHERE domain = $1 AND status = $2 ORDER BY created_at, id LIMIT 10"
        );
        assert_eq!(statement.params, vec![json!("ops"), json!("open")]);

        let id = Uuid::nil();
        let update = Statement::update(RecordFamily::Domains, id, &fields(json!({"name": "x"})));
        assert_eq!(
            update.text,
            "UPDATE domains SET name = $1, updated_at = now() WHERE id = $2"
        );
    }

    #[tokio::test]
    async fn instrumented_source_records_success_and_failure() {
        let monitor = Arc::new(QueryMonitor::new(MonitorConfig::default()));
        let source = InstrumentedSource::new(MemoryRecords::new(), monitor.clone());

        source
            .list(RecordFamily::Definitions, &ListQuery::default())
            .await
            .unwrap();
        let failed = source
            .update(RecordFamily::Definitions, Uuid::new_v4(), Fields::new())
            .await;
        assert!(failed.is_err());

        let recent = monitor.recent_queries(10);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].query.starts_with("UPDATE definitions"));
        assert!(recent[1].query.starts_with("SELECT * FROM definitions"));
    }

    #[test]
    fn non_object_body_is_invalid() {
        assert!(matches!(
            fields_from_value(json!([1, 2])),
            Err(SourceError::InvalidInput { .. })
        ));
    }
}
