//! Record CRUD handlers.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::Value;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::records::{ListQuery, Listing, RecordFamily, SourceError};
use crate::infra::records::fields_from_value;

use super::AppState;

fn family(raw: &str) -> Result<RecordFamily, AppError> {
    raw.parse().map_err(|_| AppError::NotFound)
}

/// One filter per field; a field named twice is rejected rather than picking a winner.
fn filters(pairs: Vec<(String, String)>) -> Result<BTreeMap<String, String>, AppError> {
    let mut filters = BTreeMap::new();
    for (key, value) in pairs {
        if filters.contains_key(&key) {
            return Err(SourceError::invalid(format!(
                "query parameter `{key}` given more than once"
            ))
            .into());
        }
        filters.insert(key, value);
    }
    Ok(filters)
}

/// Every query parameter filters on the record field of the same name.
pub async fn list_records(
    State(state): State<AppState>,
    Path(raw_family): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, AppError> {
    let family = family(&raw_family)?;
    let query = ListQuery {
        filters: filters(pairs)?,
        limit: None,
    };
    let rows = state.records.list(family, &query).await?;
    Ok(Json(Listing::from(rows)))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path((raw_family, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let family = family(&raw_family)?;
    match state.records.get(family, id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound),
    }
}

pub async fn create_record(
    State(state): State<AppState>,
    Path(raw_family): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let family = family(&raw_family)?;
    let fields = fields_from_value(body)?;
    let record = state.records.create(family, fields).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn update_record(
    State(state): State<AppState>,
    Path((raw_family, id)): Path<(String, Uuid)>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let family = family(&raw_family)?;
    let fields = fields_from_value(body)?;
    let record = state.records.update(family, id, fields).await?;
    Ok(Json(record))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((raw_family, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let family = family(&raw_family)?;
    if state.records.delete(family, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}
