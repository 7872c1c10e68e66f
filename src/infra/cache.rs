use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest body the read path will cache.
pub const MAX_CACHEABLE_BODY_BYTES: usize = 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// A handler response as stored in the cache.
///
/// The warmer builds these directly with [`CachedResponse::json`], the read path
/// captures them from live responses; both produce identical entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Self {
            status: status.as_u16(),
            content_type,
            body,
        }
    }

    /// Entry equivalent to what `axum::Json(value)` would have produced.
    pub fn json<T: Serialize + ?Sized>(
        status: StatusCode,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self {
            status: status.as_u16(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body: Bytes::from(body),
        })
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        if let Some(content_type) = self
            .content_type
            .and_then(|value| HeaderValue::from_str(&value).ok())
        {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }

        response
    }
}

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("failed to buffer response body: {0}")]
    Buffer(String),
}

/// Whether a live response may be stored for other callers.
pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    true
}

/// Collect a response body, returning a rebuilt response and its cacheable copy.
pub async fn buffer_response(
    response: Response,
) -> Result<(Response, CachedResponse), (Response, CacheStoreError)> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
            let rebuilt = Response::from_parts(parts, Body::from(bytes));
            Ok((rebuilt, cached))
        }
        Err(error) => {
            let rebuilt = Response::from_parts(parts, Body::empty());
            Err((rebuilt, CacheStoreError::Buffer(error.to_string())))
        }
    }
}

mod base64_body {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, response::IntoResponse};
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn buffered_response_matches_json_constructor() {
        let value = json!({"data": [], "count": 0});
        let live = Json(value.clone()).into_response();

        let (rebuilt, captured) = buffer_response(live).await.expect("buffer");
        let built = CachedResponse::json(StatusCode::OK, &value).expect("encode");

        assert_eq!(captured, built);
        assert_eq!(rebuilt.status(), StatusCode::OK);
    }

    #[test]
    fn cached_response_survives_serialization() {
        let cached = CachedResponse {
            status: 200,
            content_type: Some("application/octet-stream".to_string()),
            body: Bytes::from_static(&[0, 159, 146, 150]),
        };
        let encoded = serde_json::to_string(&cached).expect("encode");
        let decoded: CachedResponse = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, cached);
        assert_eq!(decoded.into_response().status(), StatusCode::OK);
    }

    #[test]
    fn errors_and_cookies_are_not_stored() {
        let failed = StatusCode::NOT_FOUND.into_response();
        assert!(!should_store_response(&failed));

        let cookie = ([(header::SET_COOKIE, "session=1")], "ok").into_response();
        assert!(!should_store_response(&cookie));

        let stream = ([(header::CONTENT_TYPE, "text/event-stream")], "").into_response();
        assert!(!should_store_response(&stream));

        assert!(should_store_response(&Json(json!([])).into_response()));
    }

    #[test]
    fn encoded_body_is_base64() {
        let cached = CachedResponse::json(StatusCode::OK, &json!([])).expect("encode");
        let encoded = serde_json::to_value(&cached).expect("encode");
        assert_eq!(encoded["body"], STANDARD.encode("[]"));
    }
}
