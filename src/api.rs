//! REST client for canonical trip state and trip mutations.
//!
//! ERROR HANDLING
//! ==============
//! Unlike the realtime layer, REST errors are returned to the caller: a
//! failed cancel/pay/select-guide is something the user must hear about.
//! Non-2xx responses become [`ApiError::Status`] with the server's
//! `message` (or `error`) field when it sent one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::debug;
use tripsync_protocol::{EntityKey, TripRecord};

use crate::config::SyncConfig;
use crate::transport::Credential;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Source of authoritative trip state for reconciliation.
#[async_trait]
pub trait TripSource: Send + Sync {
    async fn fetch_trip(&self, id: &EntityKey) -> Result<TripRecord, ApiError>;

    /// Trips belonging to the authenticated user.
    async fn fetch_trips(&self) -> Result<Vec<TripRecord>, ApiError>;
}

/// Bearer-authenticated client for the booking REST API.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns an error for an unparsable base URL, a credential that is not
    /// a valid header value, or a failure building the HTTP client.
    pub fn new(base_url: &str, credential: &Credential, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|_| ApiError::InvalidUrl(base_url.to_owned()))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let mut auth = HeaderValue::from_str(&credential.authorization_value())?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder().default_headers(headers).timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    /// # Errors
    ///
    /// See [`ApiClient::new`].
    pub fn from_config(config: &SyncConfig, credential: &Credential) -> Result<Self, ApiError> {
        Self::new(&config.api_url, credential, config.request_timeout)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, segments: &[&str], body: Option<Value>) -> Result<Value, ApiError> {
        let url = self.url(segments)?;
        debug!(%method, %url, "api: request");

        let request = self.http.request(method, url);
        let request = if let Some(json) = body { request.json(&json) } else { request };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(&value, status) });
        }
        Ok(value)
    }

    async fn trip_request(&self, method: Method, segments: &[&str], body: Option<Value>) -> Result<TripRecord, ApiError> {
        let value = self.request(method, segments, body).await?;
        Ok(serde_json::from_value(unwrap_envelope(value, "trip"))?)
    }

    /// `POST /trips/{id}/cancel`
    ///
    /// # Errors
    ///
    /// Transport, status, or decode failure.
    pub async fn cancel_trip(&self, id: &EntityKey) -> Result<TripRecord, ApiError> {
        self.trip_request(Method::POST, &["trips", id.as_str(), "cancel"], None).await
    }

    /// `POST /trips/{id}/select-guide` with `{"guideId": …}`
    ///
    /// # Errors
    ///
    /// Transport, status, or decode failure.
    pub async fn select_guide(&self, id: &EntityKey, guide_id: &str) -> Result<TripRecord, ApiError> {
        let body = serde_json::json!({ "guideId": guide_id });
        self.trip_request(Method::POST, &["trips", id.as_str(), "select-guide"], Some(body)).await
    }

    /// `POST /trips/{id}/pay`
    ///
    /// # Errors
    ///
    /// Transport, status, or decode failure.
    pub async fn pay_trip(&self, id: &EntityKey) -> Result<TripRecord, ApiError> {
        self.trip_request(Method::POST, &["trips", id.as_str(), "pay"], None).await
    }
}

#[async_trait]
impl TripSource for ApiClient {
    async fn fetch_trip(&self, id: &EntityKey) -> Result<TripRecord, ApiError> {
        self.trip_request(Method::GET, &["trips", id.as_str()], None).await
    }

    async fn fetch_trips(&self) -> Result<Vec<TripRecord>, ApiError> {
        let value = self.request(Method::GET, &["trips"], None).await?;
        Ok(serde_json::from_value(unwrap_envelope(value, "trips"))?)
    }
}

/// Accept bare bodies as well as `{"<key>": …}` / `{"data": …}` envelopes.
fn unwrap_envelope(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(inner) = map.remove(key) {
                return inner;
            }
            if let Some(inner) = map.remove("data") {
                return unwrap_envelope(inner, key);
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn error_message(body: &Value, status: reqwest::StatusCode) -> String {
    ["message", "error"]
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .map(ToOwned::to_owned)
        .or_else(|| body.as_str().map(ToOwned::to_owned))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_owned())
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
