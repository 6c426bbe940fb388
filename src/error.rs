//! Error types.
//!
//! - [`Error`]: startup and serving failures returned to the caller of
//!   [`Server::serve`](crate::Server::serve) or [`App::new`](crate::App::new).
//! - [`ApiError`]: request failures. Each variant is the terminal outcome of
//!   one stage and renders as a status code plus a `{"error": ...}` body.

use std::time::Duration;

use http::header::{self, HeaderValue};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;
use crate::method::Method;
use crate::middleware::metrics::MetricsError;
use crate::request::RequestSummary;
use crate::response::{IntoResponse, Json, Response};

/// Infrastructure error returned by fallible startup and serving operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address `{addr}`: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("metrics: {0}")]
    Metrics(#[from] MetricsError),
}

const INTERNAL_MESSAGE: &str = "the server encountered a problem and could not process your request";

/// A request failure, produced by a pipeline stage, a permission gate or a
/// handler.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No route matches the path under any method (404).
    #[error("the requested resource could not be found")]
    NotFound,

    /// The path exists, but not under this method (405).
    #[error("the {method} method is not supported for this resource")]
    MethodNotAllowed { method: http::Method, allowed: Vec<Method> },

    /// Gated route, anonymous caller (401).
    #[error("you must be authenticated to access this resource")]
    NotAuthenticated,

    /// Gated route, caller's account not activated (403).
    #[error("your user account must be activated to access this resource")]
    NotActivated,

    /// Gated route, caller lacks the permission code (403).
    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted { permission: String },

    /// A credential was presented and rejected (401).
    #[error("invalid or missing authentication token")]
    InvalidCredential,

    /// The client's token bucket is empty (429).
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    /// The request could not be read (400).
    #[error("{0}")]
    BadRequest(String),

    /// The request body exceeds the configured cap (413).
    #[error("the request body is too large")]
    PayloadTooLarge,

    /// The configured request timeout elapsed (503).
    #[error("the request timed out")]
    Timeout,

    /// A failure the client must not see the details of (500).
    #[error("internal error: {0}")]
    Internal(String),

    /// A handler's own error response, passed through unchanged.
    #[error("handler responded {}", .0.status_code())]
    Upstream(Response),
}

impl ApiError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotAuthenticated | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::NotActivated | Self::NotPermitted { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(res) => res.status_code(),
        }
    }

    /// Logs the failure against the request it ended.
    ///
    /// Server-side failures at `error`, access refusals at `warn`, the rest
    /// of the client errors at `info`.
    pub fn log(&self, at: &RequestSummary) {
        let status = self.status().as_u16();
        let (method, path, client) = (&at.method, at.path.as_str(), at.client.as_str());
        let key = at.key.as_deref();
        match self {
            Self::Internal(_) => {
                tracing::error!(%method, path, client, key, status, error = %self, "request failed")
            }
            Self::Upstream(_) if status >= 500 => {
                tracing::error!(%method, path, client, key, status, "handler reported failure")
            }
            Self::Upstream(_) => {
                tracing::info!(%method, path, client, key, status, "handler reported failure")
            }
            Self::NotAuthenticated
            | Self::NotActivated
            | Self::NotPermitted { .. }
            | Self::InvalidCredential
            | Self::RateLimited { .. }
            | Self::Timeout => {
                tracing::warn!(%method, path, client, key, status, error = %self, "request refused")
            }
            _ => tracing::info!(%method, path, client, key, status, error = %self, "request failed"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            Self::Upstream(res) => return res,
            err => err,
        };
        let message = match &err {
            Self::Internal(_) => INTERNAL_MESSAGE.to_owned(),
            other => other.to_string(),
        };

        let mut res = (err.status(), Json(json!({ "error": message }))).into_response();
        let headers = res.headers_mut();
        match err {
            Self::MethodNotAllowed { allowed, .. } => {
                if let Ok(v) = HeaderValue::from_str(&Method::join(&allowed)) {
                    headers.insert(header::ALLOW, v);
                }
            }
            Self::InvalidCredential => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn body(res: &Response) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    #[test]
    fn not_found_envelope() {
        let res = ApiError::NotFound.into_response();
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(body(&res), json!({"error": "the requested resource could not be found"}));
    }

    #[test]
    fn method_not_allowed_names_method_and_sets_allow() {
        let err = ApiError::MethodNotAllowed {
            method: http::Method::PUT,
            allowed: vec![Method::Get, Method::Options, Method::Post],
        };
        let res = err.into_response();
        assert_eq!(res.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.header("allow"), Some("GET, OPTIONS, POST"));
        assert_eq!(body(&res)["error"], "the PUT method is not supported for this resource");
    }

    #[test]
    fn authentication_and_authorisation_are_distinct() {
        assert_eq!(ApiError::NotAuthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotPermitted { permission: "movies:write".into() }.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotActivated.status(), StatusCode::FORBIDDEN);

        let res = ApiError::InvalidCredential.into_response();
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.header("www-authenticate"), Some("Bearer"));
    }

    #[test]
    fn rate_limited_rounds_retry_after_up() {
        let res = ApiError::RateLimited { retry_after: Duration::from_millis(1200) }.into_response();
        assert_eq!(res.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.header("retry-after"), Some("2"));

        let res = ApiError::RateLimited { retry_after: Duration::from_millis(10) }.into_response();
        assert_eq!(res.header("retry-after"), Some("1"));
    }

    #[test]
    fn internal_details_never_reach_the_client() {
        let res = ApiError::internal("connection pool exhausted").into_response();
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(!text.contains("pool"));
        assert_eq!(body(&res)["error"], INTERNAL_MESSAGE);
    }

    #[test]
    fn upstream_passes_through_unchanged() {
        let original = Response::builder()
            .status(StatusCode::UNPROCESSABLE_ENTITY)
            .json(r#"{"error":{"title":"must be provided"}}"#);
        let res = ApiError::Upstream(original).into_response();
        assert_eq!(res.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(res.body(), br#"{"error":{"title":"must be provided"}}"#);
    }
}
