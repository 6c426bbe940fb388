//! Optional upper bound on request processing time.
//!
//! When the deadline passes, the downstream future is dropped, which stops
//! the handler at its next await point, and the client gets `503`.

use std::sync::Arc;
use std::time::Duration;

use super::{Middleware, Next};
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::IntoResponse;

/// The timeout stage.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl Middleware for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        let summary = req.summary();
        Box::pin(async move {
            match tokio::time::timeout(self.limit, next.run(req)).await {
                Ok(res) => res,
                Err(_) => {
                    let err = ApiError::Timeout;
                    tracing::warn!(limit_ms = self.limit.as_millis() as u64, "request deadline exceeded");
                    err.log(&summary);
                    err.into_response()
                }
            }
        })
    }
}
