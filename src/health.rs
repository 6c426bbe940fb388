//! Built-in health check.
//!
//! `GET /v1/healthcheck` answers as long as the process can serve HTTP at
//! all. It sits behind the same pipeline as every other route, so a client
//! over its rate limit gets `429` here too.
//!
//! ```json
//! {"status": "available", "system_info": {"environment": "production", "version": "0.1.0"}}
//! ```

use serde::Serialize;

use crate::handler::Handler;
use crate::request::Request;
use crate::response::Json;

#[derive(Debug, Clone, Serialize)]
struct Health {
    status: &'static str,
    system_info: SystemInfo,
}

#[derive(Debug, Clone, Serialize)]
struct SystemInfo {
    environment: String,
    version: &'static str,
}

/// The health check handler for a deployment in `environment`.
pub fn healthcheck(environment: impl Into<String>, version: &'static str) -> impl Handler {
    let health = Health {
        status: "available",
        system_info: SystemInfo { environment: environment.into(), version },
    };
    move |_req: Request| {
        let health = health.clone();
        async move { Json(health) }
    }
}
