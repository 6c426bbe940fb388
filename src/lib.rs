//! # marquee
//!
//! Request dispatch and middleware composition for a JSON movies API.
//!
//! Every request goes through one fixed pipeline:
//!
//! ```text
//! Metrics → Recover → [Timeout] → Cors → RateLimit → Authenticate → Router → [permission gate] → handler
//! ```
//!
//! Each stage either forwards the request or answers it itself. The route
//! table tells an unknown path (`404`) from a known path under the wrong
//! method (`405` + `Allow`), and the gates tell an anonymous caller (`401`)
//! from one without the permission (`403`).
//!
//! What lives elsewhere and plugs in through traits:
//!
//! - the movie, user and token handlers: [`Resources`]
//! - token lookup: [`IdentityStore`]
//! - where metrics go: [`MetricsSink`] ([`ApiMetrics`] by default)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marquee::{App, Config, IdentityStore, Resources, Server};
//!
//! # async fn run(resources: Arc<dyn Resources>, identities: Arc<dyn IdentityStore>) -> Result<(), marquee::Error> {
//! let config = Config::from_file("marquee.toml")?;
//! let app = App::new(&config, resources, identities)?;
//! Server::from_config(&config.server)?.serve(app).await
//! # }
//! ```

mod app;
mod error;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;

pub mod config;
pub mod health;
pub mod middleware;
pub mod permission;
pub mod principal;

/// Crate version, reported by the health check and `/debug/vars`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{routes, App, Resources};
pub use config::{Config, ConfigError};
pub use error::{ApiError, Error};
pub use handler::{BoxFuture, Handler};
pub use method::{Method, UnknownMethod};
pub use middleware::{ApiMetrics, IdentityStore, Middleware, MetricsSink, Next, Pipeline, StoreError};
pub use principal::{Identity, Permissions, Principal, UserId};
pub use request::{Request, RequestSummary};
pub use response::{IntoResponse, Json, Response, ResponseBuilder};
pub use router::{DispatchError, RouteMatch, Router};
pub use server::Server;
