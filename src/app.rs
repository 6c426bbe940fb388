//! Composition root: the movies API route table wrapped in its pipeline.
//!
//! ```text
//! Metrics → Recover → [Timeout] → Cors → RateLimit → Authenticate → Router → [gate] → handler
//! ```
//!
//! Business logic and identity storage live outside this crate and come in
//! through [`Resources`] and [`IdentityStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, ConfigError};
use crate::error::{ApiError, Error};
use crate::handler::{BoxFuture, Handler};
use crate::health::healthcheck;
use crate::middleware::metrics::debug_vars;
use crate::middleware::{
    ApiMetrics, Authenticate, Cors, IdentityStore, Metrics, MetricsSink, Pipeline, RateLimit, RateLimiter,
    Recover, Timeout,
};
use crate::permission::require_permission;
use crate::principal::{MOVIES_READ, MOVIES_WRITE};
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::Router;
use crate::VERSION;

/// The business handlers behind each route.
///
/// Permission checks have already passed when these run. An `Err` is logged
/// and rendered; use [`ApiError::Upstream`] to send a response of your own
/// choosing, such as a `422` with field-level validation messages.
#[async_trait]
pub trait Resources: Send + Sync + 'static {
    async fn list_movies(&self, req: Request) -> Result<Response, ApiError>;
    async fn create_movie(&self, req: Request) -> Result<Response, ApiError>;
    async fn show_movie(&self, req: Request) -> Result<Response, ApiError>;
    async fn update_movie(&self, req: Request) -> Result<Response, ApiError>;
    async fn delete_movie(&self, req: Request) -> Result<Response, ApiError>;
    async fn register_user(&self, req: Request) -> Result<Response, ApiError>;
    async fn activate_user(&self, req: Request) -> Result<Response, ApiError>;
    async fn update_user_password(&self, req: Request) -> Result<Response, ApiError>;
    async fn create_authentication_token(&self, req: Request) -> Result<Response, ApiError>;
    async fn create_password_reset_token(&self, req: Request) -> Result<Response, ApiError>;
}

/// Adapts one [`Resources`] method into a route handler.
fn resource<F, Fut>(resources: &Arc<dyn Resources>, method: F) -> impl Handler
where
    F: Fn(Arc<dyn Resources>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
{
    let resources = Arc::clone(resources);
    move |req: Request| {
        let summary = req.summary();
        let outcome = method(Arc::clone(&resources), req);
        async move {
            outcome.await.unwrap_or_else(|err| {
                err.log(&summary);
                err.into_response()
            })
        }
    }
}

/// The route table of the movies API.
pub fn routes(resources: Arc<dyn Resources>, sink: Arc<dyn MetricsSink>, environment: &str) -> Router {
    let r = &resources;
    Router::new()
        .get("/v1/healthcheck", healthcheck(environment, VERSION))
        .get(
            "/v1/movies",
            require_permission(MOVIES_READ, resource(r, |r, req| async move { r.list_movies(req).await })),
        )
        .post(
            "/v1/movies",
            require_permission(MOVIES_WRITE, resource(r, |r, req| async move { r.create_movie(req).await })),
        )
        .get(
            "/v1/movies/:id",
            require_permission(MOVIES_READ, resource(r, |r, req| async move { r.show_movie(req).await })),
        )
        .patch(
            "/v1/movies/:id",
            require_permission(MOVIES_WRITE, resource(r, |r, req| async move { r.update_movie(req).await })),
        )
        .delete(
            "/v1/movies/:id",
            require_permission(MOVIES_WRITE, resource(r, |r, req| async move { r.delete_movie(req).await })),
        )
        .post("/v1/users", resource(r, |r, req| async move { r.register_user(req).await }))
        .put("/v1/users/activated", resource(r, |r, req| async move { r.activate_user(req).await }))
        .put("/v1/users/password", resource(r, |r, req| async move { r.update_user_password(req).await }))
        .post(
            "/v1/tokens/authentication",
            resource(r, |r, req| async move { r.create_authentication_token(req).await }),
        )
        .post(
            "/v1/tokens/password-reset",
            resource(r, |r, req| async move { r.create_password_reset_token(req).await }),
        )
        .get("/debug/vars", debug_vars(sink, VERSION))
}

/// The assembled application, ready to hand to [`Server::serve`](crate::Server::serve).
#[derive(Clone)]
pub struct App {
    pipeline: Pipeline,
    limiter: Arc<RateLimiter>,
    sweep_interval: Duration,
}

impl App {
    /// Builds the application with the default Prometheus sink.
    pub fn new(
        config: &Config,
        resources: Arc<dyn Resources>,
        identities: Arc<dyn IdentityStore>,
    ) -> Result<Self, Error> {
        config.validate().map_err(ConfigError::Invalid)?;
        let metrics = ApiMetrics::new(&config.metrics.namespace)?;
        Ok(Self::with_metrics(config, resources, identities, Arc::new(metrics)))
    }

    /// Builds the application reporting to `sink`.
    pub fn with_metrics(
        config: &Config,
        resources: Arc<dyn Resources>,
        identities: Arc<dyn IdentityStore>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let router = Arc::new(routes(resources, Arc::clone(&sink), &config.server.environment));
        for (method, template) in router.routes() {
            tracing::debug!(%method, template, "route registered");
        }

        let limiter = Arc::new(RateLimiter::new(&config.limiter));
        let cors = Cors::new(config.cors.trusted_origins.iter().cloned(), Duration::from_secs(config.cors.max_age_secs));

        let pipeline = Pipeline::builder(Arc::clone(&router))
            .stage(Metrics::new(sink, router))
            .stage(Recover)
            .optional(config.server.request_timeout().map(Timeout::new))
            .stage(cors)
            .stage(RateLimit::new(Arc::clone(&limiter)))
            .stage(Authenticate::new(identities))
            .build();
        tracing::debug!(stages = ?pipeline.stage_names(), "pipeline assembled");

        Self { pipeline, limiter, sweep_interval: config.limiter.sweep_interval() }
    }

    /// Runs one request through the whole pipeline.
    pub fn handle(&self, req: Request) -> BoxFuture {
        self.pipeline.handle(req)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}
