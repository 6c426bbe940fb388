//! The middleware pipeline.
//!
//! A [`Pipeline`] is an ordered list of stages in front of the route table.
//! Every stage implements [`Middleware`] and, per request, does one of two
//! things: forward by awaiting [`Next::run`], or short-circuit by returning a
//! response of its own. Either way it may inspect or amend the response on the
//! way out.
//!
//! Composition is a fold over the stage list: `Next` carries the position of
//! the following stage, and the route table sits at the end.
//!
//! ```text
//! Metrics → Recover → [Timeout] → Cors → RateLimit → Authenticate → Router
//! ```

pub mod auth;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod recover;
pub mod timeout;

use std::sync::Arc;

use crate::handler::BoxFuture;
use crate::request::Request;
use crate::router::Router;

pub use auth::{Authenticate, IdentityStore, StoreError};
pub use cors::Cors;
pub use metrics::{ApiMetrics, Metrics, MetricsError, MetricsSink, RequestRecord};
pub use rate_limit::{ClientKey, KeyStrategy, RateLimit, RateLimiter};
pub use recover::Recover;
pub use timeout::Timeout;

/// One stage of the pipeline.
pub trait Middleware: Send + Sync + 'static {
    /// Short stage name for logs.
    fn name(&self) -> &'static str;

    /// Processes `req`, forwarding through `next` or answering directly.
    fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture;
}

/// The rest of the pipeline, from the stage after the current one.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn Middleware>]>,
    endpoint: Arc<Router>,
    position: usize,
}

impl Next {
    /// Forwards the request to the next stage, or to the route table after
    /// the last one.
    pub fn run(self, req: Request) -> BoxFuture {
        match self.stages.get(self.position) {
            Some(stage) => {
                let stage = Arc::clone(stage);
                let next = Next { position: self.position + 1, ..self };
                stage.call(req, next)
            }
            None => self.endpoint.handle(req),
        }
    }
}

/// The composed request pipeline: stages in order, then the route table.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
    endpoint: Arc<Router>,
}

impl Pipeline {
    pub fn builder(router: impl Into<Arc<Router>>) -> PipelineBuilder {
        PipelineBuilder { stages: Vec::new(), endpoint: router.into() }
    }

    /// Runs one request through every stage.
    pub fn handle(&self, req: Request) -> BoxFuture {
        Next { stages: Arc::clone(&self.stages), endpoint: Arc::clone(&self.endpoint), position: 0 }.run(req)
    }

    pub fn router(&self) -> &Router {
        &self.endpoint
    }

    /// Stage names, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Collects stages outermost first.
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<Router>,
}

impl PipelineBuilder {
    /// Appends a stage inside the ones added so far.
    pub fn stage(mut self, stage: impl Middleware) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends `stage` only when it is `Some`.
    pub fn optional(self, stage: Option<impl Middleware>) -> Self {
        match stage {
            Some(stage) => self.stage(stage),
            None => self,
        }
    }

    pub fn build(self) -> Pipeline {
        Pipeline { stages: self.stages.into(), endpoint: self.endpoint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::Mutex;

    /// Records its name on the way in and out.
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        answer: Option<StatusCode>,
    }

    impl Middleware for Trace {
        fn name(&self) -> &'static str {
            self.name
        }

        fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("> {}", self.name));
                let res = match self.answer {
                    Some(status) => Response::status(status),
                    None => next.run(req).await,
                };
                self.log.lock().unwrap().push(format!("< {}", self.name));
                res
            })
        }
    }

    fn request() -> Request {
        Request::from(http::Request::builder().uri("/").body(Bytes::new()).unwrap())
    }

    fn trace(name: &'static str, log: &Arc<Mutex<Vec<String>>>, answer: Option<StatusCode>) -> Trace {
        Trace { name, log: Arc::clone(log), answer }
    }

    #[tokio::test]
    async fn stages_nest_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().get("/", |_req: Request| async { "root" });
        let pipeline = Pipeline::builder(router)
            .stage(trace("outer", &log, None))
            .stage(trace("inner", &log, None))
            .build();

        let res = pipeline.handle(request()).await;
        assert_eq!(res.body(), b"root");
        assert_eq!(*log.lock().unwrap(), ["> outer", "> inner", "< inner", "< outer"]);
        assert_eq!(pipeline.stage_names(), ["outer", "inner"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_remaining_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().get("/", |_req: Request| async { "root" });
        let pipeline = Pipeline::builder(router)
            .stage(trace("outer", &log, None))
            .stage(trace("gate", &log, Some(StatusCode::TOO_MANY_REQUESTS)))
            .stage(trace("never", &log, None))
            .build();

        let res = pipeline.handle(request()).await;
        assert_eq!(res.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(*log.lock().unwrap(), ["> outer", "> gate", "< gate", "< outer"]);
    }
}
