//! Shared fixtures: fake business handlers, a fixed token store and request
//! helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use marquee::principal::{MOVIES_READ, MOVIES_WRITE};
use marquee::{
    ApiError, ApiMetrics, App, Config, IdentityStore, IntoResponse, Json, Principal, Request, Resources, Response,
    StoreError, UserId,
};
use serde_json::json;

pub const READER: &str = "READERREADERREADERREADER22";
pub const WRITER: &str = "WRITERWRITERWRITERWRITER22";
pub const INACTIVE: &str = "INACTIVEINACTIVEINACTIVE22";
pub const REVOKED: &str = "REVOKEDREVOKEDREVOKEDREVOK";

/// Business handlers that answer with their own name and count calls.
#[derive(Default)]
pub struct FakeResources {
    calls: AtomicUsize,
}

impl FakeResources {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, name: &str, req: &Request) -> Result<Response, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Json(json!({
            "handler": name,
            "id": req.param("id"),
            "caller": req.principal().identity().to_string(),
        }))
        .into_response())
    }
}

#[async_trait]
impl Resources for FakeResources {
    async fn list_movies(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("list_movies", &req)
    }

    async fn create_movie(&self, req: Request) -> Result<Response, ApiError> {
        if req.body().is_empty() {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": {"title": "must be provided"}})));
            return Err(ApiError::Upstream(body.into_response()));
        }
        self.answer("create_movie", &req)
    }

    async fn show_movie(&self, req: Request) -> Result<Response, ApiError> {
        if req.param("id") == Some("666") {
            panic!("cursed movie");
        }
        self.answer("show_movie", &req)
    }

    async fn update_movie(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("update_movie", &req)
    }

    async fn delete_movie(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("delete_movie", &req)
    }

    async fn register_user(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("register_user", &req)
    }

    async fn activate_user(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("activate_user", &req)
    }

    async fn update_user_password(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("update_user_password", &req)
    }

    async fn create_authentication_token(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("create_authentication_token", &req)
    }

    async fn create_password_reset_token(&self, req: Request) -> Result<Response, ApiError> {
        self.answer("create_password_reset_token", &req)
    }
}

pub struct FixedTokens(HashMap<&'static str, Principal>);

impl Default for FixedTokens {
    fn default() -> Self {
        Self(HashMap::from([
            (READER, Principal::user(UserId(1), true, [MOVIES_READ].into_iter().collect())),
            (WRITER, Principal::user(UserId(2), true, [MOVIES_READ, MOVIES_WRITE].into_iter().collect())),
            (INACTIVE, Principal::user(UserId(3), false, [MOVIES_READ].into_iter().collect())),
        ]))
    }
}

#[async_trait]
impl IdentityStore for FixedTokens {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.0.get(token).cloned())
    }
}

/// Defaults plus a trusted origin and a limiter that never gets in the way.
pub fn config() -> Config {
    let mut config = Config::default();
    config.server.environment = "test".into();
    config.cors.trusted_origins = vec!["https://app.example.com".into()];
    config.limiter.rps = 1000.0;
    config.limiter.burst = 1000;
    config
}

pub struct Harness {
    pub app: App,
    pub metrics: ApiMetrics,
    pub resources: Arc<FakeResources>,
}

pub fn harness(config: &Config) -> Harness {
    let metrics = ApiMetrics::new(&config.metrics.namespace).unwrap();
    let resources = Arc::new(FakeResources::default());
    let app = App::with_metrics(
        config,
        Arc::clone(&resources) as Arc<dyn Resources>,
        Arc::new(FixedTokens::default()),
        Arc::new(metrics.clone()),
    );
    Harness { app, metrics, resources }
}

/// Request builder defaulting to a fixed peer address.
pub struct Req {
    inner: http::request::Builder,
    body: Bytes,
    peer: SocketAddr,
}

pub fn req(method: &str, path: &str) -> Req {
    Req {
        inner: http::Request::builder().method(method).uri(path),
        body: Bytes::new(),
        peer: "192.0.2.10:40000".parse().unwrap(),
    }
}

impl Req {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.inner = self.inner.header(name, value);
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", &format!("Bearer {token}"))
    }

    pub fn body(mut self, body: &'static str) -> Self {
        self.body = Bytes::from_static(body.as_bytes());
        self
    }

    pub fn peer(mut self, peer: &str) -> Self {
        self.peer = peer.parse().unwrap();
        self
    }

    pub fn build(self) -> Request {
        Request::from(self.inner.body(self.body).unwrap()).with_remote_addr(self.peer)
    }
}

pub fn json_body(res: &Response) -> serde_json::Value {
    serde_json::from_slice(res.body()).unwrap()
}
