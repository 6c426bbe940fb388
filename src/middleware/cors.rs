//! Cross-origin resource sharing.
//!
//! Only origins on the trusted list get `Access-Control-Allow-Origin`, echoed
//! back verbatim (never `*`). A preflight from a trusted origin is answered
//! here with `200` and never reaches authentication, the limiter's inner
//! stages or a handler.

use std::collections::HashSet;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HeaderValue};
use http::StatusCode;

use super::{Middleware, Next};
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;

const ALLOW_METHODS: &str = "OPTIONS, PUT, PATCH, DELETE";
const ALLOW_HEADERS: &str = "Authorization, Content-Type";

/// The CORS stage.
pub struct Cors {
    trusted: HashSet<String>,
    max_age: Duration,
}

impl Cors {
    /// The literal origin `null` is dropped from `trusted_origins`.
    pub fn new<I, S>(trusted_origins: I, max_age: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let trusted = trusted_origins
            .into_iter()
            .map(Into::into)
            .filter(|o: &String| o != "null")
            .collect();
        Self { trusted, max_age }
    }

    pub fn is_trusted(&self, origin: &str) -> bool {
        self.trusted.contains(origin)
    }

    fn is_preflight(req: &Request) -> bool {
        req.method() == http::Method::OPTIONS && req.headers().contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn preflight(&self) -> Response {
        let mut res = Response::status(StatusCode::OK);
        let headers = res.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age.as_secs()));
        res
    }
}

fn vary(res: &mut Response) {
    let headers = res.headers_mut();
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    headers.append(header::VARY, HeaderValue::from_static("Access-Control-Request-Method"));
}

impl Middleware for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .filter(|v| v.to_str().is_ok_and(|o| self.is_trusted(o)))
            .cloned();

        let Some(origin) = origin else {
            return Box::pin(async move {
                let mut res = next.run(req).await;
                vary(&mut res);
                res
            });
        };

        if Self::is_preflight(&req) {
            tracing::debug!(origin = ?origin, path = req.path(), "answering preflight");
            let mut res = self.preflight();
            res.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            vary(&mut res);
            return Box::pin(future::ready(res));
        }

        Box::pin(async move {
            let mut res = next.run(req).await;
            res.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            vary(&mut res);
            res
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::router::Router;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(calls: &Arc<AtomicUsize>) -> Pipeline {
        let calls = Arc::clone(calls);
        let router = Router::new().put("/v1/movies/{id}", move |_req: Request| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { "updated" }
        });
        Pipeline::builder(router)
            .stage(Cors::new(["https://app.example.com", "null"], Duration::from_secs(60)))
            .build()
    }

    fn request(method: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().method(method).uri("/v1/movies/1");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Request::from(builder.body(Bytes::new()).unwrap())
    }

    fn vary_values(res: &Response) -> Vec<&str> {
        res.headers().get_all(header::VARY).iter().filter_map(|v| v.to_str().ok()).collect()
    }

    #[tokio::test]
    async fn trusted_preflight_is_answered_without_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = pipeline(&calls)
            .handle(request(
                "OPTIONS",
                &[("origin", "https://app.example.com"), ("access-control-request-method", "PUT")],
            ))
            .await;

        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example.com"));
        assert_eq!(res.header("access-control-allow-methods"), Some(ALLOW_METHODS));
        assert_eq!(res.header("access-control-allow-headers"), Some(ALLOW_HEADERS));
        assert_eq!(res.header("access-control-max-age"), Some("60"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trusted_simple_request_gets_allow_origin() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = pipeline(&calls).handle(request("PUT", &[("origin", "https://app.example.com")])).await;
        assert_eq!(res.body(), b"updated");
        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example.com"));
        assert_eq!(vary_values(&res), ["Origin", "Access-Control-Request-Method"]);
    }

    #[tokio::test]
    async fn untrusted_origin_gets_no_cors_headers() {
        let calls = Arc::new(AtomicUsize::new(0));
        for origin in ["https://evil.example.com", "null", "https://app.example.com/"] {
            let res = pipeline(&calls)
                .handle(request("OPTIONS", &[("origin", origin), ("access-control-request-method", "PUT")]))
                .await;
            assert!(res.headers().keys().all(|k| !k.as_str().starts_with("access-control-")), "{origin}");
            assert_eq!(vary_values(&res), ["Origin", "Access-Control-Request-Method"]);
        }
    }
}
