//! Radix-tree route table.
//!
//! One [`matchit`] tree per HTTP method, built once at startup and read-only
//! afterwards. Dispatch distinguishes a path nobody registered (404) from a
//! path registered under other methods (405 with `Allow`). A path that only
//! misses by a trailing slash is redirected to the registered form.

use std::collections::{BTreeSet, HashMap};
use std::future;
use std::sync::Arc;

use http::header::{self, HeaderValue};
use http::StatusCode;
use matchit::Router as MatchitRouter;

use crate::error::ApiError;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

struct Route {
    template: Arc<str>,
    handler: BoxedHandler,
}

/// A successful dispatch: the bound handler plus what the path captured.
pub struct RouteMatch {
    pub handler: BoxedHandler,
    pub params: HashMap<String, String>,
    pub template: Arc<str>,
}

/// Why a dispatch found no handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No method has a route for this path.
    NotFound,
    /// Other methods do. `allowed` is sorted and includes `OPTIONS`.
    MethodNotAllowed { allowed: Vec<Method> },
}

impl DispatchError {
    pub fn into_api_error(self, method: http::Method) -> ApiError {
        match self {
            Self::NotFound => ApiError::NotFound,
            Self::MethodNotAllowed { allowed } => ApiError::MethodNotAllowed { method, allowed },
        }
    }
}

/// The application route table.
///
/// ```rust
/// # use marquee::{Request, Response, Router};
/// # async fn list_movies(_: Request) -> Response { Response::text("") }
/// # async fn show_movie(_: Request) -> Response { Response::text("") }
/// let routes = Router::new()
///     .get("/v1/movies", list_movies)
///     .get("/v1/movies/:id", show_movie);
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
    registered: Vec<(Method, Arc<str>)>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new(), registered: Vec::new() }
    }

    /// Registers a handler for a method and path pattern. Returns `self` for
    /// chaining.
    ///
    /// Captures may be written `:name` or `{name}`, catch-alls `*name` or
    /// `{*name}`; `req.param("name")` retrieves them.
    ///
    /// # Panics
    ///
    /// On a duplicate or conflicting (method, pattern), or a malformed
    /// pattern. The route table is fixed at startup, so this is fatal.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        let template: Arc<str> = normalise(path).into();
        let route = Route { template: Arc::clone(&template), handler: handler.into_boxed_handler() };
        self.routes
            .entry(method)
            .or_default()
            .insert(template.to_string(), route)
            .unwrap_or_else(|e| panic!("invalid route {method} `{path}`: {e}"));
        self.registered.push((method, template));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Put, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Delete, path, handler)
    }

    /// Resolves a request line to its handler.
    pub fn dispatch(&self, method: &http::Method, path: &str) -> Result<RouteMatch, DispatchError> {
        let found = Method::from_http(method)
            .and_then(|m| self.routes.get(&m))
            .and_then(|tree| tree.at(path).ok());

        if let Some(matched) = found {
            return Ok(RouteMatch {
                handler: Arc::clone(&matched.value.handler),
                params: matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect(),
                template: Arc::clone(&matched.value.template),
            });
        }

        let allowed = self.allowed_methods(path);
        if allowed.is_empty() {
            Err(DispatchError::NotFound)
        } else {
            Err(DispatchError::MethodNotAllowed { allowed })
        }
    }

    /// Methods with a route for `path`, plus `OPTIONS` when any exist.
    /// Empty for an unknown path.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let mut allowed: BTreeSet<Method> = self
            .routes
            .iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(method, _)| *method)
            .collect();
        if !allowed.is_empty() {
            allowed.insert(Method::Options);
        }
        allowed.into_iter().collect()
    }

    /// The pattern a request would be labelled with: the one matching its
    /// method, else any method's match for the same path.
    pub fn template(&self, method: &http::Method, path: &str) -> Option<Arc<str>> {
        let own = Method::from_http(method).and_then(|m| self.routes.get(&m));
        own.into_iter()
            .chain(self.routes.values())
            .find_map(|tree| tree.at(path).ok())
            .map(|matched| Arc::clone(&matched.value.template))
    }

    /// Registered (method, pattern) pairs in registration order.
    pub fn routes(&self) -> impl Iterator<Item = (Method, &str)> {
        self.registered.iter().map(|(m, t)| (*m, &**t))
    }

    /// The registered form of `path` when it misses under `method` only by
    /// a trailing slash.
    pub fn trailing_slash_redirect(&self, method: &http::Method, path: &str) -> Option<String> {
        if path == "/" || method == http::Method::CONNECT {
            return None;
        }
        let tree = Method::from_http(method).and_then(|m| self.routes.get(&m))?;
        let toggled = match path.strip_suffix('/') {
            Some(trimmed) => trimmed.to_owned(),
            None => format!("{path}/"),
        };
        let found = tree.at(&toggled).is_ok();
        found.then_some(toggled)
    }

    /// Runs the matched handler, or answers the fallback.
    pub(crate) fn handle(&self, mut req: Request) -> BoxFuture {
        let miss = match self.dispatch(req.method(), req.path()) {
            Ok(matched) => {
                req.params = matched.params;
                req.route = Some(matched.template);
                return matched.handler.call(req);
            }
            Err(miss) => miss,
        };

        if let Some(path) = self.trailing_slash_redirect(req.method(), req.path()) {
            return Box::pin(future::ready(redirect(&req, path)));
        }

        match miss {
            DispatchError::MethodNotAllowed { allowed } if req.method() == http::Method::OPTIONS => {
                let mut res = Response::status(StatusCode::NO_CONTENT);
                if let Ok(v) = HeaderValue::from_str(&Method::join(&allowed)) {
                    res.headers_mut().insert(header::ALLOW, v);
                }
                Box::pin(future::ready(res))
            }
            miss => {
                let err = miss.into_api_error(req.method().clone());
                err.log(&req.summary());
                Box::pin(future::ready(err.into_response()))
            }
        }
    }
}

/// `301` for `GET`, `307` otherwise so the method and body are replayed.
fn redirect(req: &Request, path: String) -> Response {
    let status = if req.method() == http::Method::GET {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::TEMPORARY_REDIRECT
    };
    let location = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    tracing::debug!(from = req.path(), to = %location, status = status.as_u16(), "trailing slash redirect");

    let mut res = Response::status(status);
    if let Ok(v) = HeaderValue::from_str(&location) {
        res.headers_mut().insert(header::LOCATION, v);
    }
    res
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// Rewrites `:name` and `*name` segments to matchit's `{name}` / `{*name}`.
fn normalise(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
