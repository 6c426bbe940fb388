//! Incoming HTTP request type.
//!
//! A [`Request`] is the buffered request plus its per-request context: the
//! peer address, the resolved [`Principal`] and, once the route table has
//! matched it, the path parameters and route template. It is created by the
//! server for each request and dropped with the response.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Uri};

use crate::principal::Principal;

/// An incoming HTTP request with a fully buffered body.
pub struct Request {
    pub(crate) parts: Parts,
    pub(crate) body: Bytes,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) params: HashMap<String, String>,
    pub(crate) route: Option<Arc<str>>,
    pub(crate) principal: Principal,
    pub(crate) client_key: Option<Arc<str>>,
}

impl Request {
    pub(crate) fn new(parts: Parts, body: Bytes, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            parts,
            body,
            remote_addr,
            params: HashMap::new(),
            route: None,
            principal: Principal::anonymous(),
            client_key: None,
        }
    }

    /// Attaches the peer address. The server does this for every connection;
    /// tests use it to simulate distinct clients.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Replaces the principal. Normally only the authentication stage does this.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    pub fn method(&self) -> &http::Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn principal(&self) -> &Principal { &self.principal }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Header lookup. Returns `None` for absent or non-UTF-8 values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/v1/movies/:id`, `req.param("id")` on `/v1/movies/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The pattern this request matched, e.g. `/v1/movies/{id}`. `None`
    /// before routing and for unmatched requests.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// The originating client address, honouring proxy headers.
    ///
    /// First valid hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer.
    pub fn client_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse().ok());
        forwarded
            .or_else(|| self.header("x-real-ip").and_then(|v| v.trim().parse().ok()))
            .or_else(|| self.remote_addr.map(|a| a.ip()))
    }

    pub(crate) fn set_principal(&mut self, principal: Principal) {
        self.principal = principal;
    }

    /// Records the rate limiter's key so later failure logs carry it.
    pub(crate) fn set_client_key(&mut self, key: impl Into<Arc<str>>) {
        self.client_key = Some(key.into());
    }

    pub(crate) fn extensions(&self) -> &http::Extensions {
        &self.parts.extensions
    }

    pub(crate) fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.parts.extensions
    }

    /// What a log line needs to correlate this request after it has moved on.
    /// The limiter key is included only when it says something the client
    /// address does not.
    pub fn summary(&self) -> RequestSummary {
        let client = self
            .client_ip()
            .map_or_else(|| "unknown".to_owned(), |ip| ip.to_string());
        let key = self
            .client_key
            .as_deref()
            .filter(|key| key.strip_prefix("ip:") != Some(client.as_str()))
            .map(str::to_owned);
        RequestSummary { method: self.parts.method.clone(), path: self.path().to_owned(), client, key }
    }
}

/// Builds a request from an `http` request, e.g. in tests or when embedding
/// the pipeline behind another server.
impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body, None)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("remote_addr", &self.remote_addr)
            .field("principal", &self.principal.identity())
            .finish_non_exhaustive()
    }
}

/// Method, path and client of one request, for failure logs.
#[derive(Clone, Debug)]
pub struct RequestSummary {
    pub method: http::Method,
    pub path: String,
    pub client: String,
    /// The rate limiter's bucket key, when it differs from `ip:<client>`.
    pub key: Option<String>,
}
