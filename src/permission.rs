//! Per-route permission gates.
//!
//! Each gate takes a handler and returns a handler that checks the request's
//! [`Principal`](crate::Principal) first. The gates nest: `require_permission`
//! implies `require_activated`, which implies `require_authenticated`.
//!
//! ```rust
//! # use marquee::{Request, Response, Router};
//! use marquee::permission::require_permission;
//!
//! # async fn list_movies(_: Request) -> Response { Response::text("") }
//! let routes = Router::new()
//!     .get("/v1/movies", require_permission("movies:read", list_movies));
//! ```

use std::future;

use crate::error::ApiError;
use crate::handler::{BoxFuture, Handler};
use crate::principal::Principal;
use crate::request::Request;
use crate::response::IntoResponse;

/// Refuses anonymous callers with `401`.
pub fn require_authenticated(handler: impl Handler) -> impl Handler {
    gate(handler, authenticated)
}

/// Additionally refuses callers whose account is not activated with `403`.
pub fn require_activated(handler: impl Handler) -> impl Handler {
    gate(handler, activated)
}

/// Additionally refuses callers lacking `permission` with `403`.
pub fn require_permission(permission: &'static str, handler: impl Handler) -> impl Handler {
    gate(handler, move |p: &Principal| {
        activated(p)?;
        if p.has_permission(permission) {
            Ok(())
        } else {
            Err(ApiError::NotPermitted { permission: permission.to_owned() })
        }
    })
}

fn authenticated(p: &Principal) -> Result<(), ApiError> {
    if p.is_anonymous() { Err(ApiError::NotAuthenticated) } else { Ok(()) }
}

fn activated(p: &Principal) -> Result<(), ApiError> {
    authenticated(p)?;
    if p.is_activated() { Ok(()) } else { Err(ApiError::NotActivated) }
}

fn gate<C>(handler: impl Handler, check: C) -> impl Handler
where
    C: Fn(&Principal) -> Result<(), ApiError> + Send + Sync + 'static,
{
    let inner = handler.into_boxed_handler();
    move |req: Request| -> BoxFuture {
        match check(req.principal()) {
            Ok(()) => inner.call(req),
            Err(err) => {
                tracing::debug!(principal = %req.principal().identity(), route = ?req.route(), "permission gate refused");
                err.log(&req.summary());
                Box::pin(future::ready(err.into_response()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::{Permissions, UserId, MOVIES_READ, MOVIES_WRITE};
    use crate::response::Response;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handler(calls: &Arc<AtomicUsize>) -> impl Handler {
        let calls = Arc::clone(calls);
        move |_req: Request| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Response::text("ok") }
        }
    }

    fn request(principal: Principal) -> Request {
        Request::from(http::Request::new(Bytes::new())).with_principal(principal)
    }

    fn user(activated: bool, perms: &[&str]) -> Principal {
        Principal::user(UserId(1), activated, perms.iter().copied().collect::<Permissions>())
    }

    #[tokio::test]
    async fn anonymous_is_not_authenticated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gated = require_permission(MOVIES_READ, counting_handler(&calls)).into_boxed_handler();

        let res = gated.call(request(Principal::anonymous())).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_permission_is_forbidden() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gated = require_permission(MOVIES_WRITE, counting_handler(&calls)).into_boxed_handler();

        let res = gated.call(request(user(true, &[MOVIES_READ]))).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(
            body["error"],
            "your user account doesn't have the necessary permissions to access this resource"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inactive_account_is_forbidden_before_permission_check() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gated = require_permission(MOVIES_READ, counting_handler(&calls)).into_boxed_handler();

        let res = gated.call(request(user(false, &[MOVIES_READ]))).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "your user account must be activated to access this resource");
    }

    #[tokio::test]
    async fn permitted_caller_invokes_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gated = require_permission(MOVIES_READ, counting_handler(&calls)).into_boxed_handler();

        let res = gated.call(request(user(true, &[MOVIES_READ]))).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authenticated_gate_ignores_activation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gated = require_authenticated(counting_handler(&calls)).into_boxed_handler();

        assert_eq!(gated.call(request(user(false, &[]))).await.status_code(), StatusCode::OK);
        assert_eq!(gated.call(request(Principal::anonymous())).await.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
