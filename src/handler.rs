//! Handler trait and type erasure.
//!
//! The route table stores handlers of different concrete types side by side,
//! and the permission gates wrap one handler in another. Both need a single
//! uniform type, so every handler is erased behind `dyn ErasedHandler`:
//!
//! ```text
//! async fn show_movie(req: Request) -> Result<Response, ApiError>
//!        ↓ router.get("/v1/movies/:id", show_movie)
//! show_movie.into_boxed_handler()        blanket impl below
//!        ↓
//! Arc::new(FnHandler(show_movie))        stored as BoxedHandler
//!        ↓
//! handler.call(req)                      one virtual call per request
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future that resolves to a [`Response`].
///
/// Handlers and pipeline stages both return this. `Send + 'static` lets tokio
/// move it between worker threads.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied automatically by any function or closure of the shape
///
/// ```text
/// Fn(Request) -> impl Future<Output = impl IntoResponse>
/// ```
///
/// Sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use bytes::Bytes;
    use http::StatusCode;

    fn request() -> Request {
        Request::from(http::Request::new(Bytes::new()))
    }

    #[tokio::test]
    async fn async_fn_and_closure_both_erase() {
        async fn hello(_: Request) -> &'static str {
            "hello"
        }
        let named = hello.into_boxed_handler();
        let closure = (|_req: Request| async { Err::<Response, _>(ApiError::NotFound) }).into_boxed_handler();

        assert_eq!(named.call(request()).await.body(), b"hello");
        assert_eq!(closure.call(request()).await.status_code(), StatusCode::NOT_FOUND);
    }
}
