//! Panic recovery.
//!
//! A panic anywhere downstream unwinds into this stage, is logged, and turns
//! into a single `500`. The response carries `Connection: close`, so hyper
//! drops the connection once it is written.
//!
//! Responses are buffered in full before the server writes them, so a panic
//! can never interrupt a response that is already on the wire.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::header::{self, HeaderValue};

use super::{Middleware, Next};
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::IntoResponse;

/// The recovery stage.
#[derive(Debug, Default)]
pub struct Recover;

impl Middleware for Recover {
    fn name(&self) -> &'static str {
        "recover"
    }

    fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        let summary = req.summary();
        Box::pin(async move {
            let downstream = async move { next.run(req).await };
            match AssertUnwindSafe(downstream).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => {
                    let err = ApiError::internal(format!("handler panicked: {}", panic_message(&*payload)));
                    err.log(&summary);
                    let mut res = err.into_response();
                    res.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
                    res
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
