//! Bearer-token authentication stage.
//!
//! Resolves the caller's [`Principal`] and attaches it to the request:
//!
//! | `Authorization` header        | Outcome                                  |
//! |-------------------------------|------------------------------------------|
//! | absent                        | anonymous principal, forward             |
//! | `Bearer <token>`, known token | the store's principal, forward           |
//! | anything else                 | `401`, `WWW-Authenticate: Bearer`, stop  |
//!
//! Deciding whether an anonymous caller may proceed is left to the
//! per-route permission gates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{self, HeaderValue};
use thiserror::Error;

use super::{Middleware, Next};
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::principal::Principal;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Length of a token's plaintext: 16 random bytes, base32 without padding.
pub const TOKEN_LENGTH: usize = 26;

/// Failure talking to the identity store. Not the caller's fault.
#[derive(Debug, Error)]
#[error("identity store: {0}")]
pub struct StoreError(pub String);

/// Looks up the principal an authentication token stands for.
#[async_trait]
pub trait IdentityStore: Send + Sync + 'static {
    /// `Ok(None)` for an unknown or expired token.
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, StoreError>;
}

/// Extracts the token from an `Authorization: Bearer <token>` value.
///
/// `None` for any other shape: other scheme, empty token, extra parts.
pub fn bearer_token(value: &HeaderValue) -> Option<&str> {
    let value = value.to_str().ok()?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Some(token),
        _ => None,
    }
}

/// Whether `token` could be a token plaintext at all. Saves a store
/// round-trip for garbage.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

/// Placed in a request's extensions by an outer stage that wants to know
/// whether the presented token was accepted.
#[derive(Clone, Debug, Default)]
pub(crate) struct TokenVerified(Arc<AtomicBool>);

impl TokenVerified {
    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The authentication stage.
pub struct Authenticate {
    store: Arc<dyn IdentityStore>,
}

impl Authenticate {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    async fn resolve(&self, req: &Request) -> Result<Principal, ApiError> {
        let Some(value) = req.headers().get(header::AUTHORIZATION) else {
            return Ok(Principal::anonymous());
        };
        let token = bearer_token(value).ok_or(ApiError::InvalidCredential)?;
        if !is_well_formed(token) {
            return Err(ApiError::InvalidCredential);
        }
        match self.store.principal_for_token(token).await {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => Err(ApiError::InvalidCredential),
            Err(e) => Err(ApiError::internal(e.to_string())),
        }
    }
}

impl Middleware for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn call(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            let mut res = match self.resolve(&req).await {
                Ok(principal) => {
                    tracing::trace!(principal = %principal.identity(), "authenticated");
                    if !principal.is_anonymous() {
                        if let Some(verified) = req.extensions().get::<TokenVerified>() {
                            verified.set();
                        }
                    }
                    req.set_principal(principal);
                    next.run(req).await
                }
                Err(err) => {
                    err.log(&req.summary());
                    err.into_response()
                }
            };
            vary_on_authorization(&mut res);
            res
        })
    }
}

fn vary_on_authorization(res: &mut Response) {
    res.headers_mut().append(header::VARY, HeaderValue::from_static("Authorization"));
}
