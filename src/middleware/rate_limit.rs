//! Token-bucket rate limiting per client.
//!
//! Each client key owns a bucket of at most `burst` tokens, refilled at `rps`
//! tokens per second. A request takes one token or is refused with `429`.
//! Buckets are created full on first sight and evicted once idle for longer
//! than the configured TTL.
//!
//! Under [`KeyStrategy::Credential`] a token only gets a bucket of its own
//! after [`Authenticate`](super::Authenticate) has accepted it. Until then
//! the request draws from its peer's bucket, so guessing tokens from one
//! address is throttled like any other traffic from it.

use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::header;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::auth::{bearer_token, TokenVerified};
use super::{Middleware, Next};
use crate::config::LimiterConfig;
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::IntoResponse;

/// Lowest sustained rate a limiter accepts, in tokens per second.
pub const MIN_RPS: f64 = 0.001;

/// How a request is mapped to the bucket it draws from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// The TCP peer address.
    #[default]
    Peer,
    /// The originating client per `X-Forwarded-For` / `X-Real-IP`, else the
    /// peer. Clients choose those headers, so only use this behind a proxy
    /// that overwrites them.
    Forwarded,
    /// A digest of a bearer token that has already authenticated once.
    /// Anonymous requests and not yet verified tokens use the peer address.
    Credential,
}

/// Identifies one bucket.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn ip(addr: impl fmt::Display) -> Self {
        Self(format!("ip:{addr}"))
    }

    /// Keys by token digest so the plaintext never sits in the map.
    pub fn token(token: &str) -> Self {
        Self(format!("token:{:x}", Sha256::digest(token.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Bucket {
    tokens: f64,
    last_seen: Instant,
}

impl Bucket {
    /// Refills for the time since the last visit, then tries to take a token.
    /// On refusal, returns how long until one is available.
    fn take(&mut self, now: Instant, rate: f64, burst: f64) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_seen).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_seen = self.last_seen.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::try_from_secs_f64((1.0 - self.tokens) / rate).unwrap_or(Duration::MAX))
        }
    }
}

/// Shared bucket map plus the limits applied to every bucket.
pub struct RateLimiter {
    buckets: DashMap<ClientKey, Bucket>,
    rate: f64,
    burst: f64,
    idle_ttl: Duration,
    strategy: KeyStrategy,
    enabled: bool,
}

impl RateLimiter {
    /// A rate below [`MIN_RPS`], or not a number, is raised to [`MIN_RPS`].
    pub fn new(config: &LimiterConfig) -> Self {
        let rate = if config.rps.is_finite() && config.rps >= MIN_RPS {
            config.rps
        } else {
            tracing::warn!(rps = config.rps, min = MIN_RPS, "rate limit out of range, using the minimum");
            MIN_RPS
        };
        Self {
            buckets: DashMap::new(),
            rate,
            burst: f64::from(config.burst),
            idle_ttl: config.idle_ttl(),
            strategy: config.key,
            enabled: config.enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Takes one token from `key`'s bucket, creating it full if new.
    ///
    /// The refill and decrement happen under the map's shard lock for that
    /// key, so concurrent requests from one client never double-spend.
    pub fn check(&self, key: &ClientKey) -> Result<(), Duration> {
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket { tokens: self.burst, last_seen: Instant::now() });
        bucket.take(Instant::now(), self.rate, self.burst)
    }

    /// Gives a verified credential a full bucket of its own, if it has none.
    pub fn admit(&self, key: &ClientKey) {
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket { tokens: self.burst, last_seen: Instant::now() });
    }

    /// Drops buckets idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) <= self.idle_ttl);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The bucket key for `req` under the configured strategy.
    pub fn key_for(&self, req: &Request) -> ClientKey {
        let peer = || req.remote_addr().map_or_else(|| ClientKey::ip("unknown"), |a| ClientKey::ip(a.ip()));
        match self.strategy {
            KeyStrategy::Peer => peer(),
            KeyStrategy::Forwarded => req.client_ip().map_or_else(|| ClientKey::ip("unknown"), ClientKey::ip),
            KeyStrategy::Credential => self
                .credential_key(req)
                .filter(|token| self.buckets.contains_key(token))
                .unwrap_or_else(peer),
        }
    }

    /// The key `req`'s bearer token would have once verified. `None` unless
    /// keying by credential and a token is presented.
    pub fn credential_key(&self, req: &Request) -> Option<ClientKey> {
        if self.strategy != KeyStrategy::Credential {
            return None;
        }
        req.headers().get(header::AUTHORIZATION).and_then(bearer_token).map(ClientKey::token)
    }

    /// Sweeps every `every` until the limiter is dropped or the task aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else { break };
                let evicted = limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = limiter.len(), "evicted idle rate-limit buckets");
                }
            }
        })
    }
}

/// The rate-limiting stage.
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn call(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        if !self.limiter.enabled() {
            return next.run(req);
        }
        let key = self.limiter.key_for(&req);
        req.set_client_key(key.as_str());

        if let Err(retry_after) = self.limiter.check(&key) {
            tracing::debug!(key = %key, ?retry_after, "bucket empty");
            let err = ApiError::RateLimited { retry_after };
            err.log(&req.summary());
            return Box::pin(future::ready(err.into_response()));
        }

        // A token still drawing on its peer's bucket earns its own once
        // authentication accepts it.
        let Some(token) = self.limiter.credential_key(&req).filter(|token| *token != key) else {
            return next.run(req);
        };
        let verified = TokenVerified::default();
        req.extensions_mut().insert(verified.clone());
        Box::pin(async move {
            let res = next.run(req).await;
            if verified.get() {
                self.limiter.admit(&token);
            }
            res
        })
    }
}
