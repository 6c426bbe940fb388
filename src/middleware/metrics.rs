//! Request metrics.
//!
//! The [`Metrics`] stage sits outermost, so it sees every request exactly
//! once, whichever stage ends up answering it. What it observes goes to a
//! [`MetricsSink`]; the default sink, [`ApiMetrics`], keeps Prometheus
//! collectors in a private registry and renders the JSON snapshot served at
//! `/debug/vars`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::{Middleware, Next};
use crate::handler::{BoxFuture, Handler};
use crate::method::Method;
use crate::request::Request;
use crate::response::Json;
use crate::router::Router;

/// Path label for requests that matched no route.
pub const UNMATCHED: &str = "<unmatched>";

/// Method label for extension methods.
pub const OTHER_METHOD: &str = "OTHER";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encode(String),
}

/// One finished request, as the sink sees it.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub method: http::Method,
    /// Route template, or [`UNMATCHED`].
    pub path: Arc<str>,
    pub status: StatusCode,
    pub duration: Duration,
}

/// Where the metrics stage reports to.
pub trait MetricsSink: Send + Sync + 'static {
    /// A request arrived. Called before any other stage runs.
    fn received(&self) -> Result<(), MetricsError> {
        Ok(())
    }

    /// A response is on its way out.
    fn record(&self, record: &RequestRecord) -> Result<(), MetricsError>;

    /// Current totals as a JSON object.
    fn snapshot(&self) -> Value;
}

/// Prometheus-backed [`MetricsSink`].
#[derive(Clone)]
pub struct ApiMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    requests_received: IntCounter,
    responses_sent: IntCounterVec,
    processing_time_us: IntCounter,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
}

impl std::fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMetrics")
            .field("received", &self.requests_received())
            .field("sent", &self.responses_sent())
            .finish()
    }
}

impl ApiMetrics {
    /// Builds the collectors under `namespace` in a fresh registry.
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_received = IntCounter::with_opts(
            Opts::new("http_requests_received_total", "Requests received").namespace(namespace),
        )?;
        let responses_sent = IntCounterVec::new(
            Opts::new("http_responses_sent_total", "Responses sent, by status").namespace(namespace),
            &["status"],
        )?;
        let processing_time_us = IntCounter::with_opts(
            Opts::new("http_processing_time_microseconds_total", "Time spent processing requests")
                .namespace(namespace),
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Requests, by route and status").namespace(namespace),
            &["method", "path", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "Request latency in seconds")
                .namespace(namespace)
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "path"],
        )?;

        registry.register(Box::new(requests_received.clone()))?;
        registry.register(Box::new(responses_sent.clone()))?;
        registry.register(Box::new(processing_time_us.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                requests_received,
                responses_sent,
                processing_time_us,
                requests_total,
                request_duration_seconds,
            }),
        })
    }

    pub fn requests_received(&self) -> u64 {
        self.inner.requests_received.get()
    }

    /// Responses sent, summed over every status.
    pub fn responses_sent(&self) -> u64 {
        self.by_status().iter().map(|(_, n)| n).sum()
    }

    /// `(status, count)` pairs for every status seen so far.
    pub fn by_status(&self) -> Vec<(String, u64)> {
        let mut counts = Vec::new();
        for family in self.inner.responses_sent.collect() {
            for metric in family.get_metric() {
                let status = metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == "status")
                    .map(|l| l.get_value().to_owned())
                    .unwrap_or_default();
                counts.push((status, metric.get_counter().get_value() as u64));
            }
        }
        counts
    }

    /// Count recorded for one (method, path, status) series.
    pub fn requests_for(&self, method: &str, path: &str, status: u16) -> u64 {
        self.inner
            .requests_total
            .get_metric_with_label_values(&[method, path, &status.to_string()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// All collectors in the Prometheus text exposition format.
    pub fn gather_and_encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

impl MetricsSink for ApiMetrics {
    fn received(&self) -> Result<(), MetricsError> {
        self.inner.requests_received.inc();
        Ok(())
    }

    fn record(&self, record: &RequestRecord) -> Result<(), MetricsError> {
        let status = record.status.as_str();
        let method = Method::from_http(&record.method).map_or(OTHER_METHOD, Method::as_str);
        let path = &*record.path;

        self.inner.responses_sent.get_metric_with_label_values(&[status])?.inc();
        self.inner.requests_total.get_metric_with_label_values(&[method, path, status])?.inc();
        self.inner
            .request_duration_seconds
            .get_metric_with_label_values(&[method, path])?
            .observe(record.duration.as_secs_f64());
        let micros = u64::try_from(record.duration.as_micros()).unwrap_or(u64::MAX);
        self.inner.processing_time_us.inc_by(micros);
        Ok(())
    }

    fn snapshot(&self) -> Value {
        let by_status: Map<String, Value> = self.by_status().into_iter().map(|(s, n)| (s, Value::from(n))).collect();
        json!({
            "total_requests_received": self.requests_received(),
            "total_responses_sent": self.responses_sent(),
            "total_processing_time_μs": self.inner.processing_time_us.get(),
            "total_responses_sent_by_status": by_status,
        })
    }
}

/// The metrics stage.
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
    router: Arc<Router>,
}

impl Metrics {
    /// `router` resolves the path label before the request moves on.
    pub fn new(sink: Arc<dyn MetricsSink>, router: Arc<Router>) -> Self {
        Self { sink, router }
    }
}

impl Middleware for Metrics {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn call(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            let start = Instant::now();
            if let Err(e) = self.sink.received() {
                tracing::warn!(error = %e, "failed to count request");
            }

            let method = req.method().clone();
            let path = self
                .router
                .template(&method, req.path())
                .unwrap_or_else(|| Arc::from(UNMATCHED));

            let res = next.run(req).await;

            let record = RequestRecord { method, path, status: res.status_code(), duration: start.elapsed() };
            if let Err(e) = self.sink.record(&record) {
                tracing::warn!(error = %e, path = %record.path, "failed to record request metrics");
            }
            tracing::debug!(
                method = %record.method,
                path = %record.path,
                status = record.status.as_u16(),
                elapsed_us = record.duration.as_micros() as u64,
                "request completed"
            );
            res
        })
    }
}

/// The `/debug/vars` handler: the sink's snapshot plus build and clock info.
pub fn debug_vars(sink: Arc<dyn MetricsSink>, version: &'static str) -> impl Handler {
    move |_req: Request| {
        let mut snapshot = sink.snapshot();
        if let Some(vars) = snapshot.as_object_mut() {
            vars.insert("version".into(), Value::from(version));
            vars.insert("timestamp".into(), Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        async move { Json(snapshot) }
    }
}
