//! HTTP server and graceful shutdown.
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. stops accepting connections,
//! 2. tells every open connection to finish its in-flight request and close
//!    (HTTP/1 keep-alive ends, HTTP/2 sends GOAWAY),
//! 3. waits for all connection tasks, stops the rate limiter's sweeper and
//!    returns from [`Server::serve`].
//!
//! Request bodies are read in full, up to the configured cap, before the
//! pipeline sees the request. An oversized body gets `413` and an unreadable
//! one `400`, straight from here.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited, LengthLimitError};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app::App;
use crate::config::ServerConfig;
use crate::error::{ApiError, Error};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    max_body_bytes: usize,
}

impl Server {
    /// Configures the server to listen on `addr` (`host:port`).
    ///
    /// ```rust
    /// use marquee::Server;
    /// let server = Server::bind("127.0.0.1:4000").unwrap();
    /// assert!(Server::bind("localhost").is_err());
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|source| Error::Address { addr: addr.to_owned(), source })?;
        Ok(Self { addr, max_body_bytes: DEFAULT_MAX_BODY_BYTES })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, Error> {
        Ok(Self::bind(&config.bind_address)?.max_body_bytes(config.max_body_bytes))
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, app: App) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_with_listener(listener, app, shutdown_signal()).await
    }

    /// Serves `app` on an already bound listener until `shutdown` resolves.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        app: App,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let local_addr = listener.local_addr()?;
        let app = Arc::new(app);
        let max_body = self.max_body_bytes;

        let sweeper = app
            .limiter()
            .enabled()
            .then(|| app.limiter().spawn_sweeper(app.sweep_interval()));

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        info!(addr = %local_addr, version = crate::VERSION, "listening");

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    let app = Arc::clone(&app);
                    let drain = drain_rx.clone();
                    tasks.spawn(serve_connection(stream, remote_addr, app, max_body, drain));
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        let _ = drain_tx.send(true);
        while tasks.join_next().await.is_some() {}
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        info!("stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    app: Arc<App>,
    max_body: usize,
    mut drain: watch::Receiver<bool>,
) {
    let svc = service_fn(move |req: hyper::Request<Incoming>| {
        let app = Arc::clone(&app);
        async move {
            let res = dispatch(&app, req, remote_addr, max_body).await;
            Ok::<_, Infallible>(res.into_inner())
        }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    warn!(peer = %remote_addr, "connection error: {e}");
                }
                break;
            }
            Ok(()) = drain.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Buffers the body, then runs the request through the pipeline.
async fn dispatch(app: &App, req: hyper::Request<Incoming>, remote_addr: SocketAddr, max_body: usize) -> Response {
    let (parts, body) = req.into_parts();
    match Limited::new(body, max_body).collect().await {
        Ok(collected) => app.handle(Request::new(parts, collected.to_bytes(), Some(remote_addr))).await,
        Err(e) => {
            let err = if e.downcast_ref::<LengthLimitError>().is_some() {
                ApiError::PayloadTooLarge
            } else {
                ApiError::BadRequest("the request body could not be read".into())
            };
            err.log(&Request::new(parts, Bytes::new(), Some(remote_addr)).summary());
            err.into_response()
        }
    }
}

/// Resolves on the first SIGTERM or Ctrl-C. If a handler cannot be
/// installed, that signal is ignored and logged.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
