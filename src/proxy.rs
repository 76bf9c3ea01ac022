use crate::config::{LockScope, ProxyConfig};
use crate::error::{diagnostic_response, GateError};
use crate::output::{render_failure, DiagnosticBuffer};
use crate::pipeline::ReloadPipeline;
use crate::relay::Relay;
use crate::stats::GateStats;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The gate: reloads the backend when needed, then relays the request.
///
/// Every request takes the coordination lock before checking staleness. With
/// `LockScope::Request` the lock travels inside the response body and is only
/// released once the body has been sent (or dropped), so no reload can tear
/// down a backend that is still answering.
pub struct Gate {
    pipeline: Arc<Mutex<ReloadPipeline>>,
    relay: Relay,
    stats: Arc<GateStats>,
    lock_scope: LockScope,
}

impl Gate {
    pub fn new(config: &ProxyConfig) -> Self {
        let stats = Arc::new(GateStats::default());
        Self {
            pipeline: Arc::new(Mutex::new(ReloadPipeline::new(config, Arc::clone(&stats)))),
            relay: Relay::new(
                config.target.clone(),
                config.pool_max_idle_per_host,
                config.pool_idle_timeout,
            ),
            stats,
            lock_scope: config.lock_scope,
        }
    }

    pub fn stats(&self) -> Arc<GateStats> {
        Arc::clone(&self.stats)
    }

    pub async fn handle(
        &self,
        mut req: Request<BoxBody<Bytes, hyper::Error>>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.stats.record_request();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let pipeline = Arc::clone(&self.pipeline).lock_owned().await;
        let buffer = pipeline.buffer().clone();

        // The reload owns the lock in its own task, so a client that goes
        // away mid-reload does not abandon the backend half started
        let pipeline = match tokio::spawn(reload_if_needed(pipeline)).await {
            Ok((pipeline, Ok(()))) => pipeline,
            Ok((pipeline, Err(e))) => {
                return diagnostic_response(e.code(), &e.to_string(), &pipeline.buffer().snapshot());
            }
            Err(e) => {
                error!(request_id, error = %e, "Reload task did not complete");
                let err = GateError::ReloadAborted(e.to_string());
                return diagnostic_response(err.code(), &err.to_string(), &buffer.snapshot());
            }
        };

        let guard = match self.lock_scope {
            LockScope::Request => Some(pipeline),
            LockScope::Reload => {
                drop(pipeline);
                None
            }
        };

        let response = match self.relay.forward(req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_relay_failure();
                error!(request_id, error = %e, "Failed to relay request to backend");
                let err = GateError::Relay(e.to_string());
                return diagnostic_response(err.code(), &err.to_string(), &buffer.snapshot());
            }
        };

        if response.status().is_server_error() {
            warn!(request_id, status = %response.status(), "Backend answered with a server error");
            return append_diagnostics(response, &buffer).await;
        }

        match guard {
            Some(guard) => response.map(|body| GuardedBody::new(body, guard).boxed()),
            None => response,
        }
    }

    /// Stop the backend. Waits for any in-flight request holding the lock.
    pub async fn shutdown(&self) -> bool {
        let stopped = self.pipeline.lock().await.stop().await;
        if stopped {
            info!("Backend stopped");
        }
        stopped
    }
}

async fn reload_if_needed(
    mut pipeline: OwnedMutexGuard<ReloadPipeline>,
) -> (OwnedMutexGuard<ReloadPipeline>, Result<(), GateError>) {
    let result = if pipeline.needs_reload().await {
        pipeline.reload().await
    } else {
        Ok(())
    };
    (pipeline, result)
}

/// Replace a server-error body with the original body plus the diagnostic section
async fn append_diagnostics(
    response: Response<BoxBody<Bytes, hyper::Error>>,
    buffer: &DiagnosticBuffer,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (mut parts, body) = response.into_parts();

    let original = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Backend error body was cut short");
            Bytes::new()
        }
    };
    let rendered = render_failure(&String::from_utf8_lossy(&original), &buffer.snapshot());

    // Length is recomputed from the new body
    parts.headers.remove(hyper::header::CONTENT_LENGTH);
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);

    Response::from_parts(
        parts,
        Full::new(Bytes::from(rendered)).map_err(|never| match never {}).boxed(),
    )
}

/// Response body that holds the coordination lock until it is finished
pub struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    guard: Option<OwnedMutexGuard<ReloadPipeline>>,
}

impl GuardedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, guard: OwnedMutexGuard<ReloadPipeline>) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard = None;
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// HTTP listener in front of the gate
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gate: Arc<Gate>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gate: Arc<Gate>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gate,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, gate: Arc<Gate>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        async move { Ok::<_, hyper::Error>(gate.handle(req.map(|body| body.boxed()), addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
