//! Health polling after a backend restart
//!
//! The poller sends `HEAD` requests to the target URL on a fixed cadence.
//! Any HTTP response counts as "up". Polling stops early when the backend's
//! reaper reports an exit. Each attempt waits one interval and then probes
//! with a bounded timeout, so a poll never blocks longer than
//! `attempts * (interval + probe_timeout)`.

use crate::config::HealthSettings;
use crate::error::GateError;
use crate::process::ExitWatch;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct HealthPoller {
    client: Client<HttpConnector, Empty<Bytes>>,
    target: Uri,
    settings: HealthSettings,
}

impl HealthPoller {
    pub fn new(target: Uri, settings: HealthSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(settings.probe_timeout));

        // Probes must never reuse a connection to a previous backend
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            target,
            settings,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Send a single probe. Returns true on any HTTP response.
    pub async fn probe(&self) -> bool {
        let req = match Request::builder()
            .method(Method::HEAD)
            .uri(&self.target)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.settings.probe_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "Health probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!("Health probe timed out");
                false
            }
        }
    }

    /// Poll until the backend answers, exits, or the attempt budget is spent
    pub async fn wait_until_up(&self, mut exit_rx: ExitWatch) -> Result<(), GateError> {
        let start = Instant::now();

        for attempt in 1..=self.settings.attempts {
            if let Some(exit) = exit_rx.borrow().clone() {
                warn!(%exit, "Backend exited while waiting for it to listen");
                return Err(GateError::ProcessExitedEarly(exit.to_string()));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = exit_rx.changed() => {
                    let exit = exit_rx.borrow().clone();
                    let reason = exit
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "exit status unknown".to_string());
                    warn!(%reason, "Backend exited while waiting for it to listen");
                    return Err(GateError::ProcessExitedEarly(reason));
                }
            }

            if self.probe().await {
                info!(
                    attempt,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Backend is up"
                );
                return Ok(());
            }

            debug!(attempt, budget = self.settings.attempts, "Backend not listening yet");
        }

        let waited = start.elapsed();
        warn!(
            attempts = self.settings.attempts,
            waited_ms = waited.as_millis(),
            "Giving up waiting for backend"
        );
        Err(GateError::HealthTimeout {
            attempts: self.settings.attempts,
            waited,
        })
    }
}
