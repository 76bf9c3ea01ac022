//! Stop → Build → Start → Poll, as one unit
//!
//! A `ReloadPipeline` owns every piece of mutable gate state: the backend
//! process, the diagnostic buffer and the state of the last reload. The gate
//! keeps it behind its coordination lock, so reloads are totally ordered.

use crate::builder::Builder;
use crate::config::ProxyConfig;
use crate::error::GateError;
use crate::health::HealthPoller;
use crate::output::DiagnosticBuffer;
use crate::process::ProcessSupervisor;
use crate::staleness::StalenessChecker;
use crate::stats::GateStats;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Phase of a reload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPhase {
    #[default]
    Idle,
    Stopping,
    Building,
    Starting,
    Polling,
    Healthy,
    Failed,
}

/// Where the last reload attempt got to, and why it ended
#[derive(Debug, Clone, Default)]
pub struct ReloadState {
    pub phase: ReloadPhase,
    pub error: Option<String>,
}

pub struct ReloadPipeline {
    checker: StalenessChecker,
    builder: Builder,
    supervisor: ProcessSupervisor,
    poller: HealthPoller,
    buffer: DiagnosticBuffer,
    stats: Arc<GateStats>,
    state: ReloadState,
}

impl ReloadPipeline {
    pub fn new(config: &ProxyConfig, stats: Arc<GateStats>) -> Self {
        let buffer = DiagnosticBuffer::new();
        Self {
            checker: StalenessChecker::new(config.check.clone()),
            builder: Builder::new(config.build.clone(), buffer.clone()),
            supervisor: ProcessSupervisor::new(config.run.clone(), buffer.clone(), config.stop),
            poller: HealthPoller::new(config.target.clone(), config.health),
            buffer,
            stats,
            state: ReloadState::default(),
        }
    }

    /// True unless the last reload reached `Healthy`, the backend is still
    /// running and the staleness check passes.
    ///
    /// A reload that was cancelled partway (its future dropped) leaves an
    /// intermediate phase behind, so it is retried like a failed one.
    pub async fn needs_reload(&self) -> bool {
        if self.state.phase != ReloadPhase::Healthy {
            info!(phase = ?self.state.phase, "No healthy backend, reloading");
            return true;
        }
        if !self.supervisor.is_running() {
            info!("Backend is not running, reloading");
            return true;
        }
        if self.checker.is_stale().await {
            info!("Backend is out of date, reloading");
            return true;
        }
        false
    }

    /// Run a full reload. A backend that fails its health poll stays
    /// registered; the next reload's stop cleans it up.
    pub async fn reload(&mut self) -> Result<(), GateError> {
        let start = Instant::now();
        let ticket = self.stats.reload_started();

        let result = self.run_phases().await;

        match result {
            Ok(()) => {
                ticket.succeeded();
                self.enter(ReloadPhase::Healthy);
                self.state.error = None;
                info!(duration_ms = start.elapsed().as_millis(), "Reload complete");
            }
            Err(ref e) => {
                drop(ticket);
                self.enter(ReloadPhase::Failed);
                self.state.error = Some(e.to_string());
                error!(error = %e, duration_ms = start.elapsed().as_millis(), "Reload failed");
            }
        }
        result
    }

    async fn run_phases(&mut self) -> Result<(), GateError> {
        self.enter(ReloadPhase::Stopping);
        // Stop resets the buffer when it released a backend; otherwise reset
        // here so every cycle starts from an empty buffer exactly once
        if !self.supervisor.stop().await {
            self.buffer.reset();
        }

        self.enter(ReloadPhase::Building);
        self.stats.record_build();
        self.builder.build().await?;

        self.enter(ReloadPhase::Starting);
        self.stats.record_start();
        self.supervisor.start()?;

        self.enter(ReloadPhase::Polling);
        let Some(exit_rx) = self.supervisor.exit_watch() else {
            return Err(GateError::ProcessExitedEarly("no backend registered".to_string()));
        };
        self.poller.wait_until_up(exit_rx).await
    }

    fn enter(&mut self, phase: ReloadPhase) {
        debug!(from = ?self.state.phase, to = ?phase, "Reload phase");
        self.state.phase = phase;
    }

    /// Stop the backend (used on shutdown)
    pub async fn stop(&mut self) -> bool {
        let stopped = self.supervisor.stop().await;
        self.state = ReloadState::default();
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn buffer(&self) -> &DiagnosticBuffer {
        &self.buffer
    }

    pub fn state(&self) -> &ReloadState {
        &self.state
    }
}
