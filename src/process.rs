use crate::command::ShellCommand;
use crate::config::{StopSettings, StopSignal};
use crate::error::GateError;
use crate::output::{pump, DiagnosticBuffer};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the reaper waits for buffered output after the backend exits.
/// Grandchildren may hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How a backend process ended, as observed by its reaper task
#[derive(Debug, Clone)]
pub enum ProcessExit {
    Exited(ExitStatus),
    WaitFailed(String),
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Exited(status) => write!(f, "{}", status),
            ProcessExit::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Receiver side of a backend's exit notification. `None` while running.
pub type ExitWatch = watch::Receiver<Option<ProcessExit>>;

/// Handle to the single backend process.
///
/// The `Child` itself lives in the reaper task; the handle only keeps the
/// pid, the exit notification and a way to ask the reaper for a hard kill.
struct BackendHandle {
    pid: u32,
    exit_rx: ExitWatch,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl BackendHandle {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Owns at most one running backend.
///
/// All methods take `&mut self`; the supervisor is only touched while the
/// gate's coordination lock is held. The reaper task never writes into the
/// supervisor, it reports exits through a `watch` channel.
pub struct ProcessSupervisor {
    command: ShellCommand,
    buffer: DiagnosticBuffer,
    stop: StopSettings,
    handle: Option<BackendHandle>,
}

impl ProcessSupervisor {
    pub fn new(command: ShellCommand, buffer: DiagnosticBuffer, stop: StopSettings) -> Self {
        Self {
            command,
            buffer,
            stop,
            handle: None,
        }
    }

    /// True iff a backend was launched and has not been observed to exit
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.has_exited())
    }

    /// Pid of the registered backend, live or not
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    /// Exit notification of the registered backend
    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.handle.as_ref().map(|h| h.exit_rx.clone())
    }

    /// Launch the run command. Fails if a backend is still live.
    pub fn start(&mut self) -> Result<(), GateError> {
        if let Some(ref handle) = self.handle {
            if !handle.has_exited() {
                return Err(GateError::AlreadyRunning { pid: handle.pid });
            }
        }

        info!(command = %self.command.script(), "Starting backend");

        let mut child = self.command.spawn_piped(true).map_err(GateError::Start)?;
        let pid = child.id().unwrap_or(0);

        let writer = self.buffer.writer();
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, writer.clone(), "backend")));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, writer, "backend")));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(reap(child, pid, pumps, exit_tx, kill_rx));

        info!(pid, "Backend process spawned");

        self.handle = Some(BackendHandle {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        });
        Ok(())
    }

    /// Stop the backend if there is one, release its handle and reset the
    /// diagnostic buffer. Returns false (and does nothing) without a handle.
    ///
    /// The signal is sent right away; waiting for the exit is bounded by the
    /// grace period and relies on the reaper's notification.
    pub async fn stop(&mut self) -> bool {
        let Some(mut handle) = self.handle.take() else {
            return false;
        };

        if !handle.has_exited() {
            match self.stop.signal {
                StopSignal::Term => {
                    info!(pid = handle.pid, "Sending SIGTERM to backend");
                    send_signal(&mut handle, Signal::Term);
                    if !wait_for_exit(&mut handle.exit_rx, self.stop.grace_period).await {
                        warn!(
                            pid = handle.pid,
                            grace_period_ms = self.stop.grace_period.as_millis(),
                            "Grace period exceeded, sending SIGKILL"
                        );
                        send_signal(&mut handle, Signal::Kill);
                        wait_for_exit(&mut handle.exit_rx, self.stop.grace_period).await;
                    }
                }
                StopSignal::Kill => {
                    info!(pid = handle.pid, "Sending SIGKILL to backend");
                    send_signal(&mut handle, Signal::Kill);
                    wait_for_exit(&mut handle.exit_rx, self.stop.grace_period).await;
                }
            }
        } else {
            debug!(pid = handle.pid, "Releasing handle of exited backend");
        }

        // Whatever the backend left behind in its group goes too, even when
        // the shell itself already exited
        #[cfg(unix)]
        kill_leftover_group(handle.pid);

        self.buffer.reset();
        true
    }
}

/// Wait on the child and publish its exit once its output has been drained.
/// A message on `kill_rx` forces a kill of the direct child (fallback when
/// group signalling is unavailable).
async fn reap(
    mut child: Child,
    pid: u32,
    pumps: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let result = tokio::select! {
        result = child.wait() => result,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "Failed to kill backend");
            }
            child.wait().await
        }
    };

    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        for task in pumps {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!(pid, "Backend output still open after exit");
    }

    let exit = match result {
        Ok(status) => {
            info!(pid, %status, "Backend process exited");
            ProcessExit::Exited(status)
        }
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for backend to exit");
            ProcessExit::WaitFailed(e.to_string())
        }
    };
    let _ = exit_tx.send(Some(exit));
}

/// Wait for the exit notification, up to `limit`. Returns true once exited.
async fn wait_for_exit(exit_rx: &mut ExitWatch, limit: Duration) -> bool {
    tokio::time::timeout(limit, exit_rx.wait_for(|exit| exit.is_some()))
        .await
        .is_ok()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the backend's process group, falling back to killing the direct
/// child through the reaper.
fn send_signal(handle: &mut BackendHandle, signal: Signal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        match signal_group(handle.pid, sig) {
            Ok(()) => return,
            Err(e) => {
                debug!(pid = handle.pid, error = %e, "Group signal failed, killing child directly")
            }
        }
    }

    #[cfg(not(unix))]
    let _ = signal;

    if let Some(kill_tx) = handle.kill_tx.take() {
        let _ = kill_tx.send(());
    }
}

/// Send `sig` to the process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    if pid == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // The backend leads its own group, so -pid addresses all of it
    if unsafe { libc::kill(-(pid as i32), sig) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// SIGKILL whatever is left of the backend's group. An empty group is fine.
#[cfg(unix)]
fn kill_leftover_group(pid: u32) {
    match signal_group(pid, libc::SIGKILL) {
        Ok(()) => debug!(pid, "Killed leftover backend processes"),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill leftover backend processes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(script: &str) -> (ProcessSupervisor, DiagnosticBuffer) {
        let buffer = DiagnosticBuffer::new();
        let stop = StopSettings {
            signal: StopSignal::Term,
            grace_period: Duration::from_millis(500),
        };
        (
            ProcessSupervisor::new(ShellCommand::new(script), buffer.clone(), stop),
            buffer,
        )
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let (supervisor, _) = supervisor("sleep 30");

        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());
        assert!(supervisor.exit_watch().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_backend_is_noop() {
        let (mut supervisor, buffer) = supervisor("sleep 30");
        buffer.writer().append(b"kept\n");

        assert!(!supervisor.stop().await);
        assert!(!supervisor.stop().await);
        // No handle, so nothing was reset
        assert_eq!(buffer.snapshot(), b"kept\n");
    }

    #[tokio::test]
    async fn test_start_and_stop_backend() {
        let (mut supervisor, _) = supervisor("sleep 30");

        supervisor.start().unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.pid().is_some());

        let mut exit_rx = supervisor.exit_watch().unwrap();

        assert!(supervisor.stop().await);
        assert!(!supervisor.is_running());

        // The reaper observed the exit
        assert!(wait_for_exit(&mut exit_rx, Duration::from_secs(2)).await);

        // Second stop has nothing left to signal
        assert!(!supervisor.stop().await);
    }

    #[tokio::test]
    async fn test_start_while_running_is_an_error() {
        let (mut supervisor, _) = supervisor("sleep 30");

        supervisor.start().unwrap();
        let pid = supervisor.pid().unwrap();

        match supervisor.start() {
            Err(GateError::AlreadyRunning { pid: running }) => assert_eq!(running, pid),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_exit_is_observed_without_polling() {
        let (mut supervisor, buffer) = supervisor("echo started; exit 7");

        supervisor.start().unwrap();
        let mut exit_rx = supervisor.exit_watch().unwrap();
        assert!(wait_for_exit(&mut exit_rx, Duration::from_secs(5)).await);

        assert!(!supervisor.is_running());
        match exit_rx.borrow().clone() {
            Some(ProcessExit::Exited(status)) => assert_eq!(status.code(), Some(7)),
            other => panic!("unexpected exit report: {:?}", other),
        }

        // Output is captured by the pump tasks
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(String::from_utf8_lossy(&buffer.snapshot()).contains("started"));

        // A new backend may start once the old one is gone
        supervisor.start().unwrap();
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_resets_buffer() {
        let (mut supervisor, buffer) = supervisor("echo from-backend; sleep 30");

        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!buffer.is_empty());

        supervisor.stop().await;
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_term_ignored_escalates_to_kill() {
        let buffer = DiagnosticBuffer::new();
        let stop = StopSettings {
            signal: StopSignal::Term,
            grace_period: Duration::from_millis(200),
        };
        let mut supervisor = ProcessSupervisor::new(
            ShellCommand::new("trap '' TERM; while true; do sleep 0.05; done"),
            buffer,
            stop,
        );

        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut exit_rx = supervisor.exit_watch().unwrap();

        supervisor.stop().await;
        assert!(wait_for_exit(&mut exit_rx, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_kill_signal() {
        let buffer = DiagnosticBuffer::new();
        let stop = StopSettings {
            signal: StopSignal::Kill,
            grace_period: Duration::from_millis(500),
        };
        let mut supervisor =
            ProcessSupervisor::new(ShellCommand::new("sleep 30"), buffer, stop);

        supervisor.start().unwrap();
        let mut exit_rx = supervisor.exit_watch().unwrap();

        assert!(supervisor.stop().await);
        assert!(wait_for_exit(&mut exit_rx, Duration::from_secs(2)).await);
    }

    /// Alive and not a zombie
    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                // State follows the parenthesised command name
                let state = stat.rsplit(')').next().and_then(|rest| rest.trim().chars().next());
                !matches!(state, Some('Z') | Some('X'))
            }
            Err(_) if std::path::Path::new("/proc/self").exists() => false,
            Err(_) => unsafe { libc::kill(pid, 0) == 0 },
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_children_of_exited_backend() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!(
            "sleep 30 >/dev/null 2>&1 & echo $! > '{}'; exit 0",
            pidfile.display()
        );
        let (mut supervisor, _) = supervisor(&script);

        supervisor.start().unwrap();
        let mut exit_rx = supervisor.exit_watch().unwrap();
        assert!(wait_for_exit(&mut exit_rx, Duration::from_secs(5)).await);
        assert!(!supervisor.is_running());

        let child: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(process_alive(child));

        assert!(supervisor.stop().await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(child));
    }

    #[tokio::test]
    async fn test_missing_shell_reports_start_error() {
        let buffer = DiagnosticBuffer::new();
        let command = ShellCommand::new("true").with_shell("/nonexistent/shell");
        let mut supervisor = ProcessSupervisor::new(command, buffer, StopSettings::default());

        assert!(matches!(supervisor.start(), Err(GateError::Start(_))));
        assert!(!supervisor.is_running());
    }
}
