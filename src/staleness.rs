use crate::command::ShellCommand;
use crate::error::GateError;
use tracing::{debug, warn};

/// Decides whether the backend has to be rebuilt.
///
/// Exit status 0 from the check command means up to date. A nonzero status,
/// or a command that can't be run at all, means stale. There is no timeout:
/// a hanging check command hangs the gate.
pub struct StalenessChecker {
    command: Option<ShellCommand>,
}

impl StalenessChecker {
    /// Without a command the backend is never considered stale
    pub fn new(command: Option<ShellCommand>) -> Self {
        Self { command }
    }

    pub async fn is_stale(&self) -> bool {
        match self.check().await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Treating backend as stale");
                true
            }
        }
    }

    /// Run the check, surfacing execution failures instead of folding them
    /// into "stale"
    pub async fn check(&self) -> Result<bool, GateError> {
        let Some(ref command) = self.command else {
            return Ok(false);
        };

        let output = command.output().await.map_err(GateError::StaleCheck)?;
        let stale = !output.status.success();

        debug!(
            stale,
            status = %output.status,
            output = %String::from_utf8_lossy(&output.stdout).trim(),
            "Staleness check finished"
        );

        Ok(stale)
    }
}
