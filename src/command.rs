//! Shell-string commands
//!
//! Check, build and run commands are configured as shell strings so they can
//! use pipes and redirection. `ShellCommand` hides how they are turned into a
//! process; callers only run them and observe exit status and output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::{Child, Command};

/// Default shell used to interpret command strings
pub const DEFAULT_SHELL: &str = "sh";

/// A command string executed through `<shell> -c`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    script: String,
    shell: String,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            shell: DEFAULT_SHELL.to_string(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// Use a different shell (builder pattern)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Add environment variables on top of the inherited environment (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Build the process description. The child inherits the proxy's
    /// environment plus the configured variables.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&self.script);
        cmd.stdin(Stdio::null());
        cmd.envs(&self.env);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion, capturing stdout and stderr
    pub async fn output(&self) -> std::io::Result<Output> {
        self.to_command().output().await
    }

    /// Spawn with stdout and stderr piped back to the caller.
    ///
    /// With `own_group` set the child leads a new process group on Unix, so
    /// a signal sent to the group also reaches whatever the shell started.
    pub fn spawn_piped(&self, own_group: bool) -> std::io::Result<Child> {
        let mut cmd = self.to_command();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        {
            if own_group {
                cmd.process_group(0);
            }
        }
        #[cfg(not(unix))]
        let _ = own_group;

        cmd.spawn()
    }
}
