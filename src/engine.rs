//! Engine subprocess management.
//!
//! The engine is started with a boot expression that puts the support
//! directory on its path and enters the server loop:
//!
//! ```text
//! matlab -nodesktop -nodisplay -r "addpath(genpath('/opt/mb')), matlabserver('ipc:///run/mb.sock'), exit"
//! ```
//!
//! When the server loop returns the trailing `exit` shuts the engine down.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{Address, SessionConfig};
use crate::error::{BridgeError, Result};

/// Name of the server-loop entry point shipped in the support directory.
const SERVER_ENTRY: &str = "matlabserver";

/// Quote `text` as a single-quoted MATLAB/Octave character literal.
pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// The expression the engine evaluates on startup.
pub fn boot_expression(support_dir: &Path, address: &Address) -> String {
    format!(
        "addpath(genpath({})), {}({}), exit",
        quote_literal(&support_dir.to_string_lossy()),
        SERVER_ENTRY,
        quote_literal(&address.to_string())
    )
}

/// Program and argument list used to launch the engine.
pub fn command_line(config: &SessionConfig, address: &Address) -> (PathBuf, Vec<String>) {
    let mut args = config.resolved_startup_options();
    args.push(config.engine.eval_flag().to_string());
    args.push(boot_expression(&config.resolved_support_dir(), address));
    (config.resolved_executable(), args)
}

fn render(program: &Path, args: &[String]) -> String {
    let mut rendered = program.display().to_string();
    for arg in args {
        rendered.push(' ');
        if arg.contains(' ') {
            rendered.push('"');
            rendered.push_str(arg);
            rendered.push('"');
        } else {
            rendered.push_str(arg);
        }
    }
    rendered
}

/// A running engine subprocess.
///
/// Owned exclusively by one session. Dropping a still-running process kills
/// it so a session can never leak an engine.
pub struct EngineProcess {
    child: Child,
    command: String,
}

impl EngineProcess {
    /// Spawn the engine for `config`, serving on `address`.
    ///
    /// Engine output goes to the configured log file (appended) or is
    /// discarded.
    pub fn launch(config: &SessionConfig, address: &Address) -> Result<Self> {
        let (program, args) = command_line(config, address);
        let rendered = render(&program, &args);
        info!("Starting {}", config.engine.display_name());
        debug!("Engine command: {}", rendered);

        let startup_error = |source: std::io::Error| BridgeError::Startup {
            command: rendered.clone(),
            source,
        };

        let (stdout, stderr) = match &config.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(startup_error)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(startup_error)?;
                let err_file = file.try_clone().map_err(startup_error)?;
                debug!("Engine output logged to {}", path.display());
                (Stdio::from(file), Stdio::from(err_file))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(startup_error)?;

        debug!("Engine pid: {:?}", child.id());
        Ok(Self {
            child,
            command: rendered,
        })
    }

    /// The rendered command line, for diagnostics.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the engine has already exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Error polling engine process: {}", e);
                None
            }
        }
    }

    /// Wait up to `grace` for the engine to exit on its own, then kill it.
    pub async fn shutdown(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Engine exited cleanly ({})", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error waiting for engine: {}", e);
                    break;
                }
            }
        }

        warn!("Engine didn't exit gracefully, killing");
        self.kill().await;
    }

    /// Kill the engine and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Kill failed (engine already gone?): {}", e);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("Engine still running on drop, killing");
            let _ = self.child.start_kill();
        }
    }
}
