//! The engine session.
//!
//! A [`Session`] owns one engine subprocess and the connection to its server
//! loop. It moves through
//!
//! ```text
//! NotStarted ──start()──► Starting ──handshake ok──► Connected ──stop()──► Stopping ──► NotStarted
//!                            │
//!                            └──spawn or handshake failure (engine killed)──► NotStarted
//! ```
//!
//! All requests go through one async mutex, so clones of a session can be
//! used from several tasks without ever interleaving two exchanges.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::binding::{Args, Binding, BoundFunction};
use crate::codec::{self, SparseMatrix, Value};
use crate::config::SessionConfig;
use crate::engine::{quote_literal, EngineProcess};
use crate::error::{BridgeError, Result};
use crate::ipc::{SocketTransport, Transport};
use crate::protocol::{is_acknowledgement, Reply, Request, Response, CONNECTED_ACK, EXIT_ACK};
use crate::proxy::{order_by_request, parse_descriptor, RemoteVar};

/// Lifecycle phase of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    NotStarted,
    Starting,
    Connected,
    Stopping,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::NotStarted => "not started",
            SessionPhase::Starting => "starting",
            SessionPhase::Connected => "connected",
            SessionPhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// An open connection to an engine, plus the process serving it if the
/// session launched one.
pub struct Link {
    pub transport: Box<dyn Transport>,
    pub process: Option<EngineProcess>,
}

impl Link {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            process: None,
        }
    }

    pub fn with_process(mut self, process: EngineProcess) -> Self {
        self.process = Some(process);
        self
    }
}

/// Produces the [`Link`] a session talks through.
///
/// The default [`EngineConnector`] launches a real engine; tests plug in a
/// connector that returns an in-process fake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> Result<Link>;
}

/// Launches the configured engine and connects to it over a socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConnector;

#[async_trait]
impl Connector for EngineConnector {
    async fn open(&self, config: &SessionConfig) -> Result<Link> {
        let address = config.resolve_address()?;
        let process = EngineProcess::launch(config, &address)?;
        Ok(Link::new(SocketTransport::new(address)).with_process(process))
    }
}

/// Lets `stop()` interrupt a handshake that holds the link lock.
#[derive(Default)]
struct StartCancel {
    requested: AtomicBool,
    notify: Notify,
}

impl StartCancel {
    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Resolves when `cancel` fires; never, without one.
async fn cancelled(cancel: Option<&StartCancel>) {
    match cancel {
        Some(cancel) => cancel.requested().await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Shared {
    config: SessionConfig,
    connector: Box<dyn Connector>,
    link: Mutex<Option<Link>>,
    phase: StdMutex<SessionPhase>,
    bindings: StdMutex<HashMap<String, Binding>>,
    start_cancel: StartCancel,
}

impl Shared {
    fn set_phase(&self, phase: SessionPhase) {
        *lock(&self.phase) = phase;
    }
}

/// Recover the guard of a poisoned std mutex; the guarded data stays valid.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one engine.
///
/// Cheap to clone; all clones share the engine. The engine is killed when
/// the last clone is dropped if [`stop`](Session::stop) was never called.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.shared.config.engine)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Session {
    /// A session that launches a real engine.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, EngineConnector)
    }

    pub fn with_connector(config: SessionConfig, connector: impl Connector + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector: Box::new(connector),
                link: Mutex::new(None),
                phase: StdMutex::new(SessionPhase::NotStarted),
                bindings: StdMutex::new(HashMap::new()),
                start_cancel: StartCancel::default(),
            }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<Shared>) -> Option<Session> {
        weak.upgrade().map(|shared| Session { shared })
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.shared.phase)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Launch the engine and wait for its server loop to answer.
    ///
    /// Does nothing on a connected session. On failure the engine is killed
    /// and the session is left [`SessionPhase::NotStarted`]. A concurrent
    /// [`stop`](Session::stop) ends the handshake early with
    /// [`BridgeError::StartCancelled`].
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.shared.link.lock().await;
        if slot.is_some() {
            debug!("Session already started");
            return Ok(());
        }

        let config = &self.shared.config;
        self.shared.start_cancel.clear();
        self.shared.set_phase(SessionPhase::Starting);

        let mut link = match self.shared.connector.open(config).await {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to start {}: {}", config.engine.display_name(), e);
                self.shared.set_phase(SessionPhase::NotStarted);
                return Err(e);
            }
        };

        let cancel = Some(&self.shared.start_cancel);
        if let Err(e) = handshake(&mut link, config.timeout, config.poll_interval, cancel).await {
            warn!("{} did not come up: {}", config.engine.display_name(), e);
            if let Some(mut process) = link.process.take() {
                process.kill().await;
            }
            self.shared.set_phase(SessionPhase::NotStarted);
            return Err(e);
        }

        info!("{} connected", config.engine.display_name());
        *slot = Some(link);
        self.shared.set_phase(SessionPhase::Connected);
        Ok(())
    }

    /// Ask the engine to exit, then make sure it has.
    ///
    /// Safe to call any number of times; failures while saying goodbye are
    /// logged, not returned. Cancels a [`start`](Session::start) still
    /// waiting for the handshake.
    pub async fn stop(&self) -> Result<()> {
        let payload = serde_json::to_string(&Request::Exit)?;
        if self.phase() == SessionPhase::Starting {
            debug!("Cancelling engine startup");
            self.shared.start_cancel.request();
        }
        let mut slot = self.shared.link.lock().await;
        let Some(mut link) = slot.take() else {
            return Ok(());
        };

        let grace = self.shared.config.stop_grace;
        self.shared.set_phase(SessionPhase::Stopping);
        info!("Stopping {}", self.shared.config.engine.display_name());

        match tokio::time::timeout(grace, link.transport.exchange(&payload)).await {
            Ok(Ok(reply)) if is_acknowledgement(&reply, EXIT_ACK) => {
                debug!("Engine acknowledged exit")
            }
            Ok(Ok(reply)) => warn!("Unexpected reply to exit: {}", reply),
            Ok(Err(e)) => debug!("Exit request failed: {}", e),
            Err(_) => warn!("Engine did not acknowledge exit within {:?}", grace),
        }
        link.transport.reset();

        if let Some(process) = link.process.take() {
            process.shutdown(grace).await;
        }

        self.shared.set_phase(SessionPhase::NotStarted);
        info!("{} stopped", self.shared.config.engine.display_name());
        Ok(())
    }

    /// Stop, then start again.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Whether the engine answers a ping.
    ///
    /// `false` without a round trip when the session is not started;
    /// otherwise pings until the engine answers or the configured timeout
    /// elapses.
    pub async fn is_connected(&self) -> bool {
        let mut slot = self.shared.link.lock().await;
        let Some(link) = slot.as_mut() else {
            return false;
        };
        let config = &self.shared.config;
        handshake(link, config.timeout, config.poll_interval, None)
            .await
            .is_ok()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// One exchange with the engine.
    async fn send(&self, request: Request) -> Result<Response> {
        let payload = serde_json::to_string(&request)?;
        let raw = {
            let mut slot = self.shared.link.lock().await;
            let link = slot.as_mut().ok_or(BridgeError::NotStarted)?;
            debug!("Sending {}", request.command());
            link.transport.exchange(&payload).await?
        };

        serde_json::from_str(&raw).map_err(|e| {
            error!("Undecodable {} response: {}", request.command(), e);
            BridgeError::ProtocolDesync(format!("Invalid {} response: {}", request.command(), e))
        })
    }

    /// Evaluate code in the base workspace.
    ///
    /// Engine-side failures come back as a [`Reply`] with `success == false`
    /// and the engine's diagnostic, not as an error.
    pub async fn run_code(&self, code: &str) -> Result<Reply> {
        let response = self
            .send(Request::Eval {
                code: code.to_string(),
            })
            .await?;
        Ok(Reply::try_from(response)?)
    }

    /// Run a script file. Failures are reported like [`run_code`](Session::run_code).
    pub async fn run_script(&self, path: impl AsRef<Path>) -> Result<Reply> {
        let path = absolute(path.as_ref());
        self.run_code(&format!("run({})", quote_literal(&path.to_string_lossy())))
            .await
    }

    /// Evaluate code and turn an engine failure into an error.
    async fn eval_checked(&self, code: &str) -> Result<Reply> {
        let response = self
            .send(Request::Eval {
                code: code.to_string(),
            })
            .await?;
        if !response.success {
            return Err(remote_failure(None, &response));
        }
        Ok(Reply::try_from(response)?)
    }

    /// Call a function by name, or by the path of its `.m` file.
    ///
    /// A path puts its directory on the engine path first. The result holds
    /// nothing for `nargout == 0`, the value for `nargout == 1` and a
    /// [`Value::List`] of the outputs otherwise.
    pub async fn run_func(&self, path_or_name: &str, args: Args) -> Result<Reply> {
        let name = self.prepare_function(path_or_name).await?;
        self.invoke(&name, &args).await
    }

    /// Call a function and leave its outputs in the workspace under `names`.
    ///
    /// Returns one proxy per name, in the order of `names`.
    pub async fn call_saved(
        &self,
        path_or_name: &str,
        args: Args,
        names: &[&str],
    ) -> Result<Vec<RemoteVar>> {
        let name = self.prepare_function(path_or_name).await?;
        self.invoke_saved(&name, &args, names).await
    }

    async fn prepare_function(&self, path_or_name: &str) -> Result<String> {
        match split_function_path(path_or_name) {
            Some((dir, name)) => {
                debug!("Adding {} to engine path", dir.display());
                self.eval_checked(&format!("addpath({})", quote_literal(&dir.to_string_lossy())))
                    .await?;
                Ok(name)
            }
            None => Ok(path_or_name.to_string()),
        }
    }

    pub(crate) async fn invoke(&self, name: &str, args: &Args) -> Result<Reply> {
        let nargout = args.nargout_value();
        let response = self
            .send(Request::RunFunction {
                func_name: name.to_string(),
                func_args: args.encode()?,
                nargout,
                saveout: None,
            })
            .await?;
        if !response.success {
            return Err(remote_failure(Some(name), &response));
        }

        let mut reply = Reply::try_from(response)?;
        reply.result = shape_outputs(std::mem::take(&mut reply.result), nargout);
        Ok(reply)
    }

    pub(crate) async fn invoke_saved(
        &self,
        name: &str,
        args: &Args,
        names: &[&str],
    ) -> Result<Vec<RemoteVar>> {
        if names.is_empty() {
            return Err(BridgeError::Config(
                "saving outputs needs at least one variable name".to_string(),
            ));
        }
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();

        let response = self
            .send(Request::RunFunction {
                func_name: name.to_string(),
                func_args: args.encode()?,
                nargout: names.len(),
                saveout: Some(names.clone()),
            })
            .await?;
        if !response.success {
            return Err(remote_failure(Some(name), &response));
        }

        let reply = Reply::try_from(response)?;
        let descriptor = reply.result.as_str().ok_or_else(|| {
            BridgeError::ProtocolDesync(format!(
                "expected a variable descriptor, got {}",
                reply.result.kind()
            ))
        })?;
        let descriptors = order_by_request(parse_descriptor(descriptor)?, &names)?;
        Ok(descriptors
            .into_iter()
            .map(|d| RemoteVar::new(d, self.downgrade()))
            .collect())
    }

    // =========================================================================
    // Binding cache
    // =========================================================================

    /// Look up an engine function and bind it to this session.
    ///
    /// Known names come from the cache. A name that failed at call time is
    /// rejected without asking the engine; [`forget`](Session::forget) it if
    /// it has since been defined.
    pub async fn resolve(&self, name: &str) -> Result<BoundFunction> {
        let cached = lock(&self.shared.bindings).get(name).cloned();
        match cached {
            Some(Binding::Bound(function)) => return Ok(function),
            Some(Binding::Absent) => {
                debug!("{} is blacklisted", name);
                return Err(BridgeError::UndefinedName {
                    name: name.to_string(),
                });
            }
            None => {}
        }

        let response = self
            .send(Request::Exist {
                name: name.to_string(),
            })
            .await?;
        if !response.success {
            return Err(remote_failure(Some(name), &response));
        }
        if !is_truthy(&codec::decode(&response.result)?) {
            return Err(BridgeError::UndefinedName {
                name: name.to_string(),
            });
        }

        let function = BoundFunction::new(name, self.downgrade());
        lock(&self.shared.bindings).insert(name.to_string(), Binding::Bound(function.clone()));
        debug!("Bound {}", name);
        Ok(function)
    }

    /// Drop any cached binding or blacklist entry for `name`.
    pub fn forget(&self, name: &str) -> bool {
        lock(&self.shared.bindings).remove(name).is_some()
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        matches!(
            lock(&self.shared.bindings).get(name),
            Some(Binding::Absent)
        )
    }

    pub(crate) fn blacklist(&self, name: &str) {
        lock(&self.shared.bindings).insert(name.to_string(), Binding::Absent);
    }

    // =========================================================================
    // Workspace
    // =========================================================================

    /// Fetch a workspace variable, `None` if it does not exist.
    pub async fn get_variable(&self, name: &str) -> Result<Option<Value>> {
        let response = self
            .send(Request::GetVar {
                varname: name.to_string(),
            })
            .await?;
        if !response.success {
            if response.is_undefined_error() {
                return Ok(None);
            }
            return Err(remote_failure(None, &response));
        }
        match codec::decode(&response.result)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    /// Fetch a workspace variable, falling back to `default`.
    pub async fn get_variable_or(&self, name: &str, default: impl Into<Value>) -> Result<Value> {
        Ok(self
            .get_variable(name)
            .await?
            .unwrap_or_else(|| default.into()))
    }

    /// Assign a workspace variable.
    ///
    /// Sparse matrices are rebuilt on the engine from coordinate triplets.
    pub async fn set_variable(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        match value.into() {
            Value::Sparse(matrix) => self.set_sparse(name, &matrix).await,
            value => self.assign(name, &value).await,
        }
    }

    async fn assign(&self, name: &str, value: &Value) -> Result<()> {
        let response = self
            .send(Request::SetVar {
                varname: name.to_string(),
                value: codec::encode(value)?,
            })
            .await?;
        if !response.success {
            return Err(remote_failure(None, &response));
        }
        Ok(())
    }

    async fn set_sparse(&self, name: &str, matrix: &SparseMatrix) -> Result<()> {
        let token = Uuid::new_v4().simple().to_string();
        let temps = ["r", "c", "v"].map(|part| format!("matbridge_{}_{}", token, part));

        let outcome = self.assign_sparse(name, matrix, &temps).await;
        if let Err(e) = self.eval_checked(&format!("clear {}", temps.join(" "))).await {
            warn!("Failed to clear sparse temporaries: {}", e);
        }
        outcome
    }

    async fn assign_sparse(&self, name: &str, matrix: &SparseMatrix, temps: &[String; 3]) -> Result<()> {
        let (rows, cols, vals) = matrix.to_triplet_arrays();
        for (temp, array) in temps.iter().zip([rows, cols, vals]) {
            self.assign(temp, &Value::Array(array)).await?;
        }
        let (m, n) = matrix.dims();
        self.eval_checked(&format!(
            "{} = sparse({}, {}, {}, {}, {});",
            name, temps[0], temps[1], temps[2], m, n
        ))
        .await?;
        Ok(())
    }

    /// Clear the named variables, or the whole workspace when `names` is empty.
    pub async fn clear_variables(&self, names: &[&str]) -> Result<()> {
        let code = if names.is_empty() {
            "clear".to_string()
        } else {
            format!("clear {}", names.join(" "))
        };
        self.eval_checked(&code).await?;
        Ok(())
    }
}

/// Ping until the engine acknowledges or `timeout` elapses.
///
/// Gives up early if the engine process has already exited.
async fn handshake(
    link: &mut Link,
    timeout: Duration,
    poll_interval: Duration,
    cancel: Option<&StartCancel>,
) -> Result<()> {
    let payload = serde_json::to_string(&Request::Connect)?;
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_some_and(StartCancel::is_requested) {
            link.transport.reset();
            return Err(BridgeError::StartCancelled);
        }

        attempt += 1;
        let remaining = timeout.saturating_sub(started.elapsed());
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(remaining, link.transport.exchange(&payload)) => Some(outcome),
            _ = cancelled(cancel) => None,
        };
        match outcome {
            Some(Ok(Ok(reply))) if is_acknowledgement(&reply, CONNECTED_ACK) => {
                debug!("Handshake acknowledged after {} attempt(s)", attempt);
                return Ok(());
            }
            Some(Ok(Ok(reply))) => debug!("Unexpected handshake reply: {}", reply),
            Some(Ok(Err(e))) => {
                debug!("Handshake attempt {} failed: {}", attempt, e);
                link.transport.reset();
            }
            Some(Err(_)) => link.transport.reset(),
            None => {
                link.transport.reset();
                return Err(BridgeError::StartCancelled);
            }
        }

        if let Some(process) = link.process.as_mut() {
            if let Some(status) = process.try_status() {
                return Err(BridgeError::Startup {
                    command: process.command().to_string(),
                    source: std::io::Error::other(format!(
                        "engine exited during startup ({})",
                        status
                    )),
                });
            }
        }

        if started.elapsed() + poll_interval >= timeout {
            return Err(BridgeError::ConnectTimeout(timeout));
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancelled(cancel) => {}
        }
    }
}

/// Map a failed response to the caller-facing error.
///
/// An undefined-name failure only counts against `name` when the diagnostic
/// is about `name`; a function that fails because something it calls is
/// missing still exists.
fn remote_failure(name: Option<&str>, response: &Response) -> BridgeError {
    let message = response.failure_message();
    if let Some(name) = name {
        if response.is_undefined_error() && (message.is_empty() || message.contains(name)) {
            return BridgeError::UndefinedName {
                name: name.to_string(),
            };
        }
    }
    BridgeError::RemoteExecution {
        identifier: response.identifier.clone().unwrap_or_default(),
        message,
    }
}

fn shape_outputs(result: Value, nargout: usize) -> Value {
    match nargout {
        0 => Value::Null,
        1 => result,
        _ => Value::List(result.into_outputs()),
    }
}

fn is_truthy(value: &Value) -> bool {
    value.as_f64().map(|v| v != 0.0).unwrap_or(false)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Split an `.m` file path into its directory and function name.
///
/// Plain names (including package-qualified ones like `pkg.fn`) are not paths.
fn split_function_path(target: &str) -> Option<(PathBuf, String)> {
    let path = Path::new(target);
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let is_m_file = path.extension().map_or(false, |ext| ext == "m");
    if parent.is_none() && !is_m_file {
        return None;
    }
    let name = path.file_stem()?.to_str()?.to_string();
    let dir = parent.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    Some((absolute(&dir), name))
}
