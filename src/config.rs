//! Session configuration.
//!
//! A [`SessionConfig`] says which engine to launch, how to launch it and
//! where the two sides meet. Every field has a working default; values can be
//! overridden in code, deserialized from JSON, or taken from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `MATBRIDGE_EXECUTABLE` | `executable` |
//! | `MATBRIDGE_ADDRESS` | `address` (`ipc:///path` or `tcp://host:port`) |
//! | `MATBRIDGE_TIMEOUT_SECS` | `timeout` |
//! | `MATBRIDGE_SUPPORT_DIR` | `support_dir` |
//! | `MATBRIDGE_LOG` | `log_file` (a path, or `1` for the default location) |

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{BridgeError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Which engine to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Matlab,
    Octave,
}

impl EngineKind {
    /// Command used when no executable is configured.
    pub fn default_executable(&self) -> &'static str {
        match self {
            EngineKind::Matlab => "matlab",
            EngineKind::Octave => "octave",
        }
    }

    /// Flags that suppress the interactive UI.
    pub fn default_startup_options(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            EngineKind::Matlab if cfg!(windows) => &["-automation", "-noFigureWindows"],
            EngineKind::Matlab => &["-nodesktop", "-nodisplay"],
            EngineKind::Octave => &["--silent", "--no-gui"],
        };
        flags.iter().map(|s| s.to_string()).collect()
    }

    /// Flag that introduces the boot expression.
    pub fn eval_flag(&self) -> &'static str {
        match self {
            EngineKind::Matlab => "-r",
            EngineKind::Octave => "--eval",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EngineKind::Matlab => "MATLAB",
            EngineKind::Octave => "Octave",
        }
    }
}

/// Where the engine-side server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// Local IPC socket, rendered `ipc:///path/to/socket`.
    Ipc(PathBuf),
    /// Loopback TCP, rendered `tcp://127.0.0.1:port`.
    Tcp(SocketAddr),
}

impl Address {
    /// Parse an `ipc://` or `tcp://` address.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(BridgeError::Config("ipc address has no path".to_string()));
            }
            return Ok(Address::Ipc(PathBuf::from(path)));
        }

        let url = Url::parse(raw)
            .map_err(|e| BridgeError::Config(format!("Invalid address `{}`: {}", raw, e)))?;
        if url.scheme() != "tcp" {
            return Err(BridgeError::Config(format!(
                "Unsupported address scheme `{}` (expected ipc or tcp)",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::Config(format!("Address `{}` has no host", raw)))?;
        let port = url
            .port()
            .ok_or_else(|| BridgeError::Config(format!("Address `{}` has no port", raw)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let socket = (host, port)
            .to_socket_addrs()
            .map_err(|e| BridgeError::Config(format!("Cannot resolve `{}`: {}", raw, e)))?
            .next()
            .ok_or_else(|| BridgeError::Config(format!("Cannot resolve `{}`", raw)))?;
        Ok(Address::Tcp(socket))
    }

    /// A fresh address suitable for this platform: a unique IPC socket
    /// path on Unix, a free loopback port on Windows.
    pub fn default_for_platform() -> Result<Self> {
        if cfg!(unix) {
            Ok(Self::unique_ipc())
        } else {
            Self::free_tcp()
        }
    }

    /// Unique socket path under `$XDG_RUNTIME_DIR`, falling back to the temp dir.
    pub fn unique_ipc() -> Self {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Address::Ipc(dir.join(format!("matbridge-{}.sock", Uuid::new_v4().simple())))
    }

    /// Loopback TCP on a port the OS reports free right now.
    pub fn free_tcp() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| BridgeError::Config(format!("No free loopback port: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Config(format!("No free loopback port: {}", e)))?;
        Ok(Address::Tcp(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = BridgeError;

    fn try_from(raw: String) -> Result<Self> {
        Address::parse(&raw)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

/// Configuration for one [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub engine: EngineKind,
    /// Engine executable; defaults to `matlab` / `octave` on `PATH`.
    pub executable: Option<PathBuf>,
    /// Connection address; a fresh platform default is chosen at start when unset.
    pub address: Option<Address>,
    /// Replaces the engine's default UI-suppressing flags when set.
    pub startup_options: Option<Vec<String>>,
    /// Directory holding the engine-side server scripts.
    pub support_dir: Option<PathBuf>,
    /// Maximum wait for the handshake and for liveness checks.
    pub timeout: Duration,
    /// Delay between handshake attempts.
    pub poll_interval: Duration,
    /// How long `stop()` waits for a graceful exit before killing the engine.
    pub stop_grace: Duration,
    /// Engine output destination; `None` discards it.
    pub log_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Matlab,
            executable: None,
            address: None,
            startup_options: None,
            support_dir: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
            log_file: None,
        }
    }
}

impl SessionConfig {
    pub fn matlab() -> Self {
        Self::default()
    }

    pub fn octave() -> Self {
        Self {
            engine: EngineKind::Octave,
            ..Self::default()
        }
    }

    pub fn with_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.executable = Some(exe.into());
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_startup_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.startup_options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_support_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.support_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Overlay `MATBRIDGE_*` environment variables.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay settings from an arbitrary key lookup (the environment in production).
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(exe) = lookup("MATBRIDGE_EXECUTABLE") {
            self.executable = Some(PathBuf::from(exe));
        }
        if let Some(addr) = lookup("MATBRIDGE_ADDRESS") {
            self.address = Some(Address::parse(&addr)?);
        }
        if let Some(secs) = lookup("MATBRIDGE_TIMEOUT_SECS") {
            let secs: f64 = secs.trim().parse().map_err(|_| {
                BridgeError::Config(format!("MATBRIDGE_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(BridgeError::Config(format!(
                    "MATBRIDGE_TIMEOUT_SECS must be positive: {}",
                    secs
                )));
            }
            self.timeout = Duration::from_secs_f64(secs);
        }
        if let Some(dir) = lookup("MATBRIDGE_SUPPORT_DIR") {
            self.support_dir = Some(PathBuf::from(dir));
        }
        if let Some(log) = lookup("MATBRIDGE_LOG") {
            match log.trim() {
                "" | "0" | "false" => self.log_file = None,
                "1" | "true" => self.log_file = Some(default_log_path(self.engine)),
                path => self.log_file = Some(PathBuf::from(path)),
            }
        }
        Ok(self)
    }

    pub fn resolved_executable(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.engine.default_executable()))
    }

    pub fn resolved_startup_options(&self) -> Vec<String> {
        self.startup_options
            .clone()
            .unwrap_or_else(|| self.engine.default_startup_options())
    }

    /// Server script directory, defaulting to `<data dir>/matbridge/matlab`.
    pub fn resolved_support_dir(&self) -> PathBuf {
        if let Some(dir) = &self.support_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("matbridge").join("matlab"))
            .unwrap_or_else(|| PathBuf::from("matlab"))
    }

    /// Configured address, or a fresh platform default.
    pub fn resolve_address(&self) -> Result<Address> {
        match &self.address {
            Some(addr) => Ok(addr.clone()),
            None => Address::default_for_platform(),
        }
    }
}

/// Timestamped log file under the user cache directory.
pub fn default_log_path(engine: EngineKind) -> PathBuf {
    let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    base.join("matbridge").join("logs").join(format!(
        "{}-{}.log",
        engine.default_executable(),
        stamp
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_ipc_address() {
        let addr = Address::parse("ipc:///tmp/pymatbridge").unwrap();
        assert_eq!(addr, Address::Ipc(PathBuf::from("/tmp/pymatbridge")));
        assert_eq!(addr.to_string(), "ipc:///tmp/pymatbridge");
    }

    #[test]
    fn test_parse_tcp_address() {
        let addr = Address::parse("tcp://127.0.0.1:55555").unwrap();
        assert_eq!(addr, Address::Tcp("127.0.0.1:55555".parse().unwrap()));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:55555");
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert!(Address::parse("ipc://").is_err());
        assert!(Address::parse("http://localhost:80").is_err());
        assert!(Address::parse("tcp://127.0.0.1").is_err());
        assert!(Address::parse("nonsense").is_err());
    }

    #[test]
    fn test_unique_ipc_addresses_differ() {
        let a = Address::unique_ipc();
        let b = Address::unique_ipc();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("ipc://"));
    }

    #[test]
    fn test_free_tcp_is_loopback() {
        match Address::free_tcp().unwrap() {
            Address::Tcp(addr) => {
                assert!(addr.ip().is_loopback());
                assert_ne!(addr.port(), 0);
            }
            other => panic!("Expected tcp address, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_defaults() {
        let cfg = SessionConfig::octave();
        assert_eq!(cfg.resolved_executable(), PathBuf::from("octave"));
        assert_eq!(cfg.resolved_startup_options(), vec!["--silent", "--no-gui"]);
        assert_eq!(cfg.engine.eval_flag(), "--eval");

        let cfg = SessionConfig::matlab().with_startup_options(["-nojvm"]);
        assert_eq!(cfg.resolved_startup_options(), vec!["-nojvm"]);
        assert_eq!(cfg.engine.eval_flag(), "-r");
    }

    #[test]
    fn test_apply_env_overrides() {
        let cfg = SessionConfig::matlab()
            .apply_env_from(lookup(&[
                ("MATBRIDGE_EXECUTABLE", "/opt/matlab/bin/matlab"),
                ("MATBRIDGE_ADDRESS", "tcp://127.0.0.1:4000"),
                ("MATBRIDGE_TIMEOUT_SECS", "2.5"),
                ("MATBRIDGE_LOG", "/tmp/engine.log"),
            ]))
            .unwrap();
        assert_eq!(
            cfg.resolved_executable(),
            PathBuf::from("/opt/matlab/bin/matlab")
        );
        assert_eq!(cfg.timeout, Duration::from_millis(2500));
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/engine.log")));
        assert!(matches!(cfg.address, Some(Address::Tcp(_))));
    }

    #[test]
    fn test_apply_env_rejects_bad_timeout() {
        let err = SessionConfig::matlab()
            .apply_env_from(lookup(&[("MATBRIDGE_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err = SessionConfig::matlab()
            .apply_env_from(lookup(&[("MATBRIDGE_TIMEOUT_SECS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"engine": "octave", "address": "ipc:///tmp/x.sock"}"#,
        )
        .unwrap();
        assert_eq!(cfg.engine, EngineKind::Octave);
        assert_eq!(cfg.address, Some(Address::Ipc(PathBuf::from("/tmp/x.sock"))));
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_default_log_path_is_timestamped() {
        let path = default_log_path(EngineKind::Octave);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("octave-"), "Unexpected log name: {}", name);
        assert!(name.ends_with(".log"));
    }
}
