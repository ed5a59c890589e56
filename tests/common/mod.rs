//! In-process stand-in for the engine-side server loop.
//!
//! `FakeEngine` answers the same JSON requests as the real server and records
//! every command it receives, so tests can assert on round-trip counts.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use zeromq::{RepSocket, Socket, SocketRecv, SocketSend};

use matbridge::codec::{self, NdArray, Value};
use matbridge::config::Address;
use matbridge::ipc::{SocketTransport, Transport, TransportError};
use matbridge::{Connector, Link, Result, Session, SessionConfig};

#[derive(Default)]
struct EngineState {
    workspace: BTreeMap<String, Json>,
    functions: BTreeSet<String>,
    commands: Vec<String>,
    /// Connect requests to refuse before acknowledging.
    refuse_connects: usize,
    unresponsive: bool,
}

/// Shared handle to the fake engine's state.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    opens: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let engine = Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            opens: Arc::new(AtomicUsize::new(0)),
        };
        for name in ["abs", "deal", "meshgrid", "plus", "close"] {
            engine.add_function(name);
        }
        engine
    }

    pub fn add_function(&self, name: &str) {
        self.state.lock().unwrap().functions.insert(name.to_string());
    }

    pub fn remove_function(&self, name: &str) {
        self.state.lock().unwrap().functions.remove(name);
    }

    /// Refuse the first `n` handshakes, as an engine that is still booting.
    pub fn refuse_connects(&self, n: usize) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    /// Never answer a handshake.
    pub fn unresponsive(&self) {
        self.state.lock().unwrap().unresponsive = true;
    }

    /// How many times a command was received.
    pub fn count(&self, cmd: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| *c == cmd)
            .count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn workspace_names(&self) -> Vec<String> {
        self.state.lock().unwrap().workspace.keys().cloned().collect()
    }

    /// How many links sessions have opened to this engine.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            engine: self.clone(),
        }
    }

    /// A session wired to this engine with short timeouts.
    pub fn session(&self) -> Session {
        let config = SessionConfig::matlab()
            .with_timeout(Duration::from_millis(500))
            .with_poll_interval(Duration::from_millis(10))
            .with_stop_grace(Duration::from_millis(100));
        Session::with_connector(config, self.connector())
    }

    fn handle(&self, payload: &str) -> std::result::Result<String, TransportError> {
        let request: Json = serde_json::from_str(payload)
            .map_err(|e| TransportError::Protocol(format!("bad request: {}", e)))?;
        let cmd = request["cmd"].as_str().unwrap_or_default().to_string();

        let mut state = self.state.lock().unwrap();
        state.commands.push(cmd.clone());

        let reply = match cmd.as_str() {
            "connect" => {
                if state.unresponsive {
                    return Err(refused());
                }
                if state.refuse_connects > 0 {
                    state.refuse_connects -= 1;
                    return Err(refused());
                }
                json!("connected")
            }
            "exit" => json!("exit"),
            "eval" => eval(&mut state, request["code"].as_str().unwrap_or_default()),
            "run_function" => run_function(&mut state, &request),
            "get_var" => {
                let name = request["varname"].as_str().unwrap_or_default();
                match state.workspace.get(name) {
                    Some(value) => ok(value.clone()),
                    None => undefined(name),
                }
            }
            "set_var" => {
                let name = request["varname"].as_str().unwrap_or_default().to_string();
                state.workspace.insert(name, request["value"].clone());
                ok(Json::Null)
            }
            "exist" => {
                let name = request["name"].as_str().unwrap_or_default();
                let code = if state.functions.contains(name) {
                    2
                } else if state.workspace.contains_key(name) {
                    1
                } else {
                    0
                };
                ok(json!(code))
            }
            other => json!({"success": false, "message": format!("unknown command {}", other)}),
        };
        Ok(reply.to_string())
    }
}

fn refused() -> TransportError {
    TransportError::ConnectionFailed(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "engine not listening yet",
    ))
}

fn ok(result: Json) -> Json {
    json!({"success": true, "result": result, "content": {"stdout": "", "figures": []}})
}

fn undefined(name: &str) -> Json {
    json!({
        "success": false,
        "identifier": "MATLAB:UndefinedFunction",
        "message": format!("Undefined function or variable '{}'.", name),
        "result": null,
    })
}

fn eval(state: &mut EngineState, code: &str) -> Json {
    let code = code.trim().trim_end_matches(';');

    if code == "clear" {
        state.workspace.clear();
        return ok(Json::Null);
    }
    if let Some(names) = code.strip_prefix("clear ") {
        for name in names.split_whitespace() {
            state.workspace.remove(name);
        }
        return ok(Json::Null);
    }
    if code.starts_with("addpath(") {
        return ok(Json::Null);
    }
    if let Some(path) = code.strip_prefix("run(") {
        return json!({
            "success": true,
            "result": null,
            "content": {"stdout": format!("ran {}\n", path.trim_end_matches(')'))},
        });
    }
    if let Some((target, call)) = code.split_once(" = sparse(") {
        return rebuild_sparse(state, target.trim(), call.trim_end_matches(')'));
    }
    if let Some((target, literal)) = code.split_once('=') {
        if let Ok(number) = literal.trim().parse::<f64>() {
            state
                .workspace
                .insert(target.trim().to_string(), json!(number));
            return ok(Json::Null);
        }
    }
    if let Some(value) = state.workspace.get(code) {
        return json!({
            "success": true,
            "result": null,
            "content": {"stdout": format!("{} = {}\n", code, value)},
        });
    }
    undefined(code)
}

fn rebuild_sparse(state: &mut EngineState, target: &str, call: &str) -> Json {
    if !target.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return json!({
            "success": false,
            "identifier": "MATLAB:m_invalid_lhs_of_assignment",
            "message": "Invalid left-hand side of assignment.",
        });
    }
    let parts: Vec<&str> = call.split(',').map(str::trim).collect();
    let [r, c, v, m, n] = parts[..] else {
        return json!({"success": false, "message": "sparse: wrong number of arguments"});
    };
    let fetch = |name: &str| -> Option<Vec<f64>> {
        let wire = state.workspace.get(name)?;
        codec::decode(wire).ok()?.as_array().map(|a| a.data().to_vec())
    };
    let (Some(rows), Some(cols), Some(vals)) = (fetch(r), fetch(c), fetch(v)) else {
        return undefined(r);
    };
    let (m, n): (usize, usize) = (m.parse().unwrap(), n.parse().unwrap());

    let mut dense = vec![0.0; m * n];
    for ((row, col), val) in rows.iter().zip(&cols).zip(&vals) {
        let (row, col) = (*row as usize - 1, *col as usize - 1);
        dense[row + col * m] += val;
    }
    let array = NdArray::new(vec![m, n], dense).unwrap();
    state
        .workspace
        .insert(target.to_string(), codec::encode(&Value::Array(array)).unwrap());
    ok(Json::Null)
}

fn run_function(state: &mut EngineState, request: &Json) -> Json {
    let name = request["func_name"].as_str().unwrap_or_default();
    let args: Vec<Value> = request["func_args"]
        .as_array()
        .map(|items| items.iter().map(|a| codec::decode(a).unwrap()).collect())
        .unwrap_or_default();
    let nargout = request["nargout"].as_u64().unwrap_or(1) as usize;

    if !state.functions.contains(name) {
        return undefined(name);
    }

    match name {
        "abs" => ok(json!(args[0].as_f64().unwrap().abs())),
        "deal" => {
            let outputs: Vec<Json> = args
                .iter()
                .take(nargout)
                .map(|a| codec::encode(a).unwrap())
                .collect();
            ok(Json::Array(outputs))
        }
        "plus" => json!({
            "success": false,
            "identifier": "MATLAB:dimagree",
            "message": "Matrix dimensions must agree.",
        }),
        "close" => ok(json!([])),
        "meshgrid" => {
            let xs = args[0].as_array().unwrap().data().to_vec();
            let ys = args[1].as_array().unwrap().data().to_vec();
            let (m, n) = (ys.len(), xs.len());
            let mut x = Vec::with_capacity(m * n);
            let mut y = Vec::with_capacity(m * n);
            for xv in &xs {
                for yv in &ys {
                    x.push(*xv);
                    y.push(*yv);
                }
            }
            let grids = [
                NdArray::new(vec![m, n], x).unwrap(),
                NdArray::new(vec![m, n], y).unwrap(),
            ];

            let Some(names) = request["saveout"].as_array() else {
                let outputs: Vec<Json> = grids
                    .into_iter()
                    .map(|g| codec::encode(&Value::Array(g)).unwrap())
                    .collect();
                return ok(Json::Array(outputs));
            };

            // Report in reverse assignment order, as the real server does
            let mut descriptor = String::new();
            for (name, grid) in names.iter().zip(grids).rev() {
                let name = name.as_str().unwrap();
                descriptor.push_str(&format!("__VAR={}|double([{} {}]);", name, m, n));
                state
                    .workspace
                    .insert(name.to_string(), codec::encode(&Value::Array(grid)).unwrap());
            }
            ok(json!(descriptor))
        }
        _ => ok(Json::Null),
    }
}

/// Transport that talks to a [`FakeEngine`] in-process.
pub struct FakeTransport {
    engine: FakeEngine,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exchange(&mut self, payload: &str) -> std::result::Result<String, TransportError> {
        tokio::task::yield_now().await;
        self.engine.handle(payload)
    }
}

pub struct FakeConnector {
    engine: FakeEngine,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _config: &SessionConfig) -> Result<Link> {
        self.engine.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Link::new(FakeTransport {
            engine: self.engine.clone(),
        }))
    }
}

/// Connects to a server that is already listening.
pub struct AddressConnector {
    address: Address,
}

#[async_trait]
impl Connector for AddressConnector {
    async fn open(&self, _config: &SessionConfig) -> Result<Link> {
        Ok(Link::new(SocketTransport::new(self.address.clone())))
    }
}

/// A session talking over a real ZeroMQ socket to a minimal engine loop.
///
/// `eval` answers with the evaluated code as its result; `slow` is answered
/// only after `delay_slow`.
pub async fn spawn_zmq_engine(delay_slow: Duration) -> Session {
    let mut socket = RepSocket::new();
    let endpoint = socket.bind("tcp://127.0.0.1:0").await.unwrap();
    tokio::spawn(async move {
        while let Ok(request) = socket.recv().await {
            let request: Json = serde_json::from_str(&String::try_from(request).unwrap()).unwrap();
            let reply = match request["cmd"].as_str().unwrap_or_default() {
                "connect" => json!("connected"),
                "exit" => json!("exit"),
                _ => {
                    let code = request["code"].as_str().unwrap_or_default().to_string();
                    if code == "slow" {
                        tokio::time::sleep(delay_slow).await;
                    }
                    ok(json!(code))
                }
            };
            // The requester may have given up on this reply
            let _ = socket.send(reply.to_string().into()).await;
        }
    });

    let connector = AddressConnector {
        address: Address::parse(&endpoint.to_string()).unwrap(),
    };
    let config = SessionConfig::matlab()
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
        .with_stop_grace(Duration::from_millis(200));
    Session::with_connector(config, connector)
}
