//! Request and response messages exchanged with the engine-side server.
//!
//! Every exchange is one JSON request object answered by one JSON response
//! object. Requests are tagged by `cmd`:
//!
//! ```text
//! {"cmd":"run_function","func_name":"svd","func_args":[...],"nargout":3}
//! {"success":true,"result":[...],"content":{"stdout":"","figures":[]}}
//! ```
//!
//! The handshake and shutdown commands are acknowledged with the bare JSON
//! strings `"connected"` and `"exit"`.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::{self, CodecError, Value};

/// Acknowledgement for [`Request::Connect`].
pub const CONNECTED_ACK: &str = "connected";

/// Acknowledgement for [`Request::Exit`].
pub const EXIT_ACK: &str = "exit";

/// Remote error identifiers that mean "no such function or variable".
const UNDEFINED_IDENTIFIERS: &[&str] = &[
    "MATLAB:UndefinedFunction",
    "MATLAB:undefinedVarOrFunction",
    "MATLAB:UndefinedFunctionOrVariable",
    "Octave:undefined-function",
];

/// A request sent to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Liveness handshake.
    Connect,
    /// Ask the server loop to return so the engine exits.
    Exit,
    /// Evaluate free-form code in the base workspace.
    Eval { code: String },
    /// Call a function by name.
    RunFunction {
        func_name: String,
        func_args: Vec<serde_json::Value>,
        nargout: usize,
        /// Leave outputs in the workspace under these names instead of returning them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saveout: Option<Vec<String>>,
    },
    /// Fetch a workspace variable.
    GetVar { varname: String },
    /// Assign a workspace variable.
    SetVar {
        varname: String,
        value: serde_json::Value,
    },
    /// Ask whether a function or variable with this name exists.
    Exist { name: String },
}

impl Request {
    /// The `cmd` tag of this request.
    pub fn command(&self) -> &'static str {
        match self {
            Request::Connect => "connect",
            Request::Exit => "exit",
            Request::Eval { .. } => "eval",
            Request::RunFunction { .. } => "run_function",
            Request::GetVar { .. } => "get_var",
            Request::SetVar { .. } => "set_var",
            Request::Exist { .. } => "exist",
        }
    }
}

/// Auxiliary engine output attached to a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Captured command-window text.
    #[serde(default)]
    pub stdout: String,
    /// Image files written for figures opened during the call.
    #[serde(default)]
    pub figures: Vec<PathBuf>,
    /// Scratch directory the figures live in.
    #[serde(default)]
    pub datadir: Option<PathBuf>,
}

/// One frame of a remote exception stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub file: PathBuf,
    #[serde(deserialize_with = "lenient_line")]
    pub line: u32,
}

/// A response as it arrives on the wire, result still encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(deserialize_with = "lenient_bool")]
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
}

impl Response {
    /// Whether this failure means the referenced name does not exist.
    pub fn is_undefined_error(&self) -> bool {
        if self.success {
            return false;
        }
        if let Some(id) = &self.identifier {
            if UNDEFINED_IDENTIFIERS.iter().any(|known| id == known) {
                return true;
            }
        }
        let message = self.failure_message();
        message.contains("Undefined function")
            || message.contains("Undefined variable")
            || message.contains("' undefined")
    }

    /// Engine diagnostic for a failed request.
    ///
    /// Older server scripts put the diagnostic in the captured output rather
    /// than in `message`.
    pub fn failure_message(&self) -> String {
        match (&self.message, &self.content) {
            (Some(m), _) if !m.is_empty() => m.clone(),
            (_, Some(content)) => content.stdout.trim_end().to_string(),
            _ => String::new(),
        }
    }
}

/// A decoded response handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub success: bool,
    pub result: Value,
    /// Engine diagnostic when `success` is false.
    pub message: Option<String>,
    pub identifier: Option<String>,
    pub content: Content,
    pub stack: Vec<StackFrame>,
}

impl Reply {
    /// Captured command-window text.
    pub fn stdout(&self) -> &str {
        &self.content.stdout
    }

    pub fn figures(&self) -> &[PathBuf] {
        &self.content.figures
    }
}

impl TryFrom<Response> for Reply {
    type Error = CodecError;

    fn try_from(response: Response) -> Result<Self, Self::Error> {
        let message = if response.success {
            response.message.clone()
        } else {
            Some(response.failure_message())
        };
        Ok(Reply {
            success: response.success,
            result: codec::decode(&response.result)?,
            message,
            identifier: response.identifier,
            content: response.content.unwrap_or_default(),
            stack: response.stack,
        })
    }
}

/// Whether a raw reply acknowledges a handshake or shutdown.
///
/// Accepts the bare literal (quoted or not) as well as a successful
/// response object.
pub(crate) fn is_acknowledgement(raw: &str, expected: &str) -> bool {
    let raw = raw.trim();
    if raw == expected {
        return true;
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::String(s)) => s == expected,
        Ok(obj @ serde_json::Value::Object(_)) => serde_json::from_value::<Response>(obj)
            .map(|r| r.success)
            .unwrap_or(false),
        _ => false,
    }
}

/// MATLAB's JSON writers have emitted `success` as a bool, as the strings
/// `"true"`/`"false"` and as 0/1.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid success flag: {}",
                other
            ))),
        },
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        other => Err(serde::de::Error::custom(format!(
            "invalid success flag: {}",
            other
        ))),
    }
}

/// Line numbers come back as doubles from MATLAB.
fn lenient_line<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(serde::de::Error::custom(format!(
            "invalid line number: {}",
            value
        )));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_tags() {
        let req = Request::RunFunction {
            func_name: "svd".to_string(),
            func_args: vec![json!(1)],
            nargout: 3,
            saveout: None,
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire,
            json!({"cmd": "run_function", "func_name": "svd", "func_args": [1], "nargout": 3})
        );
        assert_eq!(req.command(), "run_function");

        let wire = serde_json::to_value(Request::Connect).unwrap();
        assert_eq!(wire, json!({"cmd": "connect"}));
    }

    #[test]
    fn test_request_parses_back() {
        let req: Request =
            serde_json::from_value(json!({"cmd": "get_var", "varname": "a"})).unwrap();
        assert_eq!(
            req,
            Request::GetVar {
                varname: "a".to_string()
            }
        );
    }

    #[test]
    fn test_response_with_content_and_stack() {
        let raw = json!({
            "success": false,
            "result": null,
            "message": "boom",
            "content": {"stdout": "partial\n", "figures": ["/tmp/f1.png"], "datadir": "/tmp"},
            "stack": [{"name": "baz", "file": "/x/test_stack_trace.m", "line": 14.0}]
        });
        let resp: Response = serde_json::from_value(raw).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.stack[0].line, 14);
        assert_eq!(resp.stack[0].name, "baz");

        let reply = Reply::try_from(resp).unwrap();
        assert_eq!(reply.message.as_deref(), Some("boom"));
        assert_eq!(reply.stdout(), "partial\n");
        assert_eq!(reply.figures().len(), 1);
    }

    #[test]
    fn test_lenient_success_flag() {
        for (raw, expected) in [
            (json!("true"), true),
            (json!("false"), false),
            (json!(1), true),
            (json!(0), false),
            (json!(true), true),
        ] {
            let resp: Response = serde_json::from_value(json!({"success": raw})).unwrap();
            assert_eq!(resp.success, expected);
        }
        assert!(serde_json::from_value::<Response>(json!({"success": "maybe"})).is_err());
    }

    #[test]
    fn test_undefined_detection() {
        let by_id = Response {
            success: false,
            identifier: Some("MATLAB:UndefinedFunction".to_string()),
            message: Some("Undefined function 'nope' for input arguments of type 'double'.".to_string()),
            ..Default::default()
        };
        assert!(by_id.is_undefined_error());

        let octave = Response {
            success: false,
            message: Some("'this_is_nonsense' undefined near line 1 column 1".to_string()),
            ..Default::default()
        };
        assert!(octave.is_undefined_error());

        let in_stdout = Response {
            success: false,
            content: Some(Content {
                stdout: "Undefined function or variable 'this_is_nonsense'.\n".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(in_stdout.is_undefined_error());
        assert_eq!(
            in_stdout.failure_message(),
            "Undefined function or variable 'this_is_nonsense'."
        );

        let other = Response {
            success: false,
            identifier: Some("MATLAB:dimagree".to_string()),
            message: Some("Matrix dimensions must agree.".to_string()),
            ..Default::default()
        };
        assert!(!other.is_undefined_error());
    }

    #[test]
    fn test_acknowledgement() {
        assert!(is_acknowledgement("\"connected\"", CONNECTED_ACK));
        assert!(is_acknowledgement("connected", CONNECTED_ACK));
        assert!(is_acknowledgement("{\"success\": true}", CONNECTED_ACK));
        assert!(!is_acknowledgement("{\"success\": false}", CONNECTED_ACK));
        assert!(!is_acknowledgement("\"connected\"", EXIT_ACK));
        assert!(!is_acknowledgement("", EXIT_ACK));
    }
}
