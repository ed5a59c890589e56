//! Engine functions as local callables.
//!
//! [`Session::resolve`](crate::Session::resolve) checks that a function
//! exists once and hands back a [`BoundFunction`]; later lookups of the same
//! name come from the session's binding cache. A call that proves the function
//! missing evicts the binding and blacklists the name, so the next lookup
//! fails without a round trip.
//!
//! ```ignore
//! let svd = session.resolve("svd").await?;
//! let outputs = svd.call(Args::new().arg(matrix).nargout(3)).await?;
//! ```

use std::sync::Weak;

use tracing::debug;

use crate::codec::{self, CodecError, Value};
use crate::error::{BridgeError, Result};
use crate::proxy::RemoteVar;
use crate::session::{Session, Shared};

/// Arguments for one engine call.
///
/// Keyword arguments are sent after the positional ones as `'Name', value`
/// pairs, the engine's own convention:
/// `plot(x, y, '--', LineWidth=2)` is sent as `plot(x, y, '--', 'LineWidth', 2)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
    nargout: Option<usize>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a keyword argument. Setting the same name twice keeps the first
    /// position and the last value.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.keywords.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.keywords.push((name, value)),
        }
        self
    }

    /// Number of outputs to request. Defaults to 1.
    pub fn nargout(mut self, n: usize) -> Self {
        self.nargout = Some(n);
        self
    }

    pub fn nargout_value(&self) -> usize {
        self.nargout.unwrap_or(1)
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &[(String, Value)] {
        &self.keywords
    }

    /// Positional arguments followed by the keyword pairs.
    pub fn flatten(&self) -> Vec<Value> {
        let mut flat = self.positional.clone();
        for (name, value) in &self.keywords {
            flat.push(Value::Str(name.clone()));
            flat.push(value.clone());
        }
        flat
    }

    pub(crate) fn encode(&self) -> std::result::Result<Vec<serde_json::Value>, CodecError> {
        self.flatten().iter().map(codec::encode).collect()
    }
}

impl<V: Into<Value>> FromIterator<V> for Args {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            ..Self::default()
        }
    }
}

/// Entry in a session's binding cache.
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Bound(BoundFunction),
    /// The name proved missing at call time.
    Absent,
}

/// A named engine function bound to a session.
///
/// Holds a weak reference: a bound function never keeps the engine alive,
/// and calling one after its session is gone fails with
/// [`BridgeError::SessionClosed`].
#[derive(Debug, Clone)]
pub struct BoundFunction {
    name: String,
    session: Weak<Shared>,
}

impl BoundFunction {
    pub(crate) fn new(name: impl Into<String>, session: Weak<Shared>) -> Self {
        Self {
            name: name.into(),
            session,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.session.strong_count() > 0
    }

    /// Call the function and return its result.
    ///
    /// With `nargout > 1` the result is a [`Value::List`] of the outputs.
    pub async fn call(&self, args: Args) -> Result<Value> {
        let session = self.session()?;
        let outcome = session.invoke(&self.name, &args).await;
        self.settle(&session, outcome).map(|reply| reply.result)
    }

    /// Call the function, leaving its outputs in the workspace under `names`.
    pub async fn call_saved(&self, args: Args, names: &[&str]) -> Result<Vec<RemoteVar>> {
        let session = self.session()?;
        let outcome = session.invoke_saved(&self.name, &args, names).await;
        self.settle(&session, outcome)
    }

    fn session(&self) -> Result<Session> {
        Session::upgrade(&self.session).ok_or(BridgeError::SessionClosed)
    }

    fn settle<T>(&self, session: &Session, outcome: Result<T>) -> Result<T> {
        if let Err(BridgeError::UndefinedName { name }) = &outcome {
            if *name == self.name {
                debug!("Evicting binding for {}", self.name);
                session.blacklist(&self.name);
            }
        }
        outcome
    }
}
