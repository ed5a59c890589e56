//! Handles to values left in the engine workspace.
//!
//! A call made with output names ("save output as `X`") leaves its results in
//! the remote workspace and reports back one descriptor entry per variable:
//!
//! ```text
//! __VAR=Y|double([5 3]);__VAR=X|double([5 3]);
//! ```
//!
//! Each entry becomes a [`RemoteVar`]. Its `Display` form is the bare variable
//! name, so it can be spliced into later code run with
//! [`Session::run_code`](crate::Session::run_code); call [`RemoteVar::fetch`]
//! to pull the value itself.

use std::fmt;
use std::sync::Weak;

use thiserror::Error;

use crate::codec::Value;
use crate::error::{BridgeError, Result};
use crate::session::{Session, Shared};

const ENTRY_PREFIX: &str = "__VAR=";

/// Malformed descriptor text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor entry `{0}` does not start with `__VAR=`")]
    MissingPrefix(String),

    #[error("descriptor entry `{0}` has no `|` separator")]
    MissingClass(String),

    #[error("descriptor entry `{0}` has an empty variable name")]
    EmptyName(String),

    #[error("descriptor entry `{0}` has a malformed shape")]
    BadShape(String),

    #[error("engine did not report requested variable `{0}`")]
    MissingVariable(String),
}

/// One parsed descriptor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDescriptor {
    pub name: String,
    /// Element class as reported by the engine, e.g. `double`.
    pub class: String,
    pub shape: Vec<usize>,
}

/// Parse a descriptor string into its entries, in report order.
pub fn parse_descriptor(text: &str) -> std::result::Result<Vec<VarDescriptor>, DescriptorError> {
    text.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> std::result::Result<VarDescriptor, DescriptorError> {
    let body = entry
        .strip_prefix(ENTRY_PREFIX)
        .ok_or_else(|| DescriptorError::MissingPrefix(entry.to_string()))?;
    let (name, type_part) = body
        .split_once('|')
        .ok_or_else(|| DescriptorError::MissingClass(entry.to_string()))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(DescriptorError::EmptyName(entry.to_string()));
    }

    let bad_shape = || DescriptorError::BadShape(entry.to_string());
    let (class, dims) = type_part.split_once('(').ok_or_else(bad_shape)?;
    let dims = dims
        .trim()
        .strip_suffix(')')
        .and_then(|d| d.trim().strip_prefix('['))
        .and_then(|d| d.strip_suffix(']'))
        .ok_or_else(bad_shape)?;
    let shape = dims
        .split_whitespace()
        .map(|d| d.parse::<usize>().map_err(|_| bad_shape()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if shape.is_empty() {
        return Err(bad_shape());
    }

    Ok(VarDescriptor {
        name: name.to_string(),
        class: class.trim().to_string(),
        shape,
    })
}

/// Reorder `descriptors` to follow `requested`.
///
/// The engine reports outputs in whatever order it assigned them; callers
/// get them back in the order they asked for.
pub(crate) fn order_by_request(
    mut descriptors: Vec<VarDescriptor>,
    requested: &[String],
) -> std::result::Result<Vec<VarDescriptor>, DescriptorError> {
    requested
        .iter()
        .map(|name| {
            descriptors
                .iter()
                .position(|d| &d.name == name)
                .map(|pos| descriptors.swap_remove(pos))
                .ok_or_else(|| DescriptorError::MissingVariable(name.clone()))
        })
        .collect()
}

/// A variable that lives in the engine workspace.
///
/// Displays as its bare name so it can be spliced into code strings.
#[derive(Debug, Clone)]
pub struct RemoteVar {
    descriptor: VarDescriptor,
    session: Weak<Shared>,
}

impl RemoteVar {
    pub(crate) fn new(descriptor: VarDescriptor, session: Weak<Shared>) -> Self {
        Self {
            descriptor,
            session,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn class(&self) -> &str {
        &self.descriptor.class
    }

    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    /// Whether the owning session still exists.
    pub fn is_alive(&self) -> bool {
        self.session.strong_count() > 0
    }

    /// Fetch the current value from the workspace.
    ///
    /// A variable that has since been cleared is an [`BridgeError::UndefinedName`].
    pub async fn fetch(&self) -> Result<Value> {
        let session = Session::upgrade(&self.session).ok_or(BridgeError::SessionClosed)?;
        session
            .get_variable(self.name())
            .await?
            .ok_or_else(|| BridgeError::UndefinedName {
                name: self.name().to_string(),
            })
    }
}

impl fmt::Display for RemoteVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
