//! Objects addressable across the gateway
//!
//! Everything the peer can call (the entry point, reader handles) and
//! everything the gateway can call on the peer (registered callback objects)
//! implements [`GatewayObject`].

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Value produced by a call
pub enum Returned {
    /// Plain JSON value sent back as-is
    Value(Value),
    /// New object; the gateway stores it and hands the peer an object id
    Object(Arc<dyn GatewayObject>),
}

impl Returned {
    pub fn unit() -> Self {
        Returned::Value(Value::Null)
    }

    /// Extract the plain value, mapping object results to an error
    pub fn into_value(self) -> Result<Value, CallError> {
        match self {
            Returned::Value(v) => Ok(v),
            Returned::Object(_) => Err(CallError::Failed(
                "expected a value, got an object reference".to_string(),
            )),
        }
    }
}

impl From<Value> for Returned {
    fn from(v: Value) -> Self {
        Returned::Value(v)
    }
}

impl std::fmt::Debug for Returned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Returned::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Returned::Object(_) => f.write_str("Object(..)"),
        }
    }
}

/// Error type for a single call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No object under this id
    UnknownObject(String),
    /// Object has no such method
    UnknownMethod(String),
    /// Arguments did not match the method's signature
    InvalidArguments(String),
    /// The peer has not opened the callback connection yet
    NotConnected,
    /// Peer did not answer within the call timeout
    Timeout,
    /// Callback connection dropped, during the call or before it
    PeerDisconnected,
    /// The remote side answered with an error
    Remote(String),
    /// Call could not complete
    Failed(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::UnknownObject(id) => write!(f, "Unknown object: {}", id),
            CallError::UnknownMethod(m) => write!(f, "Unknown method: {}", m),
            CallError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            CallError::NotConnected => write!(f, "Callback channel is not connected"),
            CallError::Timeout => write!(f, "Call timed out"),
            CallError::PeerDisconnected => write!(f, "Peer disconnected"),
            CallError::Remote(msg) => write!(f, "Remote error: {}", msg),
            CallError::Failed(msg) => write!(f, "Call failed: {}", msg),
        }
    }
}

impl std::error::Error for CallError {}

pub type CallResult = Result<Returned, CallError>;

/// An object reachable through the gateway
pub trait GatewayObject: Send + Sync + 'static {
    /// Invoke `method` with positional JSON arguments
    fn invoke<'a>(&'a self, method: &'a str, args: Args) -> BoxFuture<'a, CallResult>;
}

/// Positional call arguments with typed accessors
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Args { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.values
    }

    /// Required argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallError> {
        let value = self.values.get(index).ok_or_else(|| {
            CallError::InvalidArguments(format!(
                "missing argument {} (got {})",
                index,
                self.values.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| CallError::InvalidArguments(format!("argument {}: {}", index, e)))
    }

    /// Optional argument at `index`; absent and `null` both map to `None`
    pub fn opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, CallError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    /// Reject calls with more than `max` arguments
    pub fn expect_at_most(&self, max: usize) -> Result<(), CallError> {
        if self.values.len() > max {
            return Err(CallError::InvalidArguments(format!(
                "expected at most {} arguments, got {}",
                max,
                self.values.len()
            )));
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Args::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_typed_access() {
        let args = Args::new(vec![json!("db"), json!(10), json!(null)]);
        assert_eq!(args.get::<String>(0).unwrap(), "db");
        assert_eq!(args.get::<u32>(1).unwrap(), 10);
        assert_eq!(args.opt::<String>(2).unwrap(), None);
        assert_eq!(args.opt::<String>(3).unwrap(), None);
    }

    #[test]
    fn test_args_errors() {
        let args = Args::new(vec![json!("db")]);
        assert!(matches!(
            args.get::<String>(1),
            Err(CallError::InvalidArguments(_))
        ));
        assert!(matches!(
            args.get::<u32>(0),
            Err(CallError::InvalidArguments(_))
        ));
        assert!(args.expect_at_most(0).is_err());
        assert!(args.expect_at_most(1).is_ok());
    }
}
