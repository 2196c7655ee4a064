//! Narrow capability set the engine needs from the object bus.
//!
//! Everything the aggregation engine knows about the outside world goes
//! through [`BusClient`]: enumerate addresses, read a property, subscribe to
//! property changes and publish the virtual device's own property tree.
//! Change notifications and device loss arrive as [`BusEvent`]s on the
//! receiver handed out when a client is created.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// A property value as carried on the bus.
///
/// `Empty` is the bus' "no data" marker and is distinct from a known zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl BusValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, BusValue::Empty)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(v) => Some(*v),
            BusValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            BusValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Empty => write!(f, "--"),
            BusValue::Int(v) => write!(f, "{v}"),
            BusValue::Float(v) => write!(f, "{v}"),
            BusValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Float(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

impl From<u32> for BusValue {
    fn from(value: u32) -> Self {
        BusValue::Int(value as i64)
    }
}

impl From<bool> for BusValue {
    fn from(value: bool) -> Self {
        BusValue::Int(value as i64)
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Text(value.to_string())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        BusValue::Text(value)
    }
}

impl<T: Into<BusValue>> From<Option<T>> for BusValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(BusValue::Empty)
    }
}

/// Notifications pushed by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A subscribed property of `address` changed.
    PropertyChanged {
        address: String,
        path: String,
        value: BusValue,
    },
    /// `address` is no longer resolvable on the bus.
    DeviceLost { address: String },
}

pub type BusEvents = UnboundedReceiver<BusEvent>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Disconnected,
    #[error("bus I/O error: {0}")]
    Io(String),
    #[error("unknown address `{0}`")]
    UnknownAddress(String),
    #[error("path `{0}` cannot be published on this bus")]
    UnsupportedPath(String),
}

/// Capability set consumed by the aggregation engine.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Lists every address whose name starts with `prefix`.
    async fn enumerate(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    /// Reads one property. `Ok(None)` means the property (or the address)
    /// does not resolve right now.
    async fn read_property(&self, address: &str, path: &str)
        -> Result<Option<BusValue>, BusError>;

    fn subscribe(&self, address: &str, path: &str) -> Result<(), BusError>;

    fn unsubscribe(&self, address: &str, path: &str);

    /// Updates a property of this client's own service.
    fn publish_property(&self, path: &str, value: BusValue) -> Result<(), BusError>;
}
