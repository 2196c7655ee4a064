//! Errors that end the engine. Per-device bus failures are logged and
//! survived instead, see `BusError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The bus itself went away. The engine cannot work without it.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine task failed: {0}")]
    Task(String),
}
