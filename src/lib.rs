//! Shunt Aggregator Library
//!
//! Discovers battery shunts on a message bus, merges their readings into one
//! virtual battery monitor and republishes it on the same bus. Members can be
//! read in-process through [`local_bus::LocalBus`] or polled through a Modbus
//! TCP gateway with [`modbus_bus::ModbusBus`].

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod control;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod local_bus;
pub mod member;
pub mod modbus_bus;
pub mod modbus_exporter;
pub mod publisher;
pub mod register_map;
pub mod registry;

// Re-export commonly used types for easier access
pub use aggregator::{aggregate, AggregateSnapshot, AggregationParams};
pub use bus::{BusClient, BusError, BusEvent, BusValue};
pub use config::Config;
pub use control::{ControlSettings, ControlSurface, ShuntSelector};
pub use engine::{AggregationEngine, EngineHandle, EngineSettings};
pub use error::AggregatorError;
pub use local_bus::LocalBus;
pub use member::MemberDevice;
pub use modbus_bus::{ModbusBus, ModbusBusSettings};
pub use modbus_exporter::RegisterExporter;
pub use publisher::{DeviceIdentity, VirtualDevicePublisher};
