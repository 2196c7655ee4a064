//! Bus adapter for member shunts behind a Modbus TCP gateway.

use crate::bus::{BusClient, BusError, BusEvent, BusEvents, BusValue};
use crate::member::paths;
use crate::modbus_exporter::RegisterExporter;
use crate::register_map::{self, BLOCK_LEN, BLOCK_START};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_modbus::prelude::*;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ModbusBusSettings {
    pub gateway: SocketAddr,
    /// One unit id per member shunt behind the gateway.
    pub unit_ids: Vec<u8>,
    pub poll_interval: Duration,
    /// Consecutive failed polls after which a unit is reported lost.
    pub lost_after_failures: u32,
    /// Units appear on the bus as `{address_prefix}.unit{id}`.
    pub address_prefix: String,
}

pub fn unit_address(prefix: &str, unit: u8) -> String {
    format!("{prefix}.unit{unit}")
}

/// Bus adapter reading member shunts through a Modbus TCP gateway.
///
/// A background task polls the register block of every unit. Subscribed
/// properties whose decoded value differs from the previous poll are pushed
/// as change events. Properties the virtual device publishes are written into
/// the [`RegisterExporter`] bank.
///
/// Losing the gateway itself is fatal: once reconnecting fails the poller
/// stops, the event channel closes and every call returns
/// [`BusError::Disconnected`].
pub struct ModbusBus {
    shared: Arc<Mutex<PollState>>,
    exporter: RegisterExporter,
    poller: JoinHandle<()>,
}

impl ModbusBus {
    /// Starts polling the gateway and returns the client with its event
    /// receiver.
    pub fn connect(settings: ModbusBusSettings, exporter: RegisterExporter) -> (Self, BusEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let units = settings
            .unit_ids
            .iter()
            .map(|unit| {
                (
                    unit_address(&settings.address_prefix, *unit),
                    UnitState::new(*unit),
                )
            })
            .collect();
        let shared = Arc::new(Mutex::new(PollState {
            units,
            subscriptions: HashSet::new(),
            lost_after_failures: settings.lost_after_failures.max(1),
            disconnected: false,
        }));

        let gateway = Gateway::new(settings.gateway);
        let poller = tokio::spawn(poll_loop(
            gateway,
            shared.clone(),
            sender,
            settings.poll_interval,
        ));

        (
            Self {
                shared,
                exporter,
                poller,
            },
            receiver,
        )
    }

    fn state(&self) -> MutexGuard<'_, PollState> {
        lock(&self.shared)
    }

    /// The poll state, unless the gateway is gone.
    fn live_state(&self) -> Result<MutexGuard<'_, PollState>, BusError> {
        let state = self.state();
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        Ok(state)
    }
}

impl Drop for ModbusBus {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

fn lock(shared: &Mutex<PollState>) -> MutexGuard<'_, PollState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl BusClient for ModbusBus {
    async fn enumerate(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .live_state()?
            .units
            .iter()
            .filter(|(address, unit)| unit.block.is_some() && address.starts_with(prefix))
            .map(|(address, _)| address.clone())
            .collect())
    }

    async fn read_property(
        &self,
        address: &str,
        path: &str,
    ) -> Result<Option<BusValue>, BusError> {
        Ok(self
            .live_state()?
            .units
            .get(address)
            .and_then(|unit| unit.value(path)))
    }

    fn subscribe(&self, address: &str, path: &str) -> Result<(), BusError> {
        let mut state = self.live_state()?;
        if !state.units.contains_key(address) {
            return Err(BusError::UnknownAddress(address.to_string()));
        }
        state
            .subscriptions
            .insert((address.to_string(), path.to_string()));
        Ok(())
    }

    fn unsubscribe(&self, address: &str, path: &str) {
        self.state()
            .subscriptions
            .remove(&(address.to_string(), path.to_string()));
    }

    fn publish_property(&self, path: &str, value: BusValue) -> Result<(), BusError> {
        if self.exporter.set_property(path, &value) {
            Ok(())
        } else {
            Err(BusError::UnsupportedPath(path.to_string()))
        }
    }
}

#[derive(Debug)]
struct UnitState {
    unit: u8,
    /// Last good register block, `None` while the unit is absent.
    block: Option<Vec<u16>>,
    failures: u32,
}

impl UnitState {
    fn new(unit: u8) -> Self {
        Self {
            unit,
            block: None,
            failures: 0,
        }
    }

    fn value(&self, path: &str) -> Option<BusValue> {
        block_value(self.unit, self.block.as_ref()?, path)
    }
}

/// Decodes `path` out of a unit's register block. The device instance is the
/// unit id, which is stable for the lifetime of the gateway configuration.
fn block_value(unit: u8, block: &[u16], path: &str) -> Option<BusValue> {
    if path == paths::DEVICE_INSTANCE {
        return Some(BusValue::Int(unit.into()));
    }
    register_map::lookup(path).map(|spec| spec.decode_block(block))
}

#[derive(Debug)]
struct PollState {
    units: BTreeMap<String, UnitState>,
    subscriptions: HashSet<(String, String)>,
    lost_after_failures: u32,
    /// Set once the gateway could not be reached again.
    disconnected: bool,
}

impl PollState {
    /// Folds one poll result into the unit's state and returns the events it
    /// causes.
    fn record_poll(
        &mut self,
        address: &str,
        result: Result<Vec<u16>, BusError>,
    ) -> Vec<BusEvent> {
        let Some(unit) = self.units.get_mut(address) else {
            return Vec::new();
        };
        match result {
            Ok(block) => {
                unit.failures = 0;
                let previous = unit.block.replace(block);
                if previous.is_none() {
                    info!(%address, "Unit answering");
                }
                let unit = &*unit;
                self.subscriptions
                    .iter()
                    .filter(|(a, _)| a == address)
                    .filter_map(|(_, path)| {
                        let value = unit.value(path)?;
                        let old = previous
                            .as_deref()
                            .and_then(|block| block_value(unit.unit, block, path));
                        (old.as_ref() != Some(&value)).then(|| BusEvent::PropertyChanged {
                            address: address.to_string(),
                            path: path.clone(),
                            value,
                        })
                    })
                    .collect()
            }
            Err(e) => {
                if unit.block.is_none() {
                    return Vec::new();
                }
                unit.failures += 1;
                debug!(%address, failures = unit.failures, error = %e, "Poll failed");
                if unit.failures < self.lost_after_failures {
                    return Vec::new();
                }
                warn!(%address, failures = unit.failures, "Unit stopped answering");
                unit.block = None;
                unit.failures = 0;
                self.subscriptions.retain(|(a, _)| a != address);
                vec![BusEvent::DeviceLost {
                    address: address.to_string(),
                }]
            }
        }
    }
}

async fn poll_loop(
    mut gateway: Gateway,
    shared: Arc<Mutex<PollState>>,
    sender: UnboundedSender<BusEvent>,
    poll_interval: Duration,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let units: Vec<(String, u8)> = lock(&shared)
        .units
        .iter()
        .map(|(address, unit)| (address.clone(), unit.unit))
        .collect();

    loop {
        ticker.tick().await;
        for (address, unit) in &units {
            let result = gateway.read_block(*unit).await;
            if let Err(BusError::Disconnected) = result {
                error!(gateway = %gateway.target_address, "Modbus gateway unreachable, giving up");
                lock(&shared).disconnected = true;
                return;
            }
            let events = lock(&shared).record_poll(address, result);
            for event in events {
                if sender.send(event).is_err() {
                    debug!("Event receiver gone, stopping Modbus poller");
                    return;
                }
            }
        }
    }
}

/// Connection to the gateway, re-established after any transport error.
struct Gateway {
    target_address: SocketAddr,
    connection: Option<client::Context>,
}

impl Gateway {
    fn new(target_address: SocketAddr) -> Self {
        Self {
            target_address,
            connection: None,
        }
    }

    /// Reads the whole register block of one unit. `Disconnected` means the
    /// gateway could not be reached at all.
    async fn read_block(&mut self, unit: u8) -> Result<Vec<u16>, BusError> {
        if self.connection.is_none() {
            self.connection = connect_with_retry(self.target_address).await;
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(BusError::Disconnected);
        };

        connection.set_slave(Slave(unit));
        match connection.read_holding_registers(BLOCK_START, BLOCK_LEN).await {
            Ok(Ok(words)) if words.len() == usize::from(BLOCK_LEN) => Ok(words),
            Ok(Ok(words)) => Err(BusError::Io(format!(
                "short read of {} registers",
                words.len()
            ))),
            Ok(Err(exception)) => Err(BusError::Io(format!("Modbus exception: {exception:?}"))),
            Err(e) => {
                // Transport failure, reconnect on the next read.
                self.connection = None;
                Err(BusError::Io(format!("Modbus read failed: {e}")))
            }
        }
    }
}

const CONNECT_ATTEMPTS: u32 = 3;

/// Connects to the gateway, backing off exponentially between attempts.
async fn connect_with_retry(target: SocketAddr) -> Option<client::Context> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        debug!(gateway = %target, attempt, "Connecting to Modbus gateway");
        match tcp::connect(target).await {
            Ok(connection) => {
                info!(gateway = %target, "Connected to Modbus gateway");
                return Some(connection);
            }
            Err(e) => {
                warn!(gateway = %target, attempt, error = %e, "Gateway connection failed");
                if attempt < CONNECT_ATTEMPTS {
                    sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }
    None
}
