//! In-process object bus.
//!
//! Services are property maps keyed by address. Clients connected through
//! [`LocalBus::connect`] can enumerate and read any service, subscribe to
//! individual properties and publish into their own service. Used when the
//! engine is embedded next to the producers, and throughout the tests.

use crate::bus::{BusClient, BusError, BusEvent, BusEvents, BusValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

type PropertyMap = BTreeMap<String, BusValue>;

struct Client {
    id: u64,
    sender: UnboundedSender<BusEvent>,
    subscriptions: HashSet<(String, String)>,
}

#[derive(Default)]
struct BusState {
    services: BTreeMap<String, PropertyMap>,
    clients: Vec<Client>,
    next_client_id: u64,
}

impl BusState {
    fn notify(&mut self, address: &str, path: &str, value: &BusValue) {
        let key = (address.to_string(), path.to_string());
        self.clients.retain(|client| {
            if !client.subscriptions.contains(&key) {
                return true;
            }
            client
                .sender
                .send(BusEvent::PropertyChanged {
                    address: address.to_string(),
                    path: path.to_string(),
                    value: value.clone(),
                })
                .is_ok()
        });
    }
}

/// Shared handle to the bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds (or replaces) a service with an initial property set.
    pub fn register_service<I, P, V>(&self, address: &str, properties: I)
    where
        I: IntoIterator<Item = (P, V)>,
        P: Into<String>,
        V: Into<BusValue>,
    {
        let properties = properties
            .into_iter()
            .map(|(path, value)| (path.into(), value.into()))
            .collect();
        self.state().services.insert(address.to_string(), properties);
    }

    /// Sets one property and notifies subscribers if the value changed.
    /// Returns false if the service does not exist.
    pub fn set_value(&self, address: &str, path: &str, value: impl Into<BusValue>) -> bool {
        let value = value.into();
        let mut state = self.state();
        let Some(service) = state.services.get_mut(address) else {
            return false;
        };
        if service.get(path) == Some(&value) {
            return true;
        }
        service.insert(path.to_string(), value.clone());
        state.notify(address, path, &value);
        true
    }

    /// Removes a service. Clients subscribed to any of its properties are
    /// told the address is gone.
    pub fn remove_service(&self, address: &str) -> bool {
        let mut state = self.state();
        if state.services.remove(address).is_none() {
            return false;
        }
        state.clients.retain_mut(|client| {
            let before = client.subscriptions.len();
            client.subscriptions.retain(|(a, _)| a != address);
            if client.subscriptions.len() == before {
                return true;
            }
            client
                .sender
                .send(BusEvent::DeviceLost {
                    address: address.to_string(),
                })
                .is_ok()
        });
        true
    }

    pub fn value(&self, address: &str, path: &str) -> Option<BusValue> {
        self.state()
            .services
            .get(address)
            .and_then(|service| service.get(path).cloned())
    }

    pub fn subscription_count(&self, address: &str) -> usize {
        self.state()
            .clients
            .iter()
            .flat_map(|client| client.subscriptions.iter())
            .filter(|(a, _)| a == address)
            .count()
    }

    /// Drops every client's event channel, as if the bus went away.
    pub fn disconnect_all(&self) {
        self.state().clients.clear();
    }

    /// Connects a client owning the service `own_address`.
    pub fn connect(&self, own_address: &str) -> (LocalBusClient, BusEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.push(Client {
            id,
            sender,
            subscriptions: HashSet::new(),
        });
        state
            .services
            .entry(own_address.to_string())
            .or_default();
        debug!(own_address, id, "Client connected to local bus");
        (
            LocalBusClient {
                bus: self.clone(),
                id,
                own_address: own_address.to_string(),
            },
            receiver,
        )
    }
}

pub struct LocalBusClient {
    bus: LocalBus,
    id: u64,
    own_address: String,
}

#[async_trait]
impl BusClient for LocalBusClient {
    async fn enumerate(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .bus
            .state()
            .services
            .keys()
            .filter(|address| address.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read_property(&self, address: &str, path: &str) -> Result<Option<BusValue>, BusError> {
        Ok(self.bus.value(address, path))
    }

    fn subscribe(&self, address: &str, path: &str) -> Result<(), BusError> {
        let mut state = self.bus.state();
        if !state.services.contains_key(address) {
            return Err(BusError::UnknownAddress(address.to_string()));
        }
        let client = state
            .clients
            .iter_mut()
            .find(|client| client.id == self.id)
            .ok_or(BusError::Disconnected)?;
        client
            .subscriptions
            .insert((address.to_string(), path.to_string()));
        Ok(())
    }

    fn unsubscribe(&self, address: &str, path: &str) {
        let mut state = self.bus.state();
        if let Some(client) = state.clients.iter_mut().find(|client| client.id == self.id) {
            client
                .subscriptions
                .remove(&(address.to_string(), path.to_string()));
        }
    }

    fn publish_property(&self, path: &str, value: BusValue) -> Result<(), BusError> {
        if self.bus.set_value(&self.own_address, path, value) {
            Ok(())
        } else {
            Err(BusError::UnknownAddress(self.own_address.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::paths;
    use tokio_test::assert_ok;

    const SHUNT: &str = "com.victronenergy.battery.ttyS5";

    fn bus_with_shunt() -> LocalBus {
        let bus = LocalBus::new();
        bus.register_service(
            SHUNT,
            [
                (paths::DEVICE_INSTANCE, BusValue::Int(278)),
                (paths::DC_VOLTAGE, BusValue::Float(13.2)),
            ],
        );
        bus
    }

    #[tokio::test]
    async fn test_enumerate_and_read() {
        let bus = bus_with_shunt();
        let (client, _events) = bus.connect("com.victronenergy.battery.aggregate");

        let addresses = assert_ok!(client.enumerate("com.victronenergy.battery").await);
        assert_eq!(
            addresses,
            vec![
                "com.victronenergy.battery.aggregate".to_string(),
                SHUNT.to_string()
            ]
        );
        let voltage = assert_ok!(client.read_property(SHUNT, paths::DC_VOLTAGE).await);
        assert_eq!(voltage, Some(BusValue::Float(13.2)));
        let missing = assert_ok!(client.read_property(SHUNT, paths::SOC).await);
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_subscribers_see_only_real_changes() {
        let bus = bus_with_shunt();
        let (client, mut events) = bus.connect("com.victronenergy.battery.aggregate");
        assert_ok!(client.subscribe(SHUNT, paths::DC_VOLTAGE));

        bus.set_value(SHUNT, paths::DC_VOLTAGE, 13.2);
        bus.set_value(SHUNT, paths::DC_CURRENT, 4.0);
        bus.set_value(SHUNT, paths::DC_VOLTAGE, 13.3);

        assert_eq!(
            events.try_recv().unwrap(),
            BusEvent::PropertyChanged {
                address: SHUNT.to_string(),
                path: paths::DC_VOLTAGE.to_string(),
                value: BusValue::Float(13.3),
            }
        );
        assert!(events.try_recv().is_err());

        client.unsubscribe(SHUNT, paths::DC_VOLTAGE);
        bus.set_value(SHUNT, paths::DC_VOLTAGE, 13.4);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_service_reports_loss_to_subscribers() {
        let bus = bus_with_shunt();
        let (client, mut events) = bus.connect("com.victronenergy.battery.aggregate");
        let (_other, mut other_events) = bus.connect("com.victronenergy.system");
        assert_ok!(client.subscribe(SHUNT, paths::DC_VOLTAGE));
        assert_eq!(bus.subscription_count(SHUNT), 1);

        assert!(bus.remove_service(SHUNT));
        assert_eq!(
            events.try_recv().unwrap(),
            BusEvent::DeviceLost {
                address: SHUNT.to_string()
            }
        );
        assert!(other_events.try_recv().is_err());
        assert_eq!(bus.subscription_count(SHUNT), 0);
        assert_eq!(
            client.subscribe(SHUNT, paths::DC_VOLTAGE),
            Err(BusError::UnknownAddress(SHUNT.to_string()))
        );
    }

    #[tokio::test]
    async fn test_publish_goes_to_own_service() {
        let bus = LocalBus::new();
        let (client, _events) = bus.connect("com.victronenergy.battery.aggregate");
        assert_ok!(client.publish_property(paths::SOC, BusValue::Float(71.5)));
        assert_eq!(
            bus.value("com.victronenergy.battery.aggregate", paths::SOC),
            Some(BusValue::Float(71.5))
        );
    }

    #[tokio::test]
    async fn test_disconnect_closes_event_channels() {
        let bus = LocalBus::new();
        let (_client, mut events) = bus.connect("com.victronenergy.battery.aggregate");
        bus.disconnect_all();
        assert!(events.recv().await.is_none());
    }
}
