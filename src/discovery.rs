//! Member discovery: adaptive scan interval and the admission probe.

use crate::bus::{BusClient, BusError, BusValue};
use crate::member::{paths, MemberDevice, MONITORED_PATHS, REQUIRED_PATHS};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Scan scheduling state, owned by the engine.
///
/// A scan that finds nothing new doubles the interval up to `max`. Finding a
/// device, losing one or re-including one brings it back to `min`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryState {
    interval: Duration,
    min: Duration,
    max: Duration,
    consecutive_no_change: u32,
    scans: u64,
}

impl DiscoveryState {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            interval: min,
            min,
            max,
            consecutive_no_change: 0,
            scans: 0,
        }
    }

    /// Records a finished scan and returns the delay before the next one.
    pub fn record_scan(&mut self, new_found: usize) -> Duration {
        self.scans += 1;
        if new_found > 0 {
            self.consecutive_no_change = 0;
            self.interval = self.min;
        } else {
            self.consecutive_no_change = self.consecutive_no_change.saturating_add(1);
            self.interval = self.interval.saturating_mul(2).min(self.max);
        }
        self.interval
    }

    pub fn reset(&mut self) {
        self.consecutive_no_change = 0;
        self.interval = self.min;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn scans(&self) -> u64 {
        self.scans
    }

    pub fn consecutive_no_change(&self) -> u32 {
        self.consecutive_no_change
    }
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Devices that answered the probe, ready to be registered.
    pub admitted: Vec<MemberDevice>,
    /// Addresses that were probed but did not qualify this time.
    pub rejected: Vec<String>,
}

/// Parameters of a scan that do not change between passes.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub prefix: String,
    pub own_address: String,
    /// Substring a resolvable `/ProductName` must contain.
    pub product_match: String,
}

/// Enumerates candidate addresses and probes every one that is not known yet.
///
/// Only a lost bus is an error. Individual probe failures reject the
/// candidate and it is retried on the next scan.
pub async fn scan(
    bus: &dyn BusClient,
    target: &ScanTarget,
    known: &HashSet<String>,
) -> Result<ScanReport, BusError> {
    let mut report = ScanReport::default();
    let candidates = bus.enumerate(&target.prefix).await?;

    for address in candidates {
        if address == target.own_address || known.contains(&address) {
            continue;
        }
        match probe(bus, &address, &target.product_match).await? {
            Some(device) => {
                info!(
                    address = %device.address,
                    instance = device.instance,
                    name = %device.display_name(),
                    "Found shunt"
                );
                report.admitted.push(device);
            }
            None => report.rejected.push(address),
        }
    }
    Ok(report)
}

/// Subscribes to every monitored property of `address`, then reads them.
///
/// Subscriptions are in place before the first read, so a change that lands
/// while the device is being read still arrives as an event. A device that
/// does not qualify has its subscriptions removed again.
async fn probe(
    bus: &dyn BusClient,
    address: &str,
    product_match: &str,
) -> Result<Option<MemberDevice>, BusError> {
    for path in MONITORED_PATHS {
        match bus.subscribe(address, path) {
            Ok(()) => {}
            Err(BusError::Disconnected) => return Err(BusError::Disconnected),
            Err(e) => {
                debug!(%address, error = %e, "Subscription failed, skipping for now");
                unsubscribe_all(bus, address);
                return Ok(None);
            }
        }
    }

    let result = read_device(bus, address, product_match).await;
    if !matches!(result, Ok(Some(_))) {
        unsubscribe_all(bus, address);
    }
    result
}

/// Returns `None` when a required property does not resolve or the product
/// does not match.
async fn read_device(
    bus: &dyn BusClient,
    address: &str,
    product_match: &str,
) -> Result<Option<MemberDevice>, BusError> {
    let mut values: Vec<(&str, BusValue)> = Vec::with_capacity(MONITORED_PATHS.len());
    for path in MONITORED_PATHS {
        match bus.read_property(address, path).await {
            Ok(Some(value)) => values.push((*path, value)),
            Ok(None) => {}
            Err(BusError::Disconnected) => return Err(BusError::Disconnected),
            Err(e) => {
                debug!(%address, path, error = %e, "Probe read failed");
            }
        }
    }

    let lookup = |wanted: &str| {
        values
            .iter()
            .find(|(path, _)| *path == wanted)
            .map(|(_, value)| value)
    };

    if let Some(missing) = REQUIRED_PATHS
        .into_iter()
        .find(|&path| lookup(path).map_or(true, BusValue::is_empty))
    {
        debug!(%address, path = missing, "Probe incomplete, skipping for now");
        return Ok(None);
    }

    if let Some(product) = lookup(paths::PRODUCT_NAME).and_then(BusValue::as_text) {
        if !product.contains(product_match) {
            debug!(%address, product, "Not a matching product");
            return Ok(None);
        }
    }

    let Some(instance) = lookup(paths::DEVICE_INSTANCE)
        .and_then(BusValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
    else {
        debug!(%address, "Device instance is not a valid id");
        return Ok(None);
    };

    let mut device = MemberDevice::new(address, instance);
    for (path, value) in &values {
        device.apply(path, value);
    }
    if device.snapshot.capacity.is_none() {
        info!(%address, "Installed capacity not reported, shunt will not weigh into the SoC");
    }
    Ok(Some(device))
}

pub fn unsubscribe_all(bus: &dyn BusClient, address: &str) {
    for path in MONITORED_PATHS {
        bus.unsubscribe(address, path);
    }
}
