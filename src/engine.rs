//! The aggregation engine: one task that serializes every state change.
//!
//! Bus events, scan reports, control-surface updates and timers are all
//! handled from a single `select!` loop, so the registry, the discovery state
//! and the publisher never need locking. Scans run in their own task and post
//! their report back into the loop.
//!
//! A scan subscribes to a candidate before reading it. Events for addresses
//! that are not registered yet are held back while a scan is in flight and
//! replayed once its report has been applied.

use crate::aggregator::{
    aggregate, check_settings, AggregateSnapshot, AggregationParams, ChargeLimits, SettingMismatch,
};
use crate::bus::{BusClient, BusError, BusEvent, BusEvents};
use crate::control::ControlSettings;
use crate::discovery::{self, DiscoveryState, ScanReport, ScanTarget};
use crate::error::AggregatorError;
use crate::member::{paths, MemberDevice};
use crate::publisher::VirtualDevicePublisher;
use crate::registry::DeviceRegistry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Relative spread above which member estimates are reported as diverging.
const DIVERGENCE_RATIO: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scan: ScanTarget,
    pub discovery_min: Duration,
    pub discovery_max: Duration,
    /// Scans without any member before a warning is logged.
    pub search_trials: u32,
    pub log_period: Option<Duration>,
    pub charge_limits: Option<ChargeLimits>,
}

type ScanResult = Result<ScanReport, BusError>;

pub struct AggregationEngine {
    bus: Arc<dyn BusClient>,
    events: BusEvents,
    control: watch::Receiver<ControlSettings>,
    control_open: bool,
    settings: EngineSettings,
    registry: DeviceRegistry,
    discovery: DiscoveryState,
    next_scan: Instant,
    scan_in_flight: bool,
    publisher: VirtualDevicePublisher,
    params: AggregationParams,
    snapshots: watch::Sender<AggregateSnapshot>,
    /// Member whose firmware version the virtual device mirrors.
    firmware_source: Option<String>,
    /// Events for unregistered addresses received while a scan runs.
    pending_events: Vec<BusEvent>,
    /// Last reported settings disagreement between members.
    settings_mismatches: Vec<SettingMismatch>,
    warned_no_members: bool,
    warned_ttg_divergence: bool,
}

impl AggregationEngine {
    pub fn new(
        bus: Arc<dyn BusClient>,
        events: BusEvents,
        control: watch::Receiver<ControlSettings>,
        publisher: VirtualDevicePublisher,
        settings: EngineSettings,
    ) -> Self {
        let params = AggregationParams {
            thresholds: control.borrow().thresholds,
            charge_limits: settings.charge_limits,
        };
        let (snapshots, _) = watch::channel(AggregateSnapshot::default());
        Self {
            bus,
            events,
            control,
            control_open: true,
            discovery: DiscoveryState::new(settings.discovery_min, settings.discovery_max),
            settings,
            registry: DeviceRegistry::new(),
            next_scan: Instant::now(),
            scan_in_flight: false,
            publisher,
            params,
            snapshots,
            firmware_source: None,
            pending_events: Vec::new(),
            settings_mismatches: Vec::new(),
            warned_no_members: false,
            warned_ttg_divergence: false,
        }
    }

    /// Receiver of every recomputed aggregate.
    pub fn snapshots(&self) -> watch::Receiver<AggregateSnapshot> {
        self.snapshots.subscribe()
    }

    /// Runs the engine on its own task.
    pub fn spawn(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let snapshots = self.snapshots();
        let task = tokio::spawn(self.run(async move {
            let _ = shutdown_rx.await;
        }));
        EngineHandle {
            shutdown: Some(shutdown_tx),
            snapshots,
            task,
        }
    }

    /// Runs until `shutdown` completes or the bus goes away. All
    /// subscriptions are removed before returning.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), AggregatorError> {
        let identity = self.publisher.identity();
        info!(
            service = %self.settings.scan.own_address,
            prefix = %self.settings.scan.prefix,
            device_instance = identity.device_instance,
            name = %identity.custom_name,
            "Starting aggregation engine"
        );
        let result = self.run_loop(shutdown).await;
        for address in self.registry.addresses() {
            discovery::unsubscribe_all(self.bus.as_ref(), &address);
        }
        match &result {
            Ok(()) => info!("Aggregation engine stopped"),
            Err(e) => warn!(error = %e, "Aggregation engine stopped"),
        }
        result
    }

    async fn run_loop(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), AggregatorError> {
        tokio::pin!(shutdown);
        let (scan_tx, mut scan_rx) = mpsc::channel::<ScanResult>(1);
        let log_period = self.settings.log_period;
        let period = log_period.unwrap_or(Duration::from_secs(3600));
        let mut status_timer = interval_at(Instant::now() + period, period);

        self.publisher
            .publish_static()
            .map(|_| ())
            .or_else(|e| tolerate("publishing identity", e))?;
        self.recompute()?;

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_bus_event(event)?,
                    None => {
                        return Err(AggregatorError::BusUnavailable(
                            "bus event channel closed".to_string(),
                        ))
                    }
                },
                Some(report) = scan_rx.recv() => self.handle_scan(report)?,
                _ = sleep_until(self.next_scan), if !self.scan_in_flight => {
                    self.start_scan(scan_tx.clone());
                }
                changed = self.control.changed(), if self.control_open => match changed {
                    Ok(()) => self.handle_control()?,
                    Err(_) => {
                        debug!("Control surface dropped, keeping last settings");
                        self.control_open = false;
                    }
                },
                _ = status_timer.tick(), if log_period.is_some() => self.log_status(),
            }
        }
    }

    fn start_scan(&mut self, reports: mpsc::Sender<ScanResult>) {
        self.scan_in_flight = true;
        let bus = self.bus.clone();
        let target = self.settings.scan.clone();
        let known: HashSet<String> = self.registry.addresses().into_iter().collect();
        debug!(scan = self.discovery.scans() + 1, "Scanning for shunts");
        tokio::spawn(async move {
            let report = discovery::scan(bus.as_ref(), &target, &known).await;
            // The engine is gone, nobody will own these subscriptions.
            if let Err(mpsc::error::SendError(Ok(report))) = reports.send(report).await {
                for device in &report.admitted {
                    discovery::unsubscribe_all(bus.as_ref(), &device.address);
                }
            }
        });
    }

    fn handle_scan(&mut self, report: ScanResult) -> Result<(), AggregatorError> {
        self.scan_in_flight = false;
        let result = match report {
            Ok(report) => self.apply_scan(report),
            Err(e) => tolerate("scanning", e).map(|()| (0, 0)),
        };
        self.pending_events.clear();
        let (admitted, rejected) = result?;

        let next = self.discovery.record_scan(admitted);
        self.next_scan = Instant::now() + next;
        debug!(
            admitted,
            rejected,
            members = self.registry.len(),
            enabled = self.registry.enabled_count(),
            idle_scans = self.discovery.consecutive_no_change(),
            next_scan_secs = next.as_secs_f64(),
            "Scan finished"
        );

        if self.registry.is_empty()
            && !self.warned_no_members
            && self.discovery.scans() >= u64::from(self.settings.search_trials)
        {
            warn!(
                scans = self.discovery.scans(),
                "No shunts found yet. Check that they are connected and not all excluded"
            );
            self.warned_no_members = true;
        }

        if admitted > 0 {
            self.recompute()?;
        }
        Ok(())
    }

    /// Admits the scan's devices, then catches them up on held back events.
    /// Returns how many devices were admitted and rejected.
    fn apply_scan(&mut self, report: ScanReport) -> Result<(usize, usize), AggregatorError> {
        for address in &report.rejected {
            debug!(%address, "Candidate not admitted");
        }
        let mut admitted = 0;
        for device in report.admitted {
            if self.admit(device)? {
                admitted += 1;
            }
        }
        self.replay_pending()?;
        Ok((admitted, report.rejected.len()))
    }

    /// Applies the events held back during the scan that now concern a
    /// registered member. The rest belong to rejected candidates.
    fn replay_pending(&mut self) -> Result<(), AggregatorError> {
        for event in std::mem::take(&mut self.pending_events) {
            if self.registry.contains(event_address(&event)) {
                self.handle_bus_event(event)?;
            }
        }
        Ok(())
    }

    /// Registers a probed device. The scan left it subscribed.
    fn admit(&mut self, device: MemberDevice) -> Result<bool, AggregatorError> {
        let address = device.address.clone();
        self.warn_on_capacity_deviation(&device);
        let control = self.control.borrow().clone();
        if !self.registry.admit(device, &control) {
            return Ok(false);
        }

        if let Some(member) = self.registry.get(&address) {
            info!(
                %address,
                instance = member.instance,
                name = %member.display_name(),
                enabled = member.enabled,
                capacity = member.snapshot.capacity,
                "Shunt admitted"
            );
        }
        if self.firmware_source.is_none() {
            self.firmware_source = Some(address);
            self.mirror_firmware()?;
        }
        Ok(true)
    }

    fn warn_on_capacity_deviation(&self, device: &MemberDevice) {
        let Some(capacity) = device.snapshot.capacity else {
            return;
        };
        let capacities: Vec<f64> = self
            .registry
            .members()
            .filter_map(|m| m.snapshot.capacity)
            .chain([capacity])
            .collect();
        if capacities.len() < 2 {
            return;
        }
        let mean = capacities.iter().sum::<f64>() / capacities.len() as f64;
        if mean > 0.0 && (capacity - mean).abs() / mean > DIVERGENCE_RATIO {
            warn!(
                address = %device.address,
                capacity,
                mean,
                "Shunt capacity differs by more than 20% from the bank average"
            );
        }
    }

    fn handle_bus_event(&mut self, event: BusEvent) -> Result<(), AggregatorError> {
        if !self.registry.contains(event_address(&event)) {
            if self.scan_in_flight {
                self.pending_events.push(event);
            }
            return Ok(());
        }
        match event {
            BusEvent::PropertyChanged {
                address,
                path,
                value,
            } => {
                if !self.registry.on_change(&address, &path, &value) {
                    return Ok(());
                }
                if path == paths::FIRMWARE_VERSION
                    && self.firmware_source.as_deref() == Some(address.as_str())
                {
                    self.mirror_firmware()?;
                }
                self.recompute()
            }
            BusEvent::DeviceLost { address } => {
                let Some(device) = self.registry.evict(&address) else {
                    return Ok(());
                };
                discovery::unsubscribe_all(self.bus.as_ref(), &address);
                info!(
                    %address,
                    name = %device.display_name(),
                    "Shunt lost"
                );
                self.discovery.reset();
                self.schedule_scan_soon();
                self.recompute()
            }
        }
    }

    fn handle_control(&mut self) -> Result<(), AggregatorError> {
        let settings = self.control.borrow_and_update().clone();
        let changes = self.registry.apply_control(&settings);
        if changes.is_empty() && settings.thresholds == self.params.thresholds {
            debug!("Control update changes nothing");
            return Ok(());
        }
        self.params.thresholds = settings.thresholds;
        for address in &changes.excluded {
            info!(%address, "Shunt excluded");
        }
        for address in &changes.included {
            info!(%address, "Shunt included");
        }
        for address in &changes.renamed {
            debug!(%address, "Shunt renamed");
        }
        if !changes.included.is_empty() {
            self.discovery.reset();
            self.schedule_scan_soon();
        }
        self.recompute()
    }

    fn schedule_scan_soon(&mut self) {
        if !self.scan_in_flight {
            self.next_scan = Instant::now() + self.discovery.interval();
        }
    }

    fn mirror_firmware(&mut self) -> Result<(), AggregatorError> {
        let firmware = self
            .firmware_source
            .as_deref()
            .and_then(|address| self.registry.get(address))
            .and_then(|member| member.firmware_version);
        if let Some(version) = firmware {
            self.publisher
                .set_firmware(version)
                .map(|_| ())
                .or_else(|e| tolerate("publishing firmware version", e))?;
        }
        Ok(())
    }

    /// Rebuilds the aggregate from the registry and publishes what changed.
    fn recompute(&mut self) -> Result<(), AggregatorError> {
        let snapshot = aggregate(self.registry.members(), &self.params);
        self.check_ttg_divergence(&snapshot);
        self.check_member_settings();
        match self.publisher.publish(&snapshot) {
            Ok(sent) => debug!(sent, members = snapshot.members.len(), "Aggregate published"),
            Err(e) => tolerate("publishing aggregate", e)?,
        }
        self.snapshots.send_replace(snapshot);
        Ok(())
    }

    fn check_ttg_divergence(&mut self, snapshot: &AggregateSnapshot) {
        if self.warned_ttg_divergence {
            return;
        }
        let Some(aggregate_ttg) = snapshot.time_to_go else {
            return;
        };
        let estimates: Vec<f64> = self
            .registry
            .members()
            .filter(|m| m.enabled)
            .filter_map(|m| m.snapshot.time_to_go)
            .filter(|ttg| *ttg > 0.0)
            .collect();
        let min = estimates.iter().copied().fold(f64::INFINITY, f64::min);
        let max = estimates.iter().copied().fold(0.0, f64::max);
        if estimates.len() >= 2 && max > 0.0 && (max - min) / max > DIVERGENCE_RATIO {
            warn!(
                min_hours = min / 3600.0,
                max_hours = max / 3600.0,
                aggregate_hours = aggregate_ttg / 3600.0,
                "Shunt time-to-go estimates diverge"
            );
            self.warned_ttg_divergence = true;
        }
    }

    /// Logs members whose shunt settings disagree, once per distinct
    /// disagreement. A charged voltage mismatch is a warning because the
    /// lowest value then limits charging.
    fn check_member_settings(&mut self) {
        let mismatches = check_settings(self.registry.members());
        if mismatches == self.settings_mismatches {
            return;
        }
        for mismatch in &mismatches {
            let values = mismatch
                .values
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect::<Vec<_>>()
                .join(", ");
            if mismatch.setting.is_critical() {
                warn!(
                    setting = mismatch.setting.label(),
                    min = mismatch.min,
                    max = mismatch.max,
                    %values,
                    "Shunts disagree on a critical setting, using the minimum"
                );
            } else {
                info!(
                    setting = mismatch.setting.label(),
                    min = mismatch.min,
                    max = mismatch.max,
                    %values,
                    "Shunt settings vary, matching values give a more accurate SoC"
                );
            }
        }
        if mismatches.is_empty() {
            info!("Shunt settings are consistent");
        }
        self.settings_mismatches = mismatches;
    }

    fn log_status(&self) {
        let snapshot = self.snapshots.borrow();
        if !snapshot.has_data() {
            info!(scans = self.discovery.scans(), "Status: no shunts");
            return;
        }
        info!(
            "Status: {}, {}, {} SoC from {} of {} shunts",
            format_value(snapshot.voltage, 2, "V"),
            format_value(snapshot.current, 1, "A"),
            format_value(snapshot.soc, 1, "%"),
            self.registry.enabled_count(),
            self.registry.len()
        );
        for member in self.registry.members() {
            let s = &member.snapshot;
            info!(
                "  |- {}{}: {}, {}, {}",
                member.display_name(),
                if member.enabled { "" } else { " (excluded)" },
                format_value(s.voltage, 2, "V"),
                format_value(s.current, 1, "A"),
                format_value(s.soc, 1, "%")
            );
        }
    }
}

fn event_address(event: &BusEvent) -> &str {
    match event {
        BusEvent::PropertyChanged { address, .. } | BusEvent::DeviceLost { address } => address,
    }
}

fn format_value(value: Option<f64>, decimals: usize, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.decimals$}{unit}"),
        None => format!("--{unit}"),
    }
}

/// Bus errors other than a lost bus are logged and survived.
fn tolerate(context: &str, error: BusError) -> Result<(), AggregatorError> {
    match error {
        BusError::Disconnected => Err(AggregatorError::BusUnavailable(format!(
            "bus disconnected while {context}"
        ))),
        other => {
            warn!(error = %other, "Bus error while {context}");
            Ok(())
        }
    }
}

/// Handle to an engine running on its own task.
pub struct EngineHandle {
    shutdown: Option<oneshot::Sender<()>>,
    snapshots: watch::Receiver<AggregateSnapshot>,
    task: JoinHandle<Result<(), AggregatorError>>,
}

impl EngineHandle {
    pub fn snapshots(&self) -> watch::Receiver<AggregateSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the engine and waits for it to finish.
    pub async fn shutdown(mut self) -> Result<(), AggregatorError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Waits for the engine to stop on its own.
    pub async fn join(self) -> Result<(), AggregatorError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AggregatorError::Task(e.to_string())),
        }
    }
}
