//! The device as one owned context.
//!
//! Each tick services, in order: the link, the handshake, the command
//! processor (poll, then one execution) and finally event delivery. Commands
//! go first so a pending reset or reboot never waits behind a stalled upload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::DeviceClock;
use crate::commands::{CommandProcessor, CommandRecord, CommandType, ExecutionContext, FollowUp, PollOutcome};
use crate::config::Config;
use crate::connectivity::{ConnectivityManager, ConnectivitySettings, LinkQuality, LinkState};
use crate::delivery::{DeliveryEngine, DeliveryOutcome};
use crate::identity::{HandshakeOutcome, IdentityClient};
use crate::link::Link;
use crate::net::{Backend, TransportError};
use crate::queue::{QueueError, RecordQueue};
use crate::storage::{CounterState, StateStore, StoreError};
use crate::types::{CounterSnapshot, EventKind, Treatment, TreatmentEvent};

#[derive(Debug, Error)]
pub enum TreatmentError {
    #[error("counter persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("event queue full, event {event_id} not queued")]
    QueueFull { event_id: String },
    #[error("event queue error: {0}")]
    Queue(QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// A reboot command ran; restart after the reboot delay.
    Reboot,
}

/// Local view of the device, available without connectivity.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device_id: Option<String>,
    pub identified: bool,
    pub assigned: bool,
    pub mac: String,
    pub firmware: String,
    pub counters: CounterSnapshot,
    pub reset_epoch: u32,
    /// `None` when the queue file cannot be read.
    pub queued_events: Option<usize>,
    pub queued_event_bytes: u64,
    pub queued_commands: Option<usize>,
    pub queued_command_bytes: u64,
    pub link_state: LinkState,
    pub quality: LinkQuality,
    pub upload_failures: u32,
    pub command_poll_interval_secs: u64,
    pub time: String,
}

pub struct Device<B: Backend, L: Link> {
    firmware: String,
    store: StateStore,
    counters: CounterState,
    sequence: u32,
    events: RecordQueue<TreatmentEvent>,
    commands: RecordQueue<CommandRecord>,
    clock: DeviceClock,
    identity: IdentityClient,
    connectivity: ConnectivityManager,
    delivery: DeliveryEngine,
    processor: CommandProcessor,
    backend: B,
    link: L,
}

impl<B: Backend, L: Link> Device<B, L> {
    /// Open persistent state, self-heal counters and bump the reset epoch.
    pub fn boot(config: &Config, backend: B, link: L) -> anyhow::Result<Self> {
        let mut store = StateStore::open(&config.state_db_path())?;

        let mut counters = store.load_counters()?;
        counters.reset_epoch = counters.reset_epoch.wrapping_add(1);
        store.save_counters(&counters)?;

        let credentials = match store.load_wifi()? {
            Some(creds) => creds,
            None => {
                let defaults = config.default_wifi();
                store.save_wifi(&defaults)?;
                log::info!("No stored wifi credentials, using defaults for '{}'", defaults.ssid);
                defaults
            }
        };

        let stored_identity = store.load_identity()?;
        let mac = link.mac_address();
        let identity = IdentityClient::new(
            stored_identity,
            mac.clone(),
            config.firmware_version.clone(),
            config.retry_policy(),
        );

        let events = RecordQueue::open(config.event_queue_path(), config.event_queue_max_bytes)?;
        let commands = RecordQueue::open(config.command_queue_path(), config.command_queue_max_bytes)?;

        let connectivity = ConnectivityManager::new(
            ConnectivitySettings {
                reconnect: config.reconnect_policy(),
                connect_timeout: Duration::from_millis(config.link_connect_timeout_ms),
                probe_interval: Duration::from_secs(config.probe_interval_secs),
                reconnect_after_failures: config.reconnect_after_failures,
            },
            credentials,
        );

        info!(
            mac = %mac,
            firmware = %config.firmware_version,
            device_id = ?identity.device_id(),
            reset_epoch = counters.reset_epoch,
            queued_events = ?queued(&events),
            queued_commands = ?queued(&commands),
            "device booted"
        );

        Ok(Device {
            firmware: config.firmware_version.clone(),
            store,
            counters,
            sequence: 0,
            events,
            commands,
            clock: DeviceClock::new(),
            identity,
            connectivity,
            delivery: DeliveryEngine::new(config.retry_policy()),
            processor: CommandProcessor::new(Duration::from_secs(config.command_poll_interval_secs)),
            backend,
            link,
        })
    }

    /// Count a treatment and queue its event. The counter is persisted before
    /// the event exists; a full queue does not roll the increment back.
    pub fn start_treatment(&mut self, treatment: Treatment) -> Result<TreatmentEvent, TreatmentError> {
        let mut next = self.counters;
        let counter = next.counters.increment(treatment);
        self.store.save_counters(&next)?;
        self.counters = next;

        self.sequence = self.sequence.wrapping_add(1);
        let device_id = self
            .identity
            .device_id()
            .unwrap_or_else(|| self.identity.mac())
            .to_string();
        let event = TreatmentEvent {
            event_id: format!("{}-{:06}-{:08}", device_id, self.counters.reset_epoch, self.sequence),
            device_id,
            firmware: self.firmware.clone(),
            event: EventKind::Treatment,
            treatment,
            counter,
            ts: self.clock.now_iso(),
            current_counters: self.counters.counters,
        };

        match self.events.append(&event) {
            Ok(()) => {
                info!(event_id = %event.event_id, %treatment, counter, "treatment started");
                Ok(event)
            }
            Err(QueueError::Full { size, max, .. }) => {
                warn!(event_id = %event.event_id, size, max, "event queue full, treatment counted but not queued");
                Err(TreatmentError::QueueFull {
                    event_id: event.event_id,
                })
            }
            Err(e) => Err(TreatmentError::Queue(e)),
        }
    }

    /// One cooperative cycle of the device.
    pub async fn tick(&mut self, now: Instant) -> Tick {
        if self.connectivity.tick(now, &mut self.link, &self.backend).await != LinkState::Connected {
            return Tick::Continue;
        }
        self.ensure_identity(now).await;
        if self.service_commands(now).await == Tick::Reboot {
            return Tick::Reboot;
        }
        self.deliver(now).await;
        Tick::Continue
    }

    async fn ensure_identity(&mut self, now: Instant) {
        match self.identity.ensure(now, &self.backend, &mut self.store).await {
            Ok(HandshakeOutcome::Failed(e)) => self.note_transport_failure(&e),
            Ok(_) => {}
            Err(e) => error!(error = %e, "persisting identity failed"),
        }
    }

    async fn service_commands(&mut self, now: Instant) -> Tick {
        let Some(identity) = self.identity.usable().cloned() else {
            return Tick::Continue;
        };
        match self
            .processor
            .poll(now, &identity, &self.commands, &self.clock, &self.backend)
            .await
        {
            Ok(PollOutcome::Polled { latency, .. }) => self.connectivity.report_network_success(latency),
            Ok(PollOutcome::Failed(e)) => self.note_transport_failure(&e),
            Ok(PollOutcome::NotDue) => {}
            Err(e) => error!(error = %e, "command queue write failed"),
        }

        let Some(identity) = self.identity.usable().cloned() else {
            return Tick::Continue;
        };
        let next = match self.commands.peek_oldest() {
            Ok(Some(next)) => next,
            Ok(None) => return Tick::Continue,
            Err(e) => {
                error!(error = %e, "command queue unreadable");
                return Tick::Continue;
            }
        };
        // Building the snapshot scans both queues; only GET_STATUS reads it.
        let status = (next.command_type == CommandType::GetStatus).then(|| self.status());
        let epoch_before = self.counters.reset_epoch;
        let ctx = ExecutionContext {
            store: &mut self.store,
            counters: &mut self.counters,
            events: &self.events,
            commands: &self.commands,
            clock: &mut self.clock,
            status,
        };
        let executed = match self.processor.execute_next(ctx, &identity, &self.backend).await {
            Ok(Some(executed)) => executed,
            Ok(None) => return Tick::Continue,
            Err(e) => {
                error!(error = %e, "command queue unreadable");
                return Tick::Continue;
            }
        };
        if self.counters.reset_epoch != epoch_before {
            self.sequence = 0;
        }
        match &executed.report {
            Ok(latency) => self.connectivity.report_network_success(*latency),
            Err(e) => self.note_transport_failure(e),
        }

        match executed.follow_up {
            FollowUp::None => Tick::Continue,
            FollowUp::Reconnect(credentials) => {
                self.connectivity.set_credentials(credentials);
                Tick::Continue
            }
            FollowUp::Reboot => Tick::Reboot,
        }
    }

    async fn deliver(&mut self, now: Instant) {
        let outcome = self
            .delivery
            .run_cycle(
                now,
                self.connectivity.is_connected(),
                self.identity.usable(),
                &self.events,
                &self.backend,
            )
            .await;
        match outcome {
            Ok(DeliveryOutcome::Delivered { latency, .. }) => self.connectivity.report_network_success(latency),
            Ok(DeliveryOutcome::Failed { error, .. }) => self.note_transport_failure(&error),
            Ok(_) => {}
            Err(e) => error!(error = %e, "event queue unreadable"),
        }
    }

    fn note_transport_failure(&mut self, error: &TransportError) {
        if error.is_unauthorized() {
            self.identity.invalidate();
        } else if error.is_network() && self.connectivity.report_network_failure() {
            self.identity.invalidate();
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.identity.device_id().map(str::to_string),
            identified: self.identity.usable().is_some(),
            assigned: self.identity.is_assigned(),
            mac: self.identity.mac().to_string(),
            firmware: self.firmware.clone(),
            counters: self.counters.counters,
            reset_epoch: self.counters.reset_epoch,
            queued_events: queued(&self.events),
            queued_event_bytes: self.events.size_bytes(),
            queued_commands: queued(&self.commands),
            queued_command_bytes: self.commands.size_bytes(),
            link_state: self.connectivity.state(),
            quality: self.connectivity.quality(),
            upload_failures: self.delivery.backoff().failures(),
            command_poll_interval_secs: self.processor.poll_interval().as_secs(),
            time: self.clock.now_iso(),
        }
    }

    pub fn counters(&self) -> CounterState {
        self.counters
    }

    pub fn events(&self) -> &RecordQueue<TreatmentEvent> {
        &self.events
    }

    pub fn commands(&self) -> &RecordQueue<CommandRecord> {
        &self.commands
    }

    pub fn identity(&self) -> &IdentityClient {
        &self.identity
    }

    pub fn connectivity(&self) -> &ConnectivityManager {
        &self.connectivity
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.delivery
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

fn queued<T: Serialize + DeserializeOwned>(queue: &RecordQueue<T>) -> Option<usize> {
    match queue.len() {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(path = %queue.path().display(), error = %e, "queue unreadable, backlog unknown");
            None
        }
    }
}
