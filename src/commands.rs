//! Remote command intake and execution.
//!
//! Polling appends every item with a usable id to the command queue.
//! Execution takes one command per cycle, oldest first, reports the outcome
//! together with the current counters, and removes the command whether or
//! not anything succeeded. Commands are never retried automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clock::DeviceClock;
use crate::identity::Identity;
use crate::link::WifiCredentials;
use crate::net::{Backend, TransportError};
use crate::queue::{QueueError, RecordQueue};
use crate::runtime::DeviceStatus;
use crate::storage::{CounterState, StateStore};
use crate::types::{CommandReport, CounterSnapshot, TreatmentEvent};

pub const REBOOT_DELAY: Duration = Duration::from_secs(2);
const POLL_INTERVAL_MIN_SECS: u64 = 5;
const POLL_INTERVAL_MAX_SECS: u64 = 3_600;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    ResetCounters,
    ClearMemory,
    ClearQueue,
    RebootDevice,
    UpdateSettings,
    GetStatus,
    SyncTime,
    UpdateFirmware,
    Unknown(String),
}

impl From<String> for CommandType {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RESET_COUNTERS" => CommandType::ResetCounters,
            "CLEAR_MEMORY" => CommandType::ClearMemory,
            "CLEAR_QUEUE" => CommandType::ClearQueue,
            "REBOOT_DEVICE" => CommandType::RebootDevice,
            "UPDATE_SETTINGS" => CommandType::UpdateSettings,
            "GET_STATUS" => CommandType::GetStatus,
            "SYNC_TIME" => CommandType::SyncTime,
            "UPDATE_FIRMWARE" => CommandType::UpdateFirmware,
            _ => CommandType::Unknown(raw),
        }
    }
}

impl From<CommandType> for String {
    fn from(kind: CommandType) -> Self {
        match kind {
            CommandType::ResetCounters => "RESET_COUNTERS".to_string(),
            CommandType::ClearMemory => "CLEAR_MEMORY".to_string(),
            CommandType::ClearQueue => "CLEAR_QUEUE".to_string(),
            CommandType::RebootDevice => "REBOOT_DEVICE".to_string(),
            CommandType::UpdateSettings => "UPDATE_SETTINGS".to_string(),
            CommandType::GetStatus => "GET_STATUS".to_string(),
            CommandType::SyncTime => "SYNC_TIME".to_string(),
            CommandType::UpdateFirmware => "UPDATE_FIRMWARE".to_string(),
            CommandType::Unknown(raw) => raw,
        }
    }
}

/// A command as persisted in the command queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: String,
    pub received_at: String,
}

/// What the owner loop must do after a command ran.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    None,
    Reboot,
    Reconnect(WifiCredentials),
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub success: bool,
    pub message: String,
    pub response_data: Option<Value>,
    pub follow_up: FollowUp,
}

impl Execution {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            response_data: None,
            follow_up: FollowUp::None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            response_data: None,
            follow_up: FollowUp::None,
        }
    }

    fn report(&self, counters: CounterSnapshot) -> CommandReport {
        CommandReport {
            success: self.success,
            message: self.message.clone(),
            error_message: if self.success { String::new() } else { self.message.clone() },
            response_data: self.response_data.clone(),
            current_counters: counters,
        }
    }
}

/// Everything a command may touch, borrowed from the device for one execution.
pub struct ExecutionContext<'a> {
    pub store: &'a mut StateStore,
    pub counters: &'a mut CounterState,
    pub events: &'a RecordQueue<TreatmentEvent>,
    pub commands: &'a RecordQueue<CommandRecord>,
    pub clock: &'a mut DeviceClock,
    /// Snapshot for GET_STATUS; the caller only builds it for that command.
    pub status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    NotDue,
    Polled {
        queued: usize,
        discarded: usize,
        rejected: usize,
        latency: Duration,
    },
    Failed(TransportError),
}

#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub command_id: String,
    pub command_type: CommandType,
    pub success: bool,
    pub report: Result<Duration, TransportError>,
    pub follow_up: FollowUp,
}

pub struct CommandProcessor {
    poll_interval: Duration,
    next_poll: Option<Instant>,
}

impl CommandProcessor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            next_poll: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Fetch pending commands if the poll interval has elapsed.
    pub async fn poll<B: Backend>(
        &mut self,
        now: Instant,
        identity: &Identity,
        queue: &RecordQueue<CommandRecord>,
        clock: &DeviceClock,
        backend: &B,
    ) -> Result<PollOutcome, QueueError> {
        if self.next_poll.is_some_and(|at| now < at) {
            return Ok(PollOutcome::NotDue);
        }
        self.next_poll = Some(now + self.poll_interval);

        let started = Instant::now();
        let items = match backend.poll_commands(identity).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "command poll failed");
                return Ok(PollOutcome::Failed(e));
            }
        };
        let latency = started.elapsed();

        let (mut queued, mut discarded, mut rejected) = (0, 0, 0);
        for item in items {
            let Some(command_id) = item.resolved_id() else {
                warn!(command_type = %item.command_type, "discarding command without id");
                discarded += 1;
                continue;
            };
            let record = CommandRecord {
                command_id: command_id.to_string(),
                command_type: CommandType::from(item.command_type.clone()),
                payload: payload_text(&item.payload),
                received_at: clock.now_iso(),
            };
            match queue.append(&record) {
                Ok(()) => {
                    info!(command_id = %record.command_id, command_type = ?record.command_type, "command queued");
                    queued += 1;
                }
                Err(QueueError::Full { size, max, .. }) => {
                    warn!(command_id = %record.command_id, size, max, "command queue full, command rejected");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(PollOutcome::Polled {
            queued,
            discarded,
            rejected,
            latency,
        })
    }

    /// Execute and report the oldest queued command, then remove it.
    pub async fn execute_next<B: Backend>(
        &mut self,
        mut ctx: ExecutionContext<'_>,
        identity: &Identity,
        backend: &B,
    ) -> Result<Option<ExecutedCommand>, QueueError> {
        let Some(command) = ctx.commands.peek_oldest()? else {
            return Ok(None);
        };

        let execution = self.execute(&command, &mut ctx);
        if execution.success {
            info!(command_id = %command.command_id, command_type = ?command.command_type, message = %execution.message, "command executed");
        } else {
            warn!(command_id = %command.command_id, command_type = ?command.command_type, message = %execution.message, "command failed");
        }

        let report = execution.report(ctx.counters.counters);
        let started = Instant::now();
        let reported = backend
            .report_result(identity, &command.command_id, &report)
            .await
            .map(|()| started.elapsed());
        if let Err(e) = &reported {
            warn!(command_id = %command.command_id, error = %e, "command result not reported");
        }

        ctx.commands.remove_oldest()?;

        Ok(Some(ExecutedCommand {
            command_id: command.command_id,
            command_type: command.command_type,
            success: execution.success,
            report: reported,
            follow_up: execution.follow_up,
        }))
    }

    fn execute(&mut self, command: &CommandRecord, ctx: &mut ExecutionContext<'_>) -> Execution {
        match &command.command_type {
            CommandType::ResetCounters => match reset_counters(ctx) {
                Ok(epoch) => Execution::ok(format!("Counters reset (epoch {epoch})")),
                Err(e) => Execution::failed(format!("Counter reset failed: {e}")),
            },
            CommandType::ClearMemory => {
                let epoch = match reset_counters(ctx) {
                    Ok(epoch) => epoch,
                    Err(e) => return Execution::failed(format!("Counter reset failed: {e}")),
                };
                match clear_queues(ctx) {
                    Ok((events, commands)) => Execution::ok(format!(
                        "Memory cleared: counters reset (epoch {epoch}), {events} events and {commands} commands dropped"
                    )),
                    Err(e) => Execution::failed(format!("Queue clear failed: {e}")),
                }
            }
            CommandType::ClearQueue => match clear_queues(ctx) {
                Ok((events, commands)) => {
                    Execution::ok(format!("Queues cleared: {events} events and {commands} commands dropped"))
                }
                Err(e) => Execution::failed(format!("Queue clear failed: {e}")),
            },
            CommandType::RebootDevice => Execution {
                follow_up: FollowUp::Reboot,
                ..Execution::ok(format!("Rebooting in {}s", REBOOT_DELAY.as_secs()))
            },
            CommandType::UpdateSettings => self.update_settings(&command.payload, ctx),
            CommandType::GetStatus => match ctx.status.as_ref().map(serde_json::to_value) {
                Some(Ok(status)) => Execution {
                    response_data: Some(status),
                    ..Execution::ok("Status reported")
                },
                Some(Err(e)) => Execution::failed(format!("Status encoding failed: {e}")),
                None => Execution::failed("Status snapshot unavailable"),
            },
            CommandType::SyncTime => sync_time(&command.payload, ctx.clock),
            CommandType::UpdateFirmware => Execution::failed("Firmware update is not supported on this device"),
            CommandType::Unknown(raw) => Execution::failed(format!("Unknown command type: {raw}")),
        }
    }

    fn update_settings(&mut self, payload: &str, ctx: &mut ExecutionContext<'_>) -> Execution {
        let settings = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            _ => return Execution::failed("UpdateSettings payload must be a JSON object"),
        };

        let wifi = match wifi_from_settings(&settings) {
            Ok(wifi) => wifi,
            Err(message) => return Execution::failed(message),
        };
        let poll_interval = match settings.get("command_poll_interval_secs") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(secs) if (POLL_INTERVAL_MIN_SECS..=POLL_INTERVAL_MAX_SECS).contains(&secs) => {
                    Some(Duration::from_secs(secs))
                }
                _ => {
                    return Execution::failed(format!(
                        "command_poll_interval_secs must be {POLL_INTERVAL_MIN_SECS}..={POLL_INTERVAL_MAX_SECS}"
                    ))
                }
            },
        };
        if wifi.is_none() && poll_interval.is_none() {
            return Execution::failed("No supported settings in payload");
        }

        let mut applied = Vec::new();
        let mut follow_up = FollowUp::None;
        if let Some(creds) = wifi {
            if let Err(e) = ctx.store.save_wifi(&creds) {
                return Execution::failed(format!("Saving wifi credentials failed: {e}"));
            }
            applied.push("wifi");
            follow_up = FollowUp::Reconnect(creds);
        }
        if let Some(interval) = poll_interval {
            self.poll_interval = interval;
            self.next_poll = None;
            applied.push("command_poll_interval_secs");
        }

        let ignored: Vec<&str> = settings
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "wifi_ssid" | "wifi_password" | "command_poll_interval_secs"))
            .collect();
        let mut message = format!("Applied: {}", applied.join(", "));
        if !ignored.is_empty() {
            message.push_str(&format!("; ignored: {}", ignored.join(", ")));
        }
        Execution {
            follow_up,
            ..Execution::ok(message)
        }
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Zero the counters and bump the epoch. Returns the new epoch.
fn reset_counters(ctx: &mut ExecutionContext<'_>) -> Result<u32, crate::storage::StoreError> {
    let next = CounterState {
        counters: CounterSnapshot::default(),
        reset_epoch: ctx.counters.reset_epoch.wrapping_add(1),
    };
    ctx.store.save_counters(&next)?;
    *ctx.counters = next;
    Ok(next.reset_epoch)
}

fn clear_queues(ctx: &mut ExecutionContext<'_>) -> Result<(usize, usize), QueueError> {
    let events = ctx.events.len()?;
    // The running command is still at the front; it is not counted as dropped.
    let commands = ctx.commands.len()?.saturating_sub(1);
    ctx.events.clear()?;
    ctx.commands.clear()?;
    Ok((events, commands))
}

fn wifi_from_settings(settings: &Map<String, Value>) -> Result<Option<WifiCredentials>, String> {
    let ssid = settings.get("wifi_ssid");
    let password = settings.get("wifi_password");
    match (ssid, password) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err("wifi_password requires wifi_ssid".to_string()),
        (Some(ssid), password) => {
            let creds = WifiCredentials {
                ssid: ssid.as_str().ok_or("wifi_ssid must be a string")?.to_string(),
                password: match password {
                    None => String::new(),
                    Some(p) => p.as_str().ok_or("wifi_password must be a string")?.to_string(),
                },
            };
            creds.validate()?;
            Ok(Some(creds))
        }
    }
}

fn sync_time(payload: &str, clock: &mut DeviceClock) -> Execution {
    let raw = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map.get("timestamp").and_then(Value::as_str).map(str::to_string),
        Ok(Value::String(s)) => Some(s),
        _ => Some(payload.trim().to_string()).filter(|s| !s.is_empty()),
    };
    let Some(parsed) = raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()) else {
        return Execution::failed("SyncTime payload needs an ISO-8601 timestamp");
    };
    let offset = clock.sync_to(parsed.with_timezone(&Utc));
    Execution {
        response_data: Some(json!({ "offset_ms": offset.num_milliseconds() })),
        ..Execution::ok(format!("Clock synchronized to {}", clock.now_iso()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_round_trips_wire_names() {
        let parsed: CommandType = serde_json::from_str("\"RESET_COUNTERS\"").unwrap();
        assert_eq!(parsed, CommandType::ResetCounters);
        let unknown: CommandType = serde_json::from_str("\"SELF_DESTRUCT\"").unwrap();
        assert_eq!(unknown, CommandType::Unknown("SELF_DESTRUCT".into()));
        assert_eq!(serde_json::to_string(&CommandType::GetStatus).unwrap(), "\"GET_STATUS\"");
    }

    #[test]
    fn object_payloads_are_kept_as_json_text() {
        assert_eq!(payload_text(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(payload_text(&Value::Null), "");
        assert_eq!(payload_text(&json!("raw")), "raw");
    }

    #[test]
    fn sync_time_accepts_object_or_bare_string() {
        let mut clock = DeviceClock::new();
        assert!(sync_time(r#"{"timestamp": "2030-01-01T00:00:00Z"}"#, &mut clock).success);
        assert!(clock.now_iso().starts_with("2030-01-01"));
        assert!(sync_time("2031-06-01T12:00:00+00:00", &mut clock).success);
        assert!(!sync_time("{}", &mut clock).success);
    }

    #[test]
    fn wifi_settings_validation() {
        let settings = json!({"wifi_ssid": "shop", "wifi_password": "pw"});
        let creds = wifi_from_settings(settings.as_object().unwrap()).unwrap().unwrap();
        assert_eq!(creds.ssid, "shop");

        let settings = json!({"wifi_password": "pw"});
        assert!(wifi_from_settings(settings.as_object().unwrap()).is_err());

        let settings = json!({"wifi_ssid": "x".repeat(40)});
        assert!(wifi_from_settings(settings.as_object().unwrap()).is_err());
    }
}
