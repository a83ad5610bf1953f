use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Treatment program selected at the machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Treatment {
    Basic,
    Standard,
    Premium,
}

impl Treatment {
    pub const ALL: [Treatment; 3] = [Treatment::Basic, Treatment::Standard, Treatment::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Treatment::Basic => "BASIC",
            Treatment::Standard => "STANDARD",
            Treatment::Premium => "PREMIUM",
        }
    }
}

impl std::fmt::Display for Treatment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the three treatment counters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub basic: u32,
    pub standard: u32,
    pub premium: u32,
}

impl CounterSnapshot {
    pub fn get(&self, treatment: Treatment) -> u32 {
        match treatment {
            Treatment::Basic => self.basic,
            Treatment::Standard => self.standard,
            Treatment::Premium => self.premium,
        }
    }

    /// Bumps the counter for `treatment` and returns the new value.
    pub fn increment(&mut self, treatment: Treatment) -> u32 {
        let slot = match treatment {
            Treatment::Basic => &mut self.basic,
            Treatment::Standard => &mut self.standard,
            Treatment::Premium => &mut self.premium,
        };
        *slot = slot.saturating_add(1);
        *slot
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Treatment,
}

/// A billing event as queued on disk and posted to the ingest endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TreatmentEvent {
    pub device_id: String,
    pub firmware: String,
    pub event_id: String,
    pub event: EventKind,
    pub treatment: Treatment,
    pub counter: u32,
    pub ts: String,
    pub current_counters: CounterSnapshot,
}

// Handshake exchange

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeRequest {
    pub mac: String,
    pub firmware: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub assigned: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventAck {
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub event_id: Option<String>,
}

// Command polling

/// One item of the command poll response. The server sends the id both as
/// `command_id` and as `id`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RemoteCommand {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl RemoteCommand {
    /// The usable command id, if any. Empty and literal "null"/"None" ids are rejected.
    pub fn resolved_id(&self) -> Option<&str> {
        [self.command_id.as_deref(), self.id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|id| !id.is_empty() && *id != "null" && *id != "None")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CommandPollResponse {
    #[serde(default)]
    pub commands: Vec<RemoteCommand>,
}

/// Body posted to the per-command result endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandReport {
    pub success: bool,
    pub message: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_data: Option<Value>,
    pub current_counters: CounterSnapshot,
}
