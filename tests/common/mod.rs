#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use ozone_device::config::Config;
use ozone_device::identity::Identity;
use ozone_device::link::{Link, LinkError, WifiCredentials};
use ozone_device::net::{Backend, TransportError};
use ozone_device::runtime::Device;
use ozone_device::types::{
    CommandReport, CounterSnapshot, EventAck, EventKind, HandshakeRequest, HandshakeResponse, RemoteCommand,
    Treatment, TreatmentEvent,
};

pub const TEST_MAC: &str = "02:00:00:00:00:01";

/// Scripted server state shared between a test and its backend handle.
#[derive(Debug, Default)]
pub struct StubState {
    pub online: bool,
    pub handshake_response: HandshakeResponse,
    pub handshakes: Vec<HandshakeRequest>,
    /// Unique events accepted, in arrival order.
    pub received: Vec<TreatmentEvent>,
    /// Every upload attempt that reached the server, by event id.
    pub post_attempts: Vec<String>,
    /// When set, only these event ids are acked; the rest get a 503.
    pub ack_only: Option<HashSet<String>>,
    /// Store the next event but lose the ack on the way back.
    pub lose_next_ack: bool,
    /// Ack with someone else's event id.
    pub wrong_ack: bool,
    pub unauthorized_posts: u32,
    pub pending_commands: Vec<RemoteCommand>,
    pub polls: u32,
    pub reports: Vec<(String, CommandReport)>,
    pub probes: u32,
}

#[derive(Debug, Clone)]
pub struct StubBackend {
    pub state: Arc<Mutex<StubState>>,
}

impl StubBackend {
    pub fn new() -> Self {
        let state = StubState {
            online: true,
            handshake_response: HandshakeResponse {
                device_id: Some("dev-1".to_string()),
                token: Some("tok-1".to_string()),
                assigned: true,
            },
            ..StubState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn push_command(&self, command_id: &str, command_type: &str, payload: serde_json::Value) {
        self.state().pending_commands.push(RemoteCommand {
            command_id: Some(command_id.to_string()),
            id: Some(command_id.to_string()),
            command_type: command_type.to_string(),
            payload,
        });
    }

    pub fn received_ids(&self) -> Vec<String> {
        self.state().received.iter().map(|e| e.event_id.clone()).collect()
    }

    pub fn report_ids(&self) -> Vec<String> {
        self.state().reports.iter().map(|(id, _)| id.clone()).collect()
    }
}

fn offline() -> TransportError {
    TransportError::Connect("connection refused".to_string())
}

impl Backend for StubBackend {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(offline());
        }
        state.handshakes.push(request.clone());
        Ok(state.handshake_response.clone())
    }

    async fn post_event(&self, _token: &str, event: &TreatmentEvent) -> Result<EventAck, TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(offline());
        }
        if state.unauthorized_posts > 0 {
            state.unauthorized_posts -= 1;
            return Err(TransportError::Unauthorized);
        }
        state.post_attempts.push(event.event_id.clone());
        if let Some(allowed) = &state.ack_only {
            if !allowed.contains(&event.event_id) {
                return Err(TransportError::Status(503));
            }
        }
        if !state.received.iter().any(|e| e.event_id == event.event_id) {
            state.received.push(event.clone());
        }
        if state.lose_next_ack {
            state.lose_next_ack = false;
            return Err(TransportError::Timeout);
        }
        let event_id = if state.wrong_ack {
            "someone-else".to_string()
        } else {
            event.event_id.clone()
        };
        Ok(EventAck {
            ack: true,
            event_id: Some(event_id),
        })
    }

    async fn poll_commands(&self, _identity: &Identity) -> Result<Vec<RemoteCommand>, TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(offline());
        }
        state.polls += 1;
        Ok(std::mem::take(&mut state.pending_commands))
    }

    async fn report_result(
        &self,
        _identity: &Identity,
        command_id: &str,
        report: &CommandReport,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(offline());
        }
        state.reports.push((command_id.to_string(), report.clone()));
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(offline());
        }
        state.probes += 1;
        Ok(())
    }
}

/// A radio the test drives by hand.
#[derive(Debug)]
pub struct FakeLink {
    pub connected: bool,
    pub fail_connects: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub last_ssid: Option<String>,
    pub rssi: i32,
}

impl Default for FakeLink {
    fn default() -> Self {
        Self {
            connected: false,
            fail_connects: 0,
            connects: 0,
            disconnects: 0,
            last_ssid: None,
            rssi: -60,
        }
    }
}

impl Link for FakeLink {
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), LinkError> {
        self.connects += 1;
        self.last_ssid = Some(credentials.ssid.clone());
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(LinkError::Association("no beacon".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> Option<i32> {
        self.connected.then_some(self.rssi)
    }

    fn mac_address(&self) -> String {
        TEST_MAC.to_string()
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        backend_url: "http://stub.invalid".to_string(),
        firmware_version: "1.2.3-test".to_string(),
        data_dir: data_dir.to_path_buf(),
        ..Config::default()
    }
}

pub fn boot(data_dir: &Path, backend: &StubBackend) -> Device<StubBackend, FakeLink> {
    Device::boot(&test_config(data_dir), backend.clone(), FakeLink::default()).unwrap()
}

pub fn identity() -> Identity {
    Identity {
        device_id: "dev-1".to_string(),
        token: "tok-1".to_string(),
        assigned: true,
    }
}

pub fn event(seq: u32, counter: u32) -> TreatmentEvent {
    TreatmentEvent {
        device_id: "dev-1".to_string(),
        firmware: "1.2.3-test".to_string(),
        event_id: format!("dev-1-000001-{seq:08}"),
        event: EventKind::Treatment,
        treatment: Treatment::Basic,
        counter,
        ts: "2026-01-01T08:00:00Z".to_string(),
        current_counters: CounterSnapshot {
            basic: counter,
            standard: 0,
            premium: 0,
        },
    }
}
