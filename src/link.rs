//! Radio driver seam. The driver decides when the link is actually up; the
//! connectivity manager only asks it to connect and watches `is_connected`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const WIFI_SSID_MAX: usize = 32;
pub const WIFI_PASSWORD_MAX: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("association failed: {0}")]
    Association(String),
    #[error("connect attempt timed out")]
    Timeout,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn validate(&self) -> Result<(), String> {
        if self.ssid.is_empty() || self.ssid.len() > WIFI_SSID_MAX {
            return Err(format!("ssid must be 1..={WIFI_SSID_MAX} bytes"));
        }
        if self.password.len() > WIFI_PASSWORD_MAX {
            return Err(format!("password must be at most {WIFI_PASSWORD_MAX} bytes"));
        }
        Ok(())
    }
}

#[allow(async_fn_in_trait)]
pub trait Link {
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), LinkError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Signal strength in dBm while associated.
    fn rssi(&self) -> Option<i32>;
    fn mac_address(&self) -> String;
}

/// A virtual radio with random association failures, random drops and a
/// wandering signal level.
#[derive(Debug)]
pub struct SimulatedLink {
    mac: String,
    connected: bool,
    rssi_dbm: i32,
    connect_failure_rate: f64,
    drop_rate: f64,
    association_delay: Duration,
}

impl SimulatedLink {
    pub fn new(mac: String) -> Self {
        Self {
            mac,
            connected: false,
            rssi_dbm: -60,
            connect_failure_rate: 0.1,
            drop_rate: 0.001,
            association_delay: Duration::from_millis(300),
        }
    }

    pub fn with_failure_rates(mut self, connect_failure_rate: f64, drop_rate: f64) -> Self {
        self.connect_failure_rate = connect_failure_rate.clamp(0.0, 1.0);
        self.drop_rate = drop_rate.clamp(0.0, 1.0);
        self
    }

    /// Advance the simulated radio: wander RSSI and maybe drop the link.
    pub fn step(&mut self) {
        if !self.connected {
            return;
        }
        let mut rng = rand::thread_rng();
        self.rssi_dbm = (self.rssi_dbm + rng.gen_range(-3..=3)).clamp(-95, -35);
        if rng.gen_bool(self.drop_rate) {
            self.connected = false;
        }
    }
}

/// A locally administered unicast MAC derived from a random v4 UUID.
pub fn generate_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let first = (bytes[0] | 0x02) & 0xFE;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        first, bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

impl Link for SimulatedLink {
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), LinkError> {
        tokio::time::sleep(self.association_delay).await;
        if rand::thread_rng().gen_bool(self.connect_failure_rate) {
            return Err(LinkError::Association(format!(
                "no response from access point '{}'",
                credentials.ssid
            )));
        }
        self.connected = true;
        self.rssi_dbm = rand::thread_rng().gen_range(-75..=-50);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> Option<i32> {
        self.connected.then_some(self.rssi_dbm)
    }

    fn mac_address(&self) -> String {
        self.mac.clone()
    }
}
