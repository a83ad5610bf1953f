//! Link lifecycle and quality monitoring.
//!
//! ```text
//! Disconnected --attempt ok--> Connected --driver reports drop--> Disconnected
//! Disconnected --attempt fails--> Disconnected (reconnect backoff advances)
//! ```
//!
//! Other components report connection-class failures; after
//! `reconnect_after_failures` in a row the link is torn down and an
//! immediate reconnect replaces the scheduled backoff wait.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::link::{Link, LinkError, WifiCredentials};
use crate::net::Backend;

const QUALITY_WINDOW: usize = 20;
pub const RSSI_WEAK_DBM: i32 = -70;
pub const RSSI_CRITICAL_DBM: i32 = -80;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SignalBand {
    Good,
    Weak,
    Critical,
}

impl SignalBand {
    pub fn from_rssi(rssi: i32) -> Self {
        if rssi <= RSSI_CRITICAL_DBM {
            SignalBand::Critical
        } else if rssi <= RSSI_WEAK_DBM {
            SignalBand::Weak
        } else {
            SignalBand::Good
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct LinkQuality {
    /// 0-100, higher is better.
    pub score: u8,
    pub rssi: Option<i32>,
    pub avg_latency_ms: Option<u64>,
    pub loss_pct: u8,
    pub samples: usize,
}

/// Rolling window of signal, latency and request outcomes.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    rssi: VecDeque<i32>,
    latency: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    band: Option<SignalBand>,
}

impl QualityMonitor {
    pub fn record_rssi(&mut self, rssi: i32) {
        push_bounded(&mut self.rssi, rssi);
        let band = SignalBand::from_rssi(rssi);
        match self.band {
            Some(previous) if band > previous => {
                warn!(rssi, ?band, "signal strength degraded");
            }
            Some(previous) if band < previous => {
                info!(rssi, ?band, "signal strength recovered");
            }
            None if band != SignalBand::Good => {
                warn!(rssi, ?band, "weak signal");
            }
            _ => {}
        }
        self.band = Some(band);
    }

    pub fn record_success(&mut self, latency: Duration) {
        push_bounded(&mut self.latency, latency);
        push_bounded(&mut self.outcomes, true);
    }

    pub fn record_failure(&mut self) {
        push_bounded(&mut self.outcomes, false);
    }

    pub fn clear(&mut self) {
        *self = QualityMonitor::default();
    }

    /// Weighted summary: 40% loss, 40% latency, 20% signal. Components with
    /// no samples count as perfect so a fresh link is not penalized.
    pub fn summary(&self) -> LinkQuality {
        let loss = if self.outcomes.is_empty() {
            0.0
        } else {
            self.outcomes.iter().filter(|ok| !**ok).count() as f64 / self.outcomes.len() as f64
        };
        let avg_latency = (!self.latency.is_empty()).then(|| {
            self.latency.iter().map(Duration::as_millis).sum::<u128>() as f64 / self.latency.len() as f64
        });
        let avg_rssi = (!self.rssi.is_empty())
            .then(|| self.rssi.iter().map(|r| f64::from(*r)).sum::<f64>() / self.rssi.len() as f64);

        let loss_score = 100.0 * (1.0 - loss);
        // 100ms or better is full marks, 2s or worse is zero.
        let latency_score = avg_latency.map_or(100.0, |ms| (100.0 * (2_000.0 - ms) / 1_900.0).clamp(0.0, 100.0));
        // -50 dBm or better is full marks, -100 dBm or worse is zero.
        let signal_score = avg_rssi.map_or(100.0, |dbm| ((dbm + 100.0) * 2.0).clamp(0.0, 100.0));

        let score = 0.4 * loss_score + 0.4 * latency_score + 0.2 * signal_score;
        LinkQuality {
            score: score.round().clamp(0.0, 100.0) as u8,
            rssi: self.rssi.back().copied(),
            avg_latency_ms: avg_latency.map(|ms| ms.round() as u64),
            loss_pct: (loss * 100.0).round() as u8,
            samples: self.outcomes.len(),
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T) {
    if window.len() == QUALITY_WINDOW {
        window.pop_front();
    }
    window.push_back(value);
}

#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
    pub reconnect: BackoffPolicy,
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
    pub reconnect_after_failures: u32,
}

pub struct ConnectivityManager {
    state: LinkState,
    credentials: WifiCredentials,
    backoff: Backoff,
    settings: ConnectivitySettings,
    forced: bool,
    network_failures: u32,
    next_probe: Option<Instant>,
    quality: QualityMonitor,
}

impl ConnectivityManager {
    pub fn new(settings: ConnectivitySettings, credentials: WifiCredentials) -> Self {
        Self {
            state: LinkState::Disconnected,
            credentials,
            backoff: Backoff::new(settings.reconnect),
            settings,
            forced: false,
            network_failures: 0,
            next_probe: None,
            quality: QualityMonitor::default(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn quality(&self) -> LinkQuality {
        self.quality.summary()
    }

    pub fn reconnect_backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn credentials(&self) -> &WifiCredentials {
        &self.credentials
    }

    /// Skip the scheduled wait and reconnect on the next tick.
    pub fn request_reconnect(&mut self) {
        self.forced = true;
    }

    /// Swap credentials and reconnect with them.
    pub fn set_credentials(&mut self, credentials: WifiCredentials) {
        info!(ssid = %credentials.ssid, "wifi credentials updated");
        self.credentials = credentials;
        self.request_reconnect();
    }

    /// Record a connection-class failure seen by another component. Returns
    /// true when this failure tipped the manager into a forced reconnect.
    pub fn report_network_failure(&mut self) -> bool {
        self.quality.record_failure();
        self.network_failures = self.network_failures.saturating_add(1);
        if self.network_failures >= self.settings.reconnect_after_failures.max(1) {
            warn!(
                failures = self.network_failures,
                "repeated connection failures, forcing reconnect"
            );
            self.network_failures = 0;
            self.forced = true;
            return true;
        }
        false
    }

    /// Record a request that reached the server.
    pub fn report_network_success(&mut self, latency: Duration) {
        self.network_failures = 0;
        self.quality.record_success(latency);
    }

    /// Drive the state machine once. Only the connect attempt and the probe
    /// suspend, each bounded by a timeout.
    pub async fn tick<L: Link, B: Backend>(&mut self, now: Instant, link: &mut L, backend: &B) -> LinkState {
        if self.state == LinkState::Connected && !link.is_connected() {
            warn!("link dropped");
            self.state = LinkState::Disconnected;
            self.backoff.reset();
            self.quality.clear();
        }

        if self.forced && self.state == LinkState::Connected {
            info!("tearing down link for forced reconnect");
            link.disconnect();
            self.state = LinkState::Disconnected;
            self.quality.clear();
        }

        if self.state == LinkState::Disconnected && (self.forced || self.backoff.ready(now)) {
            self.forced = false;
            self.attempt_connect(now, link).await;
        }

        if self.state == LinkState::Connected {
            if let Some(rssi) = link.rssi() {
                self.quality.record_rssi(rssi);
            }
            if self.next_probe.map_or(true, |at| now >= at) {
                self.next_probe = Some(now + self.settings.probe_interval);
                self.probe(backend).await;
            }
        }
        self.state
    }

    async fn attempt_connect<L: Link>(&mut self, now: Instant, link: &mut L) {
        self.state = LinkState::Connecting;
        info!(ssid = %self.credentials.ssid, attempt = self.backoff.failures() + 1, "connecting");
        let result = match tokio::time::timeout(self.settings.connect_timeout, link.connect(&self.credentials)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };
        match result {
            Ok(()) => {
                self.state = LinkState::Connected;
                self.backoff.reset();
                self.network_failures = 0;
                self.next_probe = None;
                info!(mac = %link.mac_address(), rssi = ?link.rssi(), "link connected");
            }
            Err(e) => {
                self.state = LinkState::Disconnected;
                let retry_in = self.backoff.record_failure(now);
                warn!(error = %e, retry_in_ms = retry_in.as_millis() as u64, "link connect failed");
            }
        }
    }

    async fn probe<B: Backend>(&mut self, backend: &B) {
        let started = Instant::now();
        match tokio::time::timeout(self.settings.connect_timeout, backend.probe()).await {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                debug!(latency_ms = latency.as_millis() as u64, "probe ok");
                self.quality.record_success(latency);
            }
            Ok(Err(e)) => {
                debug!(error = %e, "probe failed");
                self.quality.record_failure();
            }
            Err(_) => {
                debug!("probe timed out");
                self.quality.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_monitor_scores_full() {
        assert_eq!(QualityMonitor::default().summary().score, 100);
    }

    #[test]
    fn score_weights_loss_latency_and_signal() {
        let mut monitor = QualityMonitor::default();
        monitor.record_rssi(-75);
        monitor.record_success(Duration::from_millis(100));
        monitor.record_failure();
        let quality = monitor.summary();
        // loss 50% -> 50, latency 100ms -> 100, signal -75 dBm -> 50
        assert_eq!(quality.loss_pct, 50);
        assert_eq!(quality.score, (0.4f64 * 50.0 + 0.4 * 100.0 + 0.2 * 50.0).round() as u8);
        assert_eq!(quality.rssi, Some(-75));
    }

    #[test]
    fn window_is_bounded() {
        let mut monitor = QualityMonitor::default();
        for _ in 0..100 {
            monitor.record_failure();
        }
        assert_eq!(monitor.summary().samples, QUALITY_WINDOW);
        assert_eq!(monitor.summary().loss_pct, 100);
    }

    #[test]
    fn signal_bands() {
        assert_eq!(SignalBand::from_rssi(-55), SignalBand::Good);
        assert_eq!(SignalBand::from_rssi(-72), SignalBand::Weak);
        assert_eq!(SignalBand::from_rssi(-85), SignalBand::Critical);
    }
}
