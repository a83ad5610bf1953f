//! Device identity and the handshake that establishes it.
//!
//! The handshake sends `{mac, firmware}` and expects `{device_id, token,
//! assigned}`. Identity is only persisted when both id and token are
//! non-empty, and a failed handshake never clears what is already stored.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::net::{Backend, TransportError};
use crate::storage::{StateStore, StoreError};
use crate::types::HandshakeRequest;

/// How often a provisional (unassigned) identity re-announces itself.
pub const PROVISIONAL_REFRESH: Duration = Duration::from_secs(300);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub token: String,
    #[serde(default)]
    pub assigned: bool,
}

impl Identity {
    pub fn is_complete(&self) -> bool {
        !self.device_id.trim().is_empty() && !self.token.trim().is_empty()
    }
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Identity present and believed valid; nothing to do.
    NotNeeded,
    /// Waiting out the handshake backoff.
    BackingOff(Duration),
    Established { device_id: String, assigned: bool },
    /// The server answered without a usable id/token pair.
    Incomplete,
    Failed(TransportError),
}

pub struct IdentityClient {
    identity: Option<Identity>,
    stale: bool,
    last_handshake: Option<Instant>,
    mac: String,
    firmware: String,
    backoff: Backoff,
}

impl IdentityClient {
    pub fn new(stored: Option<Identity>, mac: String, firmware: String, policy: BackoffPolicy) -> Self {
        Self {
            identity: stored.filter(Identity::is_complete),
            stale: false,
            last_handshake: None,
            mac,
            firmware,
            backoff: Backoff::new(policy),
        }
    }

    /// Identity usable for authenticated calls: present and not invalidated by a 401.
    pub fn usable(&self) -> Option<&Identity> {
        self.identity.as_ref().filter(|_| !self.stale)
    }

    /// The last known device id, usable or not.
    pub fn device_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.device_id.as_str())
    }

    pub fn is_assigned(&self) -> bool {
        self.identity.as_ref().is_some_and(|i| i.assigned)
    }

    pub fn needs_handshake(&self) -> bool {
        self.identity.is_none() || self.stale
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// The first handshake after boot announces the device; after that only a
    /// provisional identity keeps re-announcing.
    fn announce_due(&self, now: Instant) -> bool {
        match self.last_handshake {
            None => true,
            Some(at) => !self.is_assigned() && now.saturating_duration_since(at) >= PROVISIONAL_REFRESH,
        }
    }

    /// Mark the current token as rejected. The stored id stays in place.
    pub fn invalidate(&mut self) {
        if !self.stale {
            warn!("device credentials rejected, re-handshake scheduled");
        }
        self.stale = true;
    }

    /// Run a handshake if one is needed and the backoff allows it.
    pub async fn ensure<B: Backend>(
        &mut self,
        now: Instant,
        backend: &B,
        store: &mut StateStore,
    ) -> Result<HandshakeOutcome, StoreError> {
        if !self.needs_handshake() && !self.announce_due(now) {
            return Ok(HandshakeOutcome::NotNeeded);
        }
        if !self.backoff.ready(now) {
            return Ok(HandshakeOutcome::BackingOff(self.backoff.remaining(now)));
        }
        self.handshake(now, backend, store).await
    }

    /// Unconditional handshake attempt.
    pub async fn handshake<B: Backend>(
        &mut self,
        now: Instant,
        backend: &B,
        store: &mut StateStore,
    ) -> Result<HandshakeOutcome, StoreError> {
        let request = HandshakeRequest {
            mac: self.mac.clone(),
            firmware: self.firmware.clone(),
        };
        let response = match backend.handshake(&request).await {
            Ok(response) => response,
            Err(e) => {
                let retry_in = self.backoff.record_failure(now);
                warn!(error = %e, retry_in_ms = retry_in.as_millis() as u64, "handshake failed");
                return Ok(HandshakeOutcome::Failed(e));
            }
        };

        let identity = Identity {
            device_id: response.device_id.unwrap_or_default(),
            token: response.token.unwrap_or_default(),
            assigned: response.assigned,
        };
        if !identity.is_complete() {
            let retry_in = self.backoff.record_failure(now);
            warn!(retry_in_ms = retry_in.as_millis() as u64, "handshake response missing device_id or token");
            return Ok(HandshakeOutcome::Incomplete);
        }

        store.save_identity(&identity)?;
        self.backoff.reset();
        self.last_handshake = Some(now);
        self.stale = false;
        if !identity.assigned {
            info!(device_id = %identity.device_id, "handshake ok, device not yet assigned");
        } else {
            info!(device_id = %identity.device_id, "handshake ok");
        }
        let outcome = HandshakeOutcome::Established {
            device_id: identity.device_id.clone(),
            assigned: identity.assigned,
        };
        self.identity = Some(identity);
        Ok(outcome)
    }
}
