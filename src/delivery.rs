//! Drains the event queue oldest-first against the ingest endpoint.
//!
//! One request in flight at a time. A record leaves the queue only after an
//! ack naming its own `event_id`; anything else keeps it at the front and
//! advances the retry backoff.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::identity::Identity;
use crate::net::{Backend, TransportError};
use crate::queue::{QueueError, RecordQueue};
use crate::types::TreatmentEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Link down or device unidentified; nothing attempted.
    Gated,
    /// Queue empty.
    Idle,
    BackingOff(Duration),
    Delivered { event_id: String, latency: Duration },
    Failed { error: TransportError, retry_in: Duration },
}

pub struct DeliveryEngine {
    backoff: Backoff,
}

impl DeliveryEngine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Attempt delivery of the oldest queued event.
    pub async fn run_cycle<B: Backend>(
        &mut self,
        now: Instant,
        online: bool,
        identity: Option<&Identity>,
        queue: &RecordQueue<TreatmentEvent>,
        backend: &B,
    ) -> Result<DeliveryOutcome, QueueError> {
        let Some(identity) = identity.filter(|_| online) else {
            return Ok(DeliveryOutcome::Gated);
        };

        let Some(event) = queue.peek_oldest()? else {
            if self.backoff.failures() > 0 {
                debug!("event queue drained, retry backoff reset");
            }
            self.backoff.reset();
            return Ok(DeliveryOutcome::Idle);
        };

        if !self.backoff.ready(now) {
            return Ok(DeliveryOutcome::BackingOff(self.backoff.remaining(now)));
        }

        let started = Instant::now();
        let result = backend.post_event(&identity.token, &event).await;
        let latency = started.elapsed();

        let error = match result {
            Ok(ack) if ack.ack && ack.event_id.as_deref() == Some(event.event_id.as_str()) => {
                queue.remove_oldest()?;
                self.backoff.reset();
                info!(
                    event_id = %event.event_id,
                    treatment = %event.treatment,
                    counter = event.counter,
                    latency_ms = latency.as_millis() as u64,
                    "event delivered"
                );
                return Ok(DeliveryOutcome::Delivered {
                    event_id: event.event_id,
                    latency,
                });
            }
            Ok(ack) => TransportError::Protocol(format!(
                "ack {:?} does not confirm event {}",
                ack.event_id, event.event_id
            )),
            Err(e) => e,
        };

        let retry_in = self.backoff.record_failure(now);
        warn!(
            event_id = %event.event_id,
            error = %error,
            attempt = self.backoff.failures(),
            retry_in_ms = retry_in.as_millis() as u64,
            "event upload failed"
        );
        Ok(DeliveryOutcome::Failed { error, retry_in })
    }
}
