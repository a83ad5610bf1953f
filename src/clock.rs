use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};

/// Wall clock with a correction offset set by time sync.
#[derive(Debug, Clone, Default)]
pub struct DeviceClock {
    offset: ChronoDuration,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    /// ISO-8601 UTC timestamp with second precision, e.g. `2026-01-01T08:00:00Z`.
    pub fn now_iso(&self) -> String {
        self.now_utc().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Align the clock to `reference` and return the applied offset.
    pub fn sync_to(&mut self, reference: DateTime<Utc>) -> ChronoDuration {
        self.offset = reference - Utc::now();
        self.offset
    }

    pub fn offset(&self) -> ChronoDuration {
        self.offset
    }
}
