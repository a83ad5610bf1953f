use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::identity::Identity;
use crate::types::{
    CommandPollResponse, CommandReport, EventAck, HandshakeRequest, HandshakeResponse, RemoteCommand,
    TreatmentEvent,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("server returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Failures attributable to the network rather than the server.
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Connect(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized)
    }
}

/// The backend as seen by the device. Every call carries its own timeout.
#[allow(async_fn_in_trait)]
pub trait Backend {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, TransportError>;
    async fn post_event(&self, token: &str, event: &TreatmentEvent) -> Result<EventAck, TransportError>;
    async fn poll_commands(&self, identity: &Identity) -> Result<Vec<RemoteCommand>, TransportError>;
    async fn report_result(
        &self,
        identity: &Identity,
        command_id: &str,
        report: &CommandReport,
    ) -> Result<(), TransportError>;
    /// Lightweight reachability check used for link quality.
    async fn probe(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(backend_url: &str) -> Self {
        Self {
            base: backend_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn handshake(&self) -> String {
        format!("{}/api/handshake/", self.base)
    }

    pub fn events(&self) -> String {
        format!("{}/api/device/events/", self.base)
    }

    pub fn commands(&self, device_id: &str) -> String {
        format!("{}/api/device/{}/commands/", self.base, device_id)
    }

    pub fn command_result(&self, device_id: &str, command_id: &str) -> String {
        format!("{}/api/device/{}/commands/{}/", self.base, device_id, command_id)
    }

    pub fn probe(&self) -> String {
        format!("{}/", self.base)
    }
}

pub struct HttpBackend {
    client: Client,
    endpoints: Endpoints,
}

impl HttpBackend {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.http_connect_timeout_ms))
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .user_agent(format!("ozone-device/{}", config.firmware_version))
            .build()?;
        Ok(Self {
            client,
            endpoints: Endpoints::new(&config.backend_url),
        })
    }
}

impl Backend for HttpBackend {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse, TransportError> {
        let response = self
            .client
            .post(self.endpoints.handshake())
            .json(request)
            .send()
            .await
            .map_err(classify)?;
        let response = check_status(response)?;
        response.json().await.map_err(classify)
    }

    async fn post_event(&self, token: &str, event: &TreatmentEvent) -> Result<EventAck, TransportError> {
        let response = self
            .client
            .post(self.endpoints.events())
            .bearer_auth(token)
            .json(event)
            .send()
            .await
            .map_err(classify)?;
        // A duplicate event_id may come back as 409 with the usual ack body.
        let response = if response.status() == StatusCode::CONFLICT {
            response
        } else {
            check_status(response)?
        };
        let ack: EventAck = response.json().await.map_err(classify)?;
        debug!(event_id = %event.event_id, ?ack, "event upload answered");
        Ok(ack)
    }

    async fn poll_commands(&self, identity: &Identity) -> Result<Vec<RemoteCommand>, TransportError> {
        let response = self
            .client
            .get(self.endpoints.commands(&identity.device_id))
            .bearer_auth(&identity.token)
            .send()
            .await
            .map_err(classify)?;
        let response = check_status(response)?;
        let body: CommandPollResponse = response.json().await.map_err(classify)?;
        Ok(body.commands)
    }

    async fn report_result(
        &self,
        identity: &Identity,
        command_id: &str,
        report: &CommandReport,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoints.command_result(&identity.device_id, command_id))
            .bearer_auth(&identity.token)
            .json(report)
            .send()
            .await
            .map_err(classify)?;
        check_status(response)?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        // Any HTTP answer proves the path to the server is alive.
        self.client
            .head(self.endpoints.probe())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized);
    }
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    Ok(response)
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Protocol(e.to_string())
    }
}
