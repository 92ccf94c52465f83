//! Workstation link to the relay.
//!
//! Registers the workstation, keeps the link alive with pings and
//! reconnects with exponential backoff, reclaiming the previous tunnel id.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, interval_at, sleep},
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::{
    health::HealthSource,
    protocol::{
        ERROR, Envelope, ErrorCode, ErrorPayload, PING, PONG, REGISTER, REGISTERED, RegisterPayload,
        RegisteredPayload,
    },
};

/// Relay client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Relay rejected registration ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Authentication and validation failures are not retried.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                code: ErrorCode::RegistrationFailed
                    | ErrorCode::InvalidApiKey
                    | ErrorCode::InvalidPayload,
                ..
            }
        )
    }
}

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket URL of the relay, e.g. `ws://relay:3001/ws`.
    pub url: String,
    pub api_key: String,
    pub name: String,
    pub auth_key: String,
    pub ping_interval: Duration,
    pub max_reconnect_delay: Duration,
}

impl RelayClientConfig {
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        name: impl Into<String>,
        auth_key: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            name: name.into(),
            auth_key: auth_key.into(),
            ping_interval: Duration::from_secs(20),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff: 100 ms doubling per attempt, capped.
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectStrategy {
    #[must_use]
    pub const fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            attempt: 0,
        }
    }

    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count an attempt and return how long to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.calculate_delay()
    }

    #[must_use]
    pub fn calculate_delay(&self) -> Duration {
        let base = Duration::from_millis(100);
        let exponential = base * 2u32.pow(self.attempt.saturating_sub(1).min(7));
        exponential.min(self.max_delay)
    }
}

/// State of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Registered { tunnel_id: String },
}

/// Readiness of the link for the health surface.
#[derive(Debug, Clone)]
pub struct LinkHealth(watch::Receiver<LinkStatus>);

impl HealthSource for LinkHealth {
    fn is_ready(&self) -> bool {
        matches!(*self.0.borrow(), LinkStatus::Registered { .. })
    }

    fn details(&self) -> Value {
        match &*self.0.borrow() {
            LinkStatus::Registered { tunnel_id } => json!({ "tunnel_id": tunnel_id }),
            LinkStatus::Disconnected => json!({ "tunnel_id": null }),
        }
    }
}

/// Workstation side of the relay link.
pub struct RelayClient {
    config: RelayClientConfig,
    status: watch::Sender<LinkStatus>,
    tunnel_id: Option<String>,
}

impl RelayClient {
    #[must_use]
    pub fn new(config: RelayClientConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        Self {
            config,
            status,
            tunnel_id: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn health(&self) -> LinkHealth {
        LinkHealth(self.status())
    }

    /// Keep the link up until `shutdown` fires or `outbound` closes.
    ///
    /// Frames from `outbound` go to the relay; frames from the relay,
    /// except pongs and errors, go to `inbound`.
    ///
    /// # Errors
    /// Returns error if the relay rejects the registration.
    pub async fn run(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        inbound: mpsc::UnboundedSender<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut backoff = ReconnectStrategy::new(self.config.max_reconnect_delay);
        loop {
            let result = self
                .connect_once(&mut outbound, &inbound, &shutdown, &mut backoff)
                .await;
            self.status.send_replace(LinkStatus::Disconnected);
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Relay registration rejected");
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "Relay link lost"),
            }

            let delay = backoff.next_delay();
            tracing::info!(attempt = backoff.attempt(), "Reconnecting in {delay:?}");
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = sleep(delay) => {}
            }
        }
    }

    async fn connect_once(
        &mut self,
        outbound: &mut mpsc::UnboundedReceiver<Envelope>,
        inbound: &mpsc::UnboundedSender<Envelope>,
        shutdown: &CancellationToken,
        backoff: &mut ReconnectStrategy,
    ) -> Result<(), ClientError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let register = RegisterPayload {
            api_key: self.config.api_key.clone(),
            name: self.config.name.clone(),
            auth_key: self.config.auth_key.clone(),
            reconnect: self.tunnel_id.is_some(),
            previous_tunnel_id: self.tunnel_id.clone(),
        };
        sink.send(text(&Envelope::from_payload(REGISTER, &register)?)?)
            .await?;

        let registered = loop {
            let msg = stream.next().await.ok_or(ClientError::Closed)??;
            let Some(envelope) = decode(msg)? else {
                continue;
            };
            match envelope.kind.as_str() {
                REGISTERED => break serde_json::from_value::<RegisteredPayload>(envelope.payload)?,
                ERROR => {
                    let error: ErrorPayload = serde_json::from_value(envelope.payload)?;
                    return Err(ClientError::Rejected {
                        code: error.code,
                        message: error.message,
                    });
                }
                _ => {}
            }
        };

        backoff.reset();
        tracing::info!(
            tunnel_id = %registered.tunnel_id,
            restored = registered.restored,
            "Registered with relay"
        );
        self.tunnel_id = Some(registered.tunnel_id.clone());
        self.status.send_replace(LinkStatus::Registered {
            tunnel_id: registered.tunnel_id,
        });

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let envelope = Envelope::new(
                        PING,
                        json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
                    );
                    sink.send(text(&envelope)?).await?;
                }
                out = outbound.recv() => {
                    let Some(envelope) = out else {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    sink.send(text(&envelope)?).await?;
                }
                msg = stream.next() => {
                    let Some(envelope) = decode(msg.ok_or(ClientError::Closed)??)? else {
                        continue;
                    };
                    match envelope.kind.as_str() {
                        PONG => {}
                        ERROR => tracing::warn!(payload = %envelope.payload, "Relay reported an error"),
                        _ => {
                            if inbound.send(envelope).is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

fn text(envelope: &Envelope) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(envelope)?.into()))
}

fn decode(msg: Message) -> Result<Option<Envelope>, ClientError> {
    match msg {
        Message::Text(text) => Ok(Some(serde_json::from_str(text.as_str())?)),
        Message::Binary(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Message::Close(_) => Err(ClientError::Closed),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let mut backoff = ReconnectStrategy::new(Duration::from_secs(5));
        let delays: Vec<u64> = (0..8)
            .map(|_| u64::try_from(backoff.next_delay().as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_exponent_is_bounded() {
        let mut backoff = ReconnectStrategy::new(Duration::from_secs(3600));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.calculate_delay(), Duration::from_millis(12_800));
    }

    #[test]
    fn test_fatal_errors() {
        let rejected = |code| ClientError::Rejected {
            code,
            message: String::new(),
        };
        assert!(rejected(ErrorCode::RegistrationFailed).is_fatal());
        assert!(!rejected(ErrorCode::InternalError).is_fatal());
        assert!(!ClientError::Closed.is_fatal());
    }

    #[test]
    fn test_health_follows_status() {
        let client = RelayClient::new(RelayClientConfig::new("ws://x", "k", "W", "a"));
        let health = client.health();
        assert!(!health.is_ready());

        client.status.send_replace(LinkStatus::Registered {
            tunnel_id: "t1".into(),
        });
        assert!(health.is_ready());
        assert_eq!(health.details()["tunnel_id"], "t1");
    }
}
