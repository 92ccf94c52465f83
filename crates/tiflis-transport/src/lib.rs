//! Relay transport for tiflis.
//!
//! Provides:
//! - Wire protocol (JSON envelopes, error codes)
//! - Relay server: connection registry, router, heartbeat, health surface
//! - Workstation side: session forwarding, request handling, relay client

pub mod config;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod relay_client;
pub mod websocket;
pub mod workstation;

pub use config::{ConfigError, RelayConfig};
pub use health::{HealthSource, health_router};
pub use protocol::{Envelope, ErrorCode, RelayError, RelayRequest};
pub use registry::{RandomTunnelIds, Registry, SequentialTunnelIds, TunnelIdGenerator};
pub use relay::{RelayState, router, serve};
pub use relay_client::{ClientError, LinkStatus, ReconnectStrategy, RelayClient, RelayClientConfig};
pub use workstation::{SessionForwarder, WorkstationHandler, WorkstationRequest};
