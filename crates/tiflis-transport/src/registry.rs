//! Relay connection registry.
//!
//! Tracks every live socket, the tunnel each workstation holds and the
//! devices bound to each tunnel. All methods are synchronous; callers hold
//! the registry lock only while routing a single frame, never across I/O.

use std::collections::HashMap;

use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::{
    sync::mpsc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{
    CLIENT_DISCONNECTED, ConnectPayload, ConnectedPayload, Envelope, ErrorCode, FORWARD_TO_DEVICE,
    ForwardToDevice, RegisterPayload, RegisteredPayload, RelayError, WORKSTATION_OFFLINE,
    WORKSTATION_ONLINE, is_valid_id,
};

/// Registry-local connection identifier.
pub type ConnId = u64;

type KeyHash = [u8; 32];

fn hash_key(key: &str) -> KeyHash {
    Sha256::digest(key.as_bytes()).into()
}

fn keys_match(a: &KeyHash, b: &KeyHash) -> bool {
    a.ct_eq(b).into()
}

/// Source of fresh tunnel identifiers.
pub trait TunnelIdGenerator: Send {
    fn next_id(&mut self) -> String;
}

/// 12 lowercase alphanumeric characters taken from a v4 UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTunnelIds;

impl TunnelIdGenerator for RandomTunnelIds {
    fn next_id(&mut self) -> String {
        Uuid::new_v4().simple().to_string()[..12].to_string()
    }
}

/// `t1`, `t2`, ... in order. Deterministic, for tests.
#[derive(Debug, Default, Clone)]
pub struct SequentialTunnelIds {
    issued: u64,
}

impl TunnelIdGenerator for SequentialTunnelIds {
    fn next_id(&mut self) -> String {
        self.issued += 1;
        format!("t{}", self.issued)
    }
}

/// Outbound side of one socket.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl ConnHandle {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<Envelope>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }

    fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!("Dropped frame for closed connection");
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Workstation { tunnel_id: String },
    Client { tunnel_id: String, device_id: String },
}

struct Connection {
    handle: ConnHandle,
    binding: Option<Binding>,
    last_seen: Instant,
}

struct Tunnel {
    name: String,
    auth_key_hash: KeyHash,
    workstation: Option<ConnId>,
    offline_since: Option<Instant>,
    clients: HashMap<String, ConnId>,
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub api_key: String,
    pub public_url: Option<String>,
    pub heartbeat_timeout: Duration,
    pub offline_grace: Duration,
}

/// Connection counts for the health surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub workstations: usize,
    pub workstations_online: usize,
    pub clients: usize,
}

/// What a sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<ConnId>,
    pub expired_tunnels: Vec<String>,
}

/// Connection registry and router.
pub struct Registry {
    config: RegistryConfig,
    api_key_hash: KeyHash,
    ids: Box<dyn TunnelIdGenerator>,
    next_conn: ConnId,
    connections: HashMap<ConnId, Connection>,
    tunnels: HashMap<String, Tunnel>,
}

impl Registry {
    #[must_use]
    pub fn new(config: RegistryConfig, ids: impl TunnelIdGenerator + 'static) -> Self {
        Self {
            api_key_hash: hash_key(&config.api_key),
            config,
            ids: Box::new(ids),
            next_conn: 0,
            connections: HashMap::new(),
            tunnels: HashMap::new(),
        }
    }

    /// Track a freshly accepted socket.
    pub fn attach(&mut self, handle: ConnHandle) -> ConnId {
        self.next_conn += 1;
        let id = self.next_conn;
        self.connections.insert(
            id,
            Connection {
                handle,
                binding: None,
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Refresh liveness of a connection.
    pub fn touch(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.last_seen = Instant::now();
        }
    }

    /// Send a frame straight back to a connection.
    pub fn reply(&self, conn: ConnId, envelope: Envelope) {
        if let Some(connection) = self.connections.get(&conn) {
            connection.handle.send(envelope);
        }
    }

    fn unbound(&self, conn: ConnId) -> Result<(), RelayError> {
        match self.connections.get(&conn) {
            Some(Connection { binding: None, .. }) => Ok(()),
            Some(_) => Err(RelayError::InvalidPayload(
                "connection is already bound".into(),
            )),
            None => Err(RelayError::Internal),
        }
    }

    /// Bind `conn` as the workstation of a new or reclaimed tunnel.
    ///
    /// A `previous_tunnel_id` held by a live workstation is never taken
    /// over; a fresh identifier is issued instead. Reclaiming with a
    /// different auth key unbinds the devices of the tunnel.
    ///
    /// # Errors
    /// Returns `RegistrationFailed` for a wrong API key and `InvalidPayload`
    /// if the connection is already bound.
    pub fn register(
        &mut self,
        conn: ConnId,
        request: &RegisterPayload,
    ) -> Result<RegisteredPayload, RelayError> {
        self.unbound(conn)?;
        if !keys_match(&hash_key(&request.api_key), &self.api_key_hash) {
            return Err(RelayError::RegistrationFailed("invalid API key".into()));
        }

        let reclaim = request
            .previous_tunnel_id
            .as_deref()
            .filter(|id| is_valid_id(id))
            .filter(|id| {
                let live = self
                    .tunnels
                    .get(*id)
                    .is_some_and(|t| t.workstation.is_some());
                if live {
                    tracing::warn!(tunnel_id = %id, "Previous tunnel id is held by a live workstation");
                }
                !live
            })
            .map(str::to_string);

        let auth_key_hash = hash_key(&request.auth_key);
        let (tunnel_id, restored) = match reclaim {
            Some(tunnel_id) => match self.tunnels.get_mut(&tunnel_id) {
                Some(tunnel) => {
                    tunnel.name.clone_from(&request.name);
                    tunnel.workstation = Some(conn);
                    tunnel.offline_since = None;
                    if !keys_match(&tunnel.auth_key_hash, &auth_key_hash) {
                        // Devices authenticated against the old key must connect again.
                        tunnel.auth_key_hash = auth_key_hash;
                        let rejected = Envelope::error(
                            None,
                            ErrorCode::InvalidAuthKey,
                            "Workstation auth key changed",
                        );
                        for (device_id, client) in tunnel.clients.drain() {
                            if let Some(c) = self.connections.get_mut(&client) {
                                c.binding = None;
                                c.handle.send(rejected.clone());
                                c.handle.close();
                            }
                            tracing::info!(tunnel_id = %tunnel_id, device_id = %device_id, "Unbound device after auth key change");
                        }
                    }
                    let online = Envelope::new(WORKSTATION_ONLINE, json!({ "tunnel_id": tunnel_id }));
                    for client in tunnel.clients.values() {
                        if let Some(c) = self.connections.get(client) {
                            c.handle.send(online.clone());
                        }
                    }
                    (tunnel_id, true)
                }
                None => {
                    self.tunnels
                        .insert(tunnel_id.clone(), Self::new_tunnel(request, auth_key_hash, conn));
                    (tunnel_id, false)
                }
            },
            None => {
                let tunnel_id = self.fresh_id();
                self.tunnels
                    .insert(tunnel_id.clone(), Self::new_tunnel(request, auth_key_hash, conn));
                (tunnel_id, false)
            }
        };

        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.binding = Some(Binding::Workstation {
                tunnel_id: tunnel_id.clone(),
            });
        }
        tracing::info!(tunnel_id = %tunnel_id, name = %request.name, restored, "Workstation registered");

        Ok(RegisteredPayload {
            tunnel_id,
            public_url: self.config.public_url.clone(),
            restored,
        })
    }

    fn new_tunnel(request: &RegisterPayload, auth_key_hash: KeyHash, conn: ConnId) -> Tunnel {
        Tunnel {
            name: request.name.clone(),
            auth_key_hash,
            workstation: Some(conn),
            offline_since: None,
            clients: HashMap::new(),
        }
    }

    fn fresh_id(&mut self) -> String {
        loop {
            let id = self.ids.next_id();
            if !self.tunnels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Bind `conn` as a client device of a tunnel.
    ///
    /// A device reconnecting under the same `device_id` replaces its
    /// previous connection, which is closed.
    ///
    /// # Errors
    /// `TunnelNotFound`, `WorkstationOffline` or `InvalidAuthKey`, checked in
    /// that order; `InvalidPayload` if the connection is already bound.
    pub fn connect(
        &mut self,
        conn: ConnId,
        request: &ConnectPayload,
    ) -> Result<ConnectedPayload, RelayError> {
        self.unbound(conn)?;
        let tunnel = self
            .tunnels
            .get_mut(&request.tunnel_id)
            .ok_or_else(|| RelayError::TunnelNotFound(request.tunnel_id.clone()))?;
        if tunnel.workstation.is_none() {
            return Err(RelayError::WorkstationOffline(request.tunnel_id.clone()));
        }
        if !keys_match(&hash_key(&request.auth_key), &tunnel.auth_key_hash) {
            return Err(RelayError::InvalidAuthKey);
        }

        let previous = tunnel.clients.insert(request.device_id.clone(), conn);
        let workstation_name = tunnel.name.clone();
        if let Some(old) = previous.filter(|old| *old != conn) {
            if let Some(replaced) = self.connections.remove(&old) {
                replaced.handle.close();
            }
            tracing::info!(device_id = %request.device_id, "Replaced previous device connection");
        }

        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.binding = Some(Binding::Client {
                tunnel_id: request.tunnel_id.clone(),
                device_id: request.device_id.clone(),
            });
        }
        tracing::info!(tunnel_id = %request.tunnel_id, device_id = %request.device_id, "Client connected");

        Ok(ConnectedPayload {
            tunnel_id: request.tunnel_id.clone(),
            workstation_name,
            workstation_online: true,
            restored: previous.is_some(),
        })
    }

    /// Route a non-relay frame from `conn` to the other side of its tunnel.
    ///
    /// # Errors
    /// `InvalidPayload` for unbound connections or a malformed
    /// `forward.to_device`; `WorkstationOffline` or `TunnelNotFound` when a
    /// client's workstation cannot be reached.
    pub fn forward(&self, conn: ConnId, mut envelope: Envelope) -> Result<(), RelayError> {
        let binding = self
            .connections
            .get(&conn)
            .and_then(|c| c.binding.as_ref())
            .ok_or_else(|| {
                RelayError::InvalidPayload("connection is not registered or connected".into())
            })?;

        match binding {
            Binding::Client {
                tunnel_id,
                device_id,
            } => {
                let tunnel = self
                    .tunnels
                    .get(tunnel_id)
                    .ok_or_else(|| RelayError::TunnelNotFound(tunnel_id.clone()))?;
                let workstation = tunnel
                    .workstation
                    .and_then(|ws| self.connections.get(&ws))
                    .ok_or_else(|| RelayError::WorkstationOffline(tunnel_id.clone()))?;
                envelope.set_payload_field("device_id", json!(device_id));
                workstation.handle.send(envelope);
            }
            Binding::Workstation { tunnel_id } => {
                let tunnel = self.tunnels.get(tunnel_id).ok_or(RelayError::Internal)?;
                if envelope.kind == FORWARD_TO_DEVICE {
                    let ForwardToDevice { device_id, message } =
                        serde_json::from_value(envelope.payload)
                            .map_err(|e| RelayError::InvalidPayload(e.to_string()))?;
                    match tunnel.clients.get(&device_id).and_then(|c| self.connections.get(c)) {
                        Some(client) => client.handle.send(message),
                        None => tracing::debug!(device_id = %device_id, "Target device is not connected"),
                    }
                } else {
                    for client in tunnel.clients.values() {
                        if let Some(c) = self.connections.get(client) {
                            c.handle.send(envelope.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Forget a connection and tell the other side of its tunnel.
    ///
    /// A workstation's tunnel stays registered, offline, until the grace
    /// period runs out.
    pub fn detach(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        match connection.binding {
            Some(Binding::Workstation { tunnel_id }) => {
                let Some(tunnel) = self.tunnels.get_mut(&tunnel_id) else {
                    return;
                };
                if tunnel.workstation != Some(conn) {
                    return;
                }
                tunnel.workstation = None;
                tunnel.offline_since = Some(Instant::now());
                let offline = Envelope::new(WORKSTATION_OFFLINE, json!({ "tunnel_id": tunnel_id }));
                for client in tunnel.clients.values() {
                    if let Some(c) = self.connections.get(client) {
                        c.handle.send(offline.clone());
                    }
                }
                tracing::info!(tunnel_id = %tunnel_id, "Workstation offline");
            }
            Some(Binding::Client {
                tunnel_id,
                device_id,
            }) => {
                let Some(tunnel) = self.tunnels.get_mut(&tunnel_id) else {
                    return;
                };
                if tunnel.clients.get(&device_id) != Some(&conn) {
                    return;
                }
                tunnel.clients.remove(&device_id);
                if let Some(ws) = tunnel.workstation.and_then(|ws| self.connections.get(&ws)) {
                    ws.handle.send(Envelope::new(
                        CLIENT_DISCONNECTED,
                        json!({ "device_id": device_id }),
                    ));
                }
                tracing::info!(tunnel_id = %tunnel_id, device_id = %device_id, "Client disconnected");
            }
            None => {}
        }
    }

    /// Close connections that missed the heartbeat timeout and drop
    /// tunnels that stayed offline past the grace period.
    pub fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout;
        let mut timed_out: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        timed_out.sort_unstable();
        for conn in &timed_out {
            if let Some(connection) = self.connections.get(conn) {
                connection.handle.close();
            }
            tracing::warn!(conn, "Closed connection (heartbeat timeout)");
            self.detach(*conn);
        }

        let grace = self.config.offline_grace;
        let mut expired_tunnels: Vec<String> = self
            .tunnels
            .iter()
            .filter(|(_, t)| t.offline_since.is_some_and(|since| now.duration_since(since) >= grace))
            .map(|(id, _)| id.clone())
            .collect();
        expired_tunnels.sort();
        for tunnel_id in &expired_tunnels {
            let Some(tunnel) = self.tunnels.remove(tunnel_id) else {
                continue;
            };
            let gone = Envelope::error(None, ErrorCode::TunnelNotFound, "Tunnel expired");
            for client in tunnel.clients.values() {
                if let Some(c) = self.connections.get_mut(client) {
                    c.binding = None;
                    c.handle.send(gone.clone());
                }
            }
            tracing::info!(tunnel_id = %tunnel_id, "Offline tunnel expired");
        }

        SweepReport {
            timed_out,
            expired_tunnels,
        }
    }

    /// Close every connection.
    pub fn close_all(&self) {
        for connection in self.connections.values() {
            connection.handle.close();
        }
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            workstations: self.tunnels.len(),
            workstations_online: self
                .tunnels
                .values()
                .filter(|t| t.workstation.is_some())
                .count(),
            clients: self.tunnels.values().map(|t| t.clients.len()).sum(),
        }
    }
}
