//! # Channel Registry Module
//!
//! Every client speaks to the broker over three TCP streams: CTRL
//! (request/response), SEND (client-to-broker data), and RECV
//! (broker-to-client data, where unsolicited FORWARD envelopes are
//! written). The registry maps broker-side connection handles to the
//! clients that own them.
//!
//! ## Identification Lifecycle
//!
//! An accepted connection starts *unidentified*: the registry knows only
//! its observed peer address. The client then sends INIT on any one of
//! its three channels, reporting its address and the local port of every
//! channel. Identification succeeds only when each reported
//! `address:port` matches the observed peer of an unidentified
//! connection; the three connections are then bound to a single
//! [`ClientDetails`] record.
//!
//! ## Storage Shape
//!
//! The record is stored once and reached through two indices: by
//! (role, identifier) for verb routing, and by connection id for the
//! dispatcher's "who is talking" lookups. The record dies when the last
//! of its three channels closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SimulatorMode;
use crate::protocol::{Intro, Originator};

/// Connection identifier for tracking client streams
pub type ConnectionId = u64;

/// The three logical channels of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Request/response traffic
    Ctrl,
    /// Client-to-broker data
    Send,
    /// Broker-to-client data (push forwards land here)
    Recv,
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRole::Ctrl => write!(f, "CTRL"),
            ChannelRole::Send => write!(f, "SEND"),
            ChannelRole::Recv => write!(f, "RECV"),
        }
    }
}

/// Originator class a client registers under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    App,
    Sim,
}

impl TryFrom<Originator> for ClientRole {
    type Error = RegistryError;

    fn try_from(originator: Originator) -> Result<Self, Self::Error> {
        match originator {
            Originator::AppClient => Ok(ClientRole::App),
            Originator::SimClient => Ok(ClientRole::Sim),
            Originator::Daemon => Err(RegistryError::UnexpectedOriginator),
        }
    }
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRole::App => write!(f, "APP_CLIENT"),
            ClientRole::Sim => write!(f, "SIM_CLIENT"),
        }
    }
}

/// Registration failures, all answered with a FAILURE envelope
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identifier is already registered for this role")]
    DuplicateIdentifier,

    #[error("a simulator is already registered in SYSTEM_WIDE mode")]
    SimulatorExists,

    #[error("introduction names {0} which matches no unidentified connection")]
    UnknownChannel(SocketAddr),

    #[error("introduction address is not a valid IP address")]
    BadAddress,

    #[error("originator class cannot register as a client")]
    UnexpectedOriginator,
}

/// The broker-side connection handles of one client's channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    pub ctrl: ConnectionId,
    pub send: ConnectionId,
    pub recv: ConnectionId,
}

impl ChannelSet {
    /// Which channel role a connection id plays, if it belongs here
    pub fn role_of(&self, conn_id: ConnectionId) -> Option<ChannelRole> {
        if conn_id == self.ctrl {
            Some(ChannelRole::Ctrl)
        } else if conn_id == self.send {
            Some(ChannelRole::Send)
        } else if conn_id == self.recv {
            Some(ChannelRole::Recv)
        } else {
            None
        }
    }

    pub fn get(&self, role: ChannelRole) -> ConnectionId {
        match role {
            ChannelRole::Ctrl => self.ctrl,
            ChannelRole::Send => self.send,
            ChannelRole::Recv => self.recv,
        }
    }
}

/// A registered client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDetails {
    pub identifier: String,
    /// The IP the client reported in its introduction
    pub address: String,
    pub role: ClientRole,
    pub channels: ChannelSet,
}

type ClientKey = (ClientRole, String);

#[derive(Debug, Default)]
struct RegistryState {
    /// Accepted connections that have not identified yet, by observed peer
    pending: HashMap<ConnectionId, SocketAddr>,
    /// One record per registered client
    clients: HashMap<ClientKey, Arc<ClientDetails>>,
    /// Second index: connection id to owning client
    by_conn: HashMap<ConnectionId, ClientKey>,
}

/// Registry of connected clients and their channels
#[derive(Debug)]
pub struct Registry {
    simulator_mode: SimulatorMode,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(simulator_mode: SimulatorMode) -> Self {
        Self {
            simulator_mode,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Record a freshly accepted, still-unidentified connection
    pub async fn track(&self, conn_id: ConnectionId, peer: SocketAddr) {
        self.state.lock().await.pending.insert(conn_id, peer);
    }

    /// Identify a client from its INIT introduction
    ///
    /// All three reported `address:port` pairs must match unidentified
    /// connections; on any failure the registry is left unchanged.
    pub async fn register(
        &self,
        originator: Originator,
        intro: &Intro,
    ) -> Result<Arc<ClientDetails>, RegistryError> {
        let role = ClientRole::try_from(originator)?;
        let ip: std::net::IpAddr = intro
            .address
            .parse()
            .map_err(|_| RegistryError::BadAddress)?;

        let mut state = self.state.lock().await;

        if role == ClientRole::Sim
            && self.simulator_mode == SimulatorMode::SystemWide
            && state.clients.keys().any(|(r, _)| *r == ClientRole::Sim)
        {
            return Err(RegistryError::SimulatorExists);
        }

        let key: ClientKey = (role, intro.identifier.clone());
        if state.clients.contains_key(&key) {
            return Err(RegistryError::DuplicateIdentifier);
        }

        // Resolve every channel before touching any state.
        let resolve = |state: &RegistryState, port: u16| -> Result<ConnectionId, RegistryError> {
            let peer = SocketAddr::new(ip, port);
            state
                .pending
                .iter()
                .find(|(_, observed)| **observed == peer)
                .map(|(conn_id, _)| *conn_id)
                .ok_or(RegistryError::UnknownChannel(peer))
        };
        let channels = ChannelSet {
            ctrl: resolve(&state, intro.ctrl_port)?,
            send: resolve(&state, intro.send_port)?,
            recv: resolve(&state, intro.recv_port)?,
        };

        for conn_id in [channels.ctrl, channels.send, channels.recv] {
            state.pending.remove(&conn_id);
            state.by_conn.insert(conn_id, key.clone());
        }

        let details = Arc::new(ClientDetails {
            identifier: intro.identifier.clone(),
            address: intro.address.clone(),
            role,
            channels,
        });
        state.clients.insert(key, Arc::clone(&details));

        debug!(
            "registered {} {} (ctrl={}, send={}, recv={})",
            details.role, details.identifier, channels.ctrl, channels.send, channels.recv
        );
        Ok(details)
    }

    /// Look up a client by role and identifier
    pub async fn lookup(&self, role: ClientRole, identifier: &str) -> Option<Arc<ClientDetails>> {
        self.state
            .lock()
            .await
            .clients
            .get(&(role, identifier.to_string()))
            .cloned()
    }

    /// The client owning a connection, if it has identified
    pub async fn client_for_conn(&self, conn_id: ConnectionId) -> Option<Arc<ClientDetails>> {
        let state = self.state.lock().await;
        let key = state.by_conn.get(&conn_id)?;
        state.clients.get(key).cloned()
    }

    /// The sole registered simulator, if exactly one exists
    pub async fn sole_simulator(&self) -> Option<Arc<ClientDetails>> {
        let state = self.state.lock().await;
        let mut sims = state
            .clients
            .iter()
            .filter(|((role, _), _)| *role == ClientRole::Sim)
            .map(|(_, details)| details);
        let first = sims.next().cloned();
        if sims.next().is_some() {
            return None;
        }
        first
    }

    /// Number of registered simulator clients
    pub async fn simulator_count(&self) -> usize {
        self.state
            .lock()
            .await
            .clients
            .keys()
            .filter(|(role, _)| *role == ClientRole::Sim)
            .count()
    }

    /// Drop a closed connection
    ///
    /// Returns the owning client record once, at the moment its last
    /// channel closed and the record was destroyed.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Option<Arc<ClientDetails>> {
        let mut state = self.state.lock().await;
        state.pending.remove(&conn_id);
        let key = state.by_conn.remove(&conn_id)?;
        let orphaned = !state.by_conn.values().any(|other| *other == key);
        if orphaned {
            return state.clients.remove(&key);
        }
        None
    }

    /// Every connection id the registry knows, identified or not
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        state
            .pending
            .keys()
            .chain(state.by_conn.keys())
            .copied()
            .collect()
    }
}
