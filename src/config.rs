//! # Broker Configuration Module
//!
//! Process-wide configuration, loaded once at startup from a TOML file and
//! replayed to every client in its INIT response.
//!
//! ## File Shape
//!
//! ```toml
//! [system]
//! mode = 0            # 0 = PULL, 1 = PUSH
//! simulator_mode = 0  # 0 = SYSTEM_WIDE, 1 = PER_NODE
//!
//! [database]
//! use_db = true
//! db_address = "127.0.0.1"
//! db_port = 6379
//! db_num = 0
//!
//! [broker]            # optional; listen endpoint overrides
//! listen_address = "127.0.0.1"
//! listen_port = 65432
//! ```
//!
//! The mode fields are kept as integers on disk for compatibility with the
//! deployed configuration format; they decode through `TryFrom<u8>` so an
//! out-of-range value is a fatal bootstrap error rather than a silent
//! default.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::defaults;
use crate::protocol::ConfigSnapshot;

/// Delivery discipline: clients poll, or the broker pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SystemMode {
    /// Clients poll with FETCH / RECEIVE; the broker buffers
    Pull,
    /// The broker forwards to the next hop's RECV channel on arrival
    Push,
}

impl TryFrom<u8> for SystemMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SystemMode::Pull),
            1 => Ok(SystemMode::Push),
            other => Err(format!("invalid system mode {} (expected 0 or 1)", other)),
        }
    }
}

impl From<SystemMode> for u8 {
    fn from(mode: SystemMode) -> u8 {
        match mode {
            SystemMode::Pull => 0,
            SystemMode::Push => 1,
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMode::Pull => write!(f, "PULL"),
            SystemMode::Push => write!(f, "PUSH"),
        }
    }
}

/// Simulator topology: one simulator for the network, or one per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SimulatorMode {
    /// A single simulator client represents the whole network
    SystemWide,
    /// One simulator instance represents each node
    PerNode,
}

impl TryFrom<u8> for SimulatorMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SimulatorMode::SystemWide),
            1 => Ok(SimulatorMode::PerNode),
            other => Err(format!(
                "invalid simulator mode {} (expected 0 or 1)",
                other
            )),
        }
    }
}

impl From<SimulatorMode> for u8 {
    fn from(mode: SimulatorMode) -> u8 {
        match mode {
            SimulatorMode::SystemWide => 0,
            SimulatorMode::PerNode => 1,
        }
    }
}

impl std::fmt::Display for SimulatorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulatorMode::SystemWide => write!(f, "SYSTEM_WIDE"),
            SimulatorMode::PerNode => write!(f, "PER_NODE"),
        }
    }
}

/// Connection parameters of the external payload store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreParams {
    pub address: String,
    pub port: u16,
    pub number: i64,
}

/// Validated process-wide broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub system_mode: SystemMode,
    pub simulator_mode: SimulatorMode,
    /// Payload store parameters; `None` disables store indirection
    pub store: Option<StoreParams>,
    pub listen_address: String,
    pub listen_port: u16,
}

impl BrokerConfig {
    /// Load and validate a configuration file
    ///
    /// Missing file, unparsable TOML, out-of-range mode values, and an
    /// enabled database section with incomplete connection details are all
    /// fatal bootstrap errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {:?}", path))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse configuration file {:?}", path))?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let store = match file.database {
            Some(db) if db.use_db => Some(StoreParams {
                address: db
                    .db_address
                    .ok_or_else(|| anyhow!("database.use_db is set but db_address is missing"))?,
                port: db
                    .db_port
                    .ok_or_else(|| anyhow!("database.use_db is set but db_port is missing"))?,
                number: db.db_num.unwrap_or(0),
            }),
            _ => None,
        };

        let broker = file.broker.unwrap_or_default();
        Ok(Self {
            system_mode: file.system.mode,
            simulator_mode: file.system.simulator_mode,
            store,
            listen_address: broker
                .listen_address
                .unwrap_or_else(|| defaults::LISTEN_ADDRESS.to_string()),
            listen_port: broker.listen_port.unwrap_or(defaults::LISTEN_PORT),
        })
    }

    /// Whether payload bytes are held off-socket in the payload store
    pub fn use_store(&self) -> bool {
        self.store.is_some()
    }

    /// The snapshot replayed in every successful INIT response
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            system_mode: self.system_mode,
            simulator_mode: self.simulator_mode,
            use_store: self.store.is_some(),
            store_address: self.store.as_ref().map(|s| s.address.clone()),
            store_port: self.store.as_ref().map(|s| s.port),
            store_num: self.store.as_ref().map(|s| s.number),
        }
    }
}

/// Raw on-disk configuration shape
#[derive(Debug, Deserialize)]
struct ConfigFile {
    system: SystemTable,
    database: Option<DatabaseTable>,
    broker: Option<BrokerTable>,
}

#[derive(Debug, Deserialize)]
struct SystemTable {
    mode: SystemMode,
    simulator_mode: SimulatorMode,
}

#[derive(Debug, Deserialize)]
struct DatabaseTable {
    use_db: bool,
    db_address: Option<String>,
    db_port: Option<u16>,
    db_num: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerTable {
    listen_address: Option<String>,
    listen_port: Option<u16>,
}
