//! # Broker Wire Protocol Module
//!
//! This module defines the single envelope type that carries every message
//! between the broker and its clients, together with the length-framed codec
//! used to move envelopes across TCP streams.
//!
//! ## Envelope Anatomy
//!
//! Every envelope has three parts:
//!
//! - **Manifest** (required): the operation verb, the originator class of the
//!   sender, and a status code qualifying the message.
//! - **Metadata** (optional): source/destination client identifiers and the
//!   informational payload size.
//! - **Body** (optional, at most one): raw payload bytes, a payload-store
//!   key, a client introduction (INIT), or a configuration snapshot (INIT
//!   response).
//!
//! ## Framing
//!
//! Envelopes are serialized with bincode and prefixed with a `u32`
//! little-endian length so a receiver can recover one envelope per frame
//! from a byte stream without knowledge of its internals. See [`codec`].
//!
//! ## Fidelity
//!
//! Encoding round-trips byte-identically: payload content is preserved
//! exactly, embedded zero bytes included.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{SimulatorMode, SystemMode};

pub mod codec;

pub use codec::FrameDecoder;

/// Errors raised by the wire layer
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame length prefix exceeded the configured cap
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    /// A write on a saturated peer channel did not complete in time
    #[error("write timed out on a saturated peer channel")]
    WriteTimeout,

    /// Underlying stream error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame body did not decode to a valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Operation verbs understood by the broker
///
/// `Forward` is emitted by the broker in push mode and is never a valid
/// inbound request; the dispatcher answers it like any unknown verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Liveness probe
    Ping,
    /// Client registration handshake
    Init,
    /// Application submits a payload for simulation (feeds TX)
    Send,
    /// Simulator drains a pending outbound payload (drains TX)
    Fetch,
    /// Simulator reports a delivered payload (feeds RX)
    Post,
    /// Application collects a delivered payload (drains RX)
    Receive,
    /// Broker-initiated delivery on a peer RECV channel (push mode)
    Forward,
    /// Cooperative broker shutdown
    Exit,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Ping => "PING",
            Operation::Init => "INIT",
            Operation::Send => "SEND",
            Operation::Fetch => "FETCH",
            Operation::Post => "POST",
            Operation::Receive => "RECEIVE",
            Operation::Forward => "FORWARD",
            Operation::Exit => "EXIT",
        };
        write!(f, "{}", name)
    }
}

/// Originator class of an envelope's sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Originator {
    /// The broker daemon itself
    Daemon,
    /// A payload-producing application client
    AppClient,
    /// A network simulator client
    SimClient,
}

impl std::fmt::Display for Originator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Originator::Daemon => "DAEMON",
            Originator::AppClient => "APP_CLIENT",
            Originator::SimClient => "SIM_CLIENT",
        };
        write!(f, "{}", name)
    }
}

/// Status codes qualifying an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Operation completed
    Success,
    /// Operation rejected or failed
    Failure,
    /// Client-originated request
    ClientRequest,
    /// Daemon-originated reply
    DaemonResponse,
    /// Queue drain without a source/destination filter
    ImplicitTarget,
    /// Queue drain filtered to a specific source/destination
    ExplicitTarget,
    /// A payload (or its store key) accompanies this envelope
    Message,
    /// Nothing was pending for this request
    NoMessage,
}

/// Required envelope header: verb, sender class, and qualifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub op: Operation,
    pub originator: Originator,
    pub code: StatusCode,
}

/// Optional routing metadata
///
/// `payload_size` records the original byte length of the payload. It is
/// informational: the broker forwards it but never checks it against the
/// body that actually accompanies the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub src_id: Option<String>,
    pub dest_id: Option<String>,
    pub payload_size: Option<i32>,
}

/// Client introduction carried by INIT
///
/// Clients report their address and the local port of each of their three
/// channels so the broker can match the introduction against the peers it
/// observed at accept time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intro {
    /// Logical client identifier, unique within the originator class
    pub identifier: String,
    /// The client's reported IP address
    pub address: String,
    /// Local port of the control channel
    pub ctrl_port: u16,
    /// Local port of the client-to-broker data channel
    pub send_port: u16,
    /// Local port of the broker-to-client data channel
    pub recv_port: u16,
}

/// Broker configuration replayed to clients in the INIT response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub system_mode: SystemMode,
    pub simulator_mode: SimulatorMode,
    pub use_store: bool,
    pub store_address: Option<String>,
    pub store_port: Option<u16>,
    pub store_num: Option<i64>,
}

/// Envelope body: at most one of these accompanies a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Raw payload bytes
    Payload(Vec<u8>),
    /// Key referencing payload bytes held in the payload store
    MsgKey(String),
    /// Client introduction (INIT request)
    Intro(Intro),
    /// Configuration snapshot (INIT response)
    Config(ConfigSnapshot),
}

/// The single message envelope exchanged between broker and clients
///
/// Constructed through [`Envelope::request`] / [`Envelope::response`] plus
/// the `with_*` builders, and inspected through the borrowing accessors,
/// which normalize empty identifier strings to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub manifest: Manifest,
    pub metadata: Option<Metadata>,
    pub body: Option<Body>,
}

impl Envelope {
    /// Create a client-originated request envelope
    pub fn request(op: Operation, originator: Originator) -> Self {
        Self {
            manifest: Manifest {
                op,
                originator,
                code: StatusCode::ClientRequest,
            },
            metadata: None,
            body: None,
        }
    }

    /// Create a daemon-originated response envelope
    pub fn response(op: Operation, code: StatusCode) -> Self {
        Self {
            manifest: Manifest {
                op,
                originator: Originator::Daemon,
                code,
            },
            metadata: None,
            body: None,
        }
    }

    /// Override the manifest status code
    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.manifest.code = code;
        self
    }

    /// Set source and destination identifiers
    pub fn with_route(mut self, src_id: &str, dest_id: &str) -> Self {
        let meta = self.metadata.get_or_insert_with(Metadata::default);
        meta.src_id = Some(src_id.to_string());
        meta.dest_id = Some(dest_id.to_string());
        self
    }

    /// Set only the source identifier
    pub fn with_src_id(mut self, src_id: &str) -> Self {
        self.metadata.get_or_insert_with(Metadata::default).src_id = Some(src_id.to_string());
        self
    }

    /// Set only the destination identifier
    pub fn with_dest_id(mut self, dest_id: &str) -> Self {
        self.metadata.get_or_insert_with(Metadata::default).dest_id = Some(dest_id.to_string());
        self
    }

    /// Record the informational payload size
    pub fn with_payload_size(mut self, size: i32) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::default)
            .payload_size = Some(size);
        self
    }

    /// Attach raw payload bytes
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.body = Some(Body::Payload(payload));
        self
    }

    /// Attach a payload-store key
    pub fn with_msg_key(mut self, key: impl Into<String>) -> Self {
        self.body = Some(Body::MsgKey(key.into()));
        self
    }

    /// Attach a client introduction
    pub fn with_intro(mut self, intro: Intro) -> Self {
        self.body = Some(Body::Intro(intro));
        self
    }

    /// Attach a configuration snapshot
    pub fn with_config(mut self, config: ConfigSnapshot) -> Self {
        self.body = Some(Body::Config(config));
        self
    }

    pub fn op(&self) -> Operation {
        self.manifest.op
    }

    pub fn originator(&self) -> Originator {
        self.manifest.originator
    }

    pub fn code(&self) -> StatusCode {
        self.manifest.code
    }

    /// Source identifier, if present and non-empty
    pub fn src_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.src_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Destination identifier, if present and non-empty
    pub fn dest_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.dest_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Informational payload size, defaulting to zero
    pub fn payload_size(&self) -> i32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.payload_size)
            .unwrap_or(0)
    }

    /// Raw payload bytes, if the body carries them
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            Some(Body::Payload(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Payload-store key, if the body carries one
    pub fn msg_key(&self) -> Option<&str> {
        match &self.body {
            Some(Body::MsgKey(key)) => Some(key),
            _ => None,
        }
    }

    /// Client introduction, if the body carries one
    pub fn intro(&self) -> Option<&Intro> {
        match &self.body {
            Some(Body::Intro(intro)) => Some(intro),
            _ => None,
        }
    }

    /// Configuration snapshot, if the body carries one
    pub fn config(&self) -> Option<&ConfigSnapshot> {
        match &self.body {
            Some(Body::Config(config)) => Some(config),
            _ => None,
        }
    }

    /// Serialize the envelope to bincode bytes (unframed)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize an envelope from bincode bytes (unframed)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
