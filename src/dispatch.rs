//! # Operation Dispatch Module
//!
//! Every inbound envelope, once parsed, is routed here by its manifest
//! verb. Each handler inspects the envelope, reads or writes the message
//! buffers and the payload store, consults the registry for routing, and
//! returns an optional response envelope; when one is returned the
//! dispatcher writes it back on the originating channel.
//!
//! ## Verb Summary
//!
//! | Verb    | From | Effect                                             |
//! |---------|------|----------------------------------------------------|
//! | INIT    | both | register client, replay configuration              |
//! | PING    | both | liveness echo                                      |
//! | SEND    | APP  | entry into TX (pull) or FORWARD to simulator (push)|
//! | FETCH   | SIM  | drain TX, optionally filtered by source            |
//! | POST    | SIM  | entry into RX (pull) or FORWARD to app (push)      |
//! | RECEIVE | APP  | drain RX, filtered by destination                  |
//! | EXIT    | both | flip the running flag; the server shuts down       |
//!
//! Any other inbound verb (FORWARD included: it is broker-emitted, never
//! broker-bound) earns a FAILURE ping.
//!
//! ## Locking Discipline
//!
//! Handlers take at most one mutex at a time: registry lookups complete
//! and release before a queue is touched, and queue operations release
//! before any peer write. Peer writes are the only handler I/O and are
//! bounded by the codec's write timeout.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::{MessageBuffer, MessageEntry, PayloadRef};
use crate::config::{BrokerConfig, SimulatorMode, SystemMode};
use crate::protocol::{Body, Envelope, Operation, Originator, StatusCode, WireError};
use crate::registry::{ClientRole, ConnectionId, Registry};
use crate::server::Connections;
use crate::store::StoreHandle;

/// Routes envelopes to verb handlers over the broker's shared state
pub struct Dispatcher {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: Registry,
    pub(crate) connections: Connections,
    tx_queue: MessageBuffer,
    rx_queue: MessageBuffer,
    store: Option<StoreHandle>,
    running: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        config: BrokerConfig,
        store: Option<StoreHandle>,
        running: watch::Sender<bool>,
    ) -> Self {
        let registry = Registry::new(config.simulator_mode);
        Self {
            config,
            registry,
            connections: Connections::new(),
            tx_queue: MessageBuffer::new(),
            rx_queue: MessageBuffer::new(),
            store,
            running,
        }
    }

    /// Route one envelope and answer on the originating channel if the
    /// handler produced a response
    pub async fn dispatch(&self, conn_id: ConnectionId, envelope: Envelope) {
        debug!(
            "dispatching {} from {} on connection {}",
            envelope.op(),
            envelope.originator(),
            conn_id
        );

        let response = match envelope.op() {
            Operation::Init => self.handle_init(conn_id, &envelope).await,
            Operation::Ping => self.handle_ping(),
            Operation::Send => self.handle_send(&envelope).await,
            Operation::Fetch => self.handle_fetch(&envelope).await,
            Operation::Post => self.handle_post(&envelope).await,
            Operation::Receive => self.handle_receive(conn_id, &envelope).await,
            Operation::Exit => self.handle_exit(),
            Operation::Forward => self.handle_unknown(&envelope),
        };

        if let Some(response) = response {
            if let Err(e) = self.connections.write(conn_id, &response).await {
                warn!("failed to answer on connection {}: {}", conn_id, e);
            }
        }
    }

    /// Answer an envelope the broker cannot parse at all
    pub async fn reject_malformed(&self, conn_id: ConnectionId, error: &WireError) {
        warn!("unparseable envelope on connection {}: {}", conn_id, error);
        let response = Envelope::response(Operation::Ping, StatusCode::Failure);
        if let Err(e) = self.connections.write(conn_id, &response).await {
            warn!("failed to answer on connection {}: {}", conn_id, e);
        }
    }

    // INIT: identify the three channels and replay the configuration.
    async fn handle_init(&self, conn_id: ConnectionId, envelope: &Envelope) -> Option<Envelope> {
        let failure = || Some(Envelope::response(Operation::Init, StatusCode::Failure));

        let Some(intro) = envelope.intro() else {
            warn!("INIT without an introduction on connection {}", conn_id);
            return failure();
        };
        if intro.identifier.is_empty() {
            warn!("INIT with an empty identifier on connection {}", conn_id);
            return failure();
        }

        match self.registry.register(envelope.originator(), intro).await {
            Ok(details) => {
                info!(
                    "client {} registered as {} from {}",
                    details.identifier, details.role, details.address
                );
                Some(
                    Envelope::response(Operation::Init, StatusCode::Success)
                        .with_config(self.config.snapshot()),
                )
            }
            Err(e) => {
                warn!("INIT rejected for {}: {}", intro.identifier, e);
                failure()
            }
        }
    }

    fn handle_ping(&self) -> Option<Envelope> {
        Some(Envelope::response(Operation::Ping, StatusCode::Success))
    }

    // SEND: an application hands the broker a payload bound for another
    // application, to be carried through the simulated network.
    async fn handle_send(&self, envelope: &Envelope) -> Option<Envelope> {
        if envelope.originator() != Originator::AppClient {
            warn!("SEND from {} rejected", envelope.originator());
            return Some(Envelope::response(Operation::Send, StatusCode::Failure));
        }
        let (Some(src_id), Some(dest_id)) = (envelope.src_id(), envelope.dest_id()) else {
            warn!("SEND without source or destination");
            return Some(Envelope::response(Operation::Send, StatusCode::Failure));
        };

        let Some(payload) = self.ingest_payload(src_id, envelope).await else {
            // the sender does not expect a SEND response; drop after logging
            return None;
        };
        let entry = MessageEntry::new(src_id, dest_id, payload, envelope.payload_size());

        match self.config.system_mode {
            SystemMode::Pull => {
                self.tx_queue.push_back(entry).await;
                debug!("queued TX entry {} -> {}", src_id, dest_id);
                None
            }
            SystemMode::Push => {
                self.forward_to_simulator(envelope, &entry).await;
                None
            }
        }
    }

    // FETCH: a simulator drains the next pending outbound payload,
    // optionally filtered to a single source.
    async fn handle_fetch(&self, envelope: &Envelope) -> Option<Envelope> {
        if envelope.originator() != Originator::SimClient {
            warn!("FETCH from {} rejected", envelope.originator());
            return Some(Envelope::response(Operation::Fetch, StatusCode::Failure));
        }

        let entry = match envelope.src_id() {
            Some(src_id) => {
                self.tx_queue
                    .pop_first_where(|e| e.source == src_id)
                    .await
            }
            None => self.tx_queue.pop_front().await,
        };

        match entry {
            Some(entry) => self.deliver(Operation::Fetch, entry, false).await,
            None => Some(Envelope::response(Operation::Fetch, StatusCode::NoMessage)),
        }
    }

    // POST: a simulator reports a payload that finished transit and is
    // now deliverable to its destination application.
    async fn handle_post(&self, envelope: &Envelope) -> Option<Envelope> {
        if envelope.originator() != Originator::SimClient {
            warn!("POST from {} rejected", envelope.originator());
            return Some(Envelope::response(Operation::Post, StatusCode::Failure));
        }
        if envelope.code() != StatusCode::Message {
            warn!("POST without a MESSAGE code rejected");
            return Some(Envelope::response(Operation::Post, StatusCode::Failure));
        }
        let (Some(src_id), Some(dest_id)) = (envelope.src_id(), envelope.dest_id()) else {
            warn!("POST without source or destination");
            return Some(Envelope::response(Operation::Post, StatusCode::Failure));
        };

        let Some(payload) = self.ingest_payload(src_id, envelope).await else {
            return None;
        };
        let entry = MessageEntry::new(src_id, dest_id, payload, envelope.payload_size());

        match self.config.system_mode {
            SystemMode::Pull => {
                self.rx_queue.push_back(entry).await;
                debug!("queued RX entry {} -> {}", src_id, dest_id);
                None
            }
            SystemMode::Push => {
                self.forward_to_app(envelope, &entry).await;
                None
            }
        }
    }

    // RECEIVE: an application collects a delivered payload. Without an
    // explicit destination filter, the caller's own identifier is used.
    async fn handle_receive(
        &self,
        conn_id: ConnectionId,
        envelope: &Envelope,
    ) -> Option<Envelope> {
        if envelope.originator() != Originator::AppClient {
            warn!("RECEIVE from {} rejected", envelope.originator());
            return Some(Envelope::response(Operation::Receive, StatusCode::Failure));
        }

        let dest_id = match envelope.dest_id() {
            Some(dest_id) => dest_id.to_string(),
            None => match self.registry.client_for_conn(conn_id).await {
                Some(details) => details.identifier.clone(),
                None => {
                    warn!("RECEIVE from unidentified connection {}", conn_id);
                    return Some(Envelope::response(
                        Operation::Receive,
                        StatusCode::Failure,
                    ));
                }
            },
        };

        let entry = self
            .rx_queue
            .pop_first_where(|e| e.destination == dest_id)
            .await;

        match entry {
            Some(entry) => self.deliver(Operation::Receive, entry, true).await,
            None => Some(Envelope::response(
                Operation::Receive,
                StatusCode::NoMessage,
            )),
        }
    }

    // EXIT: cooperative shutdown; the server observes the flag on its
    // next tick. No response is owed.
    fn handle_exit(&self) -> Option<Envelope> {
        info!("EXIT received; shutting down");
        let _ = self.running.send(false);
        None
    }

    fn handle_unknown(&self, envelope: &Envelope) -> Option<Envelope> {
        warn!("unexpected {} envelope rejected", envelope.op());
        Some(Envelope::response(Operation::Ping, StatusCode::Failure))
    }

    /// Normalize an inbound payload into the queueable form
    ///
    /// With the store enabled the wire must carry keys; raw bytes arriving
    /// in store mode are written through the adapter and replaced by a
    /// minted key. Without the store, bytes stay inline and a stray key is
    /// rejected. `None` means the payload was lost (store failure or
    /// key/store mismatch) and was logged.
    async fn ingest_payload(&self, src_id: &str, envelope: &Envelope) -> Option<PayloadRef> {
        match &self.store {
            Some(store) => {
                if let Some(key) = envelope.msg_key() {
                    Some(PayloadRef::Key(key.to_string()))
                } else {
                    let bytes = envelope.payload().unwrap_or_default().to_vec();
                    match store.store(src_id, bytes).await {
                        Some(key) => Some(PayloadRef::Key(key)),
                        None => {
                            warn!("payload from {} lost to a store failure", src_id);
                            None
                        }
                    }
                }
            }
            None => {
                if envelope.msg_key().is_some() {
                    warn!("msg_key from {} but no payload store is configured", src_id);
                    return None;
                }
                Some(PayloadRef::Inline(
                    envelope.payload().unwrap_or_default().to_vec(),
                ))
            }
        }
    }

    /// Build the MESSAGE response delivering `entry`
    ///
    /// `final_hop` marks delivery to the consuming application (RECEIVE):
    /// there the stored bytes are checked out and carried inline, emptying
    /// the store row. On the simulator hop (FETCH) the key is peeked and
    /// passed through for the simulator to re-post.
    async fn deliver(
        &self,
        op: Operation,
        entry: MessageEntry,
        final_hop: bool,
    ) -> Option<Envelope> {
        let response = Envelope::response(op, StatusCode::Message)
            .with_route(&entry.source, &entry.destination)
            .with_payload_size(entry.payload_size);

        let response = match entry.payload {
            PayloadRef::Inline(bytes) => response.with_payload(bytes),
            PayloadRef::Key(key) => {
                let store = match &self.store {
                    Some(store) => store,
                    None => {
                        warn!("queued key {} but no payload store is configured", key);
                        return Some(Envelope::response(op, StatusCode::NoMessage));
                    }
                };
                if final_hop {
                    match store.check_out(&key).await {
                        Some(bytes) => response.with_payload(bytes),
                        None => {
                            warn!("key {} missing from the payload store", key);
                            return Some(Envelope::response(op, StatusCode::NoMessage));
                        }
                    }
                } else {
                    if store.peek(&key).await.is_none() {
                        warn!("key {} missing from the payload store", key);
                        return Some(Envelope::response(op, StatusCode::NoMessage));
                    }
                    response.with_msg_key(key)
                }
            }
        };
        Some(response)
    }

    /// Push-mode SEND: re-encode as FORWARD and write on the simulator
    /// target's RECV channel
    async fn forward_to_simulator(&self, envelope: &Envelope, entry: &MessageEntry) {
        let target = match self.config.simulator_mode {
            SimulatorMode::SystemWide => self.registry.sole_simulator().await,
            SimulatorMode::PerNode => {
                self.registry.lookup(ClientRole::Sim, &entry.source).await
            }
        };
        let Some(sim) = target else {
            warn!(
                "no simulator target for source {}; dropping forward",
                entry.source
            );
            return;
        };
        self.write_forward(envelope, entry, sim.channels.recv).await;
    }

    /// Push-mode POST: forward on the destination application's RECV
    /// channel
    async fn forward_to_app(&self, envelope: &Envelope, entry: &MessageEntry) {
        let Some(app) = self
            .registry
            .lookup(ClientRole::App, &entry.destination)
            .await
        else {
            warn!(
                "no application {} to forward to; dropping",
                entry.destination
            );
            return;
        };
        self.write_forward(envelope, entry, app.channels.recv).await;
    }

    async fn write_forward(
        &self,
        envelope: &Envelope,
        entry: &MessageEntry,
        recv_conn: ConnectionId,
    ) {
        let mut forward = envelope.clone();
        forward.manifest.op = Operation::Forward;
        // carry the normalized payload, not whatever arrived on the wire
        forward.body = Some(match &entry.payload {
            PayloadRef::Inline(bytes) => Body::Payload(bytes.clone()),
            PayloadRef::Key(key) => Body::MsgKey(key.clone()),
        });

        if let Err(e) = self.connections.write(recv_conn, &forward).await {
            warn!(
                "forward {} -> {} dropped on connection {}: {}",
                entry.source, entry.destination, recv_conn, e
            );
        } else {
            debug!("forwarded {} -> {}", entry.source, entry.destination);
        }
    }
}
