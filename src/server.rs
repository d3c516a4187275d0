//! # Connection Server Module
//!
//! The broker binds a single TCP listen endpoint and services every client
//! channel through it. Each client opens three connections (CTRL, SEND,
//! RECV): the broker must be able to write unsolicited FORWARD envelopes
//! on a client's RECV stream while the client simultaneously writes on its
//! SEND stream and exchanges control traffic on CTRL.
//!
//! ## Worker Model
//!
//! The accept loop spawns one tokio task per accepted stream. Workers
//! share the registry, the message buffers, and the writer table through
//! explicit async mutexes and never hold more than one across an await;
//! see the locking note in [`crate::dispatch`]. Read halves stay with
//! their worker, which feeds every received byte through an incremental
//! [`FrameDecoder`] and dispatches one envelope per completed frame;
//! write halves live in [`Connections`] so any handler can answer on any
//! channel.
//!
//! ## Shutdown
//!
//! EXIT is cooperative: the dispatcher flips a watch flag, the accept loop
//! and every worker observe it within one bounded tick, client streams
//! close, then the listener, and [`Broker::run`] returns so the process
//! can exit 0.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::defaults::ACCEPT_TICK;
use crate::dispatch::Dispatcher;
use crate::protocol::{codec, Envelope, FrameDecoder, WireError};
use crate::registry::ConnectionId;
use crate::store::StoreHandle;

/// Write halves of every live connection, keyed by connection id
///
/// Kept apart from the registry: a connection can be written to (an INIT
/// FAILURE, say) before it has identified.
#[derive(Debug, Default)]
pub struct Connections {
    writers: Mutex<HashMap<ConnectionId, OwnedWriteHalf>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn_id: ConnectionId, writer: OwnedWriteHalf) {
        self.writers.lock().await.insert(conn_id, writer);
    }

    pub async fn remove(&self, conn_id: ConnectionId) {
        self.writers.lock().await.remove(&conn_id);
    }

    /// Serialize and write one envelope on the given connection
    pub async fn write(
        &self,
        conn_id: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), WireError> {
        let mut writers = self.writers.lock().await;
        let writer = writers.get_mut(&conn_id).ok_or_else(|| {
            WireError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection {} not found", conn_id),
            ))
        })?;
        codec::write_envelope(writer, envelope).await
    }

    /// Drop every writer, closing the write side of all client streams
    pub async fn close_all(&self) {
        self.writers.lock().await.clear();
    }
}

/// The broker's connection-oriented server
pub struct Broker {
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    local_addr: SocketAddr,
    running_rx: watch::Receiver<bool>,
    next_conn_id: AtomicU64,
}

impl Broker {
    /// Bind the listen endpoint and assemble the shared broker state
    ///
    /// A bind failure is a fatal bootstrap error.
    pub async fn bind(config: BrokerConfig, store: Option<StoreHandle>) -> Result<Self> {
        let ip: std::net::IpAddr = config
            .listen_address
            .parse()
            .with_context(|| format!("invalid listen address {:?}", config.listen_address))?;
        let addr = SocketAddr::new(ip, config.listen_port);

        // Build the listener through socket2 so address reuse is explicit.
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind listen endpoint {}", addr))?;
        socket.listen(128)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        let (running_tx, running_rx) = watch::channel(true);
        let dispatcher = Arc::new(Dispatcher::new(config, store, running_tx));

        Ok(Self {
            dispatcher,
            listener,
            local_addr,
            running_rx,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The bound listen address (useful when port 0 was requested)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and service connections until EXIT
    pub async fn run(mut self) -> Result<()> {
        info!("broker listening on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = self.running_rx.changed() => {
                    if !*self.running_rx.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        Err(e) => {
                            // transient accept errors are survivable
                            warn!("accept failed: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(ACCEPT_TICK) => {
                    // tick expirations are normal; re-check the flag
                    if !*self.running_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Close every client stream, then the listener (dropped with self).
        self.dispatcher.connections.close_all().await;
        drop(self.listener);
        info!("broker shut down cleanly");
        Ok(())
    }

    /// Register a fresh connection and spawn its worker
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        debug!("accepted connection {} from {}", conn_id, peer);

        // Low-latency writes matter more than batching on every channel.
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to disable Nagle on connection {}: {}", conn_id, e);
        }

        let (read_half, write_half) = stream.into_split();
        self.dispatcher.registry.track(conn_id, peer).await;
        self.dispatcher.connections.insert(conn_id, write_half).await;

        let dispatcher = Arc::clone(&self.dispatcher);
        let running_rx = self.running_rx.clone();
        tokio::spawn(serve_connection(dispatcher, conn_id, read_half, running_rx));
    }
}

/// Per-connection worker: frame out envelopes and drive the dispatcher
///
/// Received bytes accumulate in a [`FrameDecoder`]; each completed frame
/// is dispatched in arrival order before the next read.
async fn serve_connection(
    dispatcher: Arc<Dispatcher>,
    conn_id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut running_rx: watch::Receiver<bool>,
) {
    use tokio::io::AsyncReadExt;

    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    'serve: loop {
        tokio::select! {
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    debug!("connection {} worker stopping for shutdown", conn_id);
                    break;
                }
            }
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        if decoder.pending() > 0 {
                            warn!(
                                "connection {} closed mid-frame ({} bytes buffered)",
                                conn_id,
                                decoder.pending()
                            );
                        }
                        debug!("connection {} closed", conn_id);
                        break;
                    }
                    Ok(n) => {
                        decoder.extend(&chunk[..n]);
                        // drain every whole envelope this chunk completed
                        loop {
                            match decoder.next_envelope() {
                                Ok(Some(envelope)) => {
                                    dispatcher.dispatch(conn_id, envelope).await;
                                }
                                Ok(None) => break,
                                Err(e @ WireError::Malformed(_)) => {
                                    // a malformed body is answered, not disconnected
                                    dispatcher.reject_malformed(conn_id, &e).await;
                                }
                                Err(e) => {
                                    error!(
                                        "connection {} framing failure: {}; closing",
                                        conn_id, e
                                    );
                                    break 'serve;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("connection {} read failed: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    dispatcher.connections.remove(conn_id).await;
    if let Some(client) = dispatcher.registry.disconnect(conn_id).await {
        info!("client {} ({}) disconnected", client.identifier, client.role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimulatorMode, SystemMode};
    use crate::protocol::{Operation, Originator, StatusCode};

    fn config() -> BrokerConfig {
        BrokerConfig {
            system_mode: SystemMode::Pull,
            simulator_mode: SimulatorMode::PerNode,
            store: None,
            listen_address: "127.0.0.1".to_string(),
            // port 0: let the kernel pick, so tests never collide
            listen_port: 0,
        }
    }

    /// Test a raw connection can ping the broker and read the reply
    #[tokio::test]
    async fn test_ping_round_trip() {
        let broker = Broker::bind(config(), None).await.unwrap();
        let addr = broker.local_addr();
        let server = tokio::spawn(broker.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ping = Envelope::request(Operation::Ping, Originator::AppClient);
        codec::write_envelope(&mut stream, &ping).await.unwrap();

        let reply = codec::read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.op(), Operation::Ping);
        assert_eq!(reply.originator(), Originator::Daemon);
        assert_eq!(reply.code(), StatusCode::Success);

        drop(stream);
        server.abort();
    }

    /// Test garbage framing earns a FAILURE ping without disconnection
    #[tokio::test]
    async fn test_malformed_envelope_answered_not_dropped() {
        use tokio::io::AsyncWriteExt;

        let broker = Broker::bind(config(), None).await.unwrap();
        let addr = broker.local_addr();
        let server = tokio::spawn(broker.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // a well-framed but undecodable body
        let garbage = [255u8; 8];
        stream
            .write_all(&(garbage.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(&garbage).await.unwrap();

        let reply = codec::read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.op(), Operation::Ping);
        assert_eq!(reply.code(), StatusCode::Failure);

        // the stream is still serviceable
        let ping = Envelope::request(Operation::Ping, Originator::AppClient);
        codec::write_envelope(&mut stream, &ping).await.unwrap();
        let reply = codec::read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.code(), StatusCode::Success);

        server.abort();
    }

    /// Test EXIT brings run() to a clean return
    #[tokio::test]
    async fn test_exit_stops_server() {
        let broker = Broker::bind(config(), None).await.unwrap();
        let addr = broker.local_addr();
        let server = tokio::spawn(broker.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let exit = Envelope::request(Operation::Exit, Originator::AppClient);
        codec::write_envelope(&mut stream, &exit).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server should stop within one tick")
            .unwrap();
        assert!(result.is_ok());
    }
}
