//! Shared test harness: a minimal wire-level client.
//!
//! The broker's real client libraries live outside this crate; tests
//! drive the broker through this deliberately small stand-in that speaks
//! the framed envelope protocol over the three per-client channels
//! (CTRL, SEND, RECV).

#![allow(dead_code)]

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use nsb_broker::config::StoreParams;
use nsb_broker::protocol::codec::{read_envelope, write_envelope};
use nsb_broker::protocol::Intro;
use nsb_broker::store::{MemoryStore, StoreHandle};
use nsb_broker::{
    Broker, BrokerConfig, Envelope, Operation, Originator, SimulatorMode, StatusCode, SystemMode,
};
use std::sync::Arc;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a broker configuration on an ephemeral port
pub fn test_config(system_mode: SystemMode, simulator_mode: SimulatorMode) -> BrokerConfig {
    BrokerConfig {
        system_mode,
        simulator_mode,
        store: None,
        listen_address: "127.0.0.1".to_string(),
        // port 0: the kernel picks, so concurrent tests never collide
        listen_port: 0,
    }
}

/// Bind and launch a broker, returning its address and the run handle
pub async fn spawn_broker(config: BrokerConfig) -> (SocketAddr, JoinHandle<Result<()>>) {
    let store = if config.use_store() {
        Some(StoreHandle::new(Arc::new(MemoryStore::new())))
    } else {
        None
    };
    let broker = Broker::bind(config, store).await.expect("bind broker");
    let addr = broker.local_addr();
    let handle = tokio::spawn(broker.run());
    (addr, handle)
}

/// Enable store indirection on a test configuration
pub fn with_store(mut config: BrokerConfig) -> BrokerConfig {
    config.store = Some(StoreParams {
        address: "127.0.0.1".to_string(),
        port: 6379,
        number: 0,
    });
    config
}

/// Read one envelope with the harness timeout
pub async fn expect_envelope(stream: &mut TcpStream) -> Envelope {
    timeout(READ_TIMEOUT, read_envelope(stream))
        .await
        .expect("timed out waiting for an envelope")
        .expect("failed to read envelope")
}

/// Poll FETCH until an entry lands in TX
///
/// SEND is fire-and-forget, so tests poll the queue rather than sleeping
/// an arbitrary interval and hoping the broker got there first.
pub async fn fetch_until_message(client: &mut TestClient, src_id: Option<&str>) -> Envelope {
    for _ in 0..100 {
        let reply = client.fetch(src_id).await;
        if reply.code() == StatusCode::Message {
            return reply;
        }
        assert_eq!(reply.code(), StatusCode::NoMessage);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no TX entry arrived in time");
}

/// Poll RECEIVE until an entry lands in RX
pub async fn receive_until_message(client: &mut TestClient, dest_id: Option<&str>) -> Envelope {
    for _ in 0..100 {
        let reply = client.receive(dest_id).await;
        if reply.code() == StatusCode::Message {
            return reply;
        }
        assert_eq!(reply.code(), StatusCode::NoMessage);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no RX entry arrived in time");
}

/// A three-channel wire-level client
pub struct TestClient {
    pub identifier: String,
    originator: Originator,
    pub ctrl: TcpStream,
    pub send: TcpStream,
    pub recv: TcpStream,
}

impl TestClient {
    /// Open the three channels; the client is unidentified until `init`
    ///
    /// Each channel is probed with a PING before use: the reply proves the
    /// broker has admitted the stream, so a following INIT can resolve all
    /// three observed peers.
    pub async fn connect(
        addr: SocketAddr,
        identifier: &str,
        originator: Originator,
    ) -> Result<Self> {
        let mut ctrl = TcpStream::connect(addr).await?;
        let mut send = TcpStream::connect(addr).await?;
        let mut recv = TcpStream::connect(addr).await?;
        for stream in [&mut ctrl, &mut send, &mut recv] {
            Self::probe(stream, originator).await;
        }
        Ok(Self {
            identifier: identifier.to_string(),
            originator,
            ctrl,
            send,
            recv,
        })
    }

    async fn probe(stream: &mut TcpStream, originator: Originator) {
        let ping = Envelope::request(Operation::Ping, originator);
        write_envelope(stream, &ping).await.expect("probe channel");
        let reply = expect_envelope(stream).await;
        assert_eq!(reply.op(), Operation::Ping);
        assert_eq!(reply.code(), StatusCode::Success);
    }

    /// Connect and complete a successful INIT handshake
    pub async fn join(addr: SocketAddr, identifier: &str, originator: Originator) -> Self {
        let mut client = Self::connect(addr, identifier, originator)
            .await
            .expect("connect channels");
        let reply = client.init().await.expect("send INIT");
        assert_eq!(
            reply.code(),
            StatusCode::Success,
            "INIT for {} should succeed",
            identifier
        );
        client
    }

    fn intro(&self) -> Result<Intro> {
        Ok(Intro {
            identifier: self.identifier.clone(),
            address: self.ctrl.local_addr()?.ip().to_string(),
            ctrl_port: self.ctrl.local_addr()?.port(),
            send_port: self.send.local_addr()?.port(),
            recv_port: self.recv.local_addr()?.port(),
        })
    }

    /// Send INIT on the control channel and return the broker's verdict
    pub async fn init(&mut self) -> Result<Envelope> {
        let envelope =
            Envelope::request(Operation::Init, self.originator).with_intro(self.intro()?);
        write_envelope(&mut self.ctrl, &envelope).await?;
        Ok(expect_envelope(&mut self.ctrl).await)
    }

    /// PING on the control channel
    pub async fn ping(&mut self) -> Envelope {
        let envelope = Envelope::request(Operation::Ping, self.originator);
        write_envelope(&mut self.ctrl, &envelope)
            .await
            .expect("write PING");
        expect_envelope(&mut self.ctrl).await
    }

    /// SEND a payload on the data channel (no response expected)
    pub async fn send_payload(&mut self, dest_id: &str, payload: &[u8]) {
        let src_id = self.identifier.clone();
        let envelope = Envelope::request(Operation::Send, self.originator)
            .with_route(&src_id, dest_id)
            .with_payload_size(payload.len() as i32)
            .with_payload(payload.to_vec());
        write_envelope(&mut self.send, &envelope)
            .await
            .expect("write SEND");
    }

    /// FETCH on the control channel, optionally filtered by source
    pub async fn fetch(&mut self, src_id: Option<&str>) -> Envelope {
        let mut envelope = Envelope::request(Operation::Fetch, self.originator)
            .with_code(StatusCode::ImplicitTarget);
        if let Some(src_id) = src_id {
            envelope = envelope
                .with_code(StatusCode::ExplicitTarget)
                .with_src_id(src_id);
        }
        write_envelope(&mut self.ctrl, &envelope)
            .await
            .expect("write FETCH");
        expect_envelope(&mut self.ctrl).await
    }

    /// POST a delivered payload on the data channel
    pub async fn post(&mut self, src_id: &str, dest_id: &str, payload: &[u8]) {
        let envelope = Envelope::request(Operation::Post, self.originator)
            .with_code(StatusCode::Message)
            .with_route(src_id, dest_id)
            .with_payload_size(payload.len() as i32)
            .with_payload(payload.to_vec());
        write_envelope(&mut self.send, &envelope)
            .await
            .expect("write POST");
    }

    /// POST a payload-store key on the data channel
    pub async fn post_key(&mut self, src_id: &str, dest_id: &str, msg_key: &str) {
        let envelope = Envelope::request(Operation::Post, self.originator)
            .with_code(StatusCode::Message)
            .with_route(src_id, dest_id)
            .with_msg_key(msg_key);
        write_envelope(&mut self.send, &envelope)
            .await
            .expect("write POST");
    }

    /// RECEIVE on the control channel, optionally for another destination
    pub async fn receive(&mut self, dest_id: Option<&str>) -> Envelope {
        let mut envelope = Envelope::request(Operation::Receive, self.originator)
            .with_code(StatusCode::ImplicitTarget);
        if let Some(dest_id) = dest_id {
            envelope = envelope
                .with_code(StatusCode::ExplicitTarget)
                .with_dest_id(dest_id);
        }
        write_envelope(&mut self.ctrl, &envelope)
            .await
            .expect("write RECEIVE");
        expect_envelope(&mut self.ctrl).await
    }

    /// Wait for a broker-initiated FORWARD on the RECV channel
    pub async fn read_forward(&mut self) -> Envelope {
        expect_envelope(&mut self.recv).await
    }

    /// Send EXIT on the control channel (no response expected)
    pub async fn exit(&mut self) {
        let envelope = Envelope::request(Operation::Exit, self.originator);
        write_envelope(&mut self.ctrl, &envelope)
            .await
            .expect("write EXIT");
    }
}
