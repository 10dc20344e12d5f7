//! Scripted SSTP server and in-memory terminals for session tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use sstp_client::error::{Error, Result};
use sstp_client::terminal::TlsDiagnostics;
use sstp_client::unit::ppp::open_data_packet;
use sstp_client::unit::sstp::{peek_header, PACKET_TYPE_CONTROL};
use sstp_client::unit::{ControlPacket, DataUnit};
use sstp_client::{ClientConfig, IpTerminal, IpTerminalFactory, NetworkAddresses, SslConnection, SslDialer};

pub const CERTIFICATE: &[u8] = b"server leaf certificate";

/// Hands out pre-built connections in order and counts dial attempts.
pub struct MockDialer {
    connections: Mutex<VecDeque<SslConnection>>,
    dials: AtomicUsize,
}

impl MockDialer {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SslDialer for MockDialer {
    async fn connect(&self, _config: &ClientConfig) -> Result<SslConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .pop_front()
            .ok_or_else(|| Error::tls("no more connections"))
    }
}

/// A dialer whose single connection ends at the returned [`Server`].
pub fn dialer() -> (Arc<MockDialer>, Server) {
    let (dialer, mut servers) = dialer_with(1);
    (dialer, servers.remove(0))
}

/// A dialer with `count` connections, one [`Server`] per dial in order.
pub fn dialer_with(count: usize) -> (Arc<MockDialer>, Vec<Server>) {
    let mut connections = VecDeque::new();
    let mut servers = Vec::new();
    for _ in 0..count {
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        connections.push_back(SslConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_certificate: CERTIFICATE.to_vec(),
            correlation_id: Uuid::new_v4(),
            diagnostics: TlsDiagnostics::default(),
        });
        servers.push(Server { stream: theirs });
    }
    let dialer = MockDialer {
        connections: Mutex::new(connections),
        dials: AtomicUsize::new(0),
    };
    (Arc::new(dialer), servers)
}

/// Server end of the SSTP stream.
pub struct Server {
    stream: DuplexStream,
}

impl Server {
    pub async fn read_packet(&mut self) -> Vec<u8> {
        let mut packet = vec![0u8; 4];
        self.stream.read_exact(&mut packet).await.unwrap();
        let (_, length) = peek_header(&packet).unwrap();
        packet.resize(length, 0);
        self.stream.read_exact(&mut packet[4..]).await.unwrap();
        packet
    }

    pub async fn send<U: DataUnit>(&mut self, unit: &U) {
        self.stream.write_all(&unit.to_bytes()).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn expect_control(&mut self) -> ControlPacket {
        let packet = self.read_packet().await;
        assert_eq!(peek_header(&packet).unwrap().0, PACKET_TYPE_CONTROL);
        ControlPacket::read_from(&packet).unwrap()
    }

    /// Next data packet of `protocol`, skipping any other PPP traffic.
    pub async fn expect_ppp(&mut self, protocol: u16) -> Vec<u8> {
        loop {
            let packet = self.read_packet().await;
            if peek_header(&packet).unwrap().0 == PACKET_TYPE_CONTROL {
                panic!("unexpected SSTP control packet {:?}", ControlPacket::read_from(&packet));
            }
            let (found, _) = open_data_packet("test", &packet).unwrap();
            if found == protocol {
                return packet;
            }
        }
    }

    /// Read until a control packet matching `pred` arrives.
    pub async fn control_until(&mut self, pred: impl Fn(&ControlPacket) -> bool) -> ControlPacket {
        loop {
            let packet = self.read_packet().await;
            if peek_header(&packet).unwrap().0 != PACKET_TYPE_CONTROL {
                continue;
            }
            let control = ControlPacket::read_from(&packet).unwrap();
            if pred(&control) {
                return control;
            }
        }
    }
}

/// Host side made of channels.
pub struct MockTerminal {
    uplink: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    downlink: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl IpTerminal for MockTerminal {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.uplink.lock().await.recv().await {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => std::future::pending().await,
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.downlink
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host gone"))
    }

    async fn close(&self) {}
}

pub struct MockFactory {
    terminal: Arc<MockTerminal>,
    pub established: Mutex<Vec<(u16, NetworkAddresses)>>,
}

#[async_trait]
impl IpTerminalFactory for MockFactory {
    async fn establish(&self, mtu: u16, addresses: &NetworkAddresses) -> Result<Arc<dyn IpTerminal>> {
        self.established.lock().push((mtu, addresses.clone()));
        let terminal: Arc<dyn IpTerminal> = self.terminal.clone();
        Ok(terminal)
    }
}

/// Host end of a [`MockTerminal`].
pub struct Host {
    pub to_tunnel: mpsc::Sender<Vec<u8>>,
    pub from_tunnel: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn terminal() -> (Arc<MockFactory>, Host) {
    let (to_tunnel, uplink) = mpsc::channel(16);
    let (downlink, from_tunnel) = mpsc::unbounded_channel();
    let terminal = Arc::new(MockTerminal {
        uplink: tokio::sync::Mutex::new(uplink),
        downlink,
    });
    let factory = MockFactory {
        terminal,
        established: Mutex::new(Vec::new()),
    };
    (Arc::new(factory), Host { to_tunnel, from_tunnel })
}
