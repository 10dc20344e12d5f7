//! Per-session shared context.
//!
//! [`NetworkSetting`] carries everything the phases negotiate. Each slice is a
//! write-once [`Slot`]; the matching [`SlotWriter`] is handed to exactly one
//! phase task, so a slice has one writer by construction and many readers.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::terminal::BoxedWriter;
use crate::crypto::HLAK_LEN;
use crate::types::{AuthSuite, ControlMessage, HashProtocol, NetworkAddresses};
use crate::unit::DataUnit;

/// Read side of a write-once value.
#[derive(Debug)]
pub struct Slot<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Slot<T> {
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

/// Sole write side of a [`Slot`]; consumed by the write.
#[derive(Debug)]
pub struct SlotWriter<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> SlotWriter<T> {
    pub fn set(self, value: T) {
        // The writer is unique and consumed here, so the cell is still empty.
        let _ = self.cell.set(value);
    }
}

pub fn slot<T>() -> (SlotWriter<T>, Slot<T>) {
    let cell = Arc::new(OnceLock::new());
    (
        SlotWriter {
            cell: Arc::clone(&cell),
        },
        Slot { cell },
    )
}

/// What LCP settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSetting {
    /// MRU the peer accepted for our receive side.
    pub mru: u16,
    /// Largest packet we may send: the peer's MRU capped by our MTU.
    pub mtu: u16,
    pub auth: AuthSuite,
}

/// What the SSTP Call-Connect-Ack settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    pub hash: HashProtocol,
    pub nonce: [u8; 32],
}

/// What authentication settles.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// All zero for PAP.
    pub hlak: [u8; HLAK_LEN],
}

impl std::fmt::Debug for AuthResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResult").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Setting {
    pub address: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Setting {
    pub local_id: [u8; 8],
    pub peer_id: [u8; 8],
}

impl Ipv6Setting {
    /// fe80::/64 with our interface identifier.
    pub fn link_local(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0] = 0xFE;
        octets[1] = 0x80;
        octets[8..].copy_from_slice(&self.local_id);
        Ipv6Addr::from(octets)
    }
}

/// Negotiated state of one session.
#[derive(Debug)]
pub struct NetworkSetting {
    pub config: Arc<ClientConfig>,
    pub correlation_id: Uuid,
    /// DER of the server's leaf certificate.
    pub peer_certificate: Vec<u8>,
    pub link: Slot<LinkSetting>,
    pub binding: Slot<BindingRequest>,
    pub auth: Slot<AuthResult>,
    pub ipv4: Slot<Ipv4Setting>,
    pub ipv6: Slot<Ipv6Setting>,
}

/// Write sides of [`NetworkSetting`], handed out to the owning phases.
#[derive(Debug)]
pub struct SettingWriters {
    pub link: SlotWriter<LinkSetting>,
    pub binding: SlotWriter<BindingRequest>,
    pub auth: SlotWriter<AuthResult>,
    pub ipv4: SlotWriter<Ipv4Setting>,
    pub ipv6: SlotWriter<Ipv6Setting>,
}

impl NetworkSetting {
    pub fn new(
        config: Arc<ClientConfig>,
        correlation_id: Uuid,
        peer_certificate: Vec<u8>,
    ) -> (Arc<Self>, SettingWriters) {
        let (link_w, link) = slot();
        let (binding_w, binding) = slot();
        let (auth_w, auth) = slot();
        let (ipv4_w, ipv4) = slot();
        let (ipv6_w, ipv6) = slot();
        let setting = Arc::new(Self {
            config,
            correlation_id,
            peer_certificate,
            link,
            binding,
            auth,
            ipv4,
            ipv6,
        });
        let writers = SettingWriters {
            link: link_w,
            binding: binding_w,
            auth: auth_w,
            ipv4: ipv4_w,
            ipv6: ipv6_w,
        };
        (setting, writers)
    }

    /// MTU for outgoing packets; the configured one until LCP settles.
    pub fn mtu(&self) -> u16 {
        self.link
            .get()
            .map(|l| l.mtu)
            .unwrap_or(self.config.ppp.mtu)
    }

    pub fn addresses(&self) -> NetworkAddresses {
        NetworkAddresses {
            ipv4: self.ipv4.get().map(|s| s.address),
            ipv4_dns: self.ipv4.get().map(|s| s.dns.clone()).unwrap_or_default(),
            ipv6_link_local: self.ipv6.get().map(Ipv6Setting::link_local),
        }
    }
}

/// Shared PPP identifier counter for locally originated frames.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU8,
}

impl IdAllocator {
    pub fn next(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Byte and packet counters for both directions.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

impl TrafficStats {
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, packets: u64, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
        }
    }
}

/// Serialized write path to the SSL terminal.
///
/// Every task sends through a clone of this; the mutex keeps whole frames
/// from interleaving on the socket.
#[derive(Clone)]
pub struct SslSender {
    writer: Arc<TokioMutex<BoxedWriter>>,
}

impl SslSender {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Arc::new(TokioMutex::new(writer)),
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub async fn send_unit<U: DataUnit>(&self, unit: &U) -> std::io::Result<()> {
        self.send(&unit.to_bytes()).await
    }

    /// Send within `limit`, swallowing any failure. Used for final teardown
    /// packets, when the socket may already be half closed.
    pub async fn send_best_effort(&self, bytes: &[u8], limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.send(bytes)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("best-effort send failed: {}", e);
                false
            }
            Err(_) => {
                debug!("best-effort send timed out");
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

const CONTROL_CAPACITY: usize = 16;

/// Handles every phase task gets at construction.
#[derive(Clone)]
pub struct SessionContext {
    pub setting: Arc<NetworkSetting>,
    pub sender: SslSender,
    pub ids: Arc<IdAllocator>,
    pub control: mpsc::Sender<ControlMessage>,
    pub cancel: CancellationToken,
    pub stats: Arc<TrafficStats>,
}

impl SessionContext {
    /// Build a context and the orchestrator's end of the control channel.
    pub fn new(
        setting: Arc<NetworkSetting>,
        sender: SslSender,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (control, inbox) = mpsc::channel(CONTROL_CAPACITY);
        let ctx = Self {
            setting,
            sender,
            ids: Arc::default(),
            control,
            cancel,
            stats: Arc::default(),
        };
        (ctx, inbox)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.setting.config
    }

    /// Hand a terminal outcome to the orchestrator.
    pub async fn report(&self, message: ControlMessage) {
        // The orchestrator may already be gone during teardown.
        let _ = self.control.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_write_once() {
        let (writer, reader) = slot::<u16>();
        let other = reader.clone();
        assert_eq!(reader.get(), None);
        writer.set(1400);
        assert_eq!(reader.get(), Some(&1400));
        assert_eq!(other.get(), Some(&1400));
    }

    #[test]
    fn test_id_allocator_wraps() {
        let ids = IdAllocator::default();
        for expected in 0..=255u8 {
            assert_eq!(ids.next(), expected);
        }
        assert_eq!(ids.next(), 0);
    }

    #[test]
    fn test_link_local_address() {
        let setting = Ipv6Setting {
            local_id: [0x02, 0x11, 0x22, 0xFF, 0xFE, 0x33, 0x44, 0x55],
            peer_id: [0; 8],
        };
        assert_eq!(
            setting.link_local().to_string(),
            "fe80::211:22ff:fe33:4455"
        );
    }

    #[test]
    fn test_network_setting_defaults_to_configured_mtu() {
        let config = Arc::new(ClientConfig::new("vpn", "u", "p"));
        let (setting, writers) = NetworkSetting::new(config, Uuid::new_v4(), vec![]);
        assert_eq!(setting.mtu(), 1500);
        writers.link.set(LinkSetting {
            mru: 1500,
            mtu: 1400,
            auth: AuthSuite::Pap,
        });
        assert_eq!(setting.mtu(), 1400);
        assert_eq!(setting.addresses(), NetworkAddresses::default());
    }

    #[tokio::test]
    async fn test_ssl_sender_writes_whole_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        let sender = SslSender::new(Box::new(client));
        sender.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [1, 2, 3]);

        drop(server);
        assert!(!sender.send_best_effort(&[4], Duration::from_millis(100)).await);
    }
}
