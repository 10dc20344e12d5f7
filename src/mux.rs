//! Packet flow between the IP terminal and the SSL terminal.
//!
//! Uplink: a reader task pulls packets off the IP terminal into a queue
//! while the writer frames and coalesces whatever is queued into one SSL
//! write. Downlink: packets the demultiplexer routed to the IP mailbox are
//! written to the IP terminal.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Failure;
use crate::session::SessionContext;
use crate::terminal::IpTerminal;
use crate::types::{ControlMessage, Phase};
use crate::unit::ppp::{put_frame_header, PPP_CONTROL_OFFSET, PROTO_IPV4, PROTO_IPV6};

const UPLINK_QUEUE: usize = 1024;
/// Upper bound of one coalesced SSL write.
const SEND_BUFFER: usize = 64 * 1024;

/// PPP protocol for an IP packet, by version nibble.
pub fn ip_protocol(packet: &[u8]) -> Option<u16> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => Some(PROTO_IPV4),
        Some(6) => Some(PROTO_IPV6),
        _ => None,
    }
}

/// Append `packet` wrapped in SSTP data and PPP headers.
pub fn frame_ip(buf: &mut BytesMut, protocol: u16, packet: &[u8]) {
    put_frame_header(buf, protocol, packet.len());
    buf.extend_from_slice(packet);
}

pub struct OutgoingMux {
    ctx: SessionContext,
    terminal: Arc<dyn IpTerminal>,
}

impl OutgoingMux {
    pub fn new(ctx: SessionContext, terminal: Arc<dyn IpTerminal>) -> Self {
        Self { ctx, terminal }
    }

    /// Forward until cancelled or a failure, which is reported.
    pub async fn run(self) {
        let cancel = self.ctx.cancel.clone();
        let (tx, rx) = mpsc::channel(UPLINK_QUEUE);
        let reader = tokio::spawn(read_terminal(
            Arc::clone(&self.terminal),
            self.ctx.setting.mtu() as usize,
            tx,
        ));

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.write_loop(rx) => result,
        };
        reader.abort();
        if let Err(failure) = result {
            warn!("{} failed: {}", Phase::Outgoing, failure);
            self.ctx
                .report(ControlMessage::failed(Phase::Outgoing, failure))
                .await;
        }
    }

    /// Returns `Ok(())` only when the terminal reader stopped cleanly. A
    /// terminal error is reported after the packets read before it are sent.
    async fn write_loop(&self, mut rx: mpsc::Receiver<std::io::Result<Bytes>>) -> Result<(), Failure> {
        let mtu = self.ctx.setting.mtu() as usize;
        let ppp = &self.ctx.config().ppp;
        let mut buf = BytesMut::with_capacity(SEND_BUFFER);

        while let Some(first) = rx.recv().await {
            let mut packets = 0u64;
            let mut bytes = 0usize;
            let mut failed = None;
            let mut next = Some(first);
            while let Some(item) = next.take() {
                let packet = match item {
                    Ok(packet) => packet,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                };
                match ip_protocol(&packet) {
                    Some(PROTO_IPV4) if !ppp.ipv4 => trace!("IPv4 disabled, dropping"),
                    Some(PROTO_IPV6) if !ppp.ipv6 => trace!("IPv6 disabled, dropping"),
                    Some(protocol) if packet.len() <= mtu => {
                        frame_ip(&mut buf, protocol, &packet);
                        packets += 1;
                        bytes += packet.len();
                    }
                    Some(_) => debug!("dropping {} byte packet above MTU {}", packet.len(), mtu),
                    None => trace!("dropping non-IP packet"),
                }
                // Keep room for one more full-size packet.
                if SEND_BUFFER - buf.len() >= mtu + PPP_CONTROL_OFFSET {
                    next = rx.try_recv().ok();
                }
            }
            if !buf.is_empty() {
                self.ctx.sender.send(&buf).await?;
                self.ctx.stats.record_out(packets, bytes);
                buf.clear();
            }
            if let Some(e) = failed {
                return Err(e.into());
            }
        }
        Ok(())
    }
}

async fn read_terminal(
    terminal: Arc<dyn IpTerminal>,
    mtu: usize,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut buf = vec![0u8; mtu.max(1500)];
    loop {
        let item = match terminal.read_packet(&mut buf).await {
            Ok(0) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "IP terminal closed",
            )),
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Write packets routed by the demultiplexer to the IP terminal.
pub async fn run_downlink(
    ctx: SessionContext,
    terminal: Arc<dyn IpTerminal>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    // A single bad packet must not end the session.
                    if let Err(e) = terminal.write_packet(&packet).await {
                        warn!("IP terminal write failed: {}", e);
                    }
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::negotiation::testing::{context, read_packet};
    use crate::session::{NetworkSetting, SslSender};
    use crate::types::Outcome;
    use crate::unit::ppp::{open_data_packet, PPP_HEADER};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncWrite;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// Yields its queued packets, then end of stream.
    struct QueuedTerminal {
        packets: Mutex<VecDeque<Vec<u8>>>,
    }

    impl QueuedTerminal {
        fn new(packets: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(packets.into()),
            })
        }
    }

    #[async_trait]
    impl IpTerminal for QueuedTerminal {
        async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.packets.lock().pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Ok(0),
            }
        }

        async fn write_packet(&self, _packet: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Keeps every write the sender makes as a separate chunk.
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.writes.lock().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn ipv4(len: usize, marker: u8) -> Vec<u8> {
        let mut packet = vec![marker; len];
        packet[0] = 0x45;
        packet
    }

    fn ipv6(len: usize) -> Vec<u8> {
        let mut packet = vec![0; len];
        packet[0] = 0x60;
        packet
    }

    fn payload(packet: &[u8]) -> Vec<u8> {
        let (protocol, rest) = open_data_packet("test", packet).unwrap();
        assert_eq!(protocol, PROTO_IPV4);
        rest.to_vec()
    }

    #[test]
    fn test_frame_ip_layout() {
        let packet = [0x45u8, 0, 0, 20];
        assert_eq!(ip_protocol(&packet), Some(PROTO_IPV4));
        assert_eq!(ip_protocol(&[0x60]), Some(PROTO_IPV6));
        assert_eq!(ip_protocol(&[0x10]), None);
        assert_eq!(ip_protocol(&[]), None);

        let mut buf = BytesMut::new();
        frame_ip(&mut buf, PROTO_IPV4, &packet);
        assert_eq!(
            buf.as_ref(),
            &[0x10, 0x00, 0x00, 0x0C, 0xFF, 0x03, 0x00, 0x21, 0x45, 0, 0, 20]
        );
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), PPP_HEADER);
    }

    #[tokio::test]
    async fn test_uplink_drops_disabled_oversized_and_non_ip() {
        let mut config = ClientConfig::new("vpn", "alice", "secret");
        config.ppp.mtu = 100;
        config.ppp.ipv6 = false;
        let (ctx, mut peer, mut inbox) = context(config);

        let first = ipv4(20, 0xA1);
        let second = ipv4(100, 0xA2);
        let terminal = QueuedTerminal::new(vec![
            first.clone(),
            ipv6(40),
            ipv4(101, 0xEE),
            vec![0x10; 20],
            second.clone(),
        ]);
        OutgoingMux::new(ctx.clone(), terminal).run().await;

        assert_eq!(payload(&read_packet(&mut peer).await), first);
        assert_eq!(payload(&read_packet(&mut peer).await), second);
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.packets_out, 2);
        assert_eq!(snapshot.bytes_out, 120);

        let message = inbox.recv().await.unwrap();
        assert_eq!(message.phase, Phase::Outgoing);
        assert!(matches!(message.outcome, Outcome::Failed(Failure::Transport(_))));
    }

    #[tokio::test]
    async fn test_uplink_drops_ipv4_when_disabled() {
        let mut config = ClientConfig::new("vpn", "alice", "secret");
        config.ppp.ipv4 = false;
        config.ppp.ipv6 = true;
        let (ctx, mut peer, _inbox) = context(config);

        let kept = ipv6(48);
        OutgoingMux::new(ctx.clone(), QueuedTerminal::new(vec![ipv4(20, 1), kept.clone()]))
            .run()
            .await;

        let packet = read_packet(&mut peer).await;
        let (protocol, rest) = open_data_packet("test", &packet).unwrap();
        assert_eq!(protocol, PROTO_IPV6);
        assert_eq!(rest, &kept[..]);
        assert_eq!(ctx.stats.snapshot().packets_out, 1);
    }

    #[tokio::test]
    async fn test_uplink_coalesces_within_send_buffer() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let writer = RecordingWriter {
            writes: Arc::clone(&writes),
        };
        let config = ClientConfig::new("vpn", "alice", "secret");
        let (setting, _writers) = NetworkSetting::new(Arc::new(config), Uuid::new_v4(), vec![]);
        let (ctx, _inbox) =
            SessionContext::new(setting, SslSender::new(Box::new(writer)), CancellationToken::new());

        let sent: Vec<Vec<u8>> = (0..60).map(|i| ipv4(1500, i as u8)).collect();
        OutgoingMux::new(ctx, QueuedTerminal::new(sent.clone())).run().await;

        let writes = writes.lock();
        assert!(writes.len() >= 2, "{} writes", writes.len());
        assert!(writes.len() < sent.len(), "no coalescing: {} writes", writes.len());
        assert!(writes.iter().all(|w| w.len() <= SEND_BUFFER));

        // Every packet arrives once, in order.
        let mut stream = BytesMut::from(&writes.concat()[..]);
        let mut received = Vec::new();
        while !stream.is_empty() {
            let length = (u16::from_be_bytes([stream[2], stream[3]]) & 0x0FFF) as usize;
            received.push(payload(&stream.split_to(length)));
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_terminal_end_of_stream_stops_uplink() {
        let (ctx, _peer, mut inbox) = context(ClientConfig::new("vpn", "alice", "secret"));
        let mux = tokio::spawn(OutgoingMux::new(ctx, QueuedTerminal::new(vec![])).run());

        tokio::time::timeout(Duration::from_secs(5), mux)
            .await
            .expect("uplink kept running after end of stream")
            .unwrap();
        let message = inbox.recv().await.unwrap();
        assert_eq!(
            message,
            ControlMessage::failed(
                Phase::Outgoing,
                Failure::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "IP terminal closed").to_string()),
            )
        );
    }
}
