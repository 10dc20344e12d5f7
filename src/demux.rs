//! Incoming side of the session: SSL terminal bytes to typed frames.
//!
//! The demultiplexer is the only reader of the SSL terminal and the only
//! writer into the per-phase mailboxes. It never waits on a mailbox: a frame
//! for a protocol nobody owns is dropped, a frame for a full mailbox is
//! dropped with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Failure;
use crate::session::SessionContext;
use crate::terminal::BoxedReader;
use crate::types::{ControlMessage, Phase};
use crate::unit::option::{LcpOption, OptionKind};
use crate::unit::ppp::{open_data_packet, CONTROL_HEADER_LEN, PROTO_IPCP, PROTO_IPV6CP};
use crate::unit::sstp::{peek_header, PACKET_TYPE_CONTROL, PACKET_TYPE_DATA};
use crate::unit::{
    ChapFrame, ControlFrame, ControlPacket, DataUnit, EapFrame, IpcpFrame, Ipv6cpFrame,
    LcpFrame, PapFrame, PppProtocol, SSTP_HEADER_LEN,
};

const MAILBOX_CAPACITY: usize = 64;
const IP_MAILBOX_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;
/// How often disabled echo timers are looked at again.
const IDLE_RECHECK: Duration = Duration::from_secs(1);

type Fatal = (Phase, Failure);

/// Slot holding the sender of whichever task currently owns a protocol.
pub struct Mailbox<T> {
    name: &'static str,
    capacity: usize,
    slot: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T> Mailbox<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            slot: Mutex::new(None),
        }
    }

    /// Claim the mailbox, replacing any previous owner.
    pub fn register(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.slot.lock() = Some(tx);
        rx
    }

    pub fn unregister(&self) {
        *self.slot.lock() = None;
    }

    pub fn is_registered(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn deliver(&self, item: T) {
        let mut slot = self.slot.lock();
        let Some(tx) = slot.as_ref() else {
            trace!("{}: no owner, dropping", self.name);
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} mailbox full, dropping", self.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{} owner is gone", self.name);
                *slot = None;
            }
        }
    }
}

/// Who currently owns which protocol, plus the echo supervision switches.
///
/// Registration is done by the orchestrator when a phase starts and ends.
pub struct Registry {
    pub sstp: Mailbox<ControlPacket>,
    pub lcp: Mailbox<LcpFrame>,
    pub pap: Mailbox<PapFrame>,
    pub chap: Mailbox<ChapFrame>,
    pub eap: Mailbox<EapFrame>,
    pub ipcp: Mailbox<IpcpFrame>,
    pub ipv6cp: Mailbox<Ipv6cpFrame>,
    /// Network-layer packets bound for the IP terminal.
    pub ip: Mailbox<Bytes>,
    sstp_echo: AtomicBool,
    ppp_echo: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            sstp: Mailbox::new("SSTP", MAILBOX_CAPACITY),
            lcp: Mailbox::new("LCP", MAILBOX_CAPACITY),
            pap: Mailbox::new("PAP", MAILBOX_CAPACITY),
            chap: Mailbox::new("CHAP", MAILBOX_CAPACITY),
            eap: Mailbox::new("EAP", MAILBOX_CAPACITY),
            ipcp: Mailbox::new("IPCP", MAILBOX_CAPACITY),
            ipv6cp: Mailbox::new("IPv6CP", MAILBOX_CAPACITY),
            ip: Mailbox::new("IP", IP_MAILBOX_CAPACITY),
            sstp_echo: AtomicBool::new(false),
            ppp_echo: AtomicBool::new(false),
        }
    }
}

impl Registry {
    /// Start SSTP keepalive supervision; called once Call-Connected is sent.
    pub fn enable_sstp_echo(&self) {
        self.sstp_echo.store(true, Ordering::Relaxed);
    }

    /// Start LCP keepalive supervision; called once LCP is open.
    pub fn enable_ppp_echo(&self) {
        self.ppp_echo.store(true, Ordering::Relaxed);
    }

    /// Drop every owner, closing their mailboxes.
    pub fn close_all(&self) {
        self.sstp.unregister();
        self.lcp.unregister();
        self.pap.unregister();
        self.chap.unregister();
        self.eap.unregister();
        self.ipcp.unregister();
        self.ipv6cp.unregister();
        self.ip.unregister();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    Alive,
    /// Idle for one interval: send an Echo-Request.
    Ping,
    /// Idle past the Echo-Request deadline.
    Dead,
}

/// Liveness timer of one layer.
#[derive(Debug)]
pub struct EchoTimer {
    interval: Duration,
    last_tick: Option<Instant>,
    deadline: Option<Instant>,
}

impl EchoTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: None,
            deadline: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.last_tick.is_some()
    }

    pub fn start(&mut self, now: Instant) {
        if self.last_tick.is_none() {
            self.last_tick = Some(now);
        }
    }

    /// Traffic of this layer arrived.
    pub fn tick(&mut self, now: Instant) {
        if self.last_tick.is_some() {
            self.last_tick = Some(now);
            self.deadline = None;
        }
    }

    pub fn poll(&mut self, now: Instant) -> EchoState {
        let Some(last_tick) = self.last_tick else {
            return EchoState::Alive;
        };
        match self.deadline {
            Some(deadline) if now >= deadline => EchoState::Dead,
            Some(_) => EchoState::Alive,
            None if now.duration_since(last_tick) >= self.interval => {
                self.deadline = Some(now + self.interval);
                EchoState::Ping
            }
            None => EchoState::Alive,
        }
    }

    /// When `poll` can next change its answer.
    pub fn next_check(&self, now: Instant) -> Instant {
        match (self.last_tick, self.deadline) {
            (None, _) => now + IDLE_RECHECK,
            (Some(_), Some(deadline)) => deadline,
            (Some(last_tick), None) => last_tick + self.interval,
        }
    }
}

/// Split one complete SSTP packet off the front of `buffer`.
///
/// Returns `Ok(None)` until the declared length is fully buffered.
pub fn next_packet(buffer: &mut BytesMut) -> Result<Option<Bytes>, Failure> {
    let Some((_, length)) = peek_header(buffer) else {
        return Ok(None);
    };
    if length < SSTP_HEADER_LEN {
        return Err(Failure::Malformed(format!(
            "SSTP packet length {length} below header size"
        )));
    }
    if buffer.len() < length {
        buffer.reserve(length - buffer.len());
        return Ok(None);
    }
    Ok(Some(buffer.split_to(length).freeze()))
}

pub struct IncomingDemux {
    ctx: SessionContext,
    registry: Arc<Registry>,
    buffer: BytesMut,
    sstp_timer: EchoTimer,
    ppp_timer: EchoTimer,
}

impl IncomingDemux {
    pub fn new(ctx: SessionContext, registry: Arc<Registry>) -> Self {
        let sstp_timer = EchoTimer::new(ctx.config().sstp.echo_interval);
        let ppp_timer = EchoTimer::new(ctx.config().ppp.echo_interval);
        Self {
            ctx,
            registry,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            sstp_timer,
            ppp_timer,
        }
    }

    /// Read until cancelled or a fatal condition, which is reported to the
    /// orchestrator.
    pub async fn run(mut self, mut reader: BoxedReader) {
        let cancel = self.ctx.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.read_loop(&mut reader) => result,
        };
        if let Err((phase, failure)) = result {
            warn!("{} failed: {}", phase, failure);
            self.ctx.report(ControlMessage::failed(phase, failure)).await;
        }
    }

    async fn read_loop(&mut self, reader: &mut BoxedReader) -> Result<(), Fatal> {
        loop {
            while let Some(packet) =
                next_packet(&mut self.buffer).map_err(|f| (Phase::Incoming, f))?
            {
                self.dispatch(packet).await?;
            }
            self.check_timers().await?;

            let now = Instant::now();
            let wake = self
                .sstp_timer
                .next_check(now)
                .min(self.ppp_timer.next_check(now));
            self.buffer.reserve(READ_CHUNK);
            tokio::select! {
                read = reader.read_buf(&mut self.buffer) => match read {
                    Ok(0) => return Err((Phase::Incoming, Failure::LinkClosed)),
                    Ok(n) => trace!("read {} bytes", n),
                    Err(e) => return Err((Phase::Incoming, e.into())),
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn check_timers(&mut self) -> Result<(), Fatal> {
        let now = Instant::now();
        if self.registry.sstp_echo.load(Ordering::Relaxed) && !self.sstp_timer.is_started() {
            self.sstp_timer.start(now);
        }
        if self.registry.ppp_echo.load(Ordering::Relaxed) && !self.ppp_timer.is_started() {
            self.ppp_timer.start(now);
        }

        match self.sstp_timer.poll(now) {
            EchoState::Alive => {}
            EchoState::Ping => {
                debug!("SSTP idle, sending Echo-Request");
                self.send(&ControlPacket::EchoRequest).await?;
            }
            EchoState::Dead => return Err((Phase::SstpEcho, Failure::Timeout)),
        }
        match self.ppp_timer.poll(now) {
            EchoState::Alive => {}
            EchoState::Ping => {
                debug!("PPP idle, sending LCP Echo-Request");
                let request = LcpFrame::EchoRequest {
                    id: self.ctx.ids.next(),
                    magic: 0,
                    data: Vec::new(),
                };
                self.send(&request).await?;
            }
            EchoState::Dead => return Err((Phase::PppEcho, Failure::Timeout)),
        }
        Ok(())
    }

    async fn send<U: DataUnit>(&self, unit: &U) -> Result<(), Fatal> {
        self.ctx
            .sender
            .send_unit(unit)
            .await
            .map_err(|e| (Phase::Incoming, e.into()))
    }

    async fn dispatch(&mut self, packet: Bytes) -> Result<(), Fatal> {
        let now = Instant::now();
        self.sstp_timer.tick(now);
        let Some((packet_type, _)) = peek_header(&packet) else {
            return Ok(());
        };
        match packet_type {
            PACKET_TYPE_CONTROL => {
                let control =
                    ControlPacket::read_from(&packet).map_err(|e| (Phase::Sstp, e.into()))?;
                debug!("received SSTP {}", control.name());
                self.registry.sstp.deliver(control);
                Ok(())
            }
            PACKET_TYPE_DATA => {
                self.ppp_timer.tick(now);
                self.dispatch_ppp(&packet).await
            }
            other => {
                debug!(
                    "skipping SSTP packet of unknown type 0x{:04X} ({} bytes)",
                    other,
                    packet.len()
                );
                Ok(())
            }
        }
    }

    async fn dispatch_ppp(&self, packet: &Bytes) -> Result<(), Fatal> {
        let (protocol, rest) = open_data_packet("SSTP data packet", packet)
            .map_err(|e| (Phase::Incoming, e.into()))?;
        let ppp = &self.ctx.config().ppp;
        match PppProtocol::from_u16(protocol) {
            Some(PppProtocol::Ipv4) if ppp.ipv4 => self.forward_ip(packet, rest),
            Some(PppProtocol::Ipv6) if ppp.ipv6 => self.forward_ip(packet, rest),
            Some(PppProtocol::Lcp) => self.dispatch_lcp(packet, rest).await,
            Some(PppProtocol::Pap) => deliver_unit(&self.registry.pap, Phase::Pap, packet),
            Some(PppProtocol::Chap) => deliver_unit(&self.registry.chap, Phase::Chap, packet),
            Some(PppProtocol::Eap) => deliver_unit(&self.registry.eap, Phase::Eap, packet),
            Some(PppProtocol::Ipcp) if ppp.ipv4 => {
                self.deliver_control(&self.registry.ipcp, Phase::Ipcp, packet, rest)
                    .await
            }
            Some(PppProtocol::Ipv6cp) if ppp.ipv6 => {
                self.deliver_control(&self.registry.ipv6cp, Phase::Ipv6cp, packet, rest)
                    .await
            }
            _ => self.reject_protocol(protocol, rest).await,
        }
    }

    fn forward_ip(&self, packet: &Bytes, rest: &[u8]) -> Result<(), Fatal> {
        if rest.is_empty() {
            return Ok(());
        }
        self.ctx.stats.record_in(rest.len());
        let offset = packet.len() - rest.len();
        self.registry.ip.deliver(packet.slice(offset..));
        Ok(())
    }

    /// Answer an unknown code with Code-Reject; `None` means it was handled.
    async fn screen_code<O: OptionKind>(&self, rest: &[u8]) -> Result<Option<()>, Fatal> {
        let Some(&code) = rest.first() else {
            return Err((
                Phase::Incoming,
                Failure::Malformed("empty PPP control packet".into()),
            ));
        };
        if ControlFrame::<O>::is_known_code(code) {
            return Ok(Some(()));
        }
        debug!("rejecting unknown code {} of protocol 0x{:04X}", code, O::PROTOCOL);
        let limit = self.reject_limit(0);
        let reject = ControlFrame::<O>::CodeReject {
            id: self.ctx.ids.next(),
            rejected: rest[..rest.len().min(limit)].to_vec(),
        };
        self.send(&reject).await?;
        Ok(None)
    }

    async fn deliver_control<O: OptionKind>(
        &self,
        mailbox: &Mailbox<ControlFrame<O>>,
        phase: Phase,
        packet: &[u8],
        rest: &[u8],
    ) -> Result<(), Fatal> {
        if self.screen_code::<O>(rest).await?.is_none() {
            return Ok(());
        }
        deliver_unit(mailbox, phase, packet)
    }

    async fn dispatch_lcp(&self, packet: &[u8], rest: &[u8]) -> Result<(), Fatal> {
        if self.screen_code::<LcpOption>(rest).await?.is_none() {
            return Ok(());
        }
        let frame = LcpFrame::read_from(packet).map_err(|e| (Phase::Lcp, e.into()))?;
        match frame {
            ControlFrame::EchoRequest { id, data, .. } => {
                trace!("LCP Echo-Request #{}", id);
                self.send(&LcpFrame::EchoReply { id, magic: 0, data }).await
            }
            ControlFrame::EchoReply { .. } | ControlFrame::DiscardRequest { .. } => Ok(()),
            ControlFrame::ProtocolReject { protocol, .. } => self.on_protocol_reject(protocol),
            configure @ ControlFrame::Configure(_) => {
                if !self.registry.lcp.is_registered() {
                    warn!("peer renegotiates LCP after it opened; ignoring");
                }
                self.registry.lcp.deliver(configure);
                Ok(())
            }
            other if self.registry.lcp.is_registered() => {
                self.registry.lcp.deliver(other);
                Ok(())
            }
            ControlFrame::TerminateRequest { id, .. } => {
                self.send(&LcpFrame::TerminateAck { id, data: Vec::new() })
                    .await?;
                Err((Phase::Lcp, Failure::TerminateRequested))
            }
            ControlFrame::CodeReject { rejected, .. } => {
                let code = rejected.first().copied().unwrap_or_default();
                Err((Phase::Lcp, Failure::CodeRejected(code)))
            }
            ControlFrame::TerminateAck { .. } => Ok(()),
        }
    }

    fn on_protocol_reject(&self, protocol: u16) -> Result<(), Fatal> {
        match protocol {
            PROTO_IPCP if self.registry.ipcp.is_registered() => {
                Err((Phase::Ipcp, Failure::ProtocolRejected(protocol)))
            }
            PROTO_IPV6CP if self.registry.ipv6cp.is_registered() => {
                Err((Phase::Ipv6cp, Failure::ProtocolRejected(protocol)))
            }
            _ => {
                warn!("peer rejected protocol 0x{:04X}", protocol);
                Ok(())
            }
        }
    }

    /// Largest rejected-data length keeping the LCP packet within the MTU.
    fn reject_limit(&self, extra: usize) -> usize {
        (self.ctx.setting.mtu() as usize).saturating_sub(CONTROL_HEADER_LEN + extra)
    }

    async fn reject_protocol(&self, protocol: u16, rest: &[u8]) -> Result<(), Fatal> {
        debug!("rejecting PPP protocol 0x{:04X}", protocol);
        let limit = self.reject_limit(2);
        let reject = LcpFrame::ProtocolReject {
            id: self.ctx.ids.next(),
            protocol,
            info: rest[..rest.len().min(limit)].to_vec(),
        };
        self.send(&reject).await
    }
}

/// Decode and deliver a frame if someone owns the protocol.
///
/// A frame that fails to decode is fatal to the owning phase only.
fn deliver_unit<U: DataUnit>(mailbox: &Mailbox<U>, phase: Phase, packet: &[u8]) -> Result<(), Fatal> {
    if !mailbox.is_registered() {
        trace!("no {} owner, dropping frame", phase);
        return Ok(());
    }
    let unit = U::read_from(packet).map_err(|e| (phase, e.into()))?;
    mailbox.deliver(unit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::config::ClientConfig;
    use crate::session::{NetworkSetting, SslSender};
    use crate::unit::ppp::put_frame_header;
    use crate::unit::CryptoBindingRequest;

    fn context(writer: tokio::io::DuplexStream) -> (SessionContext, mpsc::Receiver<ControlMessage>) {
        let config = Arc::new(ClientConfig::new("vpn", "user", "pass"));
        let (setting, _writers) = NetworkSetting::new(config, Uuid::new_v4(), vec![]);
        SessionContext::new(setting, SslSender::new(Box::new(writer)), CancellationToken::new())
    }

    fn ipv4_packet() -> Vec<u8> {
        let mut packet = vec![0x45, 0x00, 0x00, 0x14];
        packet.resize(20, 0xAB);
        packet
    }

    fn data_packet(protocol: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_frame_header(&mut buf, protocol, payload.len());
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    fn connect_ack() -> Vec<u8> {
        ControlPacket::CallConnectAck {
            request: CryptoBindingRequest {
                hash_bitmask: 0x03,
                nonce: [7; 32],
            },
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_next_packet_waits_for_whole_packet() {
        let stream = [connect_ack(), data_packet(0x0021, &ipv4_packet())].concat();
        let mut buffer = BytesMut::new();

        // Header split.
        buffer.extend_from_slice(&stream[..3]);
        assert_eq!(next_packet(&mut buffer).unwrap(), None);
        // Body split.
        buffer.extend_from_slice(&stream[3..40]);
        assert_eq!(next_packet(&mut buffer).unwrap(), None);
        // Rest of the first packet and all of the second in one read.
        buffer.extend_from_slice(&stream[40..]);
        let first = next_packet(&mut buffer).unwrap().unwrap();
        assert_eq!(first.as_ref(), connect_ack().as_slice());
        let second = next_packet(&mut buffer).unwrap().unwrap();
        assert_eq!(second.len(), 8 + 20);
        assert_eq!(next_packet(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_next_packet_rejects_short_length() {
        let mut buffer = BytesMut::from(&[0x10, 0x00, 0x00, 0x02][..]);
        assert!(matches!(next_packet(&mut buffer), Err(Failure::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_timer_ping_then_dead() {
        let mut timer = EchoTimer::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(timer.poll(start + Duration::from_secs(100)), EchoState::Alive);

        timer.start(start);
        assert_eq!(timer.poll(start + Duration::from_secs(5)), EchoState::Alive);
        assert_eq!(timer.poll(start + Duration::from_secs(10)), EchoState::Ping);
        assert_eq!(timer.poll(start + Duration::from_secs(15)), EchoState::Alive);
        assert_eq!(timer.poll(start + Duration::from_secs(20)), EchoState::Dead);

        timer.tick(start + Duration::from_secs(21));
        assert_eq!(timer.poll(start + Duration::from_secs(25)), EchoState::Alive);
        assert_eq!(
            timer.next_check(start + Duration::from_secs(25)),
            start + Duration::from_secs(31)
        );
    }

    #[tokio::test]
    async fn test_control_then_data_split_reads() {
        let (ssl_out, _peer_in) = tokio::io::duplex(4096);
        let (ctx, _inbox) = context(ssl_out);
        let registry = Arc::new(Registry::default());
        let mut sstp_rx = registry.sstp.register();
        let mut ip_rx = registry.ip.register();

        let (reader, mut feed) = tokio::io::duplex(4096);
        let demux = IncomingDemux::new(ctx.clone(), Arc::clone(&registry));
        let task = tokio::spawn(demux.run(Box::new(reader)));

        let stream = [connect_ack(), data_packet(0x0021, &ipv4_packet())].concat();
        feed.write_all(&stream[..50]).await.unwrap();
        tokio::task::yield_now().await;
        feed.write_all(&stream[50..]).await.unwrap();

        let control = sstp_rx.recv().await.unwrap();
        assert!(matches!(control, ControlPacket::CallConnectAck { .. }));
        let ip = ip_rx.recv().await.unwrap();
        assert_eq!(ip.as_ref(), ipv4_packet().as_slice());
        assert!(sstp_rx.try_recv().is_err());
        assert_eq!(ctx.stats.snapshot().packets_in, 1);

        ctx.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lcp_echo_answered_and_unknown_protocol_rejected() {
        let (ssl_out, mut peer_in) = tokio::io::duplex(4096);
        let (ctx, _inbox) = context(ssl_out);
        let registry = Arc::new(Registry::default());
        let (reader, mut feed) = tokio::io::duplex(4096);
        let task = tokio::spawn(IncomingDemux::new(ctx.clone(), registry).run(Box::new(reader)));

        let echo = LcpFrame::EchoRequest {
            id: 9,
            magic: 0x1234_5678,
            data: vec![1, 2],
        };
        feed.write_all(&echo.to_bytes()).await.unwrap();
        let reply = read_packet(&mut peer_in).await;
        assert_eq!(
            LcpFrame::read_from(&reply).unwrap(),
            LcpFrame::EchoReply {
                id: 9,
                magic: 0,
                data: vec![1, 2]
            }
        );

        // CCP is not spoken here.
        feed.write_all(&data_packet(0x80FD, &[1, 1, 0, 4])).await.unwrap();
        let reject = LcpFrame::read_from(&read_packet(&mut peer_in).await).unwrap();
        assert!(matches!(
            reject,
            LcpFrame::ProtocolReject { protocol: 0x80FD, ref info, .. } if info == &[1, 1, 0, 4]
        ));

        ctx.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_request_after_open_is_fatal() {
        let (ssl_out, mut peer_in) = tokio::io::duplex(4096);
        let (ctx, mut inbox) = context(ssl_out);
        let registry = Arc::new(Registry::default());
        let (reader, mut feed) = tokio::io::duplex(4096);
        tokio::spawn(IncomingDemux::new(ctx, registry).run(Box::new(reader)));

        let terminate = LcpFrame::TerminateRequest { id: 3, data: vec![] };
        feed.write_all(&terminate.to_bytes()).await.unwrap();
        let ack = LcpFrame::read_from(&read_packet(&mut peer_in).await).unwrap();
        assert_eq!(ack, LcpFrame::TerminateAck { id: 3, data: vec![] });
        assert_eq!(
            inbox.recv().await.unwrap(),
            ControlMessage::failed(Phase::Lcp, Failure::TerminateRequested)
        );
    }

    #[tokio::test]
    async fn test_unknown_ipcp_code_gets_code_reject() {
        let (ssl_out, mut peer_in) = tokio::io::duplex(4096);
        let (ctx, _inbox) = context(ssl_out);
        let registry = Arc::new(Registry::default());
        let _ipcp = registry.ipcp.register();
        let (reader, mut feed) = tokio::io::duplex(4096);
        let task = tokio::spawn(IncomingDemux::new(ctx.clone(), registry).run(Box::new(reader)));

        // Code 9 exists for LCP only.
        feed.write_all(&data_packet(PROTO_IPCP, &[9, 1, 0, 4])).await.unwrap();
        let reject = IpcpFrame::read_from(&read_packet(&mut peer_in).await).unwrap();
        assert!(matches!(reject, IpcpFrame::CodeReject { ref rejected, .. } if rejected == &[9, 1, 0, 4]));

        ctx.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_reports_link_closed() {
        let (ssl_out, _peer_in) = tokio::io::duplex(64);
        let (ctx, mut inbox) = context(ssl_out);
        let (reader, feed) = tokio::io::duplex(64);
        drop(feed);
        IncomingDemux::new(ctx, Arc::new(Registry::default()))
            .run(Box::new(reader))
            .await;
        assert_eq!(
            inbox.recv().await.unwrap(),
            ControlMessage::failed(Phase::Incoming, Failure::LinkClosed)
        );
    }

    async fn read_packet(peer: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        peer.read_exact(&mut header).await.unwrap();
        let length = (u16::from_be_bytes([header[2], header[3]]) & 0x0FFF) as usize;
        let mut packet = header.to_vec();
        packet.resize(length, 0);
        peer.read_exact(&mut packet[4..]).await.unwrap();
        packet
    }
}
