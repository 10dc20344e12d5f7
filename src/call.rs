//! SSTP call control.
//!
//! `DISCONNECTED -> REQUEST_SENT -> ACK_RECEIVED -> CALL_CONNECTED`, then
//! one of the disconnect or abort sequences. The task owns the SSTP control
//! mailbox for the whole session; the orchestrator drives the transitions
//! that depend on PPP progress through [`CallCommand`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::crypto::{call_connected, HLAK_LEN};
use crate::demux::Registry;
use crate::error::Failure;
use crate::session::{BindingRequest, SessionContext, SlotWriter};
use crate::types::{ControlMessage, HashProtocol, Phase};
use crate::unit::{ControlPacket, DataUnit};

const SEND_LIMIT: Duration = Duration::from_secs(1);
const DISCONNECT_ACK_WAIT: Duration = Duration::from_secs(5);
const ABORT_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Disconnected,
    RequestSent,
    AckReceived,
    CallConnected,
    /// Call-Disconnect queued.
    DisconnectInProgress1,
    /// Call-Disconnect sent, waiting for the Ack.
    DisconnectInProgress2,
    AbortInProgress1,
    AbortInProgress2,
}

#[derive(Debug)]
pub enum CallCommand {
    /// Send Call-Connected once authentication settled the HLAK.
    Connect(oneshot::Sender<Result<(), Failure>>),
    Disconnect,
    Abort,
}

enum Event {
    Command(Option<CallCommand>),
    Packet(Option<ControlPacket>),
    Cancelled,
}

pub struct CallControl {
    ctx: SessionContext,
    registry: Arc<Registry>,
    mailbox: mpsc::Receiver<ControlPacket>,
    binding: Option<SlotWriter<BindingRequest>>,
    state: CallState,
}

impl CallControl {
    pub fn new(
        ctx: SessionContext,
        registry: Arc<Registry>,
        mailbox: mpsc::Receiver<ControlPacket>,
        binding: SlotWriter<BindingRequest>,
    ) -> Self {
        Self {
            ctx,
            registry,
            mailbox,
            binding: Some(binding),
            state: CallState::Disconnected,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    fn enter(&mut self, state: CallState) {
        trace!("SSTP {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Run the call until a teardown command, a peer teardown, or
    /// cancellation. Outcomes go to the control channel.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) {
        let requested = tokio::select! {
            result = self.request() => Ok(result),
            command = commands.recv() => Err(command),
        };
        match requested {
            Ok(Ok(())) => self.ctx.report(ControlMessage::proceeded(Phase::Sstp)).await,
            Ok(Err(failure)) => {
                warn!("{} failed: {}", Phase::Sstp, failure);
                self.ctx.report(ControlMessage::failed(Phase::Sstp, failure)).await;
            }
            Err(command) => {
                self.finish(command).await;
                return;
            }
        }

        loop {
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                packet = self.mailbox.recv() => Event::Packet(packet),
                _ = self.ctx.cancel.cancelled() => Event::Cancelled,
            };
            match event {
                Event::Command(Some(CallCommand::Connect(reply))) => {
                    let _ = reply.send(self.send_connected().await);
                }
                Event::Command(command) => {
                    self.finish(command).await;
                    return;
                }
                Event::Packet(Some(packet)) => {
                    if let Err(failure) = self.on_packet(packet).await {
                        warn!("{} failed: {}", Phase::Sstp, failure);
                        self.ctx.report(ControlMessage::failed(Phase::Sstp, failure)).await;
                        return;
                    }
                }
                Event::Packet(None) | Event::Cancelled => return,
            }
        }
    }

    async fn finish(&mut self, command: Option<CallCommand>) {
        match command {
            Some(CallCommand::Disconnect) => self.disconnect().await,
            Some(CallCommand::Abort) => self.abort().await,
            Some(CallCommand::Connect(reply)) => {
                let _ = reply.send(Err(Failure::UnexpectedMessage(
                    "Call-Connected requested before Call-Connect-Ack".into(),
                )));
            }
            None => {}
        }
    }

    /// Call-Connect-Request until acknowledged, retrying on timeout or Nak.
    pub async fn request(&mut self) -> Result<(), Failure> {
        let sstp = &self.ctx.config().sstp;
        let attempts = sstp.connect_retries.max(1);
        let per_attempt = sstp.negotiation_timeout / attempts;
        let mut last_nak = None;

        for attempt in 1..=attempts {
            debug!("sending Call-Connect-Request ({}/{})", attempt, attempts);
            self.ctx
                .sender
                .send_unit(&ControlPacket::call_connect_request())
                .await?;
            self.enter(CallState::RequestSent);

            let deadline = Instant::now() + per_attempt;
            loop {
                let packet = match timeout_at(deadline, self.mailbox.recv()).await {
                    Err(_) => {
                        debug!("Call-Connect-Request timed out");
                        break;
                    }
                    Ok(None) => return Err(Failure::LinkClosed),
                    Ok(Some(packet)) => packet,
                };
                let status = packet.status_text();
                match packet {
                    ControlPacket::CallConnectAck { request } => {
                        let hash = HashProtocol::choose(request.hash_bitmask).ok_or_else(|| {
                            Failure::Malformed(format!(
                                "no supported hash protocol in bitmask 0x{:02X}",
                                request.hash_bitmask
                            ))
                        })?;
                        if let Some(writer) = self.binding.take() {
                            writer.set(BindingRequest {
                                hash,
                                nonce: request.nonce,
                            });
                        }
                        self.enter(CallState::AckReceived);
                        info!("Call-Connect-Ack received, hash {:?}", hash);
                        return Ok(());
                    }
                    ControlPacket::CallConnectNak { .. } => {
                        let text = status.unwrap_or_else(|| "no status".into());
                        warn!("Call-Connect-Nak: {}", text);
                        last_nak = Some(text);
                        break;
                    }
                    other => self.on_packet(other).await?,
                }
            }
        }
        Err(match last_nak {
            Some(text) => Failure::ConnectNak(text),
            None => Failure::Timeout,
        })
    }

    async fn send_connected(&mut self) -> Result<(), Failure> {
        let setting = &self.ctx.setting;
        let binding = setting.binding.get().ok_or_else(|| {
            Failure::UnexpectedMessage("Call-Connected before Call-Connect-Ack".into())
        })?;
        let hlak = setting.auth.get().map(|auth| auth.hlak).unwrap_or([0; HLAK_LEN]);
        let packet = call_connected(binding.hash, binding.nonce, &setting.peer_certificate, &hlak)
            .map_err(|e| Failure::Malformed(e.to_string()))?;
        self.ctx.sender.send_unit(&packet).await?;
        self.enter(CallState::CallConnected);
        self.registry.enable_sstp_echo();
        info!("Call-Connected sent");
        Ok(())
    }

    /// Steady-state handling of one control packet.
    async fn on_packet(&mut self, packet: ControlPacket) -> Result<(), Failure> {
        let status = packet.status_text();
        match packet {
            ControlPacket::EchoRequest => {
                self.ctx.sender.send_unit(&ControlPacket::EchoResponse).await?;
                Ok(())
            }
            ControlPacket::EchoResponse => Ok(()),
            ControlPacket::CallDisconnect { .. } => {
                info!("server disconnected the call");
                self.send_final(ControlPacket::CallDisconnectAck).await;
                self.enter(CallState::Disconnected);
                Err(Failure::DisconnectRequested(status))
            }
            ControlPacket::CallAbort { .. } => {
                info!("server aborted the call");
                self.send_final(ControlPacket::CallAbort { status: None }).await;
                self.enter(CallState::Disconnected);
                Err(Failure::AbortRequested(status))
            }
            other => {
                debug!("ignoring {} in {:?}", other.name(), self.state);
                Ok(())
            }
        }
    }

    async fn send_final(&self, packet: ControlPacket) {
        if !self
            .ctx
            .sender
            .send_best_effort(&packet.to_bytes(), SEND_LIMIT)
            .await
        {
            debug!("{} not sent", packet.name());
        }
    }

    /// Wait until `wanted` arrives or `limit` passes.
    async fn wait_for(&mut self, limit: Duration, wanted: fn(&ControlPacket) -> bool) -> bool {
        let mailbox = &mut self.mailbox;
        timeout(limit, async {
            while let Some(packet) = mailbox.recv().await {
                if wanted(&packet) {
                    return true;
                }
                trace!("discarding {} during teardown", packet.name());
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    pub async fn disconnect(&mut self) {
        self.enter(CallState::DisconnectInProgress1);
        self.send_final(ControlPacket::CallDisconnect { status: None }).await;
        self.enter(CallState::DisconnectInProgress2);
        let acked = self
            .wait_for(DISCONNECT_ACK_WAIT, |p| {
                matches!(p, ControlPacket::CallDisconnectAck)
            })
            .await;
        if !acked {
            debug!("no Call-Disconnect-Ack");
        }
        self.enter(CallState::Disconnected);
    }

    pub async fn abort(&mut self) {
        self.enter(CallState::AbortInProgress1);
        self.send_final(ControlPacket::CallAbort { status: None }).await;
        self.enter(CallState::AbortInProgress2);
        let answered = self
            .wait_for(ABORT_WAIT, |p| matches!(p, ControlPacket::CallAbort { .. }))
            .await;
        if !answered {
            debug!("no Call-Abort from server");
        }
        self.enter(CallState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::{NetworkSetting, SslSender};
    use crate::unit::{CryptoBindingRequest, StatusInfo};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Harness {
        call: CallControl,
        ctx: SessionContext,
        peer: DuplexStream,
        packets: mpsc::Sender<ControlPacket>,
        inbox: mpsc::Receiver<ControlMessage>,
    }

    fn harness(config: ClientConfig) -> Harness {
        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let (setting, writers) = NetworkSetting::new(Arc::new(config), Uuid::new_v4(), b"cert".to_vec());
        let (ctx, inbox) =
            SessionContext::new(setting, SslSender::new(Box::new(ours)), CancellationToken::new());
        // Feed the call directly rather than through the demultiplexer.
        let packets = mpsc::channel(8);
        let call = CallControl::new(
            ctx.clone(),
            Arc::new(Registry::default()),
            packets.1,
            writers.binding,
        );
        Harness {
            call,
            ctx,
            peer,
            packets: packets.0,
            inbox,
        }
    }

    async fn read_control(peer: &mut DuplexStream) -> ControlPacket {
        let mut header = [0u8; 4];
        peer.read_exact(&mut header).await.unwrap();
        let length = (u16::from_be_bytes([header[2], header[3]]) & 0x0FFF) as usize;
        let mut packet = header.to_vec();
        packet.resize(length, 0);
        peer.read_exact(&mut packet[4..]).await.unwrap();
        ControlPacket::read_from(&packet).unwrap()
    }

    fn ack(bitmask: u8) -> ControlPacket {
        ControlPacket::CallConnectAck {
            request: CryptoBindingRequest {
                hash_bitmask: bitmask,
                nonce: [0xAB; 32],
            },
        }
    }

    #[tokio::test]
    async fn test_ack_records_binding_request() {
        let Harness { mut call, ctx, mut peer, packets, .. } = harness(ClientConfig::new("vpn", "u", "p"));
        assert_eq!(call.state(), CallState::Disconnected);
        let task = tokio::spawn(async move {
            let result = call.request().await;
            (result, call.state())
        });
        assert_eq!(read_control(&mut peer).await, ControlPacket::call_connect_request());
        packets.send(ack(HashProtocol::BIT_SHA1 | HashProtocol::BIT_SHA256)).await.unwrap();

        let (result, state) = task.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(state, CallState::AckReceived);
        let binding = ctx.setting.binding.get().unwrap();
        assert_eq!(binding.hash, HashProtocol::Sha256);
        assert_eq!(binding.nonce, [0xAB; 32]);
    }

    #[tokio::test]
    async fn test_ack_without_hash_is_malformed() {
        let Harness { mut call, mut peer, packets, .. } = harness(ClientConfig::new("vpn", "u", "p"));
        let task = tokio::spawn(async move { call.request().await });
        read_control(&mut peer).await;
        packets.send(ack(0)).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(Failure::Malformed(_))));
    }

    #[tokio::test]
    async fn test_nak_retried_then_fails() {
        let mut config = ClientConfig::new("vpn", "u", "p");
        config.sstp.connect_retries = 2;
        let Harness { mut call, mut peer, packets, .. } = harness(config);
        let task = tokio::spawn(async move { call.request().await });
        let nak = ControlPacket::CallConnectNak {
            statuses: vec![StatusInfo::new(1, StatusInfo::VALUE_NOT_SUPPORTED)],
        };
        for _ in 0..2 {
            assert_eq!(read_control(&mut peer).await, ControlPacket::call_connect_request());
            packets.send(nak.clone()).await.unwrap();
        }
        match task.await.unwrap() {
            Err(Failure::ConnectNak(text)) => assert!(text.contains("value not supported")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let Harness { mut call, mut peer, packets, .. } = harness(ClientConfig::new("vpn", "u", "p"));
        let task = tokio::spawn(async move { call.request().await });
        for _ in 0..3 {
            read_control(&mut peer).await;
        }
        assert_eq!(task.await.unwrap(), Err(Failure::Timeout));
        drop(packets);
    }

    #[tokio::test]
    async fn test_connected_then_peer_disconnect() {
        let Harness { call, ctx, mut peer, packets, mut inbox } = harness(ClientConfig::new("vpn", "u", "p"));
        let (commands_tx, commands_rx) = mpsc::channel(4);
        let task = tokio::spawn(call.run(commands_rx));

        read_control(&mut peer).await;
        packets.send(ack(HashProtocol::BIT_SHA256)).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap(), ControlMessage::proceeded(Phase::Sstp));

        let (reply_tx, reply_rx) = oneshot::channel();
        commands_tx.send(CallCommand::Connect(reply_tx)).await.unwrap();
        assert_eq!(reply_rx.await.unwrap(), Ok(()));
        let ControlPacket::CallConnected { binding } = read_control(&mut peer).await else {
            panic!("expected Call-Connected");
        };
        let expected = call_connected(
            HashProtocol::Sha256,
            [0xAB; 32],
            &ctx.setting.peer_certificate,
            &[0; HLAK_LEN],
        )
        .unwrap();
        assert_eq!(expected, ControlPacket::CallConnected { binding });

        packets.send(ControlPacket::EchoRequest).await.unwrap();
        assert_eq!(read_control(&mut peer).await, ControlPacket::EchoResponse);

        packets.send(ControlPacket::CallDisconnect { status: None }).await.unwrap();
        assert_eq!(read_control(&mut peer).await, ControlPacket::CallDisconnectAck);
        assert_eq!(
            inbox.recv().await.unwrap(),
            ControlMessage::failed(Phase::Sstp, Failure::DisconnectRequested(None))
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_disconnect_waits_for_ack() {
        let Harness { call, mut peer, packets, mut inbox, .. } = harness(ClientConfig::new("vpn", "u", "p"));
        let (commands_tx, commands_rx) = mpsc::channel(4);
        let task = tokio::spawn(call.run(commands_rx));
        read_control(&mut peer).await;
        packets.send(ack(HashProtocol::BIT_SHA1)).await.unwrap();
        inbox.recv().await.unwrap();

        commands_tx.send(CallCommand::Disconnect).await.unwrap();
        assert_eq!(read_control(&mut peer).await, ControlPacket::CallDisconnect { status: None });
        packets.send(ControlPacket::CallDisconnectAck).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_abort_is_answered() {
        let Harness { call, mut peer, packets, mut inbox, .. } = harness(ClientConfig::new("vpn", "u", "p"));
        let (_commands_tx, commands_rx) = mpsc::channel(4);
        let task = tokio::spawn(call.run(commands_rx));
        read_control(&mut peer).await;
        packets.send(ack(HashProtocol::BIT_SHA1)).await.unwrap();
        inbox.recv().await.unwrap();

        packets
            .send(ControlPacket::CallAbort {
                status: Some(StatusInfo::new(0, StatusInfo::NEGOTIATION_TIMEOUT)),
            })
            .await
            .unwrap();
        assert_eq!(read_control(&mut peer).await, ControlPacket::CallAbort { status: None });
        match inbox.recv().await.unwrap().outcome {
            crate::types::Outcome::Failed(Failure::AbortRequested(Some(text))) => {
                assert!(text.contains("negotiation timeout"))
            }
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap();
    }
}
