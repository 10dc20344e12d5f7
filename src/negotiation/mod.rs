//! Configure-Request/Ack/Nak/Reject convergence shared by LCP, IPCP and
//! IPv6CP.
//!
//! A [`Negotiator`] supplies the protocol-specific parts: what we ask for,
//! how we judge the peer's request, and how a Nak or Reject changes our next
//! request. [`NegotiationSession`] drives the exchange until both directions
//! are acknowledged.

pub mod ipcp;
pub mod ipv6cp;
pub mod lcp;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::error::Failure;
use crate::log::{log_options_received, log_options_sent};
use crate::session::SessionContext;
use crate::types::Phase;
use crate::unit::{ConfigureCode, ConfigureFrame, ControlFrame, OptionKind, OptionPack};

pub use ipcp::IpcpNegotiator;
pub use ipv6cp::Ipv6cpNegotiator;
pub use lcp::LcpNegotiator;

/// Answer to a peer Configure-Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<O> {
    Ack,
    /// Options with the values we would accept instead.
    Nak(Vec<O>),
    /// Known options we refuse to negotiate at all.
    Reject(Vec<O>),
}

/// Protocol-specific half of a negotiation.
pub trait Negotiator: Send {
    type Option: OptionKind + Send + 'static;

    const PHASE: Phase;

    /// Options for our next Configure-Request.
    fn build_request(&self) -> OptionPack<Self::Option>;

    /// Judge a peer request that carries no unknown options. A verdict of
    /// `Ack` commits the peer's values.
    fn inspect_request(
        &mut self,
        options: &OptionPack<Self::Option>,
    ) -> Result<Verdict<Self::Option>, Failure>;

    /// Our request was acknowledged as sent.
    fn apply_ack(&mut self, _options: &OptionPack<Self::Option>) -> Result<(), Failure> {
        Ok(())
    }

    /// Adopt the values the peer suggested.
    fn apply_nak(&mut self, options: &OptionPack<Self::Option>) -> Result<(), Failure>;

    /// Stop asking for rejected options, or fail if one is mandatory.
    /// Rejects of options already dropped are ignored.
    fn apply_reject(&mut self, options: &OptionPack<Self::Option>) -> Result<(), Failure>;
}

/// Drives one negotiation to the opened state.
pub struct NegotiationSession<'a, N: Negotiator> {
    negotiator: N,
    ctx: &'a SessionContext,
    mailbox: &'a mut mpsc::Receiver<ControlFrame<N::Option>>,
    request_id: u8,
    last_request: OptionPack<N::Option>,
    /// The peer acknowledged our request.
    local_ready: bool,
    /// We acknowledged the peer's request.
    remote_ready: bool,
    requests_sent: u32,
    deadline: Instant,
}

impl<'a, N: Negotiator> NegotiationSession<'a, N> {
    pub fn new(
        negotiator: N,
        ctx: &'a SessionContext,
        mailbox: &'a mut mpsc::Receiver<ControlFrame<N::Option>>,
    ) -> Self {
        Self {
            negotiator,
            ctx,
            mailbox,
            request_id: 0,
            last_request: OptionPack::default(),
            local_ready: false,
            remote_ready: false,
            requests_sent: 0,
            deadline: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.local_ready && self.remote_ready
    }

    /// Negotiate until open, handing back the negotiator with its settled
    /// state.
    pub async fn run(mut self) -> Result<N, Failure> {
        self.send_request().await?;
        while !self.is_open() {
            tokio::select! {
                _ = sleep_until(self.deadline) => {
                    debug!("{} Configure-Request #{} timed out", N::PHASE, self.request_id);
                    self.local_ready = false;
                    self.send_request().await?;
                }
                frame = self.mailbox.recv() => match frame {
                    Some(frame) => self.handle(frame).await?,
                    None => return Err(Failure::LinkClosed),
                },
            }
        }
        info!("{} opened", N::PHASE);
        Ok(self.negotiator)
    }

    async fn send_request(&mut self) -> Result<(), Failure> {
        if self.requests_sent >= self.ctx.config().ppp.max_configure {
            return Err(Failure::CountExhausted);
        }
        self.requests_sent += 1;
        self.request_id = self.ctx.ids.next();
        self.last_request = self.negotiator.build_request();
        self.deadline = Instant::now() + self.ctx.config().ppp.restart_interval;
        let options = self.last_request.clone();
        self.send(ConfigureCode::Request, self.request_id, options).await
    }

    async fn send(
        &self,
        code: ConfigureCode,
        id: u8,
        options: OptionPack<N::Option>,
    ) -> Result<(), Failure> {
        log_options_sent(N::PHASE, code, id, &options);
        let frame = ControlFrame::Configure(ConfigureFrame::new(code, id, options));
        self.ctx.sender.send_unit(&frame).await?;
        Ok(())
    }

    async fn handle(&mut self, frame: ControlFrame<N::Option>) -> Result<(), Failure> {
        match frame {
            ControlFrame::Configure(ConfigureFrame { code, id, options }) => {
                log_options_received(N::PHASE, code, id, &options);
                match code {
                    ConfigureCode::Request => self.on_request(id, options).await,
                    ConfigureCode::Ack => self.on_ack(id, options).await,
                    ConfigureCode::Nak | ConfigureCode::Reject => {
                        if id != self.request_id {
                            debug!("{} ignoring stale {:?} #{}", N::PHASE, code, id);
                            return Ok(());
                        }
                        if code == ConfigureCode::Nak {
                            self.negotiator.apply_nak(&options)?;
                        } else {
                            self.negotiator.apply_reject(&options)?;
                        }
                        self.local_ready = false;
                        self.send_request().await
                    }
                }
            }
            ControlFrame::TerminateRequest { id, .. } => {
                let ack = ControlFrame::<N::Option>::TerminateAck { id, data: Vec::new() };
                self.ctx.sender.send_unit(&ack).await?;
                Err(Failure::TerminateRequested)
            }
            ControlFrame::CodeReject { rejected, .. } => Err(Failure::CodeRejected(
                rejected.first().copied().unwrap_or_default(),
            )),
            other => {
                debug!("{} ignoring code {} during negotiation", N::PHASE, other.code());
                Ok(())
            }
        }
    }

    async fn on_request(&mut self, id: u8, options: OptionPack<N::Option>) -> Result<(), Failure> {
        if options.has_unknown() {
            self.remote_ready = false;
            let unknown = OptionPack::new(options.unknown());
            return self.send(ConfigureCode::Reject, id, unknown).await;
        }
        match self.negotiator.inspect_request(&options)? {
            Verdict::Ack => {
                self.send(ConfigureCode::Ack, id, options).await?;
                self.remote_ready = true;
            }
            Verdict::Nak(suggested) => {
                self.remote_ready = false;
                self.send(ConfigureCode::Nak, id, OptionPack::new(suggested))
                    .await?;
            }
            Verdict::Reject(refused) => {
                self.remote_ready = false;
                self.send(ConfigureCode::Reject, id, OptionPack::new(refused))
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_ack(&mut self, id: u8, options: OptionPack<N::Option>) -> Result<(), Failure> {
        if id != self.request_id {
            debug!("{} ignoring Configure-Ack #{} (expected #{})", N::PHASE, id, self.request_id);
            return Ok(());
        }
        if self.local_ready {
            // Late duplicate: start over with a fresh request.
            self.local_ready = false;
            return self.send_request().await;
        }
        if options != self.last_request {
            debug!("{} Configure-Ack #{} does not match our request", N::PHASE, id);
            return Ok(());
        }
        self.negotiator.apply_ack(&options)?;
        self.local_ready = true;
        Ok(())
    }
}
