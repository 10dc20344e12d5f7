//! Session orchestration.
//!
//! Sequences SSL connect, the SSTP request, LCP, authentication,
//! Call-Connected, IPCP/IPv6CP and the data plane, then waits for the first
//! failure. Only this module decides between tearing down for good and
//! scheduling a reconnect.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth;
use crate::call::{CallCommand, CallControl};
use crate::config::ClientConfig;
use crate::demux::{IncomingDemux, Registry};
use crate::error::{Error, Failure, Result};
use crate::mux::{run_downlink, OutgoingMux};
use crate::negotiation::{IpcpNegotiator, Ipv6cpNegotiator, LcpNegotiator, NegotiationSession};
use crate::session::{
    NetworkSetting, SessionContext, SettingWriters, SslSender, TrafficSnapshot, TrafficStats,
};
use crate::terminal::{BoxedReader, IpTerminal, IpTerminalFactory, SslDialer};
use crate::types::{ControlMessage, Outcome, Phase, SessionStatus};

/// Bound on the call task's disconnect or abort sequence.
const TEARDOWN_WAIT: Duration = Duration::from_secs(6);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

pub struct SstpClient;

impl SstpClient {
    /// Validate `config` and start the session in the background.
    pub fn start(
        config: ClientConfig,
        dialer: Arc<dyn SslDialer>,
        factory: Arc<dyn IpTerminalFactory>,
    ) -> Result<SessionHandle> {
        config.validate()?;
        let user = CancellationToken::new();
        let (status_tx, status) = watch::channel(SessionStatus::Connecting);
        let stats = Arc::new(TrafficStats::default());
        let runner = Runner {
            config: Arc::new(config),
            dialer,
            factory,
            user: user.clone(),
            status: status_tx,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(runner.run());
        Ok(SessionHandle {
            user,
            status,
            stats,
            task,
        })
    }
}

/// Control over a running session.
pub struct SessionHandle {
    user: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    stats: Arc<TrafficStats>,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    /// Ask for a graceful disconnect; [`wait`](Self::wait) for completion.
    pub fn disconnect(&self) {
        self.user.cancel();
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the session to end. `Ok` after a user disconnect.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Io(std::io::Error::other(e.to_string()))),
        }
    }
}

struct Runner {
    config: Arc<ClientConfig>,
    dialer: Arc<dyn SslDialer>,
    factory: Arc<dyn IpTerminalFactory>,
    user: CancellationToken,
    status: watch::Sender<SessionStatus>,
    stats: Arc<TrafficStats>,
}

impl Runner {
    async fn run(self) -> Result<()> {
        let policy = &self.config.reconnect;
        let mut attempt = 0u32;
        loop {
            let mut connected = false;
            let result = self.session(&mut connected).await;
            if connected {
                attempt = 0;
            }
            let err = match result {
                Ok(()) => {
                    info!("disconnected");
                    self.status.send_replace(SessionStatus::Disconnected);
                    return Ok(());
                }
                Err(err) => err,
            };
            error!("session ended: {}", err);

            if self.user.is_cancelled()
                || !policy.enabled
                || !err.is_retriable()
                || attempt >= policy.attempts
            {
                self.status.send_replace(SessionStatus::Disconnected);
                return Err(err);
            }
            attempt += 1;
            info!(
                "reconnecting in {:?} ({}/{})",
                policy.interval, attempt, policy.attempts
            );
            self.status.send_replace(SessionStatus::Reconnecting(attempt));
            tokio::select! {
                _ = self.user.cancelled() => {
                    self.status.send_replace(SessionStatus::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    async fn session(&self, connected: &mut bool) -> Result<()> {
        let connection = tokio::select! {
            _ = self.user.cancelled() => return Ok(()),
            connection = self.dialer.connect(&self.config) => connection?,
        };
        info!("{} connected ({})", Phase::Ssl, connection.diagnostics);

        let (setting, writers) = NetworkSetting::new(
            Arc::clone(&self.config),
            connection.correlation_id,
            connection.peer_certificate,
        );
        let (mut ctx, inbox) = SessionContext::new(
            setting,
            SslSender::new(connection.writer),
            CancellationToken::new(),
        );
        ctx.stats = Arc::clone(&self.stats);

        let mut session = Session::new(ctx, inbox, self.user.clone(), connection.reader);
        let result = session
            .drive(&*self.factory, writers, &self.status, connected)
            .await;
        session.teardown(&result).await;

        match result {
            Err(Error::Session {
                failure: Failure::UserDisconnect,
                ..
            }) => Ok(()),
            other => other,
        }
    }
}

/// Await `work`, giving up on the phase timeout, a failure reported by
/// another task, or a user disconnect.
async fn guard<T>(
    inbox: &mut mpsc::Receiver<ControlMessage>,
    user: &CancellationToken,
    phase: Phase,
    limit: Duration,
    work: impl Future<Output = std::result::Result<T, Failure>>,
) -> Result<T> {
    tokio::pin!(work);
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            result = &mut work => return result.map_err(|f| Error::session(phase, f)),
            _ = &mut deadline => return Err(Error::session(phase, Failure::Timeout)),
            _ = user.cancelled() => return Err(Error::session(phase, Failure::UserDisconnect)),
            message = inbox.recv() => match message {
                Some(ControlMessage { phase: from, outcome: Outcome::Failed(failure) }) => {
                    return Err(Error::session(from, failure));
                }
                Some(other) => debug!("{}: ignoring {:?}", phase, other),
                None => return Err(Error::session(phase, Failure::LinkClosed)),
            },
        }
    }
}

/// Wait for `phase` to report success on the control channel.
async fn await_proceeded(
    inbox: &mut mpsc::Receiver<ControlMessage>,
    phase: Phase,
) -> std::result::Result<(), Failure> {
    while let Some(message) = inbox.recv().await {
        match message.outcome {
            Outcome::Proceeded if message.phase == phase => return Ok(()),
            Outcome::Proceeded => debug!("ignoring {} success", message.phase),
            Outcome::Failed(failure) => return Err(failure),
        }
    }
    Err(Failure::LinkClosed)
}

async fn join<T>(
    task: JoinHandle<std::result::Result<T, Failure>>,
) -> std::result::Result<T, Failure> {
    task.await
        .map_err(|e| Failure::Transport(format!("phase task: {}", e)))?
}

/// Aborts the tasks behind its handles when dropped. Finished tasks are
/// unaffected.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

struct Session {
    ctx: SessionContext,
    registry: Arc<Registry>,
    inbox: mpsc::Receiver<ControlMessage>,
    user: CancellationToken,
    demux: Option<JoinHandle<()>>,
    call: Option<(mpsc::Sender<CallCommand>, JoinHandle<()>)>,
    terminal: Option<Arc<dyn IpTerminal>>,
}

impl Session {
    fn new(
        ctx: SessionContext,
        inbox: mpsc::Receiver<ControlMessage>,
        user: CancellationToken,
        reader: BoxedReader,
    ) -> Self {
        let registry = Arc::new(Registry::default());
        let demux =
            tokio::spawn(IncomingDemux::new(ctx.clone(), Arc::clone(&registry)).run(reader));
        Self {
            ctx,
            registry,
            inbox,
            user,
            demux: Some(demux),
            call: None,
            terminal: None,
        }
    }

    async fn drive(
        &mut self,
        factory: &dyn IpTerminalFactory,
        writers: SettingWriters,
        status: &watch::Sender<SessionStatus>,
        connected: &mut bool,
    ) -> Result<()> {
        let SettingWriters {
            link: link_writer,
            binding,
            auth: auth_writer,
            ipv4: ipv4_writer,
            ipv6: ipv6_writer,
        } = writers;

        let (commands, commands_rx) = mpsc::channel(4);
        let call = CallControl::new(
            self.ctx.clone(),
            Arc::clone(&self.registry),
            self.registry.sstp.register(),
            binding,
        );
        self.call = Some((commands.clone(), tokio::spawn(call.run(commands_rx))));

        let config = Arc::clone(&self.ctx.setting.config);
        let ppp = &config.ppp;

        // The call task reports the outcome itself; this is only a backstop.
        let sstp_limit = config.sstp.negotiation_timeout + Duration::from_secs(1);
        let user = self.user.clone();
        match tokio::select! {
            result = tokio::time::timeout(
                sstp_limit,
                await_proceeded(&mut self.inbox, Phase::Sstp),
            ) => result,
            _ = user.cancelled() => Ok(Err(Failure::UserDisconnect)),
        } {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => return Err(Error::session(Phase::Sstp, failure)),
            Err(_) => return Err(Error::session(Phase::Sstp, Failure::Timeout)),
        }

        let mut lcp_mailbox = self.registry.lcp.register();
        let lcp = guard(
            &mut self.inbox,
            &self.user,
            Phase::Lcp,
            ppp.phase_timeout,
            NegotiationSession::new(LcpNegotiator::new(ppp), &self.ctx, &mut lcp_mailbox).run(),
        )
        .await?;
        self.registry.lcp.unregister();
        let link = lcp.result().map_err(|f| Error::session(Phase::Lcp, f))?;
        info!("link MRU {} MTU {}, authenticating with {}", link.mru, link.mtu, link.auth);
        let suite = link.auth;
        link_writer.set(link);
        self.registry.enable_ppp_echo();

        let phase = suite.phase();
        let result = guard(
            &mut self.inbox,
            &self.user,
            phase,
            ppp.phase_timeout,
            auth::authenticate(suite, &self.ctx, &self.registry),
        )
        .await?;
        auth_writer.set(result);

        let (reply, connected_reply) = oneshot::channel();
        commands
            .send(CallCommand::Connect(reply))
            .await
            .map_err(|_| Error::session(Phase::Sstp, Failure::LinkClosed))?;
        guard(&mut self.inbox, &self.user, Phase::Sstp, ppp.phase_timeout, async {
            connected_reply.await.unwrap_or(Err(Failure::LinkClosed))
        })
        .await?;

        // Both network phases start together; their results are taken in order.
        let ipcp = ppp.ipv4.then(|| {
            let ctx = self.ctx.clone();
            let mut mailbox = self.registry.ipcp.register();
            tokio::spawn(async move {
                let negotiator = IpcpNegotiator::new(&ctx.config().ppp);
                NegotiationSession::new(negotiator, &ctx, &mut mailbox)
                    .run()
                    .await
                    .map(|n| n.result())
            })
        });
        let ipv6cp = ppp.ipv6.then(|| {
            let ctx = self.ctx.clone();
            let mut mailbox = self.registry.ipv6cp.register();
            tokio::spawn(async move {
                NegotiationSession::new(Ipv6cpNegotiator::new(), &ctx, &mut mailbox)
                    .run()
                    .await
                    .map(|n| n.result())
            })
        });
        // Whichever wait fails first takes the other network phase down too.
        let _network = AbortOnDrop(
            ipcp.iter()
                .map(JoinHandle::abort_handle)
                .chain(ipv6cp.iter().map(JoinHandle::abort_handle))
                .collect(),
        );

        if let Some(task) = ipcp {
            let limit = ppp.phase_timeout;
            let setting = guard(&mut self.inbox, &self.user, Phase::Ipcp, limit, join(task)).await?;
            ipv4_writer.set(setting);
        }
        if let Some(task) = ipv6cp {
            let limit = ppp.phase_timeout;
            let setting =
                guard(&mut self.inbox, &self.user, Phase::Ipv6cp, limit, join(task)).await?;
            info!("IPv6 link-local {}", setting.link_local());
            ipv6_writer.set(setting);
        }

        let addresses = self.ctx.setting.addresses();
        let terminal = factory.establish(self.ctx.setting.mtu(), &addresses).await?;
        self.terminal = Some(Arc::clone(&terminal));
        let ip_mailbox = self.registry.ip.register();
        tokio::spawn(run_downlink(self.ctx.clone(), Arc::clone(&terminal), ip_mailbox));
        tokio::spawn(OutgoingMux::new(self.ctx.clone(), terminal).run());

        info!("connected: {:?}", addresses);
        *connected = true;
        status.send_replace(SessionStatus::Connected(addresses));

        tokio::select! {
            _ = self.user.cancelled() => Ok(()),
            failure = wait_failure(&mut self.inbox) => Err(failure),
        }
    }

    async fn teardown(&mut self, result: &Result<()>) {
        let command = match result {
            Ok(()) => Some(CallCommand::Disconnect),
            Err(Error::Session { failure, .. }) => match failure {
                Failure::UserDisconnect => Some(CallCommand::Disconnect),
                Failure::DisconnectRequested(_) | Failure::AbortRequested(_) => None,
                _ => Some(CallCommand::Abort),
            },
            Err(_) => Some(CallCommand::Abort),
        };
        if let Some((commands, call)) = self.call.take() {
            if let Some(command) = command {
                debug!("call teardown: {:?}", command);
                let _ = commands.send(command).await;
            }
            if tokio::time::timeout(TEARDOWN_WAIT, call).await.is_err() {
                debug!("call teardown did not finish");
            }
        }

        self.ctx.cancel.cancel();
        self.registry.close_all();
        if let Some(terminal) = self.terminal.take() {
            terminal.close().await;
        }
        let _ = tokio::time::timeout(SHUTDOWN_WAIT, self.ctx.sender.shutdown()).await;
        if let Some(demux) = self.demux.take() {
            if tokio::time::timeout(SHUTDOWN_WAIT, demux).await.is_err() {
                debug!("incoming demultiplexer did not stop in time");
            }
        }
    }
}

async fn wait_failure(inbox: &mut mpsc::Receiver<ControlMessage>) -> Error {
    loop {
        match inbox.recv().await {
            Some(ControlMessage {
                phase,
                outcome: Outcome::Failed(failure),
            }) => return Error::session(phase, failure),
            Some(other) => debug!("ignoring {:?}", other),
            None => return Error::session(Phase::Incoming, Failure::LinkClosed),
        }
    }
}
