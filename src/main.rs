use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use sstp_client::log::init_logging;
use sstp_client::terminal::tls::RustlsDialer;
use sstp_client::{ClientConfig, SessionStatus, SstpClient};

#[cfg(unix)]
fn terminal_factory(
    config: &ClientConfig,
    server: Option<std::net::IpAddr>,
) -> anyhow::Result<Arc<dyn sstp_client::IpTerminalFactory>> {
    use sstp_client::terminal::tun::TunFactory;
    Ok(Arc::new(TunFactory::new(config.default_route, server)))
}

#[cfg(not(unix))]
fn terminal_factory(
    _config: &ClientConfig,
    _server: Option<std::net::IpAddr>,
) -> anyhow::Result<Arc<dyn sstp_client::IpTerminalFactory>> {
    bail!("no IP terminal available on this platform")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    init_logging(args.iter().any(|a| a == "-v" || a == "--verbose"));

    let mut config = ClientConfig::from_args(args.iter().cloned())
        .context("invalid arguments or environment")?;
    if args.iter().any(|a| a == "--default-route") {
        config.default_route = true;
    }

    let server = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("cannot resolve {}", config.host))?
        .next()
        .map(|addr| addr.ip());
    if server.is_none() {
        bail!("{} has no address", config.host);
    }
    info!("connecting to {}:{} ({:?})", config.host, config.port, server);

    let factory = terminal_factory(&config, server)?;
    let session = SstpClient::start(config, Arc::new(RustlsDialer), factory)
        .context("cannot start session")?;

    let mut status = session.status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for Ctrl-C")?;
            info!("Ctrl-C, disconnecting");
            session.disconnect();
        }
        _ = status.wait_for(|s| *s == SessionStatus::Disconnected) => {}
    }
    session.wait().await?;
    Ok(())
}
