//! SSTP VPN client: SSL-encapsulated PPP with LCP, PAP/MS-CHAPv2/EAP
//! authentication, IPCP/IPv6CP and SSTP crypto binding.

pub mod auth;
pub mod call;
pub mod client;
pub mod config;
pub mod crypto;
pub mod demux;
pub mod error;
pub mod log;
pub mod mux;
pub mod negotiation;
pub mod session;
pub mod terminal;
pub mod types;
pub mod unit;

pub use client::{SessionHandle, SstpClient};
pub use config::ClientConfig;
pub use error::{Error, Failure, ParseError, Result};
pub use session::TrafficSnapshot;
pub use terminal::{IpTerminal, IpTerminalFactory, SslConnection, SslDialer};
pub use types::{AuthSuite, NetworkAddresses, Phase, SessionStatus};
