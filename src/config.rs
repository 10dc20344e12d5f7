//! Client configuration and its loading from the environment or the command
//! line.

use std::env;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{Error, Result};
use crate::types::AuthSuite;
use crate::unit::ppp::PPP_CONTROL_OFFSET;

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_MRU: u16 = 1500;
pub const DEFAULT_MTU: u16 = 1500;
/// Smallest MTU an IPv4 link may have.
pub const MIN_MTU: u16 = 68;
/// Largest MRU/MTU that fits a 12-bit SSTP length after the headers.
pub const MAX_MTU: u16 = (0x0FFF - PPP_CONTROL_OFFSET) as u16;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the server certificate is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificatePolicy {
    /// Standard chain validation against the bundled web PKI roots.
    WebPki,
    /// Accept exactly the certificate whose DER SHA-256 matches.
    Pinned([u8; 32]),
    /// Accept anything. Testing only.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub policy: CertificatePolicy,
    /// Name sent as SNI and checked against the certificate; defaults to the host.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PppOptions {
    pub mru: u16,
    pub mtu: u16,
    /// Acceptable suites in preference order.
    pub auth_suites: Vec<AuthSuite>,
    pub ipv4: bool,
    pub ipv6: bool,
    pub request_dns: bool,
    /// Address proposed in IPCP instead of 0.0.0.0.
    pub static_ipv4: Option<Ipv4Addr>,
    pub restart_interval: Duration,
    pub max_configure: u32,
    pub phase_timeout: Duration,
    pub echo_interval: Duration,
}

impl Default for PppOptions {
    fn default() -> Self {
        Self {
            mru: DEFAULT_MRU,
            mtu: DEFAULT_MTU,
            auth_suites: vec![AuthSuite::MsChapV2, AuthSuite::EapMsChapV2, AuthSuite::Pap],
            ipv4: true,
            ipv6: false,
            request_dns: true,
            static_ipv4: None,
            restart_interval: Duration::from_secs(3),
            max_configure: 10,
            phase_timeout: Duration::from_secs(20),
            echo_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SstpOptions {
    pub negotiation_timeout: Duration,
    pub connect_retries: u32,
    pub echo_interval: Duration,
}

impl Default for SstpOptions {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(60),
            connect_retries: 3,
            echo_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            attempts: 3,
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tls: TlsOptions,
    pub ppp: PppOptions,
    pub sstp: SstpOptions,
    pub reconnect: ReconnectPolicy,
    /// Route all traffic through the tunnel once it is up.
    pub default_route: bool,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            credentials: Credentials {
                username: username.into(),
                password: password.into(),
            },
            tls: TlsOptions {
                policy: CertificatePolicy::WebPki,
                server_name: None,
            },
            ppp: PppOptions::default(),
            sstp: SstpOptions::default(),
            reconnect: ReconnectPolicy::default(),
            default_route: false,
        }
    }

    /// Build from `useEnv` or `useInline <server> <user> <password> [fingerprint]`.
    ///
    /// Flags (arguments starting with `-`) are skipped.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let args: Vec<String> = args
            .into_iter()
            .skip(1)
            .filter(|a| !a.starts_with('-'))
            .collect();
        let config = match args.as_slice() {
            [mode] if mode == "useEnv" => {
                // A missing .env file is fine: the variables may already be set.
                let _ = dotenv();
                Self::from_env()?
            }
            [mode, server, user, password] if mode == "useInline" => {
                Self::new(server.clone(), user.clone(), password.clone())
            }
            [mode, server, user, password, fingerprint] if mode == "useInline" => {
                let mut config = Self::new(server.clone(), user.clone(), password.clone());
                config.tls.policy = CertificatePolicy::Pinned(parse_sha256_hex(fingerprint)?);
                config
            }
            _ => {
                return Err(Error::config(
                    "Please either use 'useEnv' with environment variables or \
                     'useInline <server> <user> <password> [sha256 fingerprint]'",
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Read `SSTP_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::config(format!("{key} is not set")))
        };
        let mut config = Self::new(
            required("SSTP_SERVER")?,
            required("SSTP_USER")?,
            required("SSTP_PASSWORD")?,
        );

        if let Some(fingerprint) = lookup("SERVER_CERT_FINGERPRINT").filter(|v| !v.is_empty()) {
            config.tls.policy = CertificatePolicy::Pinned(parse_sha256_hex(&fingerprint)?);
        }
        if let Some(port) = parse_var(&lookup, "SSTP_PORT")? {
            config.port = port;
        }
        if let Some(auth) = lookup("SSTP_AUTH") {
            config.ppp.auth_suites = parse_auth_list(&auth)?;
        }
        if let Some(mru) = parse_var(&lookup, "SSTP_MRU")? {
            config.ppp.mru = mru;
        }
        if let Some(mtu) = parse_var(&lookup, "SSTP_MTU")? {
            config.ppp.mtu = mtu;
        }
        if let Some(ipv4) = parse_bool_var(&lookup, "SSTP_IPV4")? {
            config.ppp.ipv4 = ipv4;
        }
        if let Some(ipv6) = parse_bool_var(&lookup, "SSTP_IPV6")? {
            config.ppp.ipv6 = ipv6;
        }
        if let Some(addr) = parse_var(&lookup, "SSTP_STATIC_IPV4")? {
            config.ppp.static_ipv4 = Some(addr);
        }
        if let Some(enabled) = parse_bool_var(&lookup, "SSTP_RECONNECT")? {
            config.reconnect.enabled = enabled;
        }
        if let Some(attempts) = parse_var(&lookup, "SSTP_RECONNECT_ATTEMPTS")? {
            config.reconnect.attempts = attempts;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SSTP_RECONNECT_INTERVAL")? {
            config.reconnect.interval = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("server host is empty"));
        }
        if self.credentials.username.is_empty() || self.credentials.password.is_empty() {
            return Err(Error::config("username and password are required"));
        }
        if self.ppp.auth_suites.is_empty() {
            return Err(Error::config("at least one authentication suite is required"));
        }
        for (name, value) in [("MRU", self.ppp.mru), ("MTU", self.ppp.mtu)] {
            if !(MIN_MTU..=MAX_MTU).contains(&value) {
                return Err(Error::config(format!(
                    "{name} {value} outside {MIN_MTU}..={MAX_MTU}"
                )));
            }
        }
        if !self.ppp.ipv4 && !self.ppp.ipv6 {
            return Err(Error::config("IPv4 and IPv6 are both disabled"));
        }
        if self.ppp.max_configure == 0 || self.sstp.connect_retries == 0 {
            return Err(Error::config("retry counts must be at least 1"));
        }
        Ok(())
    }

    /// Name used for SNI and the `Host` header.
    pub fn server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{key}: cannot parse '{raw}'"))),
    }
}

fn parse_bool_var<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::config(format!("{key}: expected a boolean, got '{v}'"))),
        },
    }
}

/// Comma-separated suite names, e.g. `mschapv2,pap`.
pub fn parse_auth_list(list: &str) -> Result<Vec<AuthSuite>> {
    let mut suites = Vec::new();
    for name in list.split(',').filter(|s| !s.trim().is_empty()) {
        let suite = AuthSuite::parse(name)
            .ok_or_else(|| Error::config(format!("unknown authentication suite '{name}'")))?;
        if !suites.contains(&suite) {
            suites.push(suite);
        }
    }
    Ok(suites)
}

/// Parse a SHA-256 fingerprint, tolerating `:` and space separators.
pub fn parse_sha256_hex(s: &str) -> Result<[u8; 32]> {
    let clean = s.replace([':', ' '], "").to_lowercase();
    let bytes =
        hex::decode(clean).map_err(|e| Error::config(format!("invalid fingerprint: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::config("Invalid SHA256 length (expected 32 bytes)"))
}
