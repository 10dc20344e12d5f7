use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Failure;

/// Session phase, used to label control messages and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Ssl,
    Sstp,
    Lcp,
    Pap,
    Chap,
    Eap,
    Ipcp,
    Ipv6cp,
    Incoming,
    Outgoing,
    SstpEcho,
    PppEcho,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Ssl => "SSL",
            Phase::Sstp => "SSTP",
            Phase::Lcp => "LCP",
            Phase::Pap => "PAP",
            Phase::Chap => "MSCHAPv2",
            Phase::Eap => "EAP",
            Phase::Ipcp => "IPCP",
            Phase::Ipv6cp => "IPv6CP",
            Phase::Incoming => "INCOMING",
            Phase::Outgoing => "OUTGOING",
            Phase::SstpEcho => "SSTP ECHO",
            Phase::PppEcho => "PPP ECHO",
        };
        f.write_str(name)
    }
}

/// Authentication method negotiated through the LCP Auth-Protocol option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthSuite {
    Pap,
    MsChapV2,
    EapMsChapV2,
}

impl AuthSuite {
    pub fn phase(&self) -> Phase {
        match self {
            AuthSuite::Pap => Phase::Pap,
            AuthSuite::MsChapV2 => Phase::Chap,
            AuthSuite::EapMsChapV2 => Phase::Eap,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pap" => Some(AuthSuite::Pap),
            "mschapv2" | "ms-chapv2" | "chap" => Some(AuthSuite::MsChapV2),
            "eap" | "eap-mschapv2" => Some(AuthSuite::EapMsChapV2),
            _ => None,
        }
    }
}

impl fmt::Display for AuthSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthSuite::Pap => f.write_str("PAP"),
            AuthSuite::MsChapV2 => f.write_str("MS-CHAPv2"),
            AuthSuite::EapMsChapV2 => f.write_str("EAP-MSCHAPv2"),
        }
    }
}

/// Hash used for SSTP crypto binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashProtocol {
    Sha1,
    Sha256,
}

impl HashProtocol {
    pub const BIT_SHA1: u8 = 0x01;
    pub const BIT_SHA256: u8 = 0x02;

    pub fn bit(&self) -> u8 {
        match self {
            HashProtocol::Sha1 => Self::BIT_SHA1,
            HashProtocol::Sha256 => Self::BIT_SHA256,
        }
    }

    /// Pick from the server's bitmask, SHA-256 first.
    pub fn choose(bitmask: u8) -> Option<Self> {
        if bitmask & Self::BIT_SHA256 != 0 {
            Some(HashProtocol::Sha256)
        } else if bitmask & Self::BIT_SHA1 != 0 {
            Some(HashProtocol::Sha1)
        } else {
            None
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashProtocol::Sha1 => 20,
            HashProtocol::Sha256 => 32,
        }
    }
}

/// Terminal outcome of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Proceeded,
    Failed(Failure),
}

/// What a phase task tells the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub phase: Phase,
    pub outcome: Outcome,
}

impl ControlMessage {
    pub fn proceeded(phase: Phase) -> Self {
        Self {
            phase,
            outcome: Outcome::Proceeded,
        }
    }

    pub fn failed(phase: Phase, failure: Failure) -> Self {
        Self {
            phase,
            outcome: Outcome::Failed(failure),
        }
    }
}

/// Addresses handed to the IP terminal once the network phases open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv4_dns: Vec<Ipv4Addr>,
    pub ipv6_link_local: Option<Ipv6Addr>,
}

/// Published session status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected(NetworkAddresses),
    Reconnecting(u32),
    Disconnected,
}
