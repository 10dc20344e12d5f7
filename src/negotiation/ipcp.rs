//! IPCP: our IPv4 address and, optionally, DNS servers.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use super::{Negotiator, Verdict};
use crate::config::PppOptions;
use crate::error::Failure;
use crate::session::Ipv4Setting;
use crate::types::Phase;
use crate::unit::option::{IPCP_OPT_ADDRESS, IPCP_OPT_PRIMARY_DNS, IPCP_OPT_SECONDARY_DNS};
use crate::unit::{IpcpOption, OptionPack};

#[derive(Debug)]
pub struct IpcpNegotiator {
    address: Ipv4Addr,
    /// Set when the address was configured and must not be replaced.
    fixed: bool,
    /// `None` when not requested or rejected by the peer.
    primary_dns: Option<Ipv4Addr>,
    secondary_dns: Option<Ipv4Addr>,
}

impl IpcpNegotiator {
    pub fn new(ppp: &PppOptions) -> Self {
        let dns = ppp.request_dns.then_some(Ipv4Addr::UNSPECIFIED);
        Self {
            address: ppp.static_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            fixed: ppp.static_ipv4.is_some(),
            primary_dns: dns,
            secondary_dns: dns,
        }
    }

    pub fn result(&self) -> Ipv4Setting {
        let dns = [self.primary_dns, self.secondary_dns]
            .into_iter()
            .flatten()
            .filter(|addr| !addr.is_unspecified())
            .collect();
        Ipv4Setting {
            address: self.address,
            dns,
        }
    }
}

impl Negotiator for IpcpNegotiator {
    type Option = IpcpOption;

    const PHASE: Phase = Phase::Ipcp;

    fn build_request(&self) -> OptionPack<IpcpOption> {
        let mut pack = OptionPack::new(vec![IpcpOption::Address(self.address)]);
        if let Some(dns) = self.primary_dns {
            pack.push(IpcpOption::PrimaryDns(dns));
        }
        if let Some(dns) = self.secondary_dns {
            pack.push(IpcpOption::SecondaryDns(dns));
        }
        pack
    }

    fn inspect_request(&mut self, options: &OptionPack<IpcpOption>) -> Result<Verdict<IpcpOption>, Failure> {
        // DNS options describe what the sender wants to learn; we serve none.
        let refused: Vec<IpcpOption> = options
            .iter()
            .filter(|o| matches!(o, IpcpOption::PrimaryDns(_) | IpcpOption::SecondaryDns(_)))
            .cloned()
            .collect();
        if !refused.is_empty() {
            return Ok(Verdict::Reject(refused));
        }
        if let Some(peer) = options.address() {
            debug!("peer IPv4 address {}", peer);
        }
        Ok(Verdict::Ack)
    }

    fn apply_ack(&mut self, _options: &OptionPack<IpcpOption>) -> Result<(), Failure> {
        if self.address.is_unspecified() {
            return Err(Failure::OptionUnacceptable(
                IPCP_OPT_ADDRESS,
                "peer acknowledged 0.0.0.0".into(),
            ));
        }
        info!("IPv4 address {}", self.address);
        Ok(())
    }

    fn apply_nak(&mut self, options: &OptionPack<IpcpOption>) -> Result<(), Failure> {
        if let Some(address) = options.address() {
            if self.fixed && address != self.address {
                return Err(Failure::OptionUnacceptable(
                    IPCP_OPT_ADDRESS,
                    format!("peer wants {} instead of static {}", address, self.address),
                ));
            }
            self.address = address;
        }
        if let (Some(dns), Some(_)) = (options.primary_dns(), self.primary_dns) {
            self.primary_dns = Some(dns);
        }
        if let (Some(dns), Some(_)) = (options.secondary_dns(), self.secondary_dns) {
            self.secondary_dns = Some(dns);
        }
        Ok(())
    }

    fn apply_reject(&mut self, options: &OptionPack<IpcpOption>) -> Result<(), Failure> {
        if options.contains_type(IPCP_OPT_ADDRESS) {
            return Err(Failure::OptionRejected(IPCP_OPT_ADDRESS));
        }
        if options.contains_type(IPCP_OPT_PRIMARY_DNS) {
            self.primary_dns = None;
        }
        if options.contains_type(IPCP_OPT_SECONDARY_DNS) {
            self.secondary_dns = None;
        }
        Ok(())
    }
}
