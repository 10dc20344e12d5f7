//! IPv6CP: 64-bit interface identifiers for the link-local addresses.

use rand::Rng;
use tracing::debug;

use super::{Negotiator, Verdict};
use crate::error::Failure;
use crate::session::Ipv6Setting;
use crate::types::Phase;
use crate::unit::option::IPV6CP_OPT_INTERFACE_ID;
use crate::unit::{Ipv6cpOption, OptionPack};

fn random_id() -> [u8; 8] {
    let mut rng = rand::thread_rng();
    loop {
        let id: [u8; 8] = rng.gen();
        if id != [0; 8] {
            return id;
        }
    }
}

#[derive(Debug)]
pub struct Ipv6cpNegotiator {
    local_id: [u8; 8],
    peer_id: [u8; 8],
}

impl Default for Ipv6cpNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv6cpNegotiator {
    pub fn new() -> Self {
        Self {
            local_id: random_id(),
            peer_id: [0; 8],
        }
    }

    pub fn result(&self) -> Ipv6Setting {
        Ipv6Setting {
            local_id: self.local_id,
            peer_id: self.peer_id,
        }
    }
}

impl Negotiator for Ipv6cpNegotiator {
    type Option = Ipv6cpOption;

    const PHASE: Phase = Phase::Ipv6cp;

    fn build_request(&self) -> OptionPack<Ipv6cpOption> {
        OptionPack::new(vec![Ipv6cpOption::InterfaceId(self.local_id)])
    }

    fn inspect_request(&mut self, options: &OptionPack<Ipv6cpOption>) -> Result<Verdict<Ipv6cpOption>, Failure> {
        match options.interface_id() {
            Some(id) if id == [0; 8] || id == self.local_id => {
                let mut suggestion = random_id();
                while suggestion == self.local_id {
                    suggestion = random_id();
                }
                debug!("peer interface id {} unusable", hex::encode(id));
                Ok(Verdict::Nak(vec![Ipv6cpOption::InterfaceId(suggestion)]))
            }
            Some(id) => {
                self.peer_id = id;
                Ok(Verdict::Ack)
            }
            None => Ok(Verdict::Ack),
        }
    }

    fn apply_nak(&mut self, options: &OptionPack<Ipv6cpOption>) -> Result<(), Failure> {
        if let Some(id) = options.interface_id() {
            if id == [0; 8] {
                self.local_id = random_id();
            } else {
                self.local_id = id;
            }
        }
        Ok(())
    }

    fn apply_reject(&mut self, options: &OptionPack<Ipv6cpOption>) -> Result<(), Failure> {
        if options.contains_type(IPV6CP_OPT_INTERFACE_ID) {
            return Err(Failure::OptionRejected(IPV6CP_OPT_INTERFACE_ID));
        }
        Ok(())
    }
}
