//! LCP: MRU and the authentication protocol.

use tracing::{debug, warn};

use super::{Negotiator, Verdict};
use crate::config::{PppOptions, MAX_MTU, MIN_MTU};
use crate::error::Failure;
use crate::session::LinkSetting;
use crate::types::{AuthSuite, Phase};
use crate::unit::option::{LCP_OPT_AUTH, LCP_OPT_MRU};
use crate::unit::{AuthOption, LcpOption, OptionPack};

#[derive(Debug)]
pub struct LcpNegotiator {
    /// MRU we propose; `None` once the peer rejected the option.
    mru: Option<u16>,
    mtu: u16,
    auth_suites: Vec<AuthSuite>,
    /// MRU the peer asked for, defaulting to 1500 when absent.
    peer_mru: u16,
    auth: Option<AuthSuite>,
}

impl LcpNegotiator {
    pub fn new(ppp: &PppOptions) -> Self {
        Self {
            mru: Some(ppp.mru),
            mtu: ppp.mtu,
            auth_suites: ppp.auth_suites.clone(),
            peer_mru: crate::config::DEFAULT_MRU,
            auth: None,
        }
    }

    /// Settled link parameters; only meaningful after the session opened.
    pub fn result(&self) -> Result<LinkSetting, Failure> {
        let auth = self
            .auth
            .ok_or_else(|| Failure::UnexpectedMessage("LCP opened without an auth protocol".into()))?;
        Ok(LinkSetting {
            mru: self.mru.unwrap_or(crate::config::DEFAULT_MRU),
            mtu: self.peer_mru.min(self.mtu),
            auth,
        })
    }

    fn preferred(&self) -> Option<AuthSuite> {
        self.auth_suites.first().copied()
    }

    fn auth_nak(&self) -> Result<Verdict<LcpOption>, Failure> {
        match self.preferred() {
            Some(suite) => Ok(Verdict::Nak(vec![LcpOption::Auth(AuthOption::from_suite(suite))])),
            None => Err(Failure::OptionUnacceptable(
                LCP_OPT_AUTH,
                "no authentication protocol configured".into(),
            )),
        }
    }
}

impl Negotiator for LcpNegotiator {
    type Option = LcpOption;

    const PHASE: Phase = Phase::Lcp;

    fn build_request(&self) -> OptionPack<LcpOption> {
        let mut pack = OptionPack::default();
        if let Some(mru) = self.mru {
            pack.push(LcpOption::Mru(mru));
        }
        pack
    }

    fn inspect_request(&mut self, options: &OptionPack<LcpOption>) -> Result<Verdict<LcpOption>, Failure> {
        let mut nak = Vec::new();
        let peer_mru = options.mru();
        if let Some(mru) = peer_mru {
            if mru < MIN_MTU {
                nak.push(LcpOption::Mru(MIN_MTU));
            }
        }

        let auth = match options.auth() {
            Some(option) => match option.suite() {
                Some(suite) if self.auth_suites.contains(&suite) => Some(suite),
                _ => {
                    debug!("peer proposed unacceptable auth {:?}", option);
                    None
                }
            },
            None => None,
        };
        if auth.is_none() {
            if let Verdict::Nak(mut suggested) = self.auth_nak()? {
                nak.append(&mut suggested);
            }
        }

        if !nak.is_empty() {
            return Ok(Verdict::Nak(nak));
        }
        self.peer_mru = peer_mru.unwrap_or(crate::config::DEFAULT_MRU);
        self.auth = auth;
        Ok(Verdict::Ack)
    }

    fn apply_nak(&mut self, options: &OptionPack<LcpOption>) -> Result<(), Failure> {
        if let Some(mru) = options.mru() {
            if !(MIN_MTU..=MAX_MTU).contains(&mru) {
                return Err(Failure::OptionUnacceptable(
                    LCP_OPT_MRU,
                    format!("suggested MRU {} out of range", mru),
                ));
            }
            debug!("adopting peer's MRU {}", mru);
            self.mru = Some(mru);
        }
        Ok(())
    }

    fn apply_reject(&mut self, options: &OptionPack<LcpOption>) -> Result<(), Failure> {
        if options.contains_type(LCP_OPT_MRU) && self.mru.take().is_some() {
            warn!("peer rejected the MRU option, using the default");
        }
        Ok(())
    }
}
