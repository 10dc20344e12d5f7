use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{recv, MsChapExchange};
use crate::crypto::mschap::describe_failure;
use crate::crypto::HLAK_LEN;
use crate::error::Failure;
use crate::session::{AuthResult, SessionContext};
use crate::unit::auth::EAP_TYPE_MSCHAPV2;
use crate::unit::{EapFrame, EapMsChap, EapType};

/// EAP with MS-CHAPv2 as the only method we accept.
pub struct EapClient<'a> {
    ctx: &'a SessionContext,
    exchange: MsChapExchange,
    hlak: Option<[u8; HLAK_LEN]>,
}

impl<'a> EapClient<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        let credentials = &ctx.config().credentials;
        Self {
            ctx,
            exchange: MsChapExchange::new(&credentials.username, &credentials.password),
            hlak: None,
        }
    }

    async fn respond(&self, id: u8, data: EapType) -> Result<(), Failure> {
        let frame = EapFrame::Response { id, data };
        self.ctx.sender.send_unit(&frame).await?;
        Ok(())
    }

    pub async fn run(mut self, mailbox: &mut mpsc::Receiver<EapFrame>) -> Result<AuthResult, Failure> {
        loop {
            match recv(mailbox).await? {
                EapFrame::Request { id, data } => self.on_request(id, data).await?,
                EapFrame::Success { .. } => {
                    return match self.hlak {
                        Some(hlak) => Ok(AuthResult { hlak }),
                        None => Err(Failure::UnexpectedMessage(
                            "EAP Success before MS-CHAPv2 completed".into(),
                        )),
                    };
                }
                EapFrame::Failure { .. } => {
                    return Err(Failure::AuthenticationFailed("EAP Failure".into()));
                }
                EapFrame::Response { id, .. } => debug!("ignoring EAP Response #{}", id),
            }
        }
    }

    async fn on_request(&mut self, id: u8, data: EapType) -> Result<(), Failure> {
        match data {
            EapType::Identity(_) => {
                let identity = self.exchange.username().to_vec();
                self.respond(id, EapType::Identity(identity)).await
            }
            EapType::MsChapV2(EapMsChap::Challenge { ms_id, value, .. }) => {
                let value = self.exchange.respond(value);
                let name = self.exchange.username().to_vec();
                let response = EapMsChap::Response { ms_id, value, name };
                self.respond(id, EapType::MsChapV2(response)).await
            }
            EapType::MsChapV2(EapMsChap::Success { message, .. }) => {
                self.hlak = Some(self.exchange.verify(&message)?);
                self.respond(id, EapType::MsChapV2(EapMsChap::SuccessAck)).await
            }
            EapType::MsChapV2(EapMsChap::Failure { message, .. }) => {
                self.respond(id, EapType::MsChapV2(EapMsChap::FailureAck)).await?;
                Err(Failure::AuthenticationFailed(describe_failure(&message)))
            }
            EapType::MsChapV2(other) => {
                debug!("ignoring EAP-MSCHAPv2 {:?}", other);
                Ok(())
            }
            other => {
                warn!("EAP type {} proposed, asking for MS-CHAPv2", other.type_code());
                self.respond(id, EapType::Nak(vec![EAP_TYPE_MSCHAPV2])).await
            }
        }
    }
}
