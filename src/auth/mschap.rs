use tokio::sync::mpsc;
use tracing::debug;

use super::{recv, MsChapExchange};
use crate::crypto::mschap::describe_failure;
use crate::error::Failure;
use crate::session::{AuthResult, SessionContext};
use crate::unit::ChapFrame;

/// MS-CHAPv2 over plain CHAP (protocol 0xC223).
pub struct ChapClient<'a> {
    ctx: &'a SessionContext,
    exchange: MsChapExchange,
}

impl<'a> ChapClient<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        let credentials = &ctx.config().credentials;
        Self {
            ctx,
            exchange: MsChapExchange::new(&credentials.username, &credentials.password),
        }
    }

    pub async fn run(mut self, mailbox: &mut mpsc::Receiver<ChapFrame>) -> Result<AuthResult, Failure> {
        let mut challenge_id = None;
        loop {
            match recv(mailbox).await? {
                ChapFrame::Challenge { id, value, .. } => {
                    // A repeated Challenge means our Response was lost.
                    let value = self.exchange.respond(value);
                    let response = ChapFrame::Response {
                        id,
                        value,
                        name: self.exchange.username().to_vec(),
                    };
                    self.ctx.sender.send_unit(&response).await?;
                    challenge_id = Some(id);
                }
                ChapFrame::Success { id, message } if Some(id) == challenge_id => {
                    let hlak = self.exchange.verify(&message)?;
                    return Ok(AuthResult { hlak });
                }
                ChapFrame::Failure { id, message } if Some(id) == challenge_id => {
                    return Err(Failure::AuthenticationFailed(describe_failure(&message)));
                }
                other => debug!("ignoring CHAP frame #{}", other.id()),
            }
        }
    }
}
