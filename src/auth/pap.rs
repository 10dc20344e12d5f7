use tokio::sync::mpsc;
use tracing::debug;

use super::recv;
use crate::crypto::HLAK_LEN;
use crate::error::Failure;
use crate::session::{AuthResult, SessionContext};
use crate::unit::PapFrame;

pub struct PapClient<'a> {
    ctx: &'a SessionContext,
}

impl<'a> PapClient<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        Self { ctx }
    }

    /// Send one Authenticate-Request and wait for its answer. The caller
    /// bounds the wait with the phase timeout.
    pub async fn run(self, mailbox: &mut mpsc::Receiver<PapFrame>) -> Result<AuthResult, Failure> {
        let credentials = &self.ctx.config().credentials;
        let id = self.ctx.ids.next();
        let request = PapFrame::request(id, &credentials.username, &credentials.password)?;
        self.ctx.sender.send_unit(&request).await?;
        loop {
            match recv(mailbox).await? {
                PapFrame::AuthenticateAck { id: ack, .. } if ack == id => {
                    return Ok(AuthResult { hlak: [0; HLAK_LEN] });
                }
                PapFrame::AuthenticateNak { id: nak, message } if nak == id => {
                    return Err(Failure::AuthenticationFailed(
                        String::from_utf8_lossy(&message).into_owned(),
                    ));
                }
                other => debug!("ignoring PAP frame {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::negotiation::testing::{context, read_packet};
    use crate::unit::DataUnit;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pap_ack() {
        let (ctx, mut peer, _inbox) = context(ClientConfig::new("vpn", "alice", "secret"));
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async move { PapClient::new(&ctx).run(&mut rx).await });

        let request = PapFrame::read_from(&read_packet(&mut peer).await).unwrap();
        let PapFrame::AuthenticateRequest { id, peer_id, password } = request else {
            panic!("expected Authenticate-Request");
        };
        assert_eq!(peer_id, b"alice");
        assert_eq!(password, b"secret");

        tx.send(PapFrame::AuthenticateAck { id: id.wrapping_add(1), message: vec![] })
            .await
            .unwrap();
        tx.send(PapFrame::AuthenticateAck { id, message: b"ok".to_vec() })
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap().hlak, [0; HLAK_LEN]);
    }

    #[tokio::test]
    async fn test_pap_nak() {
        let (ctx, mut peer, _inbox) = context(ClientConfig::new("vpn", "alice", "wrong"));
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async move { PapClient::new(&ctx).run(&mut rx).await });
        let id = PapFrame::read_from(&read_packet(&mut peer).await).unwrap().id();
        tx.send(PapFrame::AuthenticateNak { id, message: b"denied".to_vec() })
            .await
            .unwrap();
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            Failure::AuthenticationFailed("denied".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pap_slow_ack_is_accepted_without_resend() {
        let config = ClientConfig::new("vpn", "alice", "secret");
        let restart = config.ppp.restart_interval;
        let (ctx, mut peer, _inbox) = context(config);
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async move { PapClient::new(&ctx).run(&mut rx).await });

        let id = PapFrame::read_from(&read_packet(&mut peer).await).unwrap().id();
        tokio::time::sleep(restart + Duration::from_secs(1)).await;
        tx.send(PapFrame::AuthenticateAck { id, message: vec![] })
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap().hlak, [0; HLAK_LEN]);

        // The password went out exactly once.
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(10), peer.read_to_end(&mut rest)).await;
        assert!(rest.is_empty(), "unexpected extra bytes {:?}", rest);
    }
}
