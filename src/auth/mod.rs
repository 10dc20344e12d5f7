//! PPP authentication: PAP, MS-CHAPv2 and EAP-MSCHAPv2.
//!
//! Each client runs against the frames the demultiplexer routes to its
//! mailbox and settles an [`AuthResult`]. PAP produces an all-zero HLAK.

pub mod eap;
pub mod mschap;
pub mod pap;

use tokio::sync::mpsc;
use tracing::info;

use crate::crypto::mschap::{check_authenticator, derive_hlak, generate_nt_response};
use crate::crypto::{ChapMaterial, HLAK_LEN};
use crate::demux::Registry;
use crate::error::Failure;
use crate::session::{AuthResult, SessionContext};
use crate::types::AuthSuite;
use crate::unit::ChapResponseValue;

pub use eap::EapClient;
pub use mschap::ChapClient;
pub use pap::PapClient;

/// Run the client for `suite` within the configured phase timeout.
pub async fn authenticate(
    suite: AuthSuite,
    ctx: &SessionContext,
    registry: &Registry,
) -> Result<AuthResult, Failure> {
    let limit = ctx.config().ppp.phase_timeout;
    let run = async {
        match suite {
            AuthSuite::Pap => {
                let mut mailbox = registry.pap.register();
                PapClient::new(ctx).run(&mut mailbox).await
            }
            AuthSuite::MsChapV2 => {
                let mut mailbox = registry.chap.register();
                ChapClient::new(ctx).run(&mut mailbox).await
            }
            AuthSuite::EapMsChapV2 => {
                let mut mailbox = registry.eap.register();
                EapClient::new(ctx).run(&mut mailbox).await
            }
        }
    };
    let result = tokio::time::timeout(limit, run)
        .await
        .map_err(|_| Failure::Timeout);
    match suite {
        AuthSuite::Pap => registry.pap.unregister(),
        AuthSuite::MsChapV2 => registry.chap.unregister(),
        AuthSuite::EapMsChapV2 => registry.eap.unregister(),
    }
    let result = result??;
    info!("{} succeeded", suite);
    Ok(result)
}

async fn recv<T>(mailbox: &mut mpsc::Receiver<T>) -> Result<T, Failure> {
    mailbox.recv().await.ok_or(Failure::LinkClosed)
}

/// One MS-CHAPv2 exchange, shared by plain CHAP and EAP.
pub struct MsChapExchange {
    username: String,
    password: String,
    material: Option<ChapMaterial>,
}

impl MsChapExchange {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            material: None,
        }
    }

    pub fn username(&self) -> &[u8] {
        self.username.as_bytes()
    }

    /// Response to a server challenge, with a fresh client challenge.
    pub fn respond(&mut self, server_challenge: [u8; 16]) -> ChapResponseValue {
        let client_challenge: [u8; 16] = rand::random();
        let mut material = ChapMaterial::new(server_challenge, client_challenge);
        material.client_response = generate_nt_response(
            &server_challenge,
            &client_challenge,
            &self.username,
            &self.password,
        );
        let value = ChapResponseValue {
            peer_challenge: client_challenge,
            nt_response: material.client_response,
            flags: 0,
        };
        self.material = Some(material);
        value
    }

    pub fn has_responded(&self) -> bool {
        self.material.is_some()
    }

    /// Check the authenticator in a Success message and derive the HLAK.
    pub fn verify(&mut self, message: &[u8]) -> Result<[u8; HLAK_LEN], Failure> {
        let material = self
            .material
            .as_mut()
            .ok_or_else(|| Failure::UnexpectedMessage("Success before Challenge".into()))?;
        if !check_authenticator(message, &self.password, &self.username, material) {
            return Err(Failure::VerificationFailed);
        }
        material.server_response = message.to_vec();
        Ok(derive_hlak(&self.password, &material.client_response))
    }
}
