//! SSL terminal over `tokio-rustls`: TCP connect, TLS handshake, and the
//! `SSTP_DUPLEX_POST` upgrade.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{
    Certificate, ClientConfig as TlsConfig, Error as TLSError, OwnedTrustAnchor, RootCertStore,
    ServerName,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SslConnection, SslDialer, TlsDiagnostics};
use crate::config::{CertificatePolicy, ClientConfig};
use crate::error::{Error, Result};

const SSTP_URI: &str = "/sra_{BA195980-CD49-458b-9E23-C84EE0ADCD75}/";
/// The upgrade request advertises an endless body.
const DUPLEX_CONTENT_LENGTH: &str = "18446744073709551615";
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Accepts any certificate. Testing only.
pub struct DisabledVerifier;

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Accepts exactly the leaf certificate whose DER SHA-256 equals the pin.
pub struct PinnedVerifier {
    fingerprint: [u8; 32],
}

impl PinnedVerifier {
    pub fn new(fingerprint: [u8; 32]) -> Self {
        Self { fingerprint }
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        let actual = Sha256::digest(&end_entity.0);
        if actual.as_slice() == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TLSError::General(format!(
                "certificate fingerprint mismatch: got {}",
                hex::encode(actual)
            )))
        }
    }
}

fn tls_config(policy: &CertificatePolicy) -> TlsConfig {
    let builder = TlsConfig::builder().with_safe_defaults();
    match policy {
        CertificatePolicy::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        CertificatePolicy::Pinned(fingerprint) => builder
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier::new(*fingerprint)))
            .with_no_client_auth(),
        CertificatePolicy::Disabled => {
            warn!("certificate verification is disabled");
            builder
                .with_custom_certificate_verifier(Arc::new(DisabledVerifier))
                .with_no_client_auth()
        }
    }
}

/// Send the SSTP upgrade request and consume the HTTP response header.
///
/// The response is read one byte at a time so nothing past `\r\n\r\n` is
/// taken from the stream; the first SSTP packet may follow immediately.
pub async fn upgrade<S>(stream: &mut S, host: &str, correlation_id: Uuid) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "SSTP_DUPLEX_POST {SSTP_URI} HTTP/1.1\r\n\
         Content-Length: {DUPLEX_CONTENT_LENGTH}\r\n\
         Host: {host}\r\n\
         SSTPCORRELATIONID: {{{}}}\r\n\
         \r\n",
        correlation_id.to_string().to_uppercase()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    debug!("sent SSTP upgrade request");

    let mut header = Vec::with_capacity(256);
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_RESPONSE_HEADER {
            return Err(Error::Upgrade("response header too long".into()));
        }
        match stream.read_u8().await {
            Ok(byte) => header.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Upgrade("connection closed during upgrade".into()))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or_default();
    debug!("upgrade response: {}", status_line);
    let status = status_line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(Error::Upgrade(format!(
            "server answered '{}'",
            status_line.trim()
        )));
    }
    Ok(())
}

/// Dials the server with rustls and performs the upgrade.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsDialer;

#[async_trait]
impl SslDialer for RustlsDialer {
    async fn connect(&self, config: &ClientConfig) -> Result<SslConnection> {
        let addr = format!("{}:{}", config.host, config.port);
        let timeout = config.sstp.negotiation_timeout;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::tls(format!("TCP connect to {addr} timed out")))??;
        tcp.set_nodelay(true)?;
        debug!("TCP connected to {}", addr);

        let name = config.server_name();
        let server_name = ServerName::try_from(name)
            .map_err(|e| Error::tls(format!("invalid server name '{name}': {e}")))?;
        let connector = TlsConnector::from(Arc::new(tls_config(&config.tls.policy)));
        let mut stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::tls("TLS handshake timed out"))?
            .map_err(|e| Error::tls(e.to_string()))?;

        let (_, session) = stream.get_ref();
        let peer_certificate = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.0.clone())
            .ok_or_else(|| Error::tls("server presented no certificate"))?;
        let diagnostics = TlsDiagnostics {
            protocol_version: session.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
        };
        info!("TLS established ({})", diagnostics);

        let correlation_id = Uuid::new_v4();
        tokio::time::timeout(timeout, upgrade(&mut stream, name, correlation_id))
            .await
            .map_err(|_| Error::Upgrade("timed out".into()))??;
        info!("SSTP upgrade accepted, correlation id {}", correlation_id);

        let (reader, writer) = tokio::io::split(stream);
        Ok(SslConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_certificate,
            correlation_id,
            diagnostics,
        })
    }
}
