mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use common::{Server, CERTIFICATE};
use sstp_client::crypto::binding::call_connected;
use sstp_client::crypto::HLAK_LEN;
use sstp_client::types::HashProtocol;
use sstp_client::unit::ppp::{open_data_packet, put_frame_header, PROTO_IPCP, PROTO_IPV4, PROTO_LCP, PROTO_PAP};
use sstp_client::unit::{
    AuthOption, ConfigureCode, ConfigureFrame, ControlPacket, CryptoBindingRequest, DataUnit,
    IpcpFrame, IpcpOption, LcpFrame, LcpOption, OptionKind, OptionPack, PapFrame,
};
use sstp_client::{AuthSuite, ClientConfig, Error, Failure, NetworkAddresses, Phase, SessionStatus, SstpClient};

const NONCE: [u8; 32] = [0x5A; 32];
const ASSIGNED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const DNS1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 53);
const DNS2: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 54);

fn pap_config() -> ClientConfig {
    let mut config = ClientConfig::new("vpn.example.com", "alice", "secret");
    config.ppp.auth_suites = vec![AuthSuite::Pap];
    config.sstp.connect_retries = 1;
    config
}

fn frame<O: OptionKind>(code: ConfigureCode, id: u8, options: Vec<O>) -> ConfigureFrame<O> {
    ConfigureFrame::new(code, id, OptionPack::new(options))
}

async fn accept_call(server: &mut Server) {
    assert_eq!(
        server.expect_control().await,
        ControlPacket::call_connect_request()
    );
    server
        .send(&ControlPacket::CallConnectAck {
            request: CryptoBindingRequest {
                hash_bitmask: HashProtocol::BIT_SHA1 | HashProtocol::BIT_SHA256,
                nonce: NONCE,
            },
        })
        .await;
}

/// Nak the client's MRU down to 1400 and ask for PAP.
async fn open_lcp(server: &mut Server) {
    let LcpFrame::Configure(first) = LcpFrame::read_from(&server.expect_ppp(PROTO_LCP).await).unwrap() else {
        panic!("expected LCP Configure-Request");
    };
    assert_eq!(first.code, ConfigureCode::Request);
    assert!(first.options.iter().any(|o| *o == LcpOption::Mru(1500)));

    server
        .send(&LcpFrame::Configure(frame(ConfigureCode::Nak, first.id, vec![LcpOption::Mru(1400)])))
        .await;
    server
        .send(&LcpFrame::Configure(frame(
            ConfigureCode::Request,
            1,
            vec![LcpOption::Mru(1400), LcpOption::Auth(AuthOption::Pap)],
        )))
        .await;

    let (mut acked, mut opened) = (false, false);
    while !(acked && opened) {
        match LcpFrame::read_from(&server.expect_ppp(PROTO_LCP).await).unwrap() {
            LcpFrame::Configure(f) if f.code == ConfigureCode::Ack => {
                assert_eq!(f.id, 1);
                acked = true;
            }
            LcpFrame::Configure(f) if f.code == ConfigureCode::Request => {
                assert!(f.options.iter().any(|o| *o == LcpOption::Mru(1400)));
                server
                    .send(&LcpFrame::Configure(frame(ConfigureCode::Ack, f.id, f.options.into_vec())))
                    .await;
                opened = true;
            }
            other => panic!("unexpected LCP frame {:?}", other),
        }
    }
}

async fn accept_pap(server: &mut Server) {
    match PapFrame::read_from(&server.expect_ppp(PROTO_PAP).await).unwrap() {
        PapFrame::AuthenticateRequest { id, peer_id, password } => {
            assert_eq!(peer_id, b"alice");
            assert_eq!(password, b"secret");
            server
                .send(&PapFrame::AuthenticateAck {
                    id,
                    message: b"welcome".to_vec(),
                })
                .await;
        }
        other => panic!("expected Authenticate-Request, got {:?}", other),
    }
}

/// Assign 10.0.0.2 with two DNS servers.
async fn open_ipcp(server: &mut Server) {
    let IpcpFrame::Configure(first) = IpcpFrame::read_from(&server.expect_ppp(PROTO_IPCP).await).unwrap() else {
        panic!("expected IPCP Configure-Request");
    };
    assert!(first
        .options
        .iter()
        .any(|o| *o == IpcpOption::Address(Ipv4Addr::UNSPECIFIED)));

    server
        .send(&IpcpFrame::Configure(frame(
            ConfigureCode::Nak,
            first.id,
            vec![
                IpcpOption::Address(ASSIGNED),
                IpcpOption::PrimaryDns(DNS1),
                IpcpOption::SecondaryDns(DNS2),
            ],
        )))
        .await;
    server
        .send(&IpcpFrame::Configure(frame(
            ConfigureCode::Request,
            1,
            vec![IpcpOption::Address(Ipv4Addr::new(10, 0, 0, 1))],
        )))
        .await;

    let (mut acked, mut opened) = (false, false);
    while !(acked && opened) {
        match IpcpFrame::read_from(&server.expect_ppp(PROTO_IPCP).await).unwrap() {
            IpcpFrame::Configure(f) if f.code == ConfigureCode::Ack => {
                assert_eq!(f.id, 1);
                acked = true;
            }
            IpcpFrame::Configure(f) if f.code == ConfigureCode::Request => {
                assert!(f.options.iter().any(|o| *o == IpcpOption::Address(ASSIGNED)));
                server
                    .send(&IpcpFrame::Configure(frame(ConfigureCode::Ack, f.id, f.options.into_vec())))
                    .await;
                opened = true;
            }
            other => panic!("unexpected IPCP frame {:?}", other),
        }
    }
}

/// Everything up to an open IPCP, checking the crypto binding on the way.
async fn handshake(server: &mut Server) {
    accept_call(server).await;
    open_lcp(server).await;
    accept_pap(server).await;

    let expected = call_connected(HashProtocol::Sha256, NONCE, CERTIFICATE, &[0u8; HLAK_LEN]).unwrap();
    assert_eq!(server.expect_control().await, expected);

    open_ipcp(server).await;
}

fn ipv4_packet(marker: u8) -> Vec<u8> {
    let mut packet = vec![0x45, 0x00, 0x00, 0x18];
    packet.extend_from_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
    packet.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
    packet.extend_from_slice(&[marker; 4]);
    packet
}

#[tokio::test]
async fn test_pap_session_forwards_traffic_and_disconnects() {
    let (dialer, mut server) = common::dialer();
    let (factory, mut host) = common::terminal();
    let handle = SstpClient::start(pap_config(), dialer, factory.clone()).unwrap();
    let mut status = handle.status();

    handshake(&mut server).await;
    status
        .wait_for(|s| matches!(s, SessionStatus::Connected(_)))
        .await
        .unwrap();

    let addresses = NetworkAddresses {
        ipv4: Some(ASSIGNED),
        ipv4_dns: vec![DNS1, DNS2],
        ipv6_link_local: None,
    };
    assert_eq!(*factory.established.lock(), vec![(1400, addresses)]);

    // Downlink: the terminal sees the IP packet exactly as sent.
    let inbound = ipv4_packet(0xAA);
    let mut buf = BytesMut::new();
    put_frame_header(&mut buf, PROTO_IPV4, inbound.len());
    buf.put_slice(&inbound);
    server.send_raw(&buf).await;
    assert_eq!(host.from_tunnel.recv().await.unwrap(), inbound);

    // Uplink: framed as PPP protocol 0x0021.
    let outbound = ipv4_packet(0xBB);
    host.to_tunnel.send(outbound.clone()).await.unwrap();
    let packet = server.expect_ppp(PROTO_IPV4).await;
    let (_, payload) = open_data_packet("test", &packet).unwrap();
    assert_eq!(payload, &outbound[..]);

    assert!(handle.stats().bytes_in >= inbound.len() as u64);

    handle.disconnect();
    server
        .control_until(|c| matches!(c, ControlPacket::CallDisconnect { .. }))
        .await;
    server.send(&ControlPacket::CallDisconnectAck).await;

    handle.wait().await.unwrap();
    assert_eq!(*status.borrow(), SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_is_aborted_after_echo_timeout() {
    let (dialer, mut server) = common::dialer();
    let (factory, _host) = common::terminal();
    let handle = SstpClient::start(pap_config(), dialer, factory).unwrap();
    let mut status = handle.status();

    handshake(&mut server).await;
    status
        .wait_for(|s| matches!(s, SessionStatus::Connected(_)))
        .await
        .unwrap();

    // Echo-Requests go unanswered until the client gives up.
    server
        .control_until(|c| matches!(c, ControlPacket::CallAbort { .. }))
        .await;

    match handle.wait().await.unwrap_err() {
        Error::Session { phase, failure } => {
            assert_eq!(failure, Failure::Timeout);
            assert!(matches!(phase, Phase::SstpEcho | Phase::PppEcho), "{:?}", phase);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_pap_rejection_aborts_call() {
    let (dialer, mut server) = common::dialer();
    let (factory, _host) = common::terminal();
    let handle = SstpClient::start(pap_config(), dialer, factory.clone()).unwrap();

    accept_call(&mut server).await;
    open_lcp(&mut server).await;
    let request = PapFrame::read_from(&server.expect_ppp(PROTO_PAP).await).unwrap();
    server
        .send(&PapFrame::AuthenticateNak {
            id: request.id(),
            message: b"bad password".to_vec(),
        })
        .await;

    server
        .control_until(|c| matches!(c, ControlPacket::CallAbort { .. }))
        .await;
    server.send(&ControlPacket::CallAbort { status: None }).await;

    match handle.wait().await.unwrap_err() {
        Error::Session { phase, failure } => {
            assert_eq!(phase, Phase::Pap);
            assert!(matches!(failure, Failure::AuthenticationFailed(ref text) if text.contains("bad password")));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(factory.established.lock().is_empty());
}

#[tokio::test]
async fn test_call_connect_nak_ends_session() {
    let (dialer, mut server) = common::dialer();
    let (factory, _host) = common::terminal();
    let handle = SstpClient::start(pap_config(), dialer, factory).unwrap();

    assert_eq!(
        server.expect_control().await,
        ControlPacket::call_connect_request()
    );
    server
        .send(&ControlPacket::CallConnectNak { statuses: vec![] })
        .await;
    server
        .control_until(|c| matches!(c, ControlPacket::CallAbort { .. }))
        .await;
    server.send(&ControlPacket::CallAbort { status: None }).await;

    match handle.wait().await.unwrap_err() {
        Error::Session { phase, failure } => {
            assert_eq!(phase, Phase::Sstp);
            assert!(matches!(failure, Failure::ConnectNak(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_is_redialed() {
    let mut config = pap_config();
    config.reconnect.enabled = true;
    config.reconnect.interval = Duration::from_secs(1);
    let (dialer, mut servers) = common::dialer_with(2);
    let (factory, _host) = common::terminal();
    let handle = SstpClient::start(config, dialer.clone(), factory).unwrap();
    let mut status = handle.status();
    let mut second = servers.pop().unwrap();
    let mut first = servers.pop().unwrap();

    handshake(&mut first).await;
    status
        .wait_for(|s| matches!(s, SessionStatus::Connected(_)))
        .await
        .unwrap();

    first
        .control_until(|c| matches!(c, ControlPacket::CallAbort { .. }))
        .await;
    status
        .wait_for(|s| *s == SessionStatus::Reconnecting(1))
        .await
        .unwrap();

    assert_eq!(
        second.expect_control().await,
        ControlPacket::call_connect_request()
    );
    assert_eq!(dialer.dials(), 2);

    handle.disconnect();
    handle.wait().await.unwrap();
    assert_eq!(*status.borrow(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn test_authentication_failure_is_not_redialed() {
    let mut config = pap_config();
    config.reconnect.enabled = true;
    config.reconnect.interval = Duration::from_millis(10);
    let (dialer, mut servers) = common::dialer_with(2);
    let (factory, _host) = common::terminal();
    let handle = SstpClient::start(config, dialer.clone(), factory).unwrap();
    let status = handle.status();
    let mut server = servers.remove(0);

    accept_call(&mut server).await;
    open_lcp(&mut server).await;
    let request = PapFrame::read_from(&server.expect_ppp(PROTO_PAP).await).unwrap();
    server
        .send(&PapFrame::AuthenticateNak {
            id: request.id(),
            message: b"bad password".to_vec(),
        })
        .await;
    server
        .control_until(|c| matches!(c, ControlPacket::CallAbort { .. }))
        .await;
    server.send(&ControlPacket::CallAbort { status: None }).await;

    match handle.wait().await.unwrap_err() {
        Error::Session { failure, .. } => {
            assert!(matches!(failure, Failure::AuthenticationFailed(_)), "{:?}", failure);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(*status.borrow(), SessionStatus::Disconnected);
    assert_eq!(dialer.dials(), 1);
}
