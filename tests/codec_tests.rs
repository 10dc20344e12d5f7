use std::net::Ipv4Addr;

use sstp_client::unit::{
    AuthOption, ConfigureCode, ConfigureFrame, ControlPacket, DataUnit, IpcpFrame, IpcpOption,
    LcpFrame, LcpOption, OptionPack,
};
use sstp_client::ParseError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_lcp_configure_ack_layout() {
        let ack = LcpFrame::Configure(ConfigureFrame::new(
            ConfigureCode::Ack,
            0x01,
            OptionPack::new(vec![LcpOption::Auth(AuthOption::Pap)]),
        ));

        let expected = vec![
            0x10, 0x00, 0x00, 0x10, // SSTP data header, length 16
            0xFF, 0x03, 0xC0, 0x21, // PPP header, LCP
            0x02, 0x01, 0x00, 0x08, // Configure-Ack, id 1, length 8
            0x03, 0x04, 0xC0, 0x23, // Auth-Protocol = PAP
        ];

        assert_eq!(ack.to_bytes().to_vec(), expected, "LCP packet not wrapped correctly into SSTP");
    }

    #[test]
    pub fn test_call_connect_request_layout() {
        let expected = vec![
            0x10, 0x01, 0x00, 0x0E, // SSTP control header, length 14
            0x00, 0x01, 0x00, 0x01, // Call-Connect-Request, one attribute
            0x00, 0x01, 0x00, 0x06, // Encapsulated-Protocol-Id
            0x00, 0x01, // PPP
        ];
        assert_eq!(ControlPacket::call_connect_request().to_bytes().to_vec(), expected);
        assert_eq!(
            ControlPacket::read_from(&expected).unwrap(),
            ControlPacket::call_connect_request()
        );
    }

    #[test]
    pub fn test_parse_ipcp_nak() {
        let packet = [
            0x10, 0x00, 0x00, 0x12, // SSTP
            0xFF, 0x03, 0x80, 0x21, // PPP, IPCP
            0x03, 0x07, 0x00, 0x0A, // Configure-Nak, id 7, length 10
            0x03, 0x06, 10, 0, 0, 2, // IP-Address
        ];

        let frame = IpcpFrame::read_from(&packet).unwrap();
        let IpcpFrame::Configure(nak) = frame else {
            panic!("expected Configure-Nak, got {:?}", frame);
        };
        assert_eq!(nak.code, ConfigureCode::Nak);
        assert_eq!(nak.id, 7);
        assert_eq!(
            nak.options.into_vec(),
            vec![IpcpOption::Address(Ipv4Addr::new(10, 0, 0, 2))]
        );
    }

    #[test]
    pub fn test_truncated_packet_is_rejected() {
        // Declares 16 bytes, carries 12.
        let packet = [
            0x10, 0x00, 0x00, 0x10, 0xFF, 0x03, 0xC0, 0x21, 0x02, 0x01, 0x00, 0x08,
        ];
        let err = LcpFrame::read_from(&packet).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }), "{:?}", err);
    }
}
