//! Configuration options carried by LCP, IPCP and IPv6CP Configure frames.
//!
//! Each option is `u8 type | u8 length | value`. Options a side does not
//! recognise survive decoding as [`UnknownOption`] so they can be echoed back
//! in a Configure-Reject.

use std::fmt::Debug;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::ppp::{PROTO_CHAP, PROTO_EAP, PROTO_IPCP, PROTO_IPV6CP, PROTO_LCP, PROTO_PAP};
use super::{check_length, Reader};
use crate::error::ParseError;
use crate::types::AuthSuite;

const OPTION_HEADER_LEN: usize = 2;

pub const LCP_OPT_MRU: u8 = 1;
pub const LCP_OPT_AUTH: u8 = 3;

pub const IPCP_OPT_ADDRESS: u8 = 3;
pub const IPCP_OPT_PRIMARY_DNS: u8 = 129;
pub const IPCP_OPT_SECONDARY_DNS: u8 = 131;

pub const IPV6CP_OPT_INTERFACE_ID: u8 = 1;

pub const CHAP_ALGORITHM_MSCHAPV2: u8 = 0x81;

/// An option type of one control protocol.
pub trait OptionKind: Debug + Clone + PartialEq + Sized {
    /// Name used in parse errors.
    const UNIT: &'static str;

    /// PPP protocol whose Configure frames carry this option type.
    const PROTOCOL: u16;

    fn option_type(&self) -> u8;

    /// Length of the value, header excluded.
    fn value_len(&self) -> usize;

    fn write_value(&self, buf: &mut BytesMut);

    /// Decode one option; unrecognised types become `Unknown`.
    fn decode(option_type: u8, value: &[u8]) -> Result<Self, ParseError>;

    fn as_unknown(&self) -> Option<&UnknownOption>;

    fn length(&self) -> usize {
        OPTION_HEADER_LEN + self.value_len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.option_type());
        buf.put_u8(self.length() as u8);
        self.write_value(buf);
    }
}

/// Option of a type the receiver does not understand, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption {
    pub option_type: u8,
    pub data: Vec<u8>,
}

fn expect_value_len(
    unit: &'static str,
    value: &[u8],
    expected: usize,
) -> Result<(), ParseError> {
    check_length(
        unit,
        value.len() + OPTION_HEADER_LEN,
        expected + OPTION_HEADER_LEN,
        expected + OPTION_HEADER_LEN,
    )
}

/// Auth-Protocol option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOption {
    Pap,
    MsChapV2,
    Eap,
    /// Any protocol/algorithm pair we do not implement, e.g. CHAP-MD5.
    Other { protocol: u16, data: Vec<u8> },
}

impl AuthOption {
    pub fn from_suite(suite: AuthSuite) -> Self {
        match suite {
            AuthSuite::Pap => AuthOption::Pap,
            AuthSuite::MsChapV2 => AuthOption::MsChapV2,
            AuthSuite::EapMsChapV2 => AuthOption::Eap,
        }
    }

    pub fn suite(&self) -> Option<AuthSuite> {
        match self {
            AuthOption::Pap => Some(AuthSuite::Pap),
            AuthOption::MsChapV2 => Some(AuthSuite::MsChapV2),
            AuthOption::Eap => Some(AuthSuite::EapMsChapV2),
            AuthOption::Other { .. } => None,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            AuthOption::Pap | AuthOption::Eap => 2,
            AuthOption::MsChapV2 => 3,
            AuthOption::Other { data, .. } => 2 + data.len(),
        }
    }

    fn write_value(&self, buf: &mut BytesMut) {
        match self {
            AuthOption::Pap => buf.put_u16(PROTO_PAP),
            AuthOption::MsChapV2 => {
                buf.put_u16(PROTO_CHAP);
                buf.put_u8(CHAP_ALGORITHM_MSCHAPV2);
            }
            AuthOption::Eap => buf.put_u16(PROTO_EAP),
            AuthOption::Other { protocol, data } => {
                buf.put_u16(*protocol);
                buf.put_slice(data);
            }
        }
    }

    fn decode(value: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(LcpOption::UNIT, value);
        let protocol = reader.u16()?;
        let data = reader.rest();
        Ok(match (protocol, data) {
            (PROTO_PAP, []) => AuthOption::Pap,
            (PROTO_CHAP, [CHAP_ALGORITHM_MSCHAPV2]) => AuthOption::MsChapV2,
            (PROTO_EAP, []) => AuthOption::Eap,
            _ => AuthOption::Other {
                protocol,
                data: data.to_vec(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LcpOption {
    Mru(u16),
    Auth(AuthOption),
    Unknown(UnknownOption),
}

impl OptionKind for LcpOption {
    const UNIT: &'static str = "LCP option";
    const PROTOCOL: u16 = PROTO_LCP;

    fn option_type(&self) -> u8 {
        match self {
            LcpOption::Mru(_) => LCP_OPT_MRU,
            LcpOption::Auth(_) => LCP_OPT_AUTH,
            LcpOption::Unknown(u) => u.option_type,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            LcpOption::Mru(_) => 2,
            LcpOption::Auth(auth) => auth.value_len(),
            LcpOption::Unknown(u) => u.data.len(),
        }
    }

    fn write_value(&self, buf: &mut BytesMut) {
        match self {
            LcpOption::Mru(mru) => buf.put_u16(*mru),
            LcpOption::Auth(auth) => auth.write_value(buf),
            LcpOption::Unknown(u) => buf.put_slice(&u.data),
        }
    }

    fn decode(option_type: u8, value: &[u8]) -> Result<Self, ParseError> {
        match option_type {
            LCP_OPT_MRU => {
                expect_value_len(Self::UNIT, value, 2)?;
                Ok(LcpOption::Mru(u16::from_be_bytes([value[0], value[1]])))
            }
            LCP_OPT_AUTH => {
                if value.len() < 2 {
                    return Err(ParseError::LengthOutOfRange {
                        unit: Self::UNIT,
                        length: value.len() + OPTION_HEADER_LEN,
                        min: 4,
                        max: u8::MAX as usize,
                    });
                }
                Ok(LcpOption::Auth(AuthOption::decode(value)?))
            }
            _ => Ok(LcpOption::Unknown(UnknownOption {
                option_type,
                data: value.to_vec(),
            })),
        }
    }

    fn as_unknown(&self) -> Option<&UnknownOption> {
        match self {
            LcpOption::Unknown(u) => Some(u),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcpOption {
    Address(Ipv4Addr),
    PrimaryDns(Ipv4Addr),
    SecondaryDns(Ipv4Addr),
    Unknown(UnknownOption),
}

impl OptionKind for IpcpOption {
    const UNIT: &'static str = "IPCP option";
    const PROTOCOL: u16 = PROTO_IPCP;

    fn option_type(&self) -> u8 {
        match self {
            IpcpOption::Address(_) => IPCP_OPT_ADDRESS,
            IpcpOption::PrimaryDns(_) => IPCP_OPT_PRIMARY_DNS,
            IpcpOption::SecondaryDns(_) => IPCP_OPT_SECONDARY_DNS,
            IpcpOption::Unknown(u) => u.option_type,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            IpcpOption::Unknown(u) => u.data.len(),
            _ => 4,
        }
    }

    fn write_value(&self, buf: &mut BytesMut) {
        match self {
            IpcpOption::Address(addr)
            | IpcpOption::PrimaryDns(addr)
            | IpcpOption::SecondaryDns(addr) => buf.put_slice(&addr.octets()),
            IpcpOption::Unknown(u) => buf.put_slice(&u.data),
        }
    }

    fn decode(option_type: u8, value: &[u8]) -> Result<Self, ParseError> {
        let addr = |value: &[u8]| -> Result<Ipv4Addr, ParseError> {
            expect_value_len(Self::UNIT, value, 4)?;
            Ok(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
        };
        Ok(match option_type {
            IPCP_OPT_ADDRESS => IpcpOption::Address(addr(value)?),
            IPCP_OPT_PRIMARY_DNS => IpcpOption::PrimaryDns(addr(value)?),
            IPCP_OPT_SECONDARY_DNS => IpcpOption::SecondaryDns(addr(value)?),
            _ => IpcpOption::Unknown(UnknownOption {
                option_type,
                data: value.to_vec(),
            }),
        })
    }

    fn as_unknown(&self) -> Option<&UnknownOption> {
        match self {
            IpcpOption::Unknown(u) => Some(u),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv6cpOption {
    InterfaceId([u8; 8]),
    Unknown(UnknownOption),
}

impl OptionKind for Ipv6cpOption {
    const UNIT: &'static str = "IPv6CP option";
    const PROTOCOL: u16 = PROTO_IPV6CP;

    fn option_type(&self) -> u8 {
        match self {
            Ipv6cpOption::InterfaceId(_) => IPV6CP_OPT_INTERFACE_ID,
            Ipv6cpOption::Unknown(u) => u.option_type,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Ipv6cpOption::InterfaceId(_) => 8,
            Ipv6cpOption::Unknown(u) => u.data.len(),
        }
    }

    fn write_value(&self, buf: &mut BytesMut) {
        match self {
            Ipv6cpOption::InterfaceId(id) => buf.put_slice(id),
            Ipv6cpOption::Unknown(u) => buf.put_slice(&u.data),
        }
    }

    fn decode(option_type: u8, value: &[u8]) -> Result<Self, ParseError> {
        match option_type {
            IPV6CP_OPT_INTERFACE_ID => {
                expect_value_len(Self::UNIT, value, 8)?;
                let mut id = [0u8; 8];
                id.copy_from_slice(value);
                Ok(Ipv6cpOption::InterfaceId(id))
            }
            _ => Ok(Ipv6cpOption::Unknown(UnknownOption {
                option_type,
                data: value.to_vec(),
            })),
        }
    }

    fn as_unknown(&self) -> Option<&UnknownOption> {
        match self {
            Ipv6cpOption::Unknown(u) => Some(u),
            _ => None,
        }
    }
}

/// Ordered option list of one Configure frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPack<O> {
    options: Vec<O>,
}

impl<O> Default for OptionPack<O> {
    fn default() -> Self {
        Self {
            options: Vec::new(),
        }
    }
}

impl<O: OptionKind> OptionPack<O> {
    pub fn new(options: Vec<O>) -> Self {
        Self { options }
    }

    pub fn push(&mut self, option: O) {
        self.options.push(option);
    }

    pub fn iter(&self) -> impl Iterator<Item = &O> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn into_vec(self) -> Vec<O> {
        self.options
    }

    /// Options of types this side does not recognise.
    pub fn unknown(&self) -> Vec<O> {
        self.options
            .iter()
            .filter(|o| o.as_unknown().is_some())
            .cloned()
            .collect()
    }

    pub fn has_unknown(&self) -> bool {
        self.options.iter().any(|o| o.as_unknown().is_some())
    }

    pub fn contains_type(&self, option_type: u8) -> bool {
        self.options.iter().any(|o| o.option_type() == option_type)
    }

    pub fn encoded_len(&self) -> usize {
        self.options.iter().map(OptionKind::length).sum()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        for option in &self.options {
            option.write_to(buf);
        }
    }

    /// Decode options filling exactly `input`.
    pub fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(O::UNIT, input);
        let mut options = Vec::new();
        while !reader.is_empty() {
            let header = reader.peek();
            if header.len() < OPTION_HEADER_LEN {
                return Err(ParseError::OptionOverrun {
                    unit: O::UNIT,
                    excess: OPTION_HEADER_LEN - header.len(),
                });
            }
            let option_type = header[0];
            let length = header[1] as usize;
            check_length(O::UNIT, length, OPTION_HEADER_LEN, u8::MAX as usize)?;
            if length > header.len() {
                return Err(ParseError::OptionOverrun {
                    unit: O::UNIT,
                    excess: length - header.len(),
                });
            }
            let raw = reader.take(length)?;
            options.push(O::decode(option_type, &raw[OPTION_HEADER_LEN..])?);
        }
        Ok(Self { options })
    }
}

impl OptionPack<LcpOption> {
    pub fn mru(&self) -> Option<u16> {
        self.iter().find_map(|o| match o {
            LcpOption::Mru(mru) => Some(*mru),
            _ => None,
        })
    }

    pub fn auth(&self) -> Option<&AuthOption> {
        self.iter().find_map(|o| match o {
            LcpOption::Auth(auth) => Some(auth),
            _ => None,
        })
    }
}

impl OptionPack<IpcpOption> {
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|o| match o {
            IpcpOption::Address(a) => Some(*a),
            _ => None,
        })
    }

    pub fn primary_dns(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|o| match o {
            IpcpOption::PrimaryDns(a) => Some(*a),
            _ => None,
        })
    }

    pub fn secondary_dns(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|o| match o {
            IpcpOption::SecondaryDns(a) => Some(*a),
            _ => None,
        })
    }
}

impl OptionPack<Ipv6cpOption> {
    pub fn interface_id(&self) -> Option<[u8; 8]> {
        self.iter().find_map(|o| match o {
            Ipv6cpOption::InterfaceId(id) => Some(*id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<O: OptionKind>(pack: &OptionPack<O>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        pack.write_to(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_lcp_options_decode_with_unknown() {
        let raw = [
            0x01, 0x04, 0x05, 0x78, // MRU 1400
            0x03, 0x05, 0xC2, 0x23, 0x81, // MS-CHAPv2
            0x05, 0x06, 0x12, 0x34, 0x56, 0x78, // magic number, unknown here
        ];
        let pack = OptionPack::<LcpOption>::read_from(&raw).unwrap();
        assert_eq!(pack.len(), 3);
        assert_eq!(pack.mru(), Some(1400));
        assert_eq!(pack.auth(), Some(&AuthOption::MsChapV2));
        assert_eq!(
            pack.unknown(),
            vec![LcpOption::Unknown(UnknownOption {
                option_type: 5,
                data: vec![0x12, 0x34, 0x56, 0x78],
            })]
        );
        assert_eq!(encode(&pack), raw.to_vec());
    }

    #[test]
    fn test_chap_md5_is_other_auth() {
        let raw = [0x03, 0x05, 0xC2, 0x23, 0x05];
        let pack = OptionPack::<LcpOption>::read_from(&raw).unwrap();
        let auth = pack.auth().unwrap();
        assert_eq!(auth.suite(), None);
        assert!(matches!(auth, AuthOption::Other { protocol: PROTO_CHAP, .. }));
    }

    #[test]
    fn test_option_overrun() {
        let raw = [0x01, 0x06, 0x05, 0x78];
        assert!(matches!(
            OptionPack::<LcpOption>::read_from(&raw),
            Err(ParseError::OptionOverrun { excess: 2, .. })
        ));

        let raw = [0x01, 0x04, 0x05, 0x78, 0x07];
        assert!(matches!(
            OptionPack::<LcpOption>::read_from(&raw),
            Err(ParseError::OptionOverrun { .. })
        ));
    }

    #[test]
    fn test_option_length_below_header() {
        let raw = [0x01, 0x01, 0x05];
        assert!(matches!(
            OptionPack::<LcpOption>::read_from(&raw),
            Err(ParseError::LengthOutOfRange { length: 1, .. })
        ));
    }

    #[test]
    fn test_wrong_mru_length() {
        let raw = [0x01, 0x03, 0x05];
        assert!(matches!(
            OptionPack::<LcpOption>::read_from(&raw),
            Err(ParseError::LengthOutOfRange { length: 3, .. })
        ));
    }

    #[test]
    fn test_ipcp_options() {
        let pack = OptionPack::new(vec![
            IpcpOption::Address(Ipv4Addr::new(10, 0, 0, 2)),
            IpcpOption::PrimaryDns(Ipv4Addr::new(8, 8, 8, 8)),
            IpcpOption::SecondaryDns(Ipv4Addr::new(8, 8, 4, 4)),
        ]);
        let raw = encode(&pack);
        assert_eq!(
            raw,
            vec![
                0x03, 0x06, 10, 0, 0, 2, //
                0x81, 0x06, 8, 8, 8, 8, //
                0x83, 0x06, 8, 8, 4, 4,
            ]
        );
        let decoded = OptionPack::<IpcpOption>::read_from(&raw).unwrap();
        assert_eq!(decoded.address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(decoded.secondary_dns(), Some(Ipv4Addr::new(8, 8, 4, 4)));
    }

    #[test]
    fn test_ipv6cp_interface_id() {
        let raw = [0x01, 0x0A, 1, 2, 3, 4, 5, 6, 7, 8];
        let pack = OptionPack::<Ipv6cpOption>::read_from(&raw).unwrap();
        assert_eq!(pack.interface_id(), Some([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(pack.encoded_len(), 10);
    }
}
