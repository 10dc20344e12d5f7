//! PPP frames carried inside SSTP data packets.
//!
//! Every frame here encodes the whole SSTP data packet:
//!
//! ```text
//! SSTP header (4) | 0xFF03 | u16 protocol | u8 code | u8 id | u16 length | payload
//! ```
//!
//! where `length` covers code + id + length + payload.

use bytes::{BufMut, BytesMut};

use super::option::{IpcpOption, Ipv6cpOption, LcpOption, OptionKind, OptionPack};
use super::sstp::{put_data_header, MAX_PACKET_LEN, PACKET_TYPE_DATA, SSTP_HEADER_LEN};
use super::{check_length, put_len, DataUnit, Reader};
use crate::error::ParseError;

/// Address/control constant preceding the protocol id.
pub const PPP_HEADER: u16 = 0xFF03;
/// PPP header plus protocol id.
pub const PPP_HEADER_LEN: usize = 4;
/// Offset of the PPP control packet inside an SSTP data packet.
pub const PPP_CONTROL_OFFSET: usize = SSTP_HEADER_LEN + PPP_HEADER_LEN;
pub const CONTROL_HEADER_LEN: usize = 4;

pub const PROTO_LCP: u16 = 0xC021;
pub const PROTO_PAP: u16 = 0xC023;
pub const PROTO_CHAP: u16 = 0xC223;
pub const PROTO_EAP: u16 = 0xC227;
pub const PROTO_IPCP: u16 = 0x8021;
pub const PROTO_IPV6CP: u16 = 0x8057;
pub const PROTO_IPV4: u16 = 0x0021;
pub const PROTO_IPV6: u16 = 0x0057;

pub const CODE_CONFIGURE_REQUEST: u8 = 1;
pub const CODE_CONFIGURE_ACK: u8 = 2;
pub const CODE_CONFIGURE_NAK: u8 = 3;
pub const CODE_CONFIGURE_REJECT: u8 = 4;
pub const CODE_TERMINATE_REQUEST: u8 = 5;
pub const CODE_TERMINATE_ACK: u8 = 6;
pub const CODE_CODE_REJECT: u8 = 7;
pub const CODE_PROTOCOL_REJECT: u8 = 8;
pub const CODE_ECHO_REQUEST: u8 = 9;
pub const CODE_ECHO_REPLY: u8 = 10;
pub const CODE_DISCARD_REQUEST: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PppProtocol {
    Lcp,
    Pap,
    Chap,
    Eap,
    Ipcp,
    Ipv6cp,
    Ipv4,
    Ipv6,
}

impl PppProtocol {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            PROTO_LCP => PppProtocol::Lcp,
            PROTO_PAP => PppProtocol::Pap,
            PROTO_CHAP => PppProtocol::Chap,
            PROTO_EAP => PppProtocol::Eap,
            PROTO_IPCP => PppProtocol::Ipcp,
            PROTO_IPV6CP => PppProtocol::Ipv6cp,
            PROTO_IPV4 => PppProtocol::Ipv4,
            PROTO_IPV6 => PppProtocol::Ipv6,
            _ => return None,
        })
    }

    pub fn value(&self) -> u16 {
        match self {
            PppProtocol::Lcp => PROTO_LCP,
            PppProtocol::Pap => PROTO_PAP,
            PppProtocol::Chap => PROTO_CHAP,
            PppProtocol::Eap => PROTO_EAP,
            PppProtocol::Ipcp => PROTO_IPCP,
            PppProtocol::Ipv6cp => PROTO_IPV6CP,
            PppProtocol::Ipv4 => PROTO_IPV4,
            PppProtocol::Ipv6 => PROTO_IPV6,
        }
    }
}

/// Write SSTP data header, PPP header and protocol for a payload of
/// `ppp_payload_len` bytes following the protocol id.
pub fn put_frame_header(buf: &mut BytesMut, protocol: u16, ppp_payload_len: usize) {
    put_data_header(buf, PPP_HEADER_LEN + ppp_payload_len);
    buf.put_u16(PPP_HEADER);
    buf.put_u16(protocol);
}

/// Write a control packet header (code, id, length) after the frame header.
pub(crate) fn put_control_header(
    buf: &mut BytesMut,
    protocol: u16,
    code: u8,
    id: u8,
    payload_len: usize,
) {
    let control_len = CONTROL_HEADER_LEN + payload_len;
    put_frame_header(buf, protocol, control_len);
    buf.put_u8(code);
    buf.put_u8(id);
    put_len(buf, control_len);
}

/// Decoded envelope of a PPP control packet.
#[derive(Debug)]
pub struct FrameView<'a> {
    pub protocol: u16,
    pub code: u8,
    pub id: u8,
    pub payload: &'a [u8],
}

/// Strip the SSTP data header and PPP header from `input`, returning the
/// protocol id and the bytes after it.
pub fn open_data_packet<'a>(
    unit: &'static str,
    input: &'a [u8],
) -> Result<(u16, &'a [u8]), ParseError> {
    let mut reader = Reader::new(unit, input);
    let packet_type = reader.u16()?;
    if packet_type != PACKET_TYPE_DATA {
        return Err(ParseError::InvalidField {
            unit,
            field: "packet type",
            value: packet_type as u32,
        });
    }
    let length = (reader.u16()? & 0x0FFF) as usize;
    check_length(unit, length, PPP_CONTROL_OFFSET, MAX_PACKET_LEN)?;
    let mut body = Reader::new(unit, reader.take(length - SSTP_HEADER_LEN)?);
    let header = body.u16()?;
    if header != PPP_HEADER {
        return Err(ParseError::InvalidField {
            unit,
            field: "PPP header",
            value: header as u32,
        });
    }
    let protocol = body.u16()?;
    Ok((protocol, body.rest()))
}

/// Open a PPP control packet of `protocol`, checking the declared length
/// fits in the enclosing SSTP packet.
pub fn open_frame<'a>(
    unit: &'static str,
    protocol: u16,
    input: &'a [u8],
) -> Result<FrameView<'a>, ParseError> {
    let (found, rest) = open_data_packet(unit, input)?;
    if found != protocol {
        return Err(ParseError::InvalidField {
            unit,
            field: "protocol",
            value: found as u32,
        });
    }
    let mut reader = Reader::new(unit, rest);
    let code = reader.u8()?;
    let id = reader.u8()?;
    let length = reader.u16()? as usize;
    check_length(unit, length, CONTROL_HEADER_LEN, rest.len())?;
    let payload = reader.take(length - CONTROL_HEADER_LEN)?;
    Ok(FrameView {
        protocol,
        code,
        id,
        payload,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureCode {
    Request,
    Ack,
    Nak,
    Reject,
}

impl ConfigureCode {
    pub fn value(&self) -> u8 {
        match self {
            ConfigureCode::Request => CODE_CONFIGURE_REQUEST,
            ConfigureCode::Ack => CODE_CONFIGURE_ACK,
            ConfigureCode::Nak => CODE_CONFIGURE_NAK,
            ConfigureCode::Reject => CODE_CONFIGURE_REJECT,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            CODE_CONFIGURE_REQUEST => ConfigureCode::Request,
            CODE_CONFIGURE_ACK => ConfigureCode::Ack,
            CODE_CONFIGURE_NAK => ConfigureCode::Nak,
            CODE_CONFIGURE_REJECT => ConfigureCode::Reject,
            _ => return None,
        })
    }
}

/// Configure-Request/Ack/Nak/Reject with its option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureFrame<O: OptionKind> {
    pub code: ConfigureCode,
    pub id: u8,
    pub options: OptionPack<O>,
}

impl<O: OptionKind> ConfigureFrame<O> {
    pub fn new(code: ConfigureCode, id: u8, options: OptionPack<O>) -> Self {
        Self { code, id, options }
    }
}

/// Control packet of LCP, IPCP or IPv6CP.
///
/// Protocol-Reject, Echo and Discard only exist for LCP; decoding them under
/// another protocol fails with an invalid code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame<O: OptionKind> {
    Configure(ConfigureFrame<O>),
    TerminateRequest { id: u8, data: Vec<u8> },
    TerminateAck { id: u8, data: Vec<u8> },
    /// `rejected` holds the offending control packet, header included.
    CodeReject { id: u8, rejected: Vec<u8> },
    ProtocolReject { id: u8, protocol: u16, info: Vec<u8> },
    EchoRequest { id: u8, magic: u32, data: Vec<u8> },
    EchoReply { id: u8, magic: u32, data: Vec<u8> },
    DiscardRequest { id: u8, magic: u32, data: Vec<u8> },
}

pub type LcpFrame = ControlFrame<LcpOption>;
pub type IpcpFrame = ControlFrame<IpcpOption>;
pub type Ipv6cpFrame = ControlFrame<Ipv6cpOption>;

impl<O: OptionKind> ControlFrame<O> {
    pub fn code(&self) -> u8 {
        match self {
            ControlFrame::Configure(frame) => frame.code.value(),
            ControlFrame::TerminateRequest { .. } => CODE_TERMINATE_REQUEST,
            ControlFrame::TerminateAck { .. } => CODE_TERMINATE_ACK,
            ControlFrame::CodeReject { .. } => CODE_CODE_REJECT,
            ControlFrame::ProtocolReject { .. } => CODE_PROTOCOL_REJECT,
            ControlFrame::EchoRequest { .. } => CODE_ECHO_REQUEST,
            ControlFrame::EchoReply { .. } => CODE_ECHO_REPLY,
            ControlFrame::DiscardRequest { .. } => CODE_DISCARD_REQUEST,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ControlFrame::Configure(frame) => frame.id,
            ControlFrame::TerminateRequest { id, .. }
            | ControlFrame::TerminateAck { id, .. }
            | ControlFrame::CodeReject { id, .. }
            | ControlFrame::ProtocolReject { id, .. }
            | ControlFrame::EchoRequest { id, .. }
            | ControlFrame::EchoReply { id, .. }
            | ControlFrame::DiscardRequest { id, .. } => *id,
        }
    }

    /// Whether `code` is defined for this protocol.
    pub fn is_known_code(code: u8) -> bool {
        match code {
            CODE_CONFIGURE_REQUEST..=CODE_CODE_REJECT => true,
            CODE_PROTOCOL_REJECT..=CODE_DISCARD_REQUEST => O::PROTOCOL == PROTO_LCP,
            _ => false,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            ControlFrame::Configure(frame) => frame.options.encoded_len(),
            ControlFrame::TerminateRequest { data, .. }
            | ControlFrame::TerminateAck { data, .. } => data.len(),
            ControlFrame::CodeReject { rejected, .. } => rejected.len(),
            ControlFrame::ProtocolReject { info, .. } => 2 + info.len(),
            ControlFrame::EchoRequest { data, .. }
            | ControlFrame::EchoReply { data, .. }
            | ControlFrame::DiscardRequest { data, .. } => 4 + data.len(),
        }
    }
}

impl<O: OptionKind> DataUnit for ControlFrame<O> {
    const NAME: &'static str = "PPP control frame";

    fn length(&self) -> usize {
        PPP_CONTROL_OFFSET + CONTROL_HEADER_LEN + self.payload_len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        put_control_header(buf, O::PROTOCOL, self.code(), self.id(), self.payload_len());
        match self {
            ControlFrame::Configure(frame) => frame.options.write_to(buf),
            ControlFrame::TerminateRequest { data, .. }
            | ControlFrame::TerminateAck { data, .. } => buf.put_slice(data),
            ControlFrame::CodeReject { rejected, .. } => buf.put_slice(rejected),
            ControlFrame::ProtocolReject { protocol, info, .. } => {
                buf.put_u16(*protocol);
                buf.put_slice(info);
            }
            ControlFrame::EchoRequest { magic, data, .. }
            | ControlFrame::EchoReply { magic, data, .. }
            | ControlFrame::DiscardRequest { magic, data, .. } => {
                buf.put_u32(*magic);
                buf.put_slice(data);
            }
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let view = open_frame(Self::NAME, O::PROTOCOL, input)?;
        let id = view.id;
        if !Self::is_known_code(view.code) {
            return Err(ParseError::InvalidField {
                unit: Self::NAME,
                field: "code",
                value: view.code as u32,
            });
        }
        let mut reader = Reader::new(Self::NAME, view.payload);
        let frame = match view.code {
            CODE_CONFIGURE_REQUEST..=CODE_CONFIGURE_REJECT => {
                let code = ConfigureCode::from_u8(view.code).ok_or(ParseError::InvalidField {
                    unit: Self::NAME,
                    field: "code",
                    value: view.code as u32,
                })?;
                ControlFrame::Configure(ConfigureFrame {
                    code,
                    id,
                    options: OptionPack::read_from(view.payload)?,
                })
            }
            CODE_TERMINATE_REQUEST => ControlFrame::TerminateRequest {
                id,
                data: reader.rest().to_vec(),
            },
            CODE_TERMINATE_ACK => ControlFrame::TerminateAck {
                id,
                data: reader.rest().to_vec(),
            },
            CODE_CODE_REJECT => ControlFrame::CodeReject {
                id,
                rejected: reader.rest().to_vec(),
            },
            CODE_PROTOCOL_REJECT => ControlFrame::ProtocolReject {
                id,
                protocol: reader.u16()?,
                info: reader.rest().to_vec(),
            },
            CODE_ECHO_REQUEST => ControlFrame::EchoRequest {
                id,
                magic: reader.u32()?,
                data: reader.rest().to_vec(),
            },
            CODE_ECHO_REPLY => ControlFrame::EchoReply {
                id,
                magic: reader.u32()?,
                data: reader.rest().to_vec(),
            },
            _ => ControlFrame::DiscardRequest {
                id,
                magic: reader.u32()?,
                data: reader.rest().to_vec(),
            },
        };
        Ok(frame)
    }
}
