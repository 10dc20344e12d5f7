//! SSTP packets: the 4-byte header shared by data and control packets, control
//! messages, and their attributes.
//!
//! ```text
//! u8 version(0x10) | u8 C-bit | u16 length | [u16 message_type | u16 attribute_count | attributes...]
//! attribute: u8 reserved | u8 id | u16 length | value...
//! ```

use bytes::{BufMut, BytesMut};

use super::{check_length, put_len, DataUnit, Reader};
use crate::error::ParseError;

pub const SSTP_HEADER_LEN: usize = 4;
pub const SSTP_VERSION: u8 = 0x10;
pub const PACKET_TYPE_DATA: u16 = 0x1000;
pub const PACKET_TYPE_CONTROL: u16 = 0x1001;
/// The length field carries 12 significant bits.
pub const MAX_PACKET_LEN: usize = 0x0FFF;
const LENGTH_MASK: u16 = 0x0FFF;

pub const MSG_CALL_CONNECT_REQUEST: u16 = 0x0001;
pub const MSG_CALL_CONNECT_ACK: u16 = 0x0002;
pub const MSG_CALL_CONNECT_NAK: u16 = 0x0003;
pub const MSG_CALL_CONNECTED: u16 = 0x0004;
pub const MSG_CALL_ABORT: u16 = 0x0005;
pub const MSG_CALL_DISCONNECT: u16 = 0x0006;
pub const MSG_CALL_DISCONNECT_ACK: u16 = 0x0007;
pub const MSG_ECHO_REQUEST: u16 = 0x0008;
pub const MSG_ECHO_RESPONSE: u16 = 0x0009;

pub const ATTR_ENCAPSULATED_PROTOCOL: u8 = 1;
pub const ATTR_STATUS_INFO: u8 = 2;
pub const ATTR_CRYPTO_BINDING: u8 = 3;
pub const ATTR_CRYPTO_BINDING_REQUEST: u8 = 4;

/// Encapsulated-Protocol-Id value for PPP.
pub const ENCAPSULATED_PPP: u16 = 0x0001;

const ATTR_HEADER_LEN: usize = 4;
const CONTROL_HEADER_LEN: usize = 8;
const STATUS_INFO_MIN: usize = 12;
const STATUS_INFO_MAX_VALUE: usize = 64;
const CRYPTO_BINDING_REQUEST_LEN: usize = 40;
const CRYPTO_BINDING_LEN: usize = 104;

/// Read packet type and declared total length from the first four bytes.
pub fn peek_header(buf: &[u8]) -> Option<(u16, usize)> {
    if buf.len() < SSTP_HEADER_LEN {
        return None;
    }
    let packet_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) & LENGTH_MASK;
    Some((packet_type, length as usize))
}

/// Write a data packet header for `payload_len` bytes of PPP frame.
pub fn put_data_header(buf: &mut BytesMut, payload_len: usize) {
    buf.put_u16(PACKET_TYPE_DATA);
    put_len(buf, SSTP_HEADER_LEN + payload_len);
}

/// Status-Info attribute, carried by Nak/Abort/Disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    /// The attribute the status refers to.
    pub attribute_id: u8,
    pub status: u32,
    pub value: Vec<u8>,
}

impl StatusInfo {
    pub const NO_ERROR: u32 = 0x0000_0000;
    pub const ATTRIB_NOT_SUPPORTED_IN_MSG: u32 = 0x0000_0002;
    pub const VALUE_NOT_SUPPORTED: u32 = 0x0000_0004;
    pub const RETRY_COUNT_EXCEEDED: u32 = 0x0000_0003;
    pub const NEGOTIATION_TIMEOUT: u32 = 0x0000_0007;
    pub const INVALID_FRAME_RECEIVED: u32 = 0x0000_0005;

    pub fn new(attribute_id: u8, status: u32) -> Self {
        Self {
            attribute_id,
            status,
            value: Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        let name = match self.status {
            Self::NO_ERROR => "no error",
            0x0000_0001 => "duplicate attribute",
            Self::ATTRIB_NOT_SUPPORTED_IN_MSG => "attribute not supported in message",
            Self::RETRY_COUNT_EXCEEDED => "retry count exceeded",
            Self::VALUE_NOT_SUPPORTED => "value not supported",
            Self::INVALID_FRAME_RECEIVED => "invalid frame received",
            0x0000_0006 => "ac/ac length mismatch",
            Self::NEGOTIATION_TIMEOUT => "negotiation timeout",
            _ => "unknown status",
        };
        format!(
            "{} (0x{:08X}) for attribute {}",
            name, self.status, self.attribute_id
        )
    }
}

/// Crypto-Binding-Request attribute sent by the server in Call-Connect-Ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBindingRequest {
    pub hash_bitmask: u8,
    pub nonce: [u8; 32],
}

/// Crypto-Binding attribute sent by the client in Call-Connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBinding {
    pub hash_protocol: u8,
    pub nonce: [u8; 32],
    pub cert_hash: [u8; 32],
    pub compound_mac: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    EncapsulatedProtocol(u16),
    StatusInfo(StatusInfo),
    CryptoBinding(CryptoBinding),
    CryptoBindingRequest(CryptoBindingRequest),
    Unknown { id: u8, value: Vec<u8> },
}

impl Attribute {
    pub fn id(&self) -> u8 {
        match self {
            Attribute::EncapsulatedProtocol(_) => ATTR_ENCAPSULATED_PROTOCOL,
            Attribute::StatusInfo(_) => ATTR_STATUS_INFO,
            Attribute::CryptoBinding(_) => ATTR_CRYPTO_BINDING,
            Attribute::CryptoBindingRequest(_) => ATTR_CRYPTO_BINDING_REQUEST,
            Attribute::Unknown { id, .. } => *id,
        }
    }

    fn value_range(id: u8) -> (usize, usize) {
        match id {
            ATTR_ENCAPSULATED_PROTOCOL => (6, 6),
            ATTR_STATUS_INFO => (STATUS_INFO_MIN, STATUS_INFO_MIN + STATUS_INFO_MAX_VALUE),
            ATTR_CRYPTO_BINDING => (CRYPTO_BINDING_LEN, CRYPTO_BINDING_LEN),
            ATTR_CRYPTO_BINDING_REQUEST => (CRYPTO_BINDING_REQUEST_LEN, CRYPTO_BINDING_REQUEST_LEN),
            _ => (ATTR_HEADER_LEN, MAX_PACKET_LEN - CONTROL_HEADER_LEN),
        }
    }
}

impl DataUnit for Attribute {
    const NAME: &'static str = "SSTP attribute";

    fn length(&self) -> usize {
        ATTR_HEADER_LEN
            + match self {
                Attribute::EncapsulatedProtocol(_) => 2,
                Attribute::StatusInfo(info) => 8 + info.value.len(),
                Attribute::CryptoBinding(_) => CRYPTO_BINDING_LEN - ATTR_HEADER_LEN,
                Attribute::CryptoBindingRequest(_) => CRYPTO_BINDING_REQUEST_LEN - ATTR_HEADER_LEN,
                Attribute::Unknown { value, .. } => value.len(),
            }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.id());
        put_len(buf, self.length());
        match self {
            Attribute::EncapsulatedProtocol(protocol) => buf.put_u16(*protocol),
            Attribute::StatusInfo(info) => {
                buf.put_bytes(0, 3);
                buf.put_u8(info.attribute_id);
                buf.put_u32(info.status);
                buf.put_slice(&info.value);
            }
            Attribute::CryptoBinding(binding) => {
                buf.put_bytes(0, 3);
                buf.put_u8(binding.hash_protocol);
                buf.put_slice(&binding.nonce);
                buf.put_slice(&binding.cert_hash);
                buf.put_slice(&binding.compound_mac);
            }
            Attribute::CryptoBindingRequest(request) => {
                buf.put_bytes(0, 3);
                buf.put_u8(request.hash_bitmask);
                buf.put_slice(&request.nonce);
            }
            Attribute::Unknown { value, .. } => buf.put_slice(value),
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(Self::NAME, input);
        let _reserved = reader.u8()?;
        let id = reader.u8()?;
        let length = reader.u16()? as usize;
        let (min, max) = Self::value_range(id);
        check_length(Self::NAME, length, min, max)?;
        let mut value = Reader::new(Self::NAME, reader.take(length - ATTR_HEADER_LEN)?);

        let attribute = match id {
            ATTR_ENCAPSULATED_PROTOCOL => Attribute::EncapsulatedProtocol(value.u16()?),
            ATTR_STATUS_INFO => {
                value.take(3)?;
                let attribute_id = value.u8()?;
                let status = value.u32()?;
                Attribute::StatusInfo(StatusInfo {
                    attribute_id,
                    status,
                    value: value.rest().to_vec(),
                })
            }
            ATTR_CRYPTO_BINDING => {
                value.take(3)?;
                Attribute::CryptoBinding(CryptoBinding {
                    hash_protocol: value.u8()?,
                    nonce: value.take_array()?,
                    cert_hash: value.take_array()?,
                    compound_mac: value.take_array()?,
                })
            }
            ATTR_CRYPTO_BINDING_REQUEST => {
                value.take(3)?;
                Attribute::CryptoBindingRequest(CryptoBindingRequest {
                    hash_bitmask: value.u8()?,
                    nonce: value.take_array()?,
                })
            }
            _ => Attribute::Unknown {
                id,
                value: value.rest().to_vec(),
            },
        };
        Ok(attribute)
    }
}

/// SSTP control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    CallConnectRequest { protocol: u16 },
    CallConnectAck { request: CryptoBindingRequest },
    CallConnectNak { statuses: Vec<StatusInfo> },
    CallConnected { binding: CryptoBinding },
    CallAbort { status: Option<StatusInfo> },
    CallDisconnect { status: Option<StatusInfo> },
    CallDisconnectAck,
    EchoRequest,
    EchoResponse,
}

impl ControlPacket {
    pub fn call_connect_request() -> Self {
        ControlPacket::CallConnectRequest {
            protocol: ENCAPSULATED_PPP,
        }
    }

    pub fn message_type(&self) -> u16 {
        match self {
            ControlPacket::CallConnectRequest { .. } => MSG_CALL_CONNECT_REQUEST,
            ControlPacket::CallConnectAck { .. } => MSG_CALL_CONNECT_ACK,
            ControlPacket::CallConnectNak { .. } => MSG_CALL_CONNECT_NAK,
            ControlPacket::CallConnected { .. } => MSG_CALL_CONNECTED,
            ControlPacket::CallAbort { .. } => MSG_CALL_ABORT,
            ControlPacket::CallDisconnect { .. } => MSG_CALL_DISCONNECT,
            ControlPacket::CallDisconnectAck => MSG_CALL_DISCONNECT_ACK,
            ControlPacket::EchoRequest => MSG_ECHO_REQUEST,
            ControlPacket::EchoResponse => MSG_ECHO_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlPacket::CallConnectRequest { .. } => "Call-Connect-Request",
            ControlPacket::CallConnectAck { .. } => "Call-Connect-Ack",
            ControlPacket::CallConnectNak { .. } => "Call-Connect-Nak",
            ControlPacket::CallConnected { .. } => "Call-Connected",
            ControlPacket::CallAbort { .. } => "Call-Abort",
            ControlPacket::CallDisconnect { .. } => "Call-Disconnect",
            ControlPacket::CallDisconnectAck => "Call-Disconnect-Ack",
            ControlPacket::EchoRequest => "Echo-Request",
            ControlPacket::EchoResponse => "Echo-Response",
        }
    }

    fn attributes(&self) -> Vec<Attribute> {
        match self {
            ControlPacket::CallConnectRequest { protocol } => {
                vec![Attribute::EncapsulatedProtocol(*protocol)]
            }
            ControlPacket::CallConnectAck { request } => {
                vec![Attribute::CryptoBindingRequest(request.clone())]
            }
            ControlPacket::CallConnectNak { statuses } => statuses
                .iter()
                .cloned()
                .map(Attribute::StatusInfo)
                .collect(),
            ControlPacket::CallConnected { binding } => {
                vec![Attribute::CryptoBinding(binding.clone())]
            }
            ControlPacket::CallAbort { status } | ControlPacket::CallDisconnect { status } => {
                status.iter().cloned().map(Attribute::StatusInfo).collect()
            }
            ControlPacket::CallDisconnectAck
            | ControlPacket::EchoRequest
            | ControlPacket::EchoResponse => Vec::new(),
        }
    }

    /// Valid total length for a message type.
    fn valid_range(message_type: u16) -> (usize, usize) {
        match message_type {
            MSG_CALL_CONNECT_REQUEST => (14, 14),
            MSG_CALL_CONNECT_ACK => (48, 48),
            MSG_CALL_CONNECTED => (112, 112),
            MSG_CALL_DISCONNECT_ACK | MSG_ECHO_REQUEST | MSG_ECHO_RESPONSE => {
                (CONTROL_HEADER_LEN, CONTROL_HEADER_LEN)
            }
            _ => (CONTROL_HEADER_LEN, MAX_PACKET_LEN),
        }
    }

    /// Server-supplied status text, if any.
    pub fn status_text(&self) -> Option<String> {
        match self {
            ControlPacket::CallAbort { status } | ControlPacket::CallDisconnect { status } => {
                status.as_ref().map(StatusInfo::describe)
            }
            ControlPacket::CallConnectNak { statuses } if !statuses.is_empty() => Some(
                statuses
                    .iter()
                    .map(StatusInfo::describe)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            _ => None,
        }
    }
}

impl DataUnit for ControlPacket {
    const NAME: &'static str = "SSTP control packet";

    fn length(&self) -> usize {
        CONTROL_HEADER_LEN
            + self
                .attributes()
                .iter()
                .map(DataUnit::length)
                .sum::<usize>()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let attributes = self.attributes();
        buf.put_u16(PACKET_TYPE_CONTROL);
        put_len(buf, self.length());
        buf.put_u16(self.message_type());
        buf.put_u16(attributes.len() as u16);
        for attribute in &attributes {
            attribute.write_to(buf);
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(Self::NAME, input);
        let packet_type = reader.u16()?;
        if packet_type != PACKET_TYPE_CONTROL {
            return Err(ParseError::InvalidField {
                unit: Self::NAME,
                field: "packet type",
                value: packet_type as u32,
            });
        }
        let length = (reader.u16()? & LENGTH_MASK) as usize;
        check_length(Self::NAME, length, CONTROL_HEADER_LEN, MAX_PACKET_LEN)?;
        let mut body = Reader::new(Self::NAME, reader.take(length - SSTP_HEADER_LEN)?);

        let message_type = body.u16()?;
        let (min, max) = Self::valid_range(message_type);
        check_length(Self::NAME, length, min, max)?;

        let count = body.u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let attribute = Attribute::read_from(body.peek())?;
            body.take(attribute.length())?;
            attributes.push(attribute);
        }
        if !body.is_empty() {
            return Err(ParseError::OptionOverrun {
                unit: Self::NAME,
                excess: body.remaining(),
            });
        }

        let packet = match message_type {
            MSG_CALL_CONNECT_REQUEST => {
                let protocol = attributes
                    .iter()
                    .find_map(|a| match a {
                        Attribute::EncapsulatedProtocol(p) => Some(*p),
                        _ => None,
                    })
                    .ok_or(ParseError::MissingAttribute {
                        unit: Self::NAME,
                        attribute: "Encapsulated-Protocol",
                    })?;
                ControlPacket::CallConnectRequest { protocol }
            }
            MSG_CALL_CONNECT_ACK => {
                let request = attributes
                    .into_iter()
                    .find_map(|a| match a {
                        Attribute::CryptoBindingRequest(r) => Some(r),
                        _ => None,
                    })
                    .ok_or(ParseError::MissingAttribute {
                        unit: Self::NAME,
                        attribute: "Crypto-Binding-Request",
                    })?;
                ControlPacket::CallConnectAck { request }
            }
            MSG_CALL_CONNECT_NAK => ControlPacket::CallConnectNak {
                statuses: status_infos(attributes),
            },
            MSG_CALL_CONNECTED => {
                let binding = attributes
                    .into_iter()
                    .find_map(|a| match a {
                        Attribute::CryptoBinding(b) => Some(b),
                        _ => None,
                    })
                    .ok_or(ParseError::MissingAttribute {
                        unit: Self::NAME,
                        attribute: "Crypto-Binding",
                    })?;
                ControlPacket::CallConnected { binding }
            }
            MSG_CALL_ABORT => ControlPacket::CallAbort {
                status: status_infos(attributes).into_iter().next(),
            },
            MSG_CALL_DISCONNECT => ControlPacket::CallDisconnect {
                status: status_infos(attributes).into_iter().next(),
            },
            MSG_CALL_DISCONNECT_ACK => ControlPacket::CallDisconnectAck,
            MSG_ECHO_REQUEST => ControlPacket::EchoRequest,
            MSG_ECHO_RESPONSE => ControlPacket::EchoResponse,
            other => {
                return Err(ParseError::InvalidField {
                    unit: Self::NAME,
                    field: "message type",
                    value: other as u32,
                })
            }
        };
        Ok(packet)
    }
}

fn status_infos(attributes: Vec<Attribute>) -> Vec<StatusInfo> {
    attributes
        .into_iter()
        .filter_map(|a| match a {
            Attribute::StatusInfo(info) => Some(info),
            _ => None,
        })
        .collect()
}
