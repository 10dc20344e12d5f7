//! PAP, CHAP (MS-CHAPv2) and EAP frames.

use bytes::{BufMut, BytesMut};

use super::ppp::{open_frame, put_control_header, CONTROL_HEADER_LEN, PPP_CONTROL_OFFSET};
use super::ppp::{PROTO_CHAP, PROTO_EAP, PROTO_PAP};
use super::{check_length, put_len, DataUnit, Reader};
use crate::error::ParseError;

pub const PAP_AUTHENTICATE_REQUEST: u8 = 1;
pub const PAP_AUTHENTICATE_ACK: u8 = 2;
pub const PAP_AUTHENTICATE_NAK: u8 = 3;

pub const CHAP_CHALLENGE: u8 = 1;
pub const CHAP_RESPONSE: u8 = 2;
pub const CHAP_SUCCESS: u8 = 3;
pub const CHAP_FAILURE: u8 = 4;

pub const EAP_REQUEST: u8 = 1;
pub const EAP_RESPONSE: u8 = 2;
pub const EAP_SUCCESS: u8 = 3;
pub const EAP_FAILURE: u8 = 4;

pub const EAP_TYPE_IDENTITY: u8 = 1;
pub const EAP_TYPE_NAK: u8 = 3;
pub const EAP_TYPE_MSCHAPV2: u8 = 26;

pub const CHALLENGE_LEN: usize = 16;
pub const NT_RESPONSE_LEN: usize = 24;
const RESPONSE_VALUE_LEN: usize = 49;

fn u8_len(unit: &'static str, field: &'static str, len: usize) -> Result<u8, ParseError> {
    u8::try_from(len).map_err(|_| ParseError::InvalidField {
        unit,
        field,
        value: len as u32,
    })
}

fn put_u8_len(buf: &mut BytesMut, len: usize) {
    buf.put_u8(len as u8);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PapFrame {
    AuthenticateRequest {
        id: u8,
        peer_id: Vec<u8>,
        password: Vec<u8>,
    },
    AuthenticateAck {
        id: u8,
        message: Vec<u8>,
    },
    AuthenticateNak {
        id: u8,
        message: Vec<u8>,
    },
}

impl PapFrame {
    pub fn id(&self) -> u8 {
        match self {
            PapFrame::AuthenticateRequest { id, .. }
            | PapFrame::AuthenticateAck { id, .. }
            | PapFrame::AuthenticateNak { id, .. } => *id,
        }
    }

    fn code(&self) -> u8 {
        match self {
            PapFrame::AuthenticateRequest { .. } => PAP_AUTHENTICATE_REQUEST,
            PapFrame::AuthenticateAck { .. } => PAP_AUTHENTICATE_ACK,
            PapFrame::AuthenticateNak { .. } => PAP_AUTHENTICATE_NAK,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            PapFrame::AuthenticateRequest {
                peer_id, password, ..
            } => 2 + peer_id.len() + password.len(),
            PapFrame::AuthenticateAck { message, .. }
            | PapFrame::AuthenticateNak { message, .. } => 1 + message.len(),
        }
    }
}

impl DataUnit for PapFrame {
    const NAME: &'static str = "PAP frame";

    fn length(&self) -> usize {
        PPP_CONTROL_OFFSET + CONTROL_HEADER_LEN + self.payload_len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        put_control_header(buf, PROTO_PAP, self.code(), self.id(), self.payload_len());
        match self {
            PapFrame::AuthenticateRequest {
                peer_id, password, ..
            } => {
                put_u8_len(buf, peer_id.len());
                buf.put_slice(peer_id);
                put_u8_len(buf, password.len());
                buf.put_slice(password);
            }
            PapFrame::AuthenticateAck { message, .. }
            | PapFrame::AuthenticateNak { message, .. } => {
                put_u8_len(buf, message.len());
                buf.put_slice(message);
            }
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let view = open_frame(Self::NAME, PROTO_PAP, input)?;
        let mut reader = Reader::new(Self::NAME, view.payload);
        let id = view.id;
        let frame = match view.code {
            PAP_AUTHENTICATE_REQUEST => {
                let peer_len = reader.u8()? as usize;
                let peer_id = reader.take(peer_len)?.to_vec();
                let pass_len = reader.u8()? as usize;
                let password = reader.take(pass_len)?.to_vec();
                PapFrame::AuthenticateRequest {
                    id,
                    peer_id,
                    password,
                }
            }
            PAP_AUTHENTICATE_ACK | PAP_AUTHENTICATE_NAK => {
                // Some servers send an empty body instead of a zero msg-length.
                let message = if reader.is_empty() {
                    Vec::new()
                } else {
                    let len = reader.u8()? as usize;
                    reader.take(len)?.to_vec()
                };
                if view.code == PAP_AUTHENTICATE_ACK {
                    PapFrame::AuthenticateAck { id, message }
                } else {
                    PapFrame::AuthenticateNak { id, message }
                }
            }
            other => {
                return Err(ParseError::InvalidField {
                    unit: Self::NAME,
                    field: "code",
                    value: other as u32,
                })
            }
        };
        Ok(frame)
    }
}

impl PapFrame {
    /// Build a request, rejecting credentials longer than a length byte allows.
    pub fn request(id: u8, peer_id: &str, password: &str) -> Result<Self, ParseError> {
        u8_len(Self::NAME, "peer-id length", peer_id.len())?;
        u8_len(Self::NAME, "password length", password.len())?;
        Ok(PapFrame::AuthenticateRequest {
            id,
            peer_id: peer_id.as_bytes().to_vec(),
            password: password.as_bytes().to_vec(),
        })
    }
}

/// Value field of an MS-CHAPv2 Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapResponseValue {
    pub peer_challenge: [u8; CHALLENGE_LEN],
    pub nt_response: [u8; NT_RESPONSE_LEN],
    pub flags: u8,
}

impl ChapResponseValue {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(RESPONSE_VALUE_LEN as u8);
        buf.put_slice(&self.peer_challenge);
        buf.put_bytes(0, 8);
        buf.put_slice(&self.nt_response);
        buf.put_u8(self.flags);
    }

    fn read_from(reader: &mut Reader<'_>) -> Result<Self, ParseError> {
        let size = reader.u8()?;
        if size as usize != RESPONSE_VALUE_LEN {
            return Err(ParseError::InvalidField {
                unit: "MS-CHAPv2 response",
                field: "value size",
                value: size as u32,
            });
        }
        let peer_challenge = reader.take_array()?;
        reader.take(8)?;
        let nt_response = reader.take_array()?;
        let flags = reader.u8()?;
        Ok(Self {
            peer_challenge,
            nt_response,
            flags,
        })
    }
}

fn read_challenge(unit: &'static str, reader: &mut Reader<'_>) -> Result<[u8; 16], ParseError> {
    let size = reader.u8()?;
    if size as usize != CHALLENGE_LEN {
        return Err(ParseError::InvalidField {
            unit,
            field: "value size",
            value: size as u32,
        });
    }
    reader.take_array()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapFrame {
    Challenge {
        id: u8,
        value: [u8; CHALLENGE_LEN],
        name: Vec<u8>,
    },
    Response {
        id: u8,
        value: ChapResponseValue,
        name: Vec<u8>,
    },
    /// `message` is the raw text, e.g. `S=<40 hex> M=...`.
    Success {
        id: u8,
        message: Vec<u8>,
    },
    Failure {
        id: u8,
        message: Vec<u8>,
    },
}

impl ChapFrame {
    pub fn id(&self) -> u8 {
        match self {
            ChapFrame::Challenge { id, .. }
            | ChapFrame::Response { id, .. }
            | ChapFrame::Success { id, .. }
            | ChapFrame::Failure { id, .. } => *id,
        }
    }

    fn code(&self) -> u8 {
        match self {
            ChapFrame::Challenge { .. } => CHAP_CHALLENGE,
            ChapFrame::Response { .. } => CHAP_RESPONSE,
            ChapFrame::Success { .. } => CHAP_SUCCESS,
            ChapFrame::Failure { .. } => CHAP_FAILURE,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            ChapFrame::Challenge { name, .. } => 1 + CHALLENGE_LEN + name.len(),
            ChapFrame::Response { name, .. } => 1 + RESPONSE_VALUE_LEN + name.len(),
            ChapFrame::Success { message, .. } | ChapFrame::Failure { message, .. } => {
                message.len()
            }
        }
    }
}

impl DataUnit for ChapFrame {
    const NAME: &'static str = "CHAP frame";

    fn length(&self) -> usize {
        PPP_CONTROL_OFFSET + CONTROL_HEADER_LEN + self.payload_len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        put_control_header(buf, PROTO_CHAP, self.code(), self.id(), self.payload_len());
        match self {
            ChapFrame::Challenge { value, name, .. } => {
                buf.put_u8(CHALLENGE_LEN as u8);
                buf.put_slice(value);
                buf.put_slice(name);
            }
            ChapFrame::Response { value, name, .. } => {
                value.write_to(buf);
                buf.put_slice(name);
            }
            ChapFrame::Success { message, .. } | ChapFrame::Failure { message, .. } => {
                buf.put_slice(message)
            }
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let view = open_frame(Self::NAME, PROTO_CHAP, input)?;
        let mut reader = Reader::new(Self::NAME, view.payload);
        let id = view.id;
        let frame = match view.code {
            CHAP_CHALLENGE => ChapFrame::Challenge {
                id,
                value: read_challenge(Self::NAME, &mut reader)?,
                name: reader.rest().to_vec(),
            },
            CHAP_RESPONSE => ChapFrame::Response {
                id,
                value: ChapResponseValue::read_from(&mut reader)?,
                name: reader.rest().to_vec(),
            },
            CHAP_SUCCESS => ChapFrame::Success {
                id,
                message: reader.rest().to_vec(),
            },
            CHAP_FAILURE => ChapFrame::Failure {
                id,
                message: reader.rest().to_vec(),
            },
            other => {
                return Err(ParseError::InvalidField {
                    unit: Self::NAME,
                    field: "code",
                    value: other as u32,
                })
            }
        };
        Ok(frame)
    }
}

/// MS-CHAPv2 packet carried as EAP type-data (type 26).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapMsChap {
    Challenge {
        ms_id: u8,
        value: [u8; CHALLENGE_LEN],
        name: Vec<u8>,
    },
    Response {
        ms_id: u8,
        value: ChapResponseValue,
        name: Vec<u8>,
    },
    Success {
        ms_id: u8,
        message: Vec<u8>,
    },
    Failure {
        ms_id: u8,
        message: Vec<u8>,
    },
    /// Client acknowledgement of Success: the op-code alone.
    SuccessAck,
    /// Client acknowledgement of Failure: the op-code alone.
    FailureAck,
}

impl EapMsChap {
    const UNIT: &'static str = "EAP-MSCHAPv2";

    fn length(&self) -> usize {
        match self {
            EapMsChap::Challenge { name, .. } => 4 + 1 + CHALLENGE_LEN + name.len(),
            EapMsChap::Response { name, .. } => 4 + 1 + RESPONSE_VALUE_LEN + name.len(),
            EapMsChap::Success { message, .. } | EapMsChap::Failure { message, .. } => {
                4 + message.len()
            }
            EapMsChap::SuccessAck | EapMsChap::FailureAck => 1,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let len = self.length();
        match self {
            EapMsChap::Challenge { ms_id, value, name } => {
                buf.put_u8(CHAP_CHALLENGE);
                buf.put_u8(*ms_id);
                put_len(buf, len);
                buf.put_u8(CHALLENGE_LEN as u8);
                buf.put_slice(value);
                buf.put_slice(name);
            }
            EapMsChap::Response { ms_id, value, name } => {
                buf.put_u8(CHAP_RESPONSE);
                buf.put_u8(*ms_id);
                put_len(buf, len);
                value.write_to(buf);
                buf.put_slice(name);
            }
            EapMsChap::Success { ms_id, message } => {
                buf.put_u8(CHAP_SUCCESS);
                buf.put_u8(*ms_id);
                put_len(buf, len);
                buf.put_slice(message);
            }
            EapMsChap::Failure { ms_id, message } => {
                buf.put_u8(CHAP_FAILURE);
                buf.put_u8(*ms_id);
                put_len(buf, len);
                buf.put_slice(message);
            }
            EapMsChap::SuccessAck => buf.put_u8(CHAP_SUCCESS),
            EapMsChap::FailureAck => buf.put_u8(CHAP_FAILURE),
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(Self::UNIT, input);
        let op_code = reader.u8()?;
        if reader.is_empty() {
            return match op_code {
                CHAP_SUCCESS => Ok(EapMsChap::SuccessAck),
                CHAP_FAILURE => Ok(EapMsChap::FailureAck),
                other => Err(ParseError::InvalidField {
                    unit: Self::UNIT,
                    field: "op-code",
                    value: other as u32,
                }),
            };
        }
        let ms_id = reader.u8()?;
        let ms_length = reader.u16()? as usize;
        check_length(Self::UNIT, ms_length, 4, input.len())?;
        let mut body = Reader::new(Self::UNIT, reader.take(ms_length - 4)?);
        let packet = match op_code {
            CHAP_CHALLENGE => EapMsChap::Challenge {
                ms_id,
                value: read_challenge(Self::UNIT, &mut body)?,
                name: body.rest().to_vec(),
            },
            CHAP_RESPONSE => EapMsChap::Response {
                ms_id,
                value: ChapResponseValue::read_from(&mut body)?,
                name: body.rest().to_vec(),
            },
            CHAP_SUCCESS => EapMsChap::Success {
                ms_id,
                message: body.rest().to_vec(),
            },
            CHAP_FAILURE => EapMsChap::Failure {
                ms_id,
                message: body.rest().to_vec(),
            },
            other => {
                return Err(ParseError::InvalidField {
                    unit: Self::UNIT,
                    field: "op-code",
                    value: other as u32,
                })
            }
        };
        Ok(packet)
    }
}

/// Type-data of an EAP Request or Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapType {
    Identity(Vec<u8>),
    /// Legacy Nak listing the desired authentication types.
    Nak(Vec<u8>),
    MsChapV2(EapMsChap),
    Other { type_code: u8, data: Vec<u8> },
}

impl EapType {
    pub fn type_code(&self) -> u8 {
        match self {
            EapType::Identity(_) => EAP_TYPE_IDENTITY,
            EapType::Nak(_) => EAP_TYPE_NAK,
            EapType::MsChapV2(_) => EAP_TYPE_MSCHAPV2,
            EapType::Other { type_code, .. } => *type_code,
        }
    }

    fn length(&self) -> usize {
        1 + match self {
            EapType::Identity(data) | EapType::Nak(data) => data.len(),
            EapType::MsChapV2(inner) => inner.length(),
            EapType::Other { data, .. } => data.len(),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_code());
        match self {
            EapType::Identity(data) | EapType::Nak(data) => buf.put_slice(data),
            EapType::MsChapV2(inner) => inner.write_to(buf),
            EapType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(EapFrame::NAME, input);
        let type_code = reader.u8()?;
        let data = reader.rest();
        Ok(match type_code {
            EAP_TYPE_IDENTITY => EapType::Identity(data.to_vec()),
            EAP_TYPE_NAK => EapType::Nak(data.to_vec()),
            EAP_TYPE_MSCHAPV2 => EapType::MsChapV2(EapMsChap::read_from(data)?),
            _ => EapType::Other {
                type_code,
                data: data.to_vec(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapFrame {
    Request { id: u8, data: EapType },
    Response { id: u8, data: EapType },
    Success { id: u8 },
    Failure { id: u8 },
}

impl EapFrame {
    pub fn id(&self) -> u8 {
        match self {
            EapFrame::Request { id, .. }
            | EapFrame::Response { id, .. }
            | EapFrame::Success { id }
            | EapFrame::Failure { id } => *id,
        }
    }

    fn code(&self) -> u8 {
        match self {
            EapFrame::Request { .. } => EAP_REQUEST,
            EapFrame::Response { .. } => EAP_RESPONSE,
            EapFrame::Success { .. } => EAP_SUCCESS,
            EapFrame::Failure { .. } => EAP_FAILURE,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            EapFrame::Request { data, .. } | EapFrame::Response { data, .. } => data.length(),
            EapFrame::Success { .. } | EapFrame::Failure { .. } => 0,
        }
    }
}

impl DataUnit for EapFrame {
    const NAME: &'static str = "EAP frame";

    fn length(&self) -> usize {
        PPP_CONTROL_OFFSET + CONTROL_HEADER_LEN + self.payload_len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        put_control_header(buf, PROTO_EAP, self.code(), self.id(), self.payload_len());
        if let EapFrame::Request { data, .. } | EapFrame::Response { data, .. } = self {
            data.write_to(buf);
        }
    }

    fn read_from(input: &[u8]) -> Result<Self, ParseError> {
        let view = open_frame(Self::NAME, PROTO_EAP, input)?;
        let id = view.id;
        let frame = match view.code {
            EAP_REQUEST => EapFrame::Request {
                id,
                data: EapType::read_from(view.payload)?,
            },
            EAP_RESPONSE => EapFrame::Response {
                id,
                data: EapType::read_from(view.payload)?,
            },
            EAP_SUCCESS => EapFrame::Success { id },
            EAP_FAILURE => EapFrame::Failure { id },
            other => {
                return Err(ParseError::InvalidField {
                    unit: Self::NAME,
                    field: "code",
                    value: other as u32,
                })
            }
        };
        Ok(frame)
    }
}
