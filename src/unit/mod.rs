//! Wire codec for SSTP and PPP units.
//!
//! Every unit knows its encoded length, writes itself into a `BytesMut`, and
//! reads itself from a byte slice. Decoding checks the declared length against
//! the unit's valid range before touching the payload.

pub mod auth;
pub mod option;
pub mod ppp;
pub mod sstp;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ParseError;

pub use auth::{ChapFrame, ChapResponseValue, EapFrame, EapMsChap, EapType, PapFrame};
pub use option::{
    AuthOption, IpcpOption, Ipv6cpOption, LcpOption, OptionKind, OptionPack, UnknownOption,
};
pub use ppp::{
    ConfigureCode, ConfigureFrame, ControlFrame, IpcpFrame, Ipv6cpFrame, LcpFrame, PppProtocol,
    PPP_HEADER,
};
pub use sstp::{
    Attribute, ControlPacket, CryptoBinding, CryptoBindingRequest, StatusInfo, SSTP_HEADER_LEN,
};

/// Encoded wire unit.
pub trait DataUnit: Sized {
    /// Name used in parse errors and logs.
    const NAME: &'static str;

    /// Total encoded length, header included.
    fn length(&self) -> usize;

    fn write_to(&self, buf: &mut BytesMut);

    fn read_from(input: &[u8]) -> Result<Self, ParseError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Checked cursor over an input slice.
#[derive(Debug)]
pub struct Reader<'a> {
    unit: &'static str,
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(unit: &'static str, input: &'a [u8]) -> Self {
        Self { unit, input }
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.input.len() < n {
            return Err(ParseError::Truncated {
                unit: self.unit,
                needed: n,
                available: self.input.len(),
            });
        }
        let (head, tail) = self.input.split_at(n);
        self.input = tail;
        Ok(head)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Unread bytes, without consuming them.
    pub fn peek(&self) -> &'a [u8] {
        self.input
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.input;
        self.input = &[];
        rest
    }
}

/// Reject `length` outside `min..=max`.
pub fn check_length(
    unit: &'static str,
    length: usize,
    min: usize,
    max: usize,
) -> Result<(), ParseError> {
    if length < min || length > max {
        return Err(ParseError::LengthOutOfRange {
            unit,
            length,
            min,
            max,
        });
    }
    Ok(())
}

/// Write a u16 length that the caller has already bounded.
pub(crate) fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u16(len as u16);
}
