//! SSTP crypto binding: certificate hash, Compound MAC Key and Compound MAC.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::mschap::HLAK_LEN;
use crate::error::{Error, Result};
use crate::types::HashProtocol;
use crate::unit::{ControlPacket, CryptoBinding, DataUnit};

const CMK_SEED: &[u8] = b"SSTP inner method derived CMK";

/// Hash fields in the Crypto-Binding attribute are 32 bytes; SHA-1 output is
/// zero-padded.
fn pad32(digest: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..digest.len()].copy_from_slice(digest);
    out
}

fn hmac(protocol: HashProtocol, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let invalid = |e: hmac::digest::InvalidLength| Error::Crypto(e.to_string());
    Ok(match protocol {
        HashProtocol::Sha1 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(invalid)?;
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        HashProtocol::Sha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(invalid)?;
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
    })
}

/// Hash of the server certificate (DER) under the negotiated protocol.
pub fn cert_hash(protocol: HashProtocol, certificate: &[u8]) -> [u8; 32] {
    match protocol {
        HashProtocol::Sha1 => pad32(&Sha1::digest(certificate)),
        HashProtocol::Sha256 => pad32(&Sha256::digest(certificate)),
    }
}

/// CMK = HMAC(HLAK, seed || LEN (u16 LE) || 0x01).
pub fn compound_mac_key(protocol: HashProtocol, hlak: &[u8; HLAK_LEN]) -> Result<Vec<u8>> {
    let len = (protocol.digest_len() as u16).to_le_bytes();
    hmac(protocol, hlak, &[CMK_SEED, &len, &[0x01]])
}

/// HMAC under the CMK over a serialized Call-Connected packet whose
/// Compound MAC field is zero.
pub fn compound_mac(
    protocol: HashProtocol,
    hlak: &[u8; HLAK_LEN],
    zeroed_packet: &[u8],
) -> Result<[u8; 32]> {
    let cmk = compound_mac_key(protocol, hlak)?;
    Ok(pad32(&hmac(protocol, &cmk, &[zeroed_packet])?))
}

/// Build the Call-Connected packet with its Compound MAC filled in.
pub fn call_connected(
    protocol: HashProtocol,
    nonce: [u8; 32],
    certificate: &[u8],
    hlak: &[u8; HLAK_LEN],
) -> Result<ControlPacket> {
    let mut binding = CryptoBinding {
        hash_protocol: protocol.bit(),
        nonce,
        cert_hash: cert_hash(protocol, certificate),
        compound_mac: [0u8; 32],
    };
    let zeroed = ControlPacket::CallConnected {
        binding: binding.clone(),
    }
    .to_bytes();
    binding.compound_mac = compound_mac(protocol, hlak, &zeroed)?;
    Ok(ControlPacket::CallConnected { binding })
}
