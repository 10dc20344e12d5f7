//! MS-CHAPv2 (RFC 2759) response and authenticator, and the MPPE-style key
//! derivation (RFC 3079) that yields the SSTP HLAK.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use sha1::{Digest, Sha1};

use super::md4::Md4;

pub const HLAK_LEN: usize = 32;
/// `S=` followed by 40 uppercase hex digits.
pub const SERVER_RESPONSE_LEN: usize = 42;

const MAGIC1: &[u8] = b"Magic server to client signing constant";
const MAGIC2: &[u8] = b"Pad to make it do more than one iteration";

const MASTER_KEY_MAGIC: &[u8] = b"This is the MPPE Master Key";
const CLIENT_SEND_MAGIC: &[u8] =
    b"On the client side, this is the send key; on the server side, it is the receive key.";
const CLIENT_RECV_MAGIC: &[u8] =
    b"On the client side, this is the receive key; on the server side, it is the send key.";
const SHS_PAD1: [u8; 40] = [0x00; 40];
const SHS_PAD2: [u8; 40] = [0xF2; 40];

/// Challenge/response material of one MS-CHAPv2 exchange.
///
/// Filled as the exchange progresses and consumed once to derive the HLAK.
#[derive(Debug, Clone, Default)]
pub struct ChapMaterial {
    pub server_challenge: [u8; 16],
    pub client_challenge: [u8; 16],
    pub server_response: Vec<u8>,
    pub client_response: [u8; 24],
}

impl ChapMaterial {
    pub fn new(server_challenge: [u8; 16], client_challenge: [u8; 16]) -> Self {
        Self {
            server_challenge,
            client_challenge,
            ..Default::default()
        }
    }
}

fn utf16le(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

/// MD4 of the UTF-16LE password.
pub fn nt_password_hash(password: &str) -> [u8; 16] {
    Md4::hash(&utf16le(password))
}

/// MD4 of the NT password hash.
pub fn password_hash_hash(password: &str) -> [u8; 16] {
    Md4::hash(&nt_password_hash(password))
}

/// The 8-byte challenge both sides feed into DES.
pub fn challenge_hash(
    client_challenge: &[u8; 16],
    server_challenge: &[u8; 16],
    username: &str,
) -> [u8; 8] {
    let digest = Sha1::new()
        .chain_update(client_challenge)
        .chain_update(server_challenge)
        .chain_update(username.as_bytes())
        .finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Spread 56 key bits over 8 bytes, leaving the low (parity) bit clear.
fn expand_des_key(key: &[u8]) -> [u8; 8] {
    [
        key[0] & 0xFE,
        (key[0] << 7) | (key[1] >> 1),
        (key[1] << 6) | (key[2] >> 2),
        (key[2] << 5) | (key[3] >> 3),
        (key[3] << 4) | (key[4] >> 4),
        (key[4] << 3) | (key[5] >> 5),
        (key[5] << 2) | (key[6] >> 6),
        key[6] << 1,
    ]
}

fn des_encrypt(key7: &[u8], clear: &[u8; 8]) -> [u8; 8] {
    let key = expand_des_key(key7);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(clear);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    out
}

/// DES the challenge under three thirds of the zero-padded password hash.
pub fn challenge_response(challenge: &[u8; 8], password_hash: &[u8; 16]) -> [u8; 24] {
    let mut z = [0u8; 21];
    z[..16].copy_from_slice(password_hash);

    let mut response = [0u8; 24];
    for (i, chunk) in response.chunks_mut(8).enumerate() {
        chunk.copy_from_slice(&des_encrypt(&z[i * 7..i * 7 + 7], challenge));
    }
    response
}

pub fn generate_nt_response(
    server_challenge: &[u8; 16],
    client_challenge: &[u8; 16],
    username: &str,
    password: &str,
) -> [u8; 24] {
    let challenge = challenge_hash(client_challenge, server_challenge, username);
    challenge_response(&challenge, &nt_password_hash(password))
}

/// Expected `S=...` authenticator response, uppercase hex.
pub fn generate_authenticator_response(
    password: &str,
    nt_response: &[u8; 24],
    client_challenge: &[u8; 16],
    server_challenge: &[u8; 16],
    username: &str,
) -> String {
    let digest = Sha1::new()
        .chain_update(password_hash_hash(password))
        .chain_update(nt_response)
        .chain_update(MAGIC1)
        .finalize();
    let challenge = challenge_hash(client_challenge, server_challenge, username);
    let digest = Sha1::new()
        .chain_update(digest)
        .chain_update(challenge)
        .chain_update(MAGIC2)
        .finalize();
    format!("S={}", hex::encode_upper(digest))
}

/// Compare the server's 42-byte `S=` field against the expected value.
///
/// `message` is the full Success message; anything after the first 42 bytes
/// (e.g. ` M=...`) is ignored.
pub fn check_authenticator(
    message: &[u8],
    password: &str,
    username: &str,
    material: &ChapMaterial,
) -> bool {
    if message.len() < SERVER_RESPONSE_LEN {
        return false;
    }
    let expected = generate_authenticator_response(
        password,
        &material.client_response,
        &material.client_challenge,
        &material.server_challenge,
        username,
    );
    let received = &message[..SERVER_RESPONSE_LEN];
    // Case-insensitive, without early exit.
    expected
        .as_bytes()
        .iter()
        .zip(received)
        .fold(0u8, |acc, (a, b)| {
            acc | (a.to_ascii_uppercase() ^ b.to_ascii_uppercase())
        })
        == 0
}

fn master_key(password_hash_hash: &[u8; 16], nt_response: &[u8; 24]) -> [u8; 16] {
    let digest = Sha1::new()
        .chain_update(password_hash_hash)
        .chain_update(nt_response)
        .chain_update(MASTER_KEY_MAGIC)
        .finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

fn asymmetric_start_key(master_key: &[u8; 16], magic: &[u8]) -> [u8; 16] {
    let digest = Sha1::new()
        .chain_update(master_key)
        .chain_update(SHS_PAD1)
        .chain_update(magic)
        .chain_update(SHS_PAD2)
        .finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// HLAK = MasterReceiveKey || MasterSendKey, from the client's point of view.
pub fn derive_hlak(password: &str, nt_response: &[u8; 24]) -> [u8; HLAK_LEN] {
    let master = master_key(&password_hash_hash(password), nt_response);
    let mut hlak = [0u8; HLAK_LEN];
    hlak[..16].copy_from_slice(&asymmetric_start_key(&master, CLIENT_RECV_MAGIC));
    hlak[16..].copy_from_slice(&asymmetric_start_key(&master, CLIENT_SEND_MAGIC));
    hlak
}

/// Parse `E=eeeeeeeeee R=r C=cccc V=vvvvvvvvvv M=<msg>` into a readable line.
pub fn describe_failure(message: &[u8]) -> String {
    let text = String::from_utf8_lossy(message);
    let code = text
        .split_whitespace()
        .find_map(|field| field.strip_prefix("E="))
        .and_then(|e| e.parse::<u32>().ok());
    let reason = text.find("M=").map(|pos| text[pos + 2..].trim().to_string());
    let known = code.map(|code| match code {
        646 => "restricted logon hours",
        647 => "account disabled",
        648 => "password expired",
        649 => "no dial-in permission",
        691 => "authentication failure",
        709 => "error changing password",
        _ => "unknown error",
    });
    match (code, known, reason) {
        (Some(code), Some(known), Some(reason)) if !reason.is_empty() => {
            format!("E={code} {known}: {reason}")
        }
        (Some(code), Some(known), _) => format!("E={code} {known}"),
        (None, _, Some(reason)) if !reason.is_empty() => reason,
        _ => text.trim().to_string(),
    }
}
