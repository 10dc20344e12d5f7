//! Cryptographic primitives for MS-CHAPv2 and SSTP crypto binding.

pub mod binding;
pub mod md4;
pub mod mschap;

pub use binding::{call_connected, cert_hash, compound_mac};
pub use md4::Md4;
pub use mschap::{ChapMaterial, HLAK_LEN};
