//! MySQL authentication
//!
//! Scramble generation and the password-plugin responses the relay needs:
//! - `mysql_native_password` - SHA1-based, spoken to clients and backends
//! - `caching_sha2_password` - SHA256-based, MySQL 8.0 backends; full
//!   authentication sends the password RSA-encrypted with the server's key
//!
//! References:
//! - Native: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_authentication_methods_native_password_authentication.html>
//! - Caching SHA2: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html>

use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::packets::{CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD, SCRAMBLE_LENGTH};
use crate::error::{RelayError, Result};

/// Generate a random 20-byte scramble.
///
/// NUL and 0xFF are avoided: the scramble is sent NUL-terminated and some
/// clients treat 0xFF specially.
pub fn generate_scramble() -> [u8; SCRAMBLE_LENGTH] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LENGTH];
    for byte in scramble.iter_mut() {
        *byte = rng.gen_range(1..=0xFE);
    }
    scramble
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// `mysql_native_password` response:
///
/// ```text
/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
/// ```
///
/// An empty password produces an empty response.
pub fn compute_native_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    Sha1Digest::update(&mut hasher, scramble);
    Sha1Digest::update(&mut hasher, stage2);
    xor(&stage1, &hasher.finalize())
}

/// `caching_sha2_password` response:
///
/// ```text
/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
/// ```
pub fn compute_caching_sha2_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    Sha2Digest::update(&mut hasher, stage2);
    Sha2Digest::update(&mut hasher, scramble);
    xor(&stage1, &hasher.finalize())
}

/// Scramble response for the plugin a backend asked for.
pub fn compute_auth_for_plugin(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        MYSQL_NATIVE_PASSWORD => Ok(compute_native_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(compute_caching_sha2_response(password, scramble)),
        other => Err(RelayError::UnsupportedAuthMethod(other.to_string())),
    }
}

/// `caching_sha2_password` full authentication without TLS:
///
/// ```text
/// RSA_OAEP(server_public_key, (password + NUL) XOR scramble)
/// ```
///
/// The scramble is repeated over the password. `public_key_pem` is the key
/// the server sent after a public key request, in SPKI or PKCS#1 PEM form.
pub fn encrypt_password_rsa(
    password: &str,
    scramble: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>> {
    if scramble.is_empty() {
        return Err(RelayError::Protocol(
            "cannot encrypt password without a scramble".into(),
        ));
    }
    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|_| RelayError::Protocol("server public key is not valid UTF-8".into()))?
        .trim_end_matches('\0')
        .trim();
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| RelayError::Protocol(format!("invalid server public key: {}", e)))?;

    let mut plain = Zeroizing::new(password.as_bytes().to_vec());
    plain.push(0x00);
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte ^= scramble[i % scramble.len()];
    }
    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &plain[..])
        .map_err(|e| RelayError::Protocol(format!("failed to encrypt backend password: {}", e)))
}

/// Check a client's native-password response against the stored password.
///
/// The comparison is constant-time; a length mismatch is a plain mismatch.
pub fn verify_native_response(password: &str, scramble: &[u8], response: &[u8]) -> bool {
    let expected = compute_native_response(password, scramble);
    expected.as_slice().ct_eq(response).into()
}
