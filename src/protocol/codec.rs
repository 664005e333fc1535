//! Chat message codec.
//!
//! Outbound messages travel as `base64(ciphertext)|sha256_hex|md5_hex`. The
//! relay recomputes the digests over the plaintext it decrypts. Inbound
//! broadcast messages are ciphertext only; the client decrypts them and does
//! not check digests, even when the relay appends some.
//!
//! 聊天消息编解码器。

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::crypto::hash::sha256_hex;
use crate::crypto::keys::{LocalKeyPair, RemotePublicKey};
use crate::crypto::md5;
use crate::error::{HandshakeError, Result};

/// Field separator. Never produced by base64 or hex.
pub const DELIMITER: char = '|';

const SHA256_HEX_LEN: usize = 64;
const MD5_HEX_LEN: usize = 32;

/// An encrypted chat message with its two integrity tags.
///
/// 带有两个完整性标签的加密聊天消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub sha256_hex: String,
    pub md5_hex: String,
}

impl Envelope {
    /// Serializes the envelope into its wire form.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Parses the three-field wire form.
    ///
    /// Used on the relay side of the exchange; the client never parses its
    /// inbound traffic this way.
    pub fn parse(wire: &str) -> Result<Self> {
        let mut fields = wire.trim().split(DELIMITER);
        let (Some(cipher), Some(sha), Some(md5), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(HandshakeError::Decryption);
        };

        let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !is_hex(sha, SHA256_HEX_LEN) || !is_hex(md5, MD5_HEX_LEN) {
            return Err(HandshakeError::Decryption);
        }

        let ciphertext = STANDARD
            .decode(cipher)
            .map_err(|_| HandshakeError::Decryption)?;
        Ok(Self {
            ciphertext,
            sha256_hex: sha.to_ascii_lowercase(),
            md5_hex: md5.to_ascii_lowercase(),
        })
    }

    /// Checks both tags against the decrypted plaintext.
    pub fn verify(&self, plaintext: &str) -> bool {
        sha256_hex(plaintext.as_bytes()) == self.sha256_hex
            && md5::digest_hex(plaintext.as_bytes()) == self.md5_hex
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}",
            STANDARD.encode(&self.ciphertext),
            self.sha256_hex,
            self.md5_hex
        )
    }
}

/// Encrypts `plaintext` for the relay and attaches both digests.
pub fn encode(plaintext: &str, remote: &RemotePublicKey) -> Result<Envelope> {
    let bytes = plaintext.as_bytes();
    Ok(Envelope {
        ciphertext: remote.encrypt(bytes)?,
        sha256_hex: sha256_hex(bytes),
        md5_hex: md5::digest_hex(bytes),
    })
}

/// Encrypts `plaintext` with no digests, as the relay does for broadcasts.
pub fn seal(plaintext: &str, remote: &RemotePublicKey) -> Result<String> {
    Ok(STANDARD.encode(remote.encrypt(plaintext.as_bytes())?))
}

/// Decrypts an inbound wire message.
///
/// Anything after the first delimiter is ignored. Every failure (base64,
/// OAEP, UTF-8) is a [`HandshakeError::Decryption`].
pub fn decode(wire: &str, local: &LocalKeyPair) -> Result<String> {
    let cipher = wire
        .split(DELIMITER)
        .next()
        .unwrap_or_default()
        .trim();
    let ciphertext = STANDARD
        .decode(cipher)
        .map_err(|_| HandshakeError::Decryption)?;
    let plaintext = local.decrypt(&ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| HandshakeError::Decryption)
}
