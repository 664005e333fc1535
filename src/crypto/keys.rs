//! Manages the RSA-OAEP key material exchanged during the handshake.
//!
//! The client generates an ephemeral key pair per connection attempt, imports
//! the relay's public key from a PEM block, and uses OAEP with SHA-256 (for
//! both the label hash and MGF1) in each direction.
//!
//! 管理握手过程中交换的 RSA-OAEP 密钥材料。
//!
//! 客户端在每次连接尝试中生成一个临时密钥对，从 PEM 块导入中继的公钥，
//! 并在两个方向上使用基于 SHA-256 的 OAEP。

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{HandshakeError, Result};
use crate::protocol::message::{PEM_FOOTER, PEM_HEADER};

/// Modulus size used unless configured otherwise.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// OAEP overhead with SHA-256: two digests plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// The client's ephemeral key pair for one connection attempt.
///
/// The private half never leaves this struct; `Debug` does not print it and
/// the `rsa` crate zeroizes it on drop.
///
/// 一次连接尝试所用的客户端临时密钥对。私钥永远不会离开此结构体。
pub struct LocalKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl LocalKeyPair {
    /// Generates a fresh key pair with public exponent 65537.
    ///
    /// This is CPU-heavy (hundreds of milliseconds for 2048 bits); async
    /// callers should run it on a blocking thread.
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| HandshakeError::KeyGeneration(e.to_string()))?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn size_bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// Serializes the public half as a PEM block (SPKI, single base64 line).
    pub fn export_public_pem(&self) -> Result<String> {
        export_public_pem(&self.public_key)
    }

    /// The public half, usable as an encryption key by a peer.
    pub fn public_key(&self) -> RemotePublicKey {
        RemotePublicKey {
            key: self.public_key.clone(),
        }
    }

    /// OAEP-decrypts `ciphertext` with the private key.
    ///
    /// Any failure maps to [`HandshakeError::Decryption`]; the underlying
    /// reason is not exposed.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(oaep(), ciphertext)
            .map_err(|_| HandshakeError::Decryption)
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("bits", &self.size_bits())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A peer's public key, used only for encryption.
///
/// 对端的公钥，仅用于加密。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePublicKey {
    key: RsaPublicKey,
}

impl RemotePublicKey {
    /// Imports a key from a PEM block.
    ///
    /// Header, footer and all whitespace are stripped before the body is
    /// base64-decoded and parsed as SubjectPublicKeyInfo.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let body: String = pem
            .trim()
            .strip_prefix(PEM_HEADER)
            .and_then(|rest| rest.trim_end().strip_suffix(PEM_FOOTER))
            .ok_or_else(|| HandshakeError::KeyImport("missing PEM header or footer".into()))?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let der = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| HandshakeError::KeyImport(format!("invalid base64 body: {e}")))?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| HandshakeError::KeyImport(format!("invalid SPKI structure: {e}")))?;
        Ok(Self { key })
    }

    pub fn to_pem(&self) -> Result<String> {
        export_public_pem(&self.key)
    }

    /// Ciphertext length produced by this key, in bytes.
    pub fn ciphertext_len(&self) -> usize {
        self.key.size()
    }

    /// Largest plaintext OAEP-SHA256 accepts for this key.
    pub fn max_plaintext_len(&self) -> usize {
        self.key.size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    /// OAEP-encrypts `plaintext`. The output length is fixed by the key size.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > self.max_plaintext_len() {
            return Err(HandshakeError::Encryption(format!(
                "plaintext of {} bytes exceeds the {}-byte limit",
                plaintext.len(),
                self.max_plaintext_len()
            )));
        }
        self.key
            .encrypt(&mut OsRng, oaep(), plaintext)
            .map_err(|e| HandshakeError::Encryption(e.to_string()))
    }
}

fn export_public_pem(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| HandshakeError::KeyGeneration(format!("SPKI encoding failed: {e}")))?;
    let body = STANDARD.encode(der.as_bytes());
    Ok(format!("{PEM_HEADER}\n{body}\n{PEM_FOOTER}"))
}
