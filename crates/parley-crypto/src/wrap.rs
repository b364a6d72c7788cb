//! RSA-OAEP key wrapping (SHA-256 for both the OAEP hash and MGF1).
//!
//! The symmetric key travels base64-encoded; it is decoded to raw bytes
//! before wrapping and re-encoded after unwrapping.

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encoding::{decode_b64, encode_b64};
use crate::error::CryptoError;

/// Parse a correspondent's public key. SPKI (`BEGIN PUBLIC KEY`) is the
/// exchanged format; PKCS#1 (`BEGIN RSA PUBLIC KEY`) is accepted too.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|spki_err| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| spki_err.to_string())
        })
        .map_err(CryptoError::KeyEncoding)
}

/// Wrap a base64 symmetric key for `recipient`. Returns base64 ciphertext.
pub fn wrap_key(key_b64: &str, recipient: &RsaPublicKey) -> Result<String, CryptoError> {
    let raw = Zeroizing::new(decode_b64(key_b64)?);
    let wrapped = recipient.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &raw)?;
    Ok(encode_b64(&wrapped))
}

/// Recover a base64 symmetric key wrapped for `private_key`.
pub fn unwrap_key(
    wrapped_b64: &str,
    private_key: &RsaPrivateKey,
) -> Result<Zeroizing<String>, CryptoError> {
    let wrapped = decode_b64(wrapped_b64)?;
    let raw = Zeroizing::new(private_key.decrypt(Oaep::new::<Sha256>(), &wrapped)?);
    Ok(Zeroizing::new(encode_b64(&raw)))
}
