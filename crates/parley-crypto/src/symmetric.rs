//! Per-message symmetric encryption: AES-256-CBC with PKCS#7 padding,
//! authenticated Encrypt-then-MAC with HMAC-SHA256 over `iv || ciphertext`.
//!
//! Every call to [`encrypt_symmetric`] draws a fresh 256-bit key and 128-bit
//! IV. The key is returned base64-encoded so it can be wrapped for each
//! recipient (see [`crate::wrap`]).

use std::fmt;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use zeroize::Zeroizing;

use crate::encoding::{decode_b64, encode_b64};
use crate::error::CryptoError;

/// AES-256 key size, also used as the HMAC key size.
pub const KEY_SIZE: usize = 32;

/// AES block size / CBC IV size.
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Output of [`encrypt_symmetric`]; every field is standard base64.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub ciphertext: String,
    pub iv: String,
    pub mac: String,
    /// The per-message key. Must be wrapped before it leaves the device.
    pub key: Zeroizing<String>,
}

impl fmt::Debug for SealedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedMessage")
            .field("ciphertext", &self.ciphertext)
            .field("iv", &self.iv)
            .field("mac", &self.mac)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Result of [`decrypt_symmetric`]. Failures are values, not errors: the
/// caller drops the message and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(String),
    /// The MAC did not verify. Nothing was decrypted.
    AuthFailure,
    /// Malformed input, wrong key length, bad padding or empty/non-UTF-8 text.
    DecodeFailure,
}

impl DecryptOutcome {
    pub fn into_plaintext(self) -> Option<String> {
        match self {
            DecryptOutcome::Plaintext(text) => Some(text),
            _ => None,
        }
    }
}

fn mac_input(iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(iv.len() + ciphertext.len());
    data.extend_from_slice(iv);
    data.extend_from_slice(ciphertext);
    data
}

pub fn encrypt_symmetric(plaintext: &str) -> Result<SealedMessage, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }

    let rng = SystemRandom::new();
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let mut iv = [0u8; IV_SIZE];
    rng.fill(&mut key[..]).map_err(|_| CryptoError::Rng)?;
    rng.fill(&mut iv).map_err(|_| CryptoError::Rng)?;

    let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        }
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &key[..]);
    let tag = hmac::sign(&mac_key, &mac_input(&iv, &ciphertext));

    Ok(SealedMessage {
        ciphertext: encode_b64(&ciphertext),
        iv: encode_b64(&iv),
        mac: encode_b64(tag.as_ref()),
        key: Zeroizing::new(encode_b64(&key[..])),
    })
}

/// Verify, then decrypt. The MAC is checked in constant time before any
/// block is decrypted.
pub fn decrypt_symmetric(sealed: &SealedMessage) -> DecryptOutcome {
    let decoded = (|| -> Result<_, CryptoError> {
        let key = Zeroizing::new(decode_b64(&sealed.key)?);
        let iv = decode_b64(&sealed.iv)?;
        let ciphertext = decode_b64(&sealed.ciphertext)?;
        let mac = decode_b64(&sealed.mac)?;
        Ok((key, iv, ciphertext, mac))
    })();
    let (key, iv, ciphertext, mac) = match decoded {
        Ok(parts) => parts,
        Err(e) => {
            debug!("symmetric decode failed: {}", e);
            return DecryptOutcome::DecodeFailure;
        }
    };
    if key.len() != KEY_SIZE || iv.len() != IV_SIZE || ciphertext.is_empty() {
        debug!(
            key_len = key.len(),
            iv_len = iv.len(),
            "symmetric parts have wrong length"
        );
        return DecryptOutcome::DecodeFailure;
    }

    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &key);
    if hmac::verify(&mac_key, &mac_input(&iv, &ciphertext), &mac).is_err() {
        return DecryptOutcome::AuthFailure;
    }

    let Ok(cipher) = Aes256CbcDec::new_from_slices(&key, &iv) else {
        return DecryptOutcome::DecodeFailure;
    };
    let plaintext = match cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext) {
        Ok(bytes) => bytes,
        Err(_) => return DecryptOutcome::DecodeFailure,
    };
    match String::from_utf8(plaintext) {
        Ok(text) if !text.is_empty() => DecryptOutcome::Plaintext(text),
        _ => DecryptOutcome::DecodeFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flip_bit(b64: &str, byte: usize, bit: u8) -> String {
        let mut bytes = decode_b64(b64).unwrap();
        let idx = byte % bytes.len();
        bytes[idx] ^= 1 << (bit % 8);
        encode_b64(&bytes)
    }

    #[test]
    fn roundtrip() {
        let sealed = encrypt_symmetric("hello, marketplace").unwrap();
        assert_eq!(
            decrypt_symmetric(&sealed),
            DecryptOutcome::Plaintext("hello, marketplace".into())
        );
    }

    #[test]
    fn fresh_key_and_iv_per_message() {
        let a = encrypt_symmetric("same text").unwrap();
        let b = encrypt_symmetric("same text").unwrap();
        assert_ne!(*a.key, *b.key);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn field_sizes() {
        let sealed = encrypt_symmetric("x").unwrap();
        assert_eq!(decode_b64(&sealed.key).unwrap().len(), KEY_SIZE);
        assert_eq!(decode_b64(&sealed.iv).unwrap().len(), IV_SIZE);
        assert_eq!(decode_b64(&sealed.mac).unwrap().len(), 32);
        // One byte of plaintext pads to one block
        assert_eq!(decode_b64(&sealed.ciphertext).unwrap().len(), 16);
    }

    #[test]
    fn empty_plaintext_is_rejected() {
        assert!(matches!(
            encrypt_symmetric(""),
            Err(CryptoError::EmptyPlaintext)
        ));
    }

    #[test]
    fn wrong_key_is_auth_failure() {
        let sealed = encrypt_symmetric("secret").unwrap();
        let other = encrypt_symmetric("other").unwrap();
        let forged = SealedMessage {
            key: other.key.clone(),
            ..sealed
        };
        assert_eq!(decrypt_symmetric(&forged), DecryptOutcome::AuthFailure);
    }

    #[test]
    fn malformed_fields_are_decode_failures() {
        let sealed = encrypt_symmetric("secret").unwrap();
        let bad_b64 = SealedMessage {
            iv: "***".into(),
            ..sealed.clone()
        };
        assert_eq!(decrypt_symmetric(&bad_b64), DecryptOutcome::DecodeFailure);

        let short_key = SealedMessage {
            key: Zeroizing::new(encode_b64(&[0u8; 16])),
            ..sealed
        };
        assert_eq!(decrypt_symmetric(&short_key), DecryptOutcome::DecodeFailure);
    }

    #[test]
    fn bad_padding_after_valid_mac_is_decode_failure() {
        // Authentic MAC over a ciphertext whose padding is invalid
        let key = [7u8; KEY_SIZE];
        let iv = [1u8; IV_SIZE];
        let ciphertext = [0u8; 16];
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &key);
        let tag = hmac::sign(&mac_key, &mac_input(&iv, &ciphertext));
        let cipher = Aes256CbcDec::new_from_slices(&key, &iv).unwrap();
        let padding_ok = cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext).is_ok();

        let sealed = SealedMessage {
            ciphertext: encode_b64(&ciphertext),
            iv: encode_b64(&iv),
            mac: encode_b64(tag.as_ref()),
            key: Zeroizing::new(encode_b64(&key)),
        };
        let outcome = decrypt_symmetric(&sealed);
        // Either the random block happens to unpad cleanly or it is a decode failure,
        // but it is never an auth failure.
        assert_ne!(outcome, DecryptOutcome::AuthFailure);
        if !padding_ok {
            assert_eq!(outcome, DecryptOutcome::DecodeFailure);
        }
    }

    #[test]
    fn accepts_url_safe_unpadded_fields() {
        let sealed = encrypt_symmetric("url safe").unwrap();
        let relaxed = |s: &str| s.trim_end_matches('=').replace('+', "-").replace('/', "_");
        let mangled = SealedMessage {
            ciphertext: relaxed(&sealed.ciphertext),
            iv: relaxed(&sealed.iv),
            mac: relaxed(&sealed.mac),
            key: Zeroizing::new(relaxed(&sealed.key)),
        };
        assert_eq!(
            decrypt_symmetric(&mangled),
            DecryptOutcome::Plaintext("url safe".into())
        );
    }

    #[test]
    fn debug_redacts_key() {
        let sealed = encrypt_symmetric("x").unwrap();
        let rendered = format!("{sealed:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(sealed.key.as_str()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_text(text in ".{1,200}") {
            let sealed = encrypt_symmetric(&text).unwrap();
            prop_assert_eq!(decrypt_symmetric(&sealed), DecryptOutcome::Plaintext(text));
        }

        #[test]
        fn any_bit_flip_is_auth_failure(text in "[a-zA-Z0-9 ]{1,64}",
                                        field in 0usize..3,
                                        byte in any::<usize>(),
                                        bit in any::<u8>()) {
            let sealed = encrypt_symmetric(&text).unwrap();
            let tampered = match field {
                0 => SealedMessage { ciphertext: flip_bit(&sealed.ciphertext, byte, bit), ..sealed },
                1 => SealedMessage { iv: flip_bit(&sealed.iv, byte, bit), ..sealed },
                _ => SealedMessage { mac: flip_bit(&sealed.mac, byte, bit), ..sealed },
            };
            prop_assert_eq!(decrypt_symmetric(&tampered), DecryptOutcome::AuthFailure);
        }
    }
}
