//! Base64 helpers shared by the symmetric and key-wrap layers.
//!
//! Peers are not consistent about the alphabet or padding they emit, so every
//! decode first normalizes to padded standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::CryptoError;

/// Strip whitespace, map the URL-safe alphabet to the standard one and
/// restore missing `=` padding.
pub fn normalize_b64(input: &str) -> String {
    let mut out: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let trimmed_len = out.trim_end_matches('=').len();
    out.truncate(trimmed_len);
    match out.len() % 4 {
        2 => out.push_str("=="),
        3 => out.push('='),
        _ => {}
    }
    out
}

pub fn decode_b64(input: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(normalize_b64(input))
        .map_err(|e| CryptoError::Decode(format!("base64: {e}")))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_padding() {
        assert_eq!(normalize_b64("YQ"), "YQ==");
        assert_eq!(normalize_b64("YWI"), "YWI=");
        assert_eq!(normalize_b64("YWJj"), "YWJj");
    }

    #[test]
    fn maps_url_safe_alphabet_and_whitespace() {
        let url_safe = "-_8\n+/8 =";
        assert_eq!(normalize_b64(url_safe), "+/8+/8==");
        assert_eq!(decode_b64("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode_b64("!!!"), Err(CryptoError::Decode(_))));
    }

    #[test]
    fn encode_is_standard_padded() {
        assert_eq!(encode_b64(b"a"), "YQ==");
        assert_eq!(decode_b64(&encode_b64(&[0xfb, 0xff, 0x00])).unwrap(), vec![0xfb, 0xff, 0x00]);
    }
}
