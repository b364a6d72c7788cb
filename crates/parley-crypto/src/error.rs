use parley_protocol::UserId;
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decode failure: {0}")]
    Decode(String),

    #[error("refusing to encrypt an empty message")]
    EmptyPlaintext,

    #[error("system RNG failed")]
    Rng,

    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("key encoding error: {0}")]
    KeyEncoding(String),
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no key material available for user {0}")]
    KeyUnavailable(UserId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("key generation failed: {0}")]
    Keygen(String),
}

/// Failures reported by a [`crate::keystore::KeyDirectory`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unreachable(String),

    #[error("directory rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("directory refused credentials")]
    Unauthorized,
}
